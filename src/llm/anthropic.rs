//! Claude Messages API provider.
//!
//! Thin `reqwest` binding to `POST /v1/messages`. Transient failures
//! (rate limits, overload, 5xx, connect failures, timeouts) are retried with
//! exponential backoff; everything else fails immediately.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::client::{GenerationRequest, GenerationResponse, LlmProvider, Message, Usage};
use crate::config::Settings;
use crate::error::LlmError;

/// Default Messages API endpoint base.
const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";

/// API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Default model to use if none specified.
const DEFAULT_MODEL: &str = "claude-sonnet-4-5";

/// `max_tokens` is mandatory for the Messages API.
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Maximum number of attempts for transient failures.
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff in milliseconds.
const BASE_RETRY_DELAY_MS: u64 = 1000;

/// Request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Claude provider implementing [`LlmProvider`].
pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    base_url: String,
    default_model: String,
}

impl AnthropicProvider {
    /// Create a provider for the public API with the default model.
    ///
    /// # Errors
    ///
    /// Returns `LlmError::MissingApiKey` for an empty key, or
    /// `LlmError::RequestFailed` if the HTTP client cannot be built.
    pub fn new(api_key: impl Into<String>) -> Result<Self, LlmError> {
        Self::with_custom_url(api_key, ANTHROPIC_BASE_URL, DEFAULT_MODEL)
    }

    /// Create a provider with a specific base URL and default model.
    ///
    /// Useful for tests and API-compatible proxies.
    pub fn with_custom_url(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, LlmError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(LlmError::MissingApiKey);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| LlmError::RequestFailed(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            default_model: model.into(),
        })
    }

    /// Create a provider from settings (agent model and base URL).
    pub fn from_settings(settings: &Settings) -> Result<Self, LlmError> {
        let key = settings
            .anthropic_api_key
            .clone()
            .ok_or(LlmError::MissingApiKey)?;
        Self::with_custom_url(key, &settings.anthropic_base_url, &settings.model)
    }

    /// Get the API key (for logging, returns masked value).
    pub fn api_key_masked(&self) -> String {
        mask_key(&self.api_key)
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Get the default model.
    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Execute a request with exponential backoff retry logic.
    async fn execute_with_retry(
        &self,
        request: &ApiRequest,
    ) -> Result<GenerationResponse, LlmError> {
        let mut last_error = None;
        let url = format!("{}/messages", self.base_url);

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s
                let delay_ms = BASE_RETRY_DELAY_MS * (1 << (attempt - 1));
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                tracing::debug!(
                    attempt = attempt + 1,
                    delay_ms = delay_ms,
                    "Retrying Claude request after transient failure"
                );
            }

            match self.execute_request(&url, request).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_transient() => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_retries = MAX_RETRIES,
                        model = %request.model,
                        error = %err,
                        "Transient Claude API error, will retry"
                    );
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            LlmError::RequestFailed("Max retries exceeded with no error captured".to_string())
        }))
    }

    /// Execute a single request (no retry logic).
    async fn execute_request(
        &self,
        url: &str,
        request: &ApiRequest,
    ) -> Result<GenerationResponse, LlmError> {
        let http_response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(request)
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        let status = http_response.status();

        if !status.is_success() {
            let status_code = status.as_u16();
            let error_text = http_response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(classify_error(status_code, &error_text));
        }

        let api_response: ApiResponse = http_response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(format!("Failed to parse API response: {}", e)))?;

        Ok(api_response.into_generation_response())
    }
}

fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        "*".repeat(chars.len())
    } else {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", head, tail)
    }
}

/// Map a failed send to `LlmError::Transport`. Connect failures and
/// timeouts are retryable.
fn transport_error(e: &reqwest::Error) -> LlmError {
    LlmError::Transport {
        message: e.to_string(),
        transient: e.is_connect() || e.is_timeout(),
    }
}

/// Map a non-success status and body to an `LlmError`.
fn classify_error(status_code: u16, body: &str) -> LlmError {
    let parsed = serde_json::from_str::<ApiErrorResponse>(body).ok();
    let message = parsed
        .as_ref()
        .map(|e| e.error.message.clone())
        .unwrap_or_else(|| body.to_string());
    let error_type = parsed.and_then(|e| e.error.error_type);

    match (status_code, error_type.as_deref()) {
        (429, _) | (_, Some("rate_limit_error")) => LlmError::RateLimited(message),
        (529, _) | (_, Some("overloaded_error")) => LlmError::Overloaded(message),
        _ => LlmError::ApiError {
            code: status_code,
            message,
        },
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let model = if request.model.is_empty() {
            self.default_model.clone()
        } else {
            request.model
        };

        let api_request = ApiRequest {
            model,
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system: request.system,
            messages: request.messages,
            temperature: request.temperature,
        };

        self.execute_with_retry(&api_request).await
    }
}

/// Internal request structure for the Messages API.
#[derive(Debug, Clone, Serialize)]
struct ApiRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

/// Internal response structure from the Messages API.
#[derive(Debug, Deserialize)]
struct ApiResponse {
    id: String,
    model: String,
    content: Vec<ApiContentBlock>,
    stop_reason: Option<String>,
    usage: ApiUsage,
}

impl ApiResponse {
    fn into_generation_response(self) -> GenerationResponse {
        let content = self
            .content
            .into_iter()
            .filter(|block| block.block_type == "text")
            .filter_map(|block| block.text)
            .collect();

        GenerationResponse {
            id: self.id,
            model: self.model,
            content,
            stop_reason: self.stop_reason,
            usage: Usage {
                input_tokens: self.usage.input_tokens,
                output_tokens: self.usage.output_tokens,
            },
        }
    }
}

/// Internal content block from the API response.
#[derive(Debug, Deserialize)]
struct ApiContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
}

/// Internal usage structure from the API response.
#[derive(Debug, Deserialize)]
struct ApiUsage {
    input_tokens: u32,
    output_tokens: u32,
}

/// Error response from the API.
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

/// Error detail from the API.
#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(rename = "type")]
    error_type: Option<String>,
    message: String,
}
