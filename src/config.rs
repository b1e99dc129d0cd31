//! Process-wide settings for the agent pipeline.
//!
//! Settings are read from environment variables once and then shared
//! through [`Settings::global`]. Tests and embedders can build a
//! [`Settings`] directly and pass it around instead.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use thiserror::Error;

static GLOBAL: OnceLock<Settings> = OnceLock::new();

/// Errors that can occur while loading settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Which set of completion criteria the role agents enforce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AgentProfile {
    /// Baseline evidence requirements.
    #[default]
    Standard,
    /// Second-generation agents with additional evidence requirements.
    Strict,
}

impl FromStr for AgentProfile {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "standard" | "v1" => Ok(AgentProfile::Standard),
            "strict" | "v2" => Ok(AgentProfile::Strict),
            other => Err(ConfigError::InvalidValue {
                key: "AGENT_PROFILE".to_string(),
                message: format!("expected 'standard' or 'strict', got '{}'", other),
            }),
        }
    }
}

/// Settings for every component of the pipeline.
#[derive(Debug, Clone)]
pub struct Settings {
    // Redis
    /// Redis connection URL.
    pub redis_url: String,

    // Claude
    /// Anthropic API key. Only required by components that call the API.
    pub anthropic_api_key: Option<String>,
    /// Base URL of the Messages API.
    pub anthropic_base_url: String,
    /// Model used by the role agents.
    pub model: String,
    /// `max_tokens` for role agent calls.
    pub max_tokens: u32,
    /// Sampling temperature for role agent calls.
    pub temperature: f64,

    // Q&A
    /// Model used by the Q&A orchestrator.
    pub qa_model: String,
    /// `max_tokens` for Q&A calls.
    pub qa_max_tokens: u32,
    /// Upper bound on file context attached to a Q&A prompt.
    pub qa_max_context_bytes: usize,
    /// How long a worker waits for an answer to one question.
    pub qa_wait_timeout: Duration,
    /// Maximum question/answer follow-up rounds per stage attempt.
    pub qa_max_rounds: u32,

    // Workers
    /// Blocking timeout for a single dequeue attempt.
    pub block_timeout: Duration,
    /// Sleep after a transient worker-loop error.
    pub error_backoff: Duration,
    /// Failed attempts allowed before a PRP is marked failed.
    pub max_retries: u32,
    /// Number of earlier turns replayed into each prompt.
    pub history_window: usize,
    /// Completion criteria profile.
    pub profile: AgentProfile,
    /// Minimum coverage the PM stage must report.
    pub min_coverage_pct: f64,

    // Watchdog
    /// Age after which an inflight job is considered abandoned.
    pub inflight_timeout: Duration,
    /// Interval between watchdog sweeps.
    pub watchdog_interval: Duration,
    /// Age after which history of terminal PRPs is deleted.
    pub history_retention: Duration,

    // Supervisor
    /// Interval between health monitor passes.
    pub monitor_interval: Duration,
    /// Agents silent for longer than this are reported as stale.
    pub agent_stale_after: Duration,

    /// Root directory the Q&A orchestrator reads files from.
    pub workspace_root: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),

            anthropic_api_key: None,
            anthropic_base_url: "https://api.anthropic.com/v1".to_string(),
            model: "claude-sonnet-4-5".to_string(),
            max_tokens: 4096,
            temperature: 0.2,

            qa_model: "claude-sonnet-4-5".to_string(),
            qa_max_tokens: 8192,
            qa_max_context_bytes: 200_000,
            qa_wait_timeout: Duration::from_secs(120),
            qa_max_rounds: 2,

            block_timeout: Duration::from_secs(5),
            error_backoff: Duration::from_secs(5),
            max_retries: 3,
            history_window: 6,
            profile: AgentProfile::Standard,
            min_coverage_pct: 80.0,

            inflight_timeout: Duration::from_secs(1800), // 30 minutes
            watchdog_interval: Duration::from_secs(60),
            history_retention: Duration::from_secs(7 * 24 * 3600),

            monitor_interval: Duration::from_secs(30),
            agent_stale_after: Duration::from_secs(600),

            workspace_root: PathBuf::from("."),
        }
    }
}

impl Settings {
    /// Creates settings with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the process-wide settings, loading them from the
    /// environment on first use.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the environment holds invalid values. A
    /// failed load is not cached; the next call retries.
    pub fn global() -> Result<&'static Settings, ConfigError> {
        if let Some(settings) = GLOBAL.get() {
            return Ok(settings);
        }
        let loaded = Self::from_env()?;
        Ok(GLOBAL.get_or_init(|| loaded))
    }

    /// Installs explicit settings as the process-wide instance.
    ///
    /// Returns the settings back if the global was already initialized.
    pub fn install(settings: Settings) -> Result<&'static Settings, Settings> {
        GLOBAL.set(settings)?;
        GLOBAL.get().ok_or_else(Settings::default)
    }

    /// Creates settings from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `REDIS_URL` (default: redis://127.0.0.1:6379)
    /// - `ANTHROPIC_API_KEY`, `ANTHROPIC_BASE_URL`
    /// - `CLAUDE_MODEL`, `CLAUDE_MAX_TOKENS`, `CLAUDE_TEMPERATURE`
    /// - `QA_MODEL`, `QA_MAX_TOKENS`, `QA_MAX_CONTEXT_BYTES`,
    ///   `QA_WAIT_TIMEOUT_SECS`, `QA_MAX_ROUNDS`
    /// - `WORKER_BLOCK_TIMEOUT_SECS`, `WORKER_ERROR_BACKOFF_SECS`,
    ///   `MAX_RETRIES`, `HISTORY_WINDOW`, `AGENT_PROFILE`, `MIN_COVERAGE_PCT`
    /// - `INFLIGHT_TIMEOUT_SECS`, `WATCHDOG_INTERVAL_SECS`,
    ///   `HISTORY_RETENTION_HOURS`
    /// - `MONITOR_INTERVAL_SECS`, `AGENT_STALE_SECS`
    /// - `WORKSPACE_ROOT`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the
    /// resulting settings fail validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from an arbitrary key lookup.
    ///
    /// `from_env` delegates here; tests pass a map instead of mutating the
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("REDIS_URL") {
            config.redis_url = val;
        }

        // Claude
        config.anthropic_api_key = lookup("ANTHROPIC_API_KEY").filter(|k| !k.trim().is_empty());
        if let Some(val) = lookup("ANTHROPIC_BASE_URL") {
            config.anthropic_base_url = val.trim_end_matches('/').to_string();
        }
        if let Some(val) = lookup("CLAUDE_MODEL") {
            config.model = val.clone();
            config.qa_model = val;
        }
        if let Some(val) = lookup("CLAUDE_MAX_TOKENS") {
            config.max_tokens = parse_env_value(&val, "CLAUDE_MAX_TOKENS")?;
        }
        if let Some(val) = lookup("CLAUDE_TEMPERATURE") {
            config.temperature = parse_env_value(&val, "CLAUDE_TEMPERATURE")?;
        }

        // Q&A
        if let Some(val) = lookup("QA_MODEL") {
            config.qa_model = val;
        }
        if let Some(val) = lookup("QA_MAX_TOKENS") {
            config.qa_max_tokens = parse_env_value(&val, "QA_MAX_TOKENS")?;
        }
        if let Some(val) = lookup("QA_MAX_CONTEXT_BYTES") {
            config.qa_max_context_bytes = parse_env_value(&val, "QA_MAX_CONTEXT_BYTES")?;
        }
        if let Some(val) = lookup("QA_WAIT_TIMEOUT_SECS") {
            config.qa_wait_timeout = parse_env_secs(&val, "QA_WAIT_TIMEOUT_SECS")?;
        }
        if let Some(val) = lookup("QA_MAX_ROUNDS") {
            config.qa_max_rounds = parse_env_value(&val, "QA_MAX_ROUNDS")?;
        }

        // Workers
        if let Some(val) = lookup("WORKER_BLOCK_TIMEOUT_SECS") {
            config.block_timeout = parse_env_secs(&val, "WORKER_BLOCK_TIMEOUT_SECS")?;
        }
        if let Some(val) = lookup("WORKER_ERROR_BACKOFF_SECS") {
            config.error_backoff = parse_env_secs(&val, "WORKER_ERROR_BACKOFF_SECS")?;
        }
        if let Some(val) = lookup("MAX_RETRIES") {
            config.max_retries = parse_env_value(&val, "MAX_RETRIES")?;
        }
        if let Some(val) = lookup("HISTORY_WINDOW") {
            config.history_window = parse_env_value(&val, "HISTORY_WINDOW")?;
        }
        if let Some(val) = lookup("AGENT_PROFILE") {
            config.profile = val.parse()?;
        }
        if let Some(val) = lookup("MIN_COVERAGE_PCT") {
            config.min_coverage_pct = parse_env_value(&val, "MIN_COVERAGE_PCT")?;
        }

        // Watchdog
        if let Some(val) = lookup("INFLIGHT_TIMEOUT_SECS") {
            config.inflight_timeout = parse_env_secs(&val, "INFLIGHT_TIMEOUT_SECS")?;
        }
        if let Some(val) = lookup("WATCHDOG_INTERVAL_SECS") {
            config.watchdog_interval = parse_env_secs(&val, "WATCHDOG_INTERVAL_SECS")?;
        }
        if let Some(val) = lookup("HISTORY_RETENTION_HOURS") {
            let hours: u64 = parse_env_value(&val, "HISTORY_RETENTION_HOURS")?;
            let secs = hours
                .checked_mul(3600)
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: "HISTORY_RETENTION_HOURS".to_string(),
                    message: format!("{} hours is out of range", hours),
                })?;
            config.history_retention = Duration::from_secs(secs);
        }

        // Supervisor
        if let Some(val) = lookup("MONITOR_INTERVAL_SECS") {
            config.monitor_interval = parse_env_secs(&val, "MONITOR_INTERVAL_SECS")?;
        }
        if let Some(val) = lookup("AGENT_STALE_SECS") {
            config.agent_stale_after = parse_env_secs(&val, "AGENT_STALE_SECS")?;
        }

        if let Some(val) = lookup("WORKSPACE_ROOT") {
            config.workspace_root = PathBuf::from(val);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url cannot be empty".to_string(),
            ));
        }

        if self.model.is_empty() || self.qa_model.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "model names cannot be empty".to_string(),
            ));
        }

        if self.max_tokens == 0 || self.qa_max_tokens == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_tokens must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.temperature) {
            return Err(ConfigError::ValidationFailed(
                "temperature must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.max_retries == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_retries must be greater than 0".to_string(),
            ));
        }

        if self.block_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "block_timeout must be greater than 0".to_string(),
            ));
        }

        if self.inflight_timeout.is_zero() || self.watchdog_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "watchdog timeouts must be greater than 0".to_string(),
            ));
        }

        if self.monitor_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "monitor_interval must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=100.0).contains(&self.min_coverage_pct) {
            return Err(ConfigError::ValidationFailed(
                "min_coverage_pct must be between 0 and 100".to_string(),
            ));
        }

        Ok(())
    }

    /// Returns the API key or an error naming the missing variable.
    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        self.anthropic_api_key
            .as_deref()
            .ok_or_else(|| ConfigError::MissingEnvVar("ANTHROPIC_API_KEY".to_string()))
    }

    /// Builder method to set the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Builder method to set the retry cap.
    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    /// Builder method to set the inflight timeout.
    pub fn with_inflight_timeout(mut self, timeout: Duration) -> Self {
        self.inflight_timeout = timeout;
        self
    }

    /// Builder method to set the completion criteria profile.
    pub fn with_profile(mut self, profile: AgentProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Builder method to set the workspace root.
    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = root.into();
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable holding whole seconds.
fn parse_env_secs(value: &str, key: &str) -> Result<Duration, ConfigError> {
    let secs: u64 = parse_env_value(value, key)?;
    Ok(Duration::from_secs(secs))
}
