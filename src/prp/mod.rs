//! PRP (Product Requirement Prompt) data model.
//!
//! A PRP is the unit of work that moves through the pipeline. It lives in
//! Redis as a flat hash at `prp:<id>`; [`Prp`] is the typed view of it.

pub mod history;
pub mod keys;
pub mod lifecycle;
pub mod status;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

pub use history::ConversationTurn;
pub use keys::field;
pub use lifecycle::Lifecycle;
pub use status::{AgentState, AgentStatus};

/// Errors raised when reading a PRP hash.
#[derive(Debug, Error)]
pub enum PrpError {
    #[error("unknown PRP state '{0}'")]
    UnknownState(String),

    #[error("PRP hash is missing required field '{0}'")]
    MissingField(&'static str),

    #[error("invalid value for PRP field '{field}': {value}")]
    InvalidField { field: &'static str, value: String },

    #[error("illegal state transition {from} -> {to}")]
    IllegalTransition { from: PrpState, to: PrpState },
}

/// Pipeline state of a PRP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrpState {
    New,
    Dev,
    Validation,
    Integration,
    Complete,
    Failed,
}

impl PrpState {
    pub const ALL: [PrpState; 6] = [
        PrpState::New,
        PrpState::Dev,
        PrpState::Validation,
        PrpState::Integration,
        PrpState::Complete,
        PrpState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PrpState::New => "new",
            PrpState::Dev => "dev",
            PrpState::Validation => "validation",
            PrpState::Integration => "integration",
            PrpState::Complete => "complete",
            PrpState::Failed => "failed",
        }
    }

    /// `complete` and `failed` accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PrpState::Complete | PrpState::Failed)
    }
}

impl fmt::Display for PrpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PrpState {
    type Err = PrpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PrpState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| PrpError::UnknownState(s.to_string()))
    }
}

/// Metadata stamped on a PRP while a worker holds it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessingInfo {
    /// Unix seconds at which the claim was stamped.
    pub started_at: Option<i64>,
    pub worker: Option<String>,
    pub queue: Option<String>,
}

impl ProcessingInfo {
    pub fn is_empty(&self) -> bool {
        self.started_at.is_none() && self.worker.is_none() && self.queue.is_none()
    }
}

/// Typed view of a PRP hash.
#[derive(Debug, Clone, PartialEq)]
pub struct Prp {
    pub id: String,
    pub title: String,
    pub content: String,
    pub state: PrpState,
    pub retry_count: u32,
    /// Unix seconds.
    pub created_at: i64,
    /// Unix seconds.
    pub updated_at: i64,
    pub last_error: Option<String>,
    pub failure_reason: Option<String>,
    pub processing: ProcessingInfo,
    /// Every non-reserved field: evidence and per-stage completion stamps.
    pub fields: BTreeMap<String, String>,
}

impl Prp {
    /// Create a new PRP in state `new` with a random id.
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), title, content)
    }

    /// Create a new PRP in state `new` with an explicit id.
    pub fn with_id(
        id: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: id.into(),
            title: title.into(),
            content: content.into(),
            state: PrpState::New,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            last_error: None,
            failure_reason: None,
            processing: ProcessingInfo::default(),
            fields: BTreeMap::new(),
        }
    }

    /// Build the typed view from a raw hash.
    ///
    /// `id` and `state` are required. Missing counters and timestamps
    /// default to zero; unknown fields land in [`Prp::fields`].
    pub fn from_hash(mut hash: HashMap<String, String>) -> Result<Self, PrpError> {
        let id = hash
            .remove(field::ID)
            .filter(|id| !id.is_empty())
            .ok_or(PrpError::MissingField(field::ID))?;
        let state = hash
            .remove(field::STATE)
            .ok_or(PrpError::MissingField(field::STATE))?
            .parse()?;

        let retry_count = parse_optional(&mut hash, field::RETRY_COUNT)?.unwrap_or(0);
        let created_at = parse_optional(&mut hash, field::CREATED_AT)?.unwrap_or(0);
        let updated_at = parse_optional(&mut hash, field::UPDATED_AT)?.unwrap_or(created_at);

        let processing = ProcessingInfo {
            started_at: parse_optional(&mut hash, field::PROCESSING_STARTED_AT)?,
            worker: hash.remove(field::PROCESSING_WORKER),
            queue: hash.remove(field::PROCESSING_QUEUE),
        };

        let title = hash.remove(field::TITLE).unwrap_or_default();
        let content = hash.remove(field::CONTENT).unwrap_or_default();
        let last_error = hash.remove(field::LAST_ERROR);
        let failure_reason = hash.remove(field::FAILURE_REASON);

        let fields = hash
            .into_iter()
            .filter(|(k, _)| !field::is_reserved(k))
            .collect();

        Ok(Self {
            id,
            title,
            content,
            state,
            retry_count,
            created_at,
            updated_at,
            last_error,
            failure_reason,
            processing,
            fields,
        })
    }

    /// Field/value pairs for `HSET` when the PRP is first written.
    pub fn to_hash_fields(&self) -> Vec<(String, String)> {
        let mut out = vec![
            (field::ID.to_string(), self.id.clone()),
            (field::TITLE.to_string(), self.title.clone()),
            (field::CONTENT.to_string(), self.content.clone()),
            (field::STATE.to_string(), self.state.to_string()),
            (field::RETRY_COUNT.to_string(), self.retry_count.to_string()),
            (field::CREATED_AT.to_string(), self.created_at.to_string()),
            (field::UPDATED_AT.to_string(), self.updated_at.to_string()),
        ];
        if let Some(err) = &self.last_error {
            out.push((field::LAST_ERROR.to_string(), err.clone()));
        }
        if let Some(reason) = &self.failure_reason {
            out.push((field::FAILURE_REASON.to_string(), reason.clone()));
        }
        out.extend(self.fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        out
    }

    /// Whether `role` has recorded its completion on this PRP.
    pub fn completed_by(&self, role: &str) -> Option<&str> {
        self.fields
            .get(&field::completed_by(role))
            .map(String::as_str)
    }
}

fn parse_optional<T: FromStr>(
    hash: &mut HashMap<String, String>,
    name: &'static str,
) -> Result<Option<T>, PrpError> {
    match hash.remove(name) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| PrpError::InvalidField {
                field: name,
                value: raw,
            }),
    }
}
