//! Crate-level error type for Elmnet nodes
//!
//! Module errors fold into [`ElmnetError`]; anything that has to be reported
//! to a remote agent is mapped onto a wire [`FailureKind`] and sanitized
//! before it leaves the node.

use crate::protocol::messages::{FailureKind, Message, RecordError};
use crate::protocol::topics::TopicError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for Elmnet node operations
#[derive(Debug, Error)]
pub enum ElmnetError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Identity error: {0}")]
    Identity(#[from] crate::identity::IdentityError),

    #[error("Invalid topic: {0}")]
    Topic(#[from] TopicError),

    #[error("Invalid record: {0}")]
    Record(#[from] RecordError),

    #[error("Transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    #[error("Answer engine error: {0}")]
    Answer(#[from] crate::agent::answer::AnswerError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] crate::persistence::PersistenceError),

    #[error("Unexpected message: expected {expected}, got {got}")]
    UnexpectedMessage { expected: &'static str, got: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ElmnetError {
    /// Wire failure kind reported to remote agents
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            ElmnetError::Transport(e) => e.failure_kind(),
            ElmnetError::Identity(_)
            | ElmnetError::Topic(_)
            | ElmnetError::Record(_)
            | ElmnetError::UnexpectedMessage { .. }
            | ElmnetError::InvalidInput { .. } => FailureKind::Malformed,
            ElmnetError::Config(_)
            | ElmnetError::Answer(_)
            | ElmnetError::Persistence(_)
            | ElmnetError::Internal { .. } => FailureKind::NoRoute,
        }
    }

    /// Boundary rejection for this error, safe to send to a peer
    pub fn to_rejection(&self) -> Message {
        Message::Rejected {
            kind: self.failure_kind(),
            reason: sanitize_error_message(&self.to_string()),
        }
    }

    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn unexpected(expected: &'static str, got: &Message) -> Self {
        Self::UnexpectedMessage {
            expected,
            got: got.kind().to_string(),
        }
    }
}

static SECRET_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").ok());

static SENSITIVE_PATH_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config|keys?)/[a-zA-Z0-9._/-]+").ok()
});

/// Hex runs of 64+ characters: public keys, signatures, secret keys
static KEY_MATERIAL_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"\b[0-9a-fA-F]{64,}\b").ok());

const MAX_REASON_LEN: usize = 500;

/// Strip secrets and key material from a message before it leaves the node
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    if let Some(re) = SECRET_PATTERN.as_ref() {
        sanitized = re.replace_all(&sanitized, "${1}=***").to_string();
    }
    if let Some(re) = SENSITIVE_PATH_PATTERN.as_ref() {
        sanitized = re.replace_all(&sanitized, "/***REDACTED***/").to_string();
    }
    if let Some(re) = KEY_MATERIAL_PATTERN.as_ref() {
        sanitized = re.replace_all(&sanitized, "<redacted-hex>").to_string();
    }

    if sanitized.len() > MAX_REASON_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_REASON_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for Elmnet operations
pub type ElmnetResult<T> = Result<T, ElmnetError>;
