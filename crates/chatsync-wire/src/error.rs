//! Error types for chatsync-wire

use thiserror::Error;

/// Result type alias using chatsync-wire Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while talking to the chat backend
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Reading a local transcript or config failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend returned a non-success status
    #[error("API error: {message} (status: {status})")]
    Api { status: u16, message: String },

    /// The byte stream broke mid-read
    #[error("Transport error: {0}")]
    Transport(String),

    /// Stream was deliberately cancelled
    #[error("Stream cancelled")]
    Aborted,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Create an API error from a status code and message
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Check if this error is worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Error::Transport(_) | Error::Io(_) => true,
            Error::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Whether the error is a deliberate cancellation rather than a failure
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Aborted)
    }
}

/// Why a single wire record was rejected.
///
/// Decode errors never abort a stream: the decoder logs them and the record is
/// skipped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Payload was not valid JSON
    #[error("malformed JSON: {0}")]
    MalformedJson(String),

    /// A required field was absent or null
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    /// A field was present but could not be coerced to its declared type
    #[error("field `{field}` has invalid value: {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// Event name has no envelope mapping
    #[error("unknown event `{0}`")]
    UnknownEvent(String),

    /// `kind` is not a known chunk kind
    #[error("unknown message kind `{0}`")]
    UnknownKind(String),

    /// Payload carried neither terminal nor delta fields
    #[error("payload shape matches neither a chunk nor a completion")]
    UnrecognizedShape,
}
