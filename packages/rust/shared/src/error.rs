//! Error types for kbingest.
//!
//! Library crates use [`IngestError`] via `thiserror`. The ingestion pipeline
//! reports per-URL failures as a [`StageError`] carrying an [`ErrorCode`] and
//! the [`Stage`] it happened in. The CLI wraps both with `color-eyre`.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level error type for all kbingest library operations.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error during fetch.
    #[error("network error: {0}")]
    Network(String),

    /// Content parsing or extraction error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad input, invalid URL, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A referenced row does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A unique name is already taken.
    #[error("name already exists: {0}")]
    DuplicateName(String),

    /// A tag would become its own ancestor.
    #[error("circular reference: tag {tag_id} cannot have parent {parent_id}")]
    CircularReference { tag_id: String, parent_id: String },

    /// Stored data violates an invariant (e.g. runaway parent chain).
    #[error("data corruption: {0}")]
    Corrupted(String),

    /// Content conversion error (HTML → Markdown, decoding).
    #[error("conversion error: {0}")]
    Conversion(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, IngestError>;

impl IngestError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a not-found error for a given entity kind.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Stable machine-readable code, used by the CLI's JSON output.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config { .. } => "CONFIG",
            Self::Network(_) => "NETWORK",
            Self::Parse { .. } => "PARSE",
            Self::Storage(_) => "STORAGE",
            Self::Io { .. } => "IO",
            Self::Validation { .. } => "VALIDATION",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::DuplicateName(_) => "DUPLICATE_NAME",
            Self::CircularReference { .. } => "CIRCULAR_REFERENCE",
            Self::Corrupted(_) => "CORRUPTED",
            Self::Conversion(_) => "CONVERSION",
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline taxonomy
// ---------------------------------------------------------------------------

/// One phase of the ingestion pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Detecting,
    Fetching,
    Processing,
    Storing,
    Indexing,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Stage; 5] = [
        Stage::Detecting,
        Stage::Fetching,
        Stage::Processing,
        Stage::Storing,
        Stage::Indexing,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Detecting => "DETECTING",
            Stage::Fetching => "FETCHING",
            Stage::Processing => "PROCESSING",
            Stage::Storing => "STORING",
            Stage::Indexing => "INDEXING",
        }
    }

    /// Progress percentage reported while a run is inside this stage.
    pub fn progress(self) -> u8 {
        match self {
            Stage::Detecting => 10,
            Stage::Fetching => 30,
            Stage::Processing => 50,
            Stage::Storing => 70,
            Stage::Indexing => 90,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified failure reasons for a single URL run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidUrl,
    UnsupportedType,
    FetchFailed,
    ProcessingFailed,
    StorageFailed,
    Timeout,
    AccessDenied,
    RateLimited,
    DuplicateUrl,
    DuplicateContent,
    UnknownError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidUrl => "INVALID_URL",
            ErrorCode::UnsupportedType => "UNSUPPORTED_TYPE",
            ErrorCode::FetchFailed => "FETCH_FAILED",
            ErrorCode::ProcessingFailed => "PROCESSING_FAILED",
            ErrorCode::StorageFailed => "STORAGE_FAILED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::AccessDenied => "ACCESS_DENIED",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::DuplicateUrl => "DUPLICATE_URL",
            ErrorCode::DuplicateContent => "DUPLICATE_CONTENT",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }

    /// Whether a caller may reasonably retry a run that failed with this code.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::Timeout | ErrorCode::RateLimited | ErrorCode::FetchFailed
        )
    }

    /// Map a fetch failure message onto the fetch-related codes. URLs in the
    /// message are ignored so a path like `/docs/timeout` cannot pick the code.
    pub fn from_fetch_message(message: &str) -> Self {
        let msg = message
            .split_whitespace()
            .filter(|token| !token.contains("://"))
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        if msg.contains("timeout") || msg.contains("timed out") {
            ErrorCode::Timeout
        } else if msg.contains("429")
            || msg.contains("rate limit")
            || msg.contains("too many requests")
        {
            ErrorCode::RateLimited
        } else if msg.contains("403")
            || msg.contains("401")
            || msg.contains("forbidden")
            || msg.contains("unauthorized")
            || msg.contains("access denied")
        {
            ErrorCode::AccessDenied
        } else {
            ErrorCode::FetchFailed
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified, stage-scoped pipeline failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("[{stage}] {code}: {message}")]
pub struct StageError {
    pub code: ErrorCode,
    pub stage: Stage,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl StageError {
    pub fn new(code: ErrorCode, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            code,
            stage,
            message: message.into(),
            url: None,
        }
    }

    /// Attach the URL the failure belongs to.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = IngestError::config("missing data dir");
        assert_eq!(err.to_string(), "config error: missing data dir");

        let err = IngestError::not_found("tag", "abc");
        assert_eq!(err.to_string(), "tag not found: abc");
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[test]
    fn fetch_messages_map_to_codes() {
        assert_eq!(
            ErrorCode::from_fetch_message("https://a.com: request timeout"),
            ErrorCode::Timeout
        );
        assert_eq!(
            ErrorCode::from_fetch_message("https://a.com: HTTP 403 Forbidden"),
            ErrorCode::AccessDenied
        );
        assert_eq!(
            ErrorCode::from_fetch_message("https://a.com: HTTP 429 Too Many Requests"),
            ErrorCode::RateLimited
        );
        assert_eq!(
            ErrorCode::from_fetch_message("https://a.com: connection refused"),
            ErrorCode::FetchFailed
        );
    }

    #[test]
    fn url_text_does_not_pick_the_code() {
        for message in [
            "https://a.com/docs/timeout-settings: HTTP 404 Not Found",
            "https://a.com/forms/401k: HTTP 404 Not Found",
            "https://a.com/rate%20limit/429: HTTP 404 Not Found",
            "error sending request for url (https://a.com/timeout/): connection refused",
        ] {
            assert_eq!(ErrorCode::from_fetch_message(message), ErrorCode::FetchFailed, "{message}");
        }
        assert_eq!(
            ErrorCode::from_fetch_message("https://a.com/401k: request timeout"),
            ErrorCode::Timeout
        );
    }

    #[test]
    fn retryable_codes() {
        assert!(ErrorCode::Timeout.is_retryable());
        assert!(ErrorCode::RateLimited.is_retryable());
        assert!(!ErrorCode::AccessDenied.is_retryable());
        assert!(!ErrorCode::UnsupportedType.is_retryable());
    }

    #[test]
    fn stage_error_serializes_codes() {
        let err = StageError::new(ErrorCode::DuplicateContent, Stage::Fetching, "dup")
            .with_url("https://a.com/");
        let json = serde_json::to_value(&err).expect("serialize");
        assert_eq!(json["code"], "DUPLICATE_CONTENT");
        assert_eq!(json["stage"], "FETCHING");
        assert_eq!(err.to_string(), "[FETCHING] DUPLICATE_CONTENT: dup");
    }
}
