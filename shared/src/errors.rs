/// Unified error types for Rangefetch.
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error type for downloads.
///
/// Session-level variants (`InvalidLength`, `Parse`, `InvalidConfig`) abort
/// startup. Everything else is recorded on the chunk that hit it.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("request failed: {0}")]
    RequestFailure(String),

    #[error("read failed: {0}")]
    ReadFailure(String),

    #[error("failed to open file: {0}")]
    IoOpen(#[source] std::io::Error),

    #[error("failed to write file: {0}")]
    IoWrite(#[source] std::io::Error),

    #[error("failed to sync file: {0}")]
    IoSync(#[source] std::io::Error),

    #[error("failed to close file: {0}")]
    IoClose(#[source] std::io::Error),

    #[error("failed to seek file: {0}")]
    IoSeek(#[source] std::io::Error),

    #[error("invalid content length: {0}")]
    InvalidLength(String),

    #[error("malformed state: {0}")]
    Parse(String),

    #[error("configuration error: {0}")]
    InvalidConfig(String),

    #[error("cancelled")]
    Cancelled,

    #[error("BUG: {0}")]
    InternalBug(String),
}

impl DownloadError {
    /// Numeric code persisted on the chunk that hit this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            DownloadError::InvalidUrl(_) => ErrorCode::InvalidUrl,
            DownloadError::RequestFailure(_) => ErrorCode::RequestFailure,
            DownloadError::ReadFailure(_) => ErrorCode::ReadFailure,
            DownloadError::IoOpen(_) => ErrorCode::IoOpen,
            DownloadError::IoWrite(_) => ErrorCode::IoWrite,
            DownloadError::IoSync(_) => ErrorCode::IoSync,
            DownloadError::IoClose(_) => ErrorCode::IoClose,
            DownloadError::IoSeek(_) => ErrorCode::IoSeek,
            DownloadError::InvalidLength(_) => ErrorCode::InvalidLength,
            DownloadError::Parse(_) => ErrorCode::Parse,
            DownloadError::InvalidConfig(_) => ErrorCode::InvalidConfig,
            DownloadError::Cancelled => ErrorCode::Cancelled,
            DownloadError::InternalBug(_) => ErrorCode::InternalBug,
        }
    }

    /// Whether this error came from the network side of an attempt.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            DownloadError::InvalidUrl(_)
                | DownloadError::RequestFailure(_)
                | DownloadError::ReadFailure(_)
        )
    }
}

impl From<serde_json::Error> for DownloadError {
    fn from(e: serde_json::Error) -> Self {
        DownloadError::Parse(e.to_string())
    }
}

/// Stable numeric error codes, as written to the state file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum ErrorCode {
    #[default]
    Ok,
    InvalidUrl,
    RequestFailure,
    ReadFailure,
    Cancelled,
    IoOpen,
    IoWrite,
    IoSync,
    IoClose,
    IoSeek,
    InvalidLength,
    Parse,
    InvalidConfig,
    InternalBug,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        match self {
            ErrorCode::Ok => 0,
            ErrorCode::InvalidUrl => 1,
            ErrorCode::RequestFailure => 2,
            ErrorCode::ReadFailure => 3,
            ErrorCode::Cancelled => 4,
            ErrorCode::IoOpen => -1,
            ErrorCode::IoWrite => -2,
            ErrorCode::IoSync => -3,
            ErrorCode::IoClose => -4,
            ErrorCode::IoSeek => -5,
            ErrorCode::InvalidLength => 10,
            ErrorCode::Parse => 11,
            ErrorCode::InvalidConfig => 12,
            ErrorCode::InternalBug => 999,
        }
    }

    pub fn is_ok(self) -> bool {
        self == ErrorCode::Ok
    }
}

impl From<ErrorCode> for i32 {
    fn from(code: ErrorCode) -> Self {
        code.as_i32()
    }
}

impl TryFrom<i32> for ErrorCode {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        let code = match value {
            0 => ErrorCode::Ok,
            1 => ErrorCode::InvalidUrl,
            2 => ErrorCode::RequestFailure,
            3 => ErrorCode::ReadFailure,
            4 => ErrorCode::Cancelled,
            -1 => ErrorCode::IoOpen,
            -2 => ErrorCode::IoWrite,
            -3 => ErrorCode::IoSync,
            -4 => ErrorCode::IoClose,
            -5 => ErrorCode::IoSeek,
            10 => ErrorCode::InvalidLength,
            11 => ErrorCode::Parse,
            12 => ErrorCode::InvalidConfig,
            999 => ErrorCode::InternalBug,
            other => return Err(format!("unknown error code {}", other)),
        };
        Ok(code)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_i32())
    }
}

/// Result type alias for download operations.
pub type DownloadResult<T> = Result<T, DownloadError>;
