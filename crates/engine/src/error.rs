use crate::traits::{EvalError, LiveIoError};
use crate::types::{ErrorCode, ErrorInfo};

pub type ScanResult<T> = Result<T, ScanError>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScanError {
    /// Bad descriptor parameters. Raised before any real execution.
    #[error("invalid {kind} command: {message}")]
    Validation { kind: String, message: String },

    #[error("unknown command kind: {0}")]
    Compilation(String),

    #[error("live I/O on '{channel}' failed: {source}")]
    LiveIo {
        channel: String,
        #[source]
        source: LiveIoError,
    },

    #[error(transparent)]
    Expression(#[from] EvalError),

    #[error("timeout after {seconds} s waiting for {channel}")]
    Timeout { channel: String, seconds: f64 },

    /// Cooperative stop was honored. Not a failure.
    #[error("interrupted")]
    Interrupted,

    #[error("busy: {0}")]
    Busy(String),
}

impl ScanError {
    pub fn validation(kind: &str, message: impl Into<String>) -> Self {
        Self::Validation {
            kind: kind.to_string(),
            message: message.into(),
        }
    }

    pub fn live_io(channel: &str, source: LiveIoError) -> Self {
        Self::LiveIo {
            channel: channel.to_string(),
            source,
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            ScanError::Validation { .. } => ErrorCode::InvalidInput,
            ScanError::Compilation(_) => ErrorCode::UnknownCommand,
            ScanError::LiveIo { .. } => ErrorCode::IoError,
            ScanError::Expression(_) => ErrorCode::InvalidInput,
            ScanError::Timeout { .. } => ErrorCode::Timeout,
            ScanError::Interrupted => ErrorCode::Interrupted,
            ScanError::Busy(_) => ErrorCode::Busy,
        }
    }

    /// Errors that reject a sequence before it starts.
    pub fn is_rejection(&self) -> bool {
        matches!(self, ScanError::Validation { .. } | ScanError::Compilation(_))
    }

    pub fn to_info(&self) -> ErrorInfo {
        ErrorInfo {
            code: self.error_code(),
            message: self.to_string(),
        }
    }
}
