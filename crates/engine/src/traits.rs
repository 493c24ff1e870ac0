/// Result type for live-process operations.
pub type IoResult<T> = Result<T, LiveIoError>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LiveIoError {
    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    #[error("timeout accessing {0}")]
    Timeout(String),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("disconnected: {0}")]
    Disconnected(String),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("cannot evaluate '{expression}': {reason}")]
pub struct EvalError {
    pub expression: String,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Live value I/O
// ---------------------------------------------------------------------------

/// Read/write access to named values of the live process.
///
/// Implementations carry their own timeout semantics. The engine never
/// retries a failed call; retry policy belongs to the command that issued it.
pub trait ValueIo: Send + Sync {
    fn read(&self, channel: &str) -> IoResult<f64>;
    fn write(&self, channel: &str, value: f64) -> IoResult<()>;
}

// ---------------------------------------------------------------------------
// Expression evaluation
// ---------------------------------------------------------------------------

/// Evaluates computed parameters embedded in descriptors.
///
/// Evaluation must be side-effect free: it also runs during simulation.
pub trait ExpressionEval: Send + Sync {
    fn evaluate(&self, expression: &str) -> Result<f64, EvalError>;
}
