/// All errors that can occur within strata.
///
/// Every failure is a compile-time or programmer error raised synchronously
/// to whoever built the graph or invoked a computation. Nothing in the
/// compiler retries.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Two axis sets could not be reconciled (missing axis with broadcast
    /// disabled, reduction axes not found in an operand, ...).
    #[error("axis mismatch: {0}")]
    AxisMismatch(String),

    /// A host value does not match the shape of the tensor it is copied into.
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    /// The backend has no handler for an op.
    #[error("unsupported operation: {op} is not implemented by backend {backend}")]
    UnsupportedOperation { op: String, backend: String },

    /// Conflicting options detected while building a graph or transformer.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Wrong number of positional values passed to a computation.
    #[error("argument count mismatch: computation takes {expected} values, got {got}")]
    ArgumentCountMismatch { expected: usize, got: usize },

    /// Slice step other than 1 or -1, or a slice that does not fit its axis.
    #[error("invalid slice: {0}")]
    InvalidSlice(String),

    /// Operation not allowed in the transformer's current state.
    #[error("invalid transformer state: {0}")]
    InvalidState(String),

    /// A compiler invariant was violated (for example two simultaneously
    /// live values assigned the same buffer).
    #[error("internal error: {0}")]
    Internal(String),

    /// Device runtime failure (allocation, compilation, launch).
    #[error("device error: {0}")]
    Device(String),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    pub fn axis(s: impl Into<String>) -> Self {
        Error::AxisMismatch(s.into())
    }

    pub fn unsupported(op: impl Into<String>, backend: impl Into<String>) -> Self {
        Error::UnsupportedOperation {
            op: op.into(),
            backend: backend.into(),
        }
    }
}

/// Convenience Result type used throughout strata.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
