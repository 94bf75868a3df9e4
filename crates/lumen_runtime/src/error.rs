//! Error types for the runtime.

/// Boxed error returned by fallible loop messages.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while running the loop.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Message loop is already running")]
    AlreadyRunning,

    #[error("Message failed: {0}")]
    MessageFailed(#[source] BoxError),
}

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;
