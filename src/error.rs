use thiserror::Error;

/// Result type for stage pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Returned by a blocking queue call whose direction has been interrupted.
///
/// Stage loops treat this as their normal termination signal, not as a fault.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("queue operation interrupted")]
pub struct Interrupted;

/// Errors that can occur while assembling or running a pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A stage was started before all of its queue endpoints were bound
    #[error("Stage {stage} is missing its {endpoint} endpoint")]
    MissingEndpoint {
        stage: String,
        endpoint: &'static str,
    },

    /// Block size is zero or larger than a bound queue can hold
    #[error("Stage {stage}: block size {blocksize} does not fit queue capacity {capacity}")]
    InvalidBlockSize {
        stage: String,
        blocksize: usize,
        capacity: usize,
    },

    /// A queue endpoint was interrupted
    #[error(transparent)]
    Interrupted(#[from] Interrupted),

    /// Thread spawn or join error
    #[error("Thread error: {0}")]
    ThreadError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// I/O error from an ingestion source or a device
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
