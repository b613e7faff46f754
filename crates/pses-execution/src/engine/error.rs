/// Errors reported by the scripting engine across the engine boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("{message}")]
    Runtime { message: String },

    #[error("The pipeline has been stopped")]
    PipelineStopped,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Remoting transport broken: {0}")]
    TransportBroken(String),

    #[error("Not supported: {0}")]
    NotSupported(&'static str),

    #[error("Idle subscription failed: {0}")]
    Subscription(String),
}

impl EngineError {
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
