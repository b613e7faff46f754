use std::borrow::Cow;

pub mod config;
pub mod engine;
pub mod events;
pub mod invocation_queue;
pub mod operations;
pub mod pipeline;
pub mod prompt_nest;
pub mod request;
pub mod runspace;
pub mod service;
pub mod sim;
pub mod value;

#[cfg(test)]
mod tests;

pub use config::ServiceConfig;
pub use engine::{EngineError, EngineHost, ScriptEngine};
pub use events::{ContextEvent, EventBus};
pub use pipeline::{ExecutionOptions, PipelineCommand, PsCommand};
pub use request::{ExecutionOutput, PipelineExecutionRequest};
pub use runspace::{ExecutionResult, RunspaceHandle, SessionState};
pub use service::{ExecutionService, HostOutput, LoopKind, NullHostOutput};
pub use value::{FromPsValue, PsValue};

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Engine runtime error: {0}")]
    EngineRuntime(String),

    #[error("The pipeline has been stopped")]
    PipelineStopped,

    #[error("Invariant violated: {0}")]
    InvariantViolation(Cow<'static, str>),

    #[error("Not supported: {0}")]
    NotSupported(&'static str),

    #[error("Execution service has been disposed")]
    Disposed,

    #[error("Conversion error: {0}")]
    Conversion(#[from] value::ConversionError),

    #[error("Execution panicked: {0}")]
    Panicked(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),
}

impl ExecutionError {
    /// Cancellation and engine-level stops are both "the work did not finish" outcomes.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::PipelineStopped)
    }

    pub(crate) fn invariant(message: impl Into<Cow<'static, str>>) -> Self {
        let message = message.into();
        tracing::error!(target: "invariant", %message, "invariant violated");
        Self::InvariantViolation(message)
    }
}

impl From<EngineError> for ExecutionError {
    fn from(value: EngineError) -> Self {
        match value {
            EngineError::Runtime { message } => Self::EngineRuntime(message),
            EngineError::PipelineStopped => Self::PipelineStopped,
            EngineError::Cancelled => Self::Cancelled,
            EngineError::NotSupported(what) => Self::NotSupported(what),
            EngineError::TransportBroken(message) => {
                Self::EngineRuntime(format!("remoting transport broken: {message}"))
            }
            EngineError::Subscription(message) => {
                Self::EngineRuntime(format!("idle subscription failed: {message}"))
            }
        }
    }
}
