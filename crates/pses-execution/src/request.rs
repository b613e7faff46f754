use std::{
    any::Any,
    panic::{AssertUnwindSafe, catch_unwind},
};

use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::{
    ExecutionError,
    pipeline::{ExecutionOptions, PsCommand},
    value::{ConversionError, FromPsValue, PsValue},
};

/// What a command produced: its output plus the non-terminating errors it reported.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutput<T> {
    pub output: Vec<T>,
    pub errors: Vec<String>,
}

impl<T> Default for ExecutionOutput<T> {
    fn default() -> Self {
        Self {
            output: Vec::new(),
            errors: Vec::new(),
        }
    }
}

impl ExecutionOutput<PsValue> {
    pub fn convert<T: FromPsValue>(self) -> Result<ExecutionOutput<T>, ConversionError> {
        Ok(ExecutionOutput {
            output: self
                .output
                .into_iter()
                .map(T::from_ps_value)
                .collect::<Result<_, _>>()?,
            errors: self.errors,
        })
    }
}

pub type ExecutionReply = Result<ExecutionOutput<PsValue>, ExecutionError>;

/// A command hopped from the requesting thread to whichever thread may drive the engine.
///
/// Created by the caller, executed exactly once elsewhere, and awaited through the
/// `PendingExecution` returned alongside it.
pub struct PipelineExecutionRequest {
    id: Uuid,
    command: PsCommand,
    options: ExecutionOptions,
    reply: oneshot::Sender<ExecutionReply>,
}

/// The requester's side of a `PipelineExecutionRequest`.
pub struct PendingExecution {
    id: Uuid,
    rx: oneshot::Receiver<ExecutionReply>,
}

impl PipelineExecutionRequest {
    pub fn new(command: PsCommand, options: ExecutionOptions) -> (Self, PendingExecution) {
        let id = Uuid::new_v4();
        let (reply, rx) = oneshot::channel();
        (
            Self {
                id,
                command,
                options,
                reply,
            },
            PendingExecution { id, rx },
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn command(&self) -> &PsCommand {
        &self.command
    }

    pub fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    /// Takes the command back without running it. The requester will see `Cancelled`
    /// unless it stops waiting first.
    pub fn into_parts(self) -> (PsCommand, ExecutionOptions) {
        (self.command, self.options)
    }

    /// Runs the request and delivers the outcome, including a panic, to the requester.
    pub fn execute<F>(self, run: F)
    where
        F: FnOnce(PsCommand, &ExecutionOptions) -> ExecutionReply,
    {
        let Self {
            id,
            command,
            options,
            reply,
        } = self;

        let outcome = catch_unwind(AssertUnwindSafe(|| run(command, &options)))
            .unwrap_or_else(|panic| Err(ExecutionError::Panicked(panic_message(&*panic))));

        if reply.send(outcome).is_err() {
            debug!(target: "request", request = %id, "requester went away before the result was delivered");
        }
    }
}

impl PendingExecution {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Waits for the outcome. A request dropped without being executed reports `Cancelled`.
    pub async fn results(self) -> ExecutionReply {
        self.rx.await.unwrap_or(Err(ExecutionError::Cancelled))
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
