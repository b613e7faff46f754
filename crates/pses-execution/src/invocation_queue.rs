//! Marshals work from foreign threads onto the engine's execution thread.
//!
//! While the engine sits in `read_line` it calls `on_idle` on its own thread between
//! keystrokes. A request parked here is picked up by that callback and run in a frame
//! pushed for the purpose, so whatever it runs is isolated from the prompt below it.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use crate::{
    ExecutionError,
    engine::ScriptEngine,
    pipeline::{ExecutionOptions, PsCommand},
    prompt_nest::{PromptNest, PromptNestFrameType},
    request::{ExecutionReply, PendingExecution, PipelineExecutionRequest},
    runspace::RunspaceHandle,
};

/// Runs a command against the handle of the frame pushed for it.
pub type IdleExecutor =
    Box<dyn FnOnce(&RunspaceHandle, PsCommand, &ExecutionOptions) -> ExecutionReply + Send>;

/// A request waiting for the next idle tick.
pub struct InvocationRequest {
    request: PipelineExecutionRequest,
    executor: IdleExecutor,
}

impl InvocationRequest {
    pub fn new(request: PipelineExecutionRequest, executor: IdleExecutor) -> Self {
        Self { request, executor }
    }

    pub fn id(&self) -> Uuid {
        self.request.id()
    }

    fn run(self, handle: &RunspaceHandle) {
        let Self { request, executor } = self;
        request.execute(|command, options| executor(handle, command, options));
    }
}

struct PendingInvocation {
    invocation: InvocationRequest,
    // Held until the invocation has delivered its result, which keeps the next caller out.
    _permit: OwnedSemaphorePermit,
}

/// How an idle-routed command ended.
pub enum IdleOutcome {
    Completed(ExecutionReply),
    /// The prompt stopped reading before the request was picked up. The caller gets the
    /// command back and has to run it some other way.
    Reclaimed(PsCommand, ExecutionOptions),
}

pub struct InvocationEventQueue {
    engine: Arc<dyn ScriptEngine>,
    prompt_nest: Arc<PromptNest>,
    slot: Arc<Semaphore>,
    pending: Mutex<Option<PendingInvocation>>,
    idle_skips: AtomicU64,
}

impl InvocationEventQueue {
    pub fn new(engine: Arc<dyn ScriptEngine>, prompt_nest: Arc<PromptNest>) -> Self {
        Self {
            engine,
            prompt_nest,
            slot: Arc::new(Semaphore::new(1)),
            pending: Mutex::new(None),
            idle_skips: AtomicU64::new(0),
        }
    }

    /// Waits until no earlier invocation is in flight, then parks `invocation` (or clears
    /// the slot when `None`) and nudges the engine to fire its idle callback.
    pub async fn set_invocation_request(
        &self,
        invocation: Option<InvocationRequest>,
    ) -> Result<(), ExecutionError> {
        let permit = Arc::clone(&self.slot)
            .acquire_owned()
            .await
            .map_err(|_| ExecutionError::ChannelClosed("invocation slot"))?;

        let Some(invocation) = invocation else {
            *self.pending.lock() = None;
            return Ok(());
        };

        self.ensure_idle_subscription();
        trace!(target: "invocation_queue", request = %invocation.id(), "invocation request parked");
        *self.pending.lock() = Some(PendingInvocation {
            invocation,
            _permit: permit,
        });
        self.engine.request_idle_tick();
        Ok(())
    }

    /// Idle callback. Must be called on the engine's execution thread.
    ///
    /// Never blocks: if the slot is locked by a caller that is parking a request, this
    /// tick is skipped and the request is picked up by a later one.
    pub fn on_idle(&self) {
        let Some(mut pending) = self.pending.try_lock() else {
            self.idle_skips.fetch_add(1, Ordering::Relaxed);
            trace!(target: "invocation_queue", "idle tick skipped, slot is contended");
            return;
        };
        let taken = pending.take();
        drop(pending);

        if let Some(pending) = taken {
            self.run_pending(pending);
        }
    }

    /// Runs whatever is still parked. Called by the prompt after the engine stopped
    /// reading, before the read-line handle is released.
    pub fn drain(&self) {
        let taken = self.pending.lock().take();
        if let Some(pending) = taken {
            debug!(target: "invocation_queue", request = %pending.invocation.id(), "draining invocation left after read-line");
            self.run_pending(pending);
        }
    }

    fn run_pending(&self, pending: PendingInvocation) {
        let PendingInvocation {
            invocation,
            _permit: permit,
        } = pending;
        let id = invocation.id();
        debug!(target: "invocation_queue", request = %id, "running invocation on idle");

        let ran = self
            .prompt_nest
            .run_in_pushed_frame(PromptNestFrameType::NORMAL, |handle| invocation.run(handle));
        if let Err(error) = ran {
            warn!(target: "invocation_queue", request = %id, %error, "idle invocation could not run");
        }
        drop(permit);
    }

    /// Executes `command` on the next idle tick and waits for its result.
    #[instrument(skip_all, fields(command = %command))]
    pub async fn execute_command_on_idle(
        &self,
        command: PsCommand,
        options: ExecutionOptions,
        executor: IdleExecutor,
    ) -> IdleOutcome {
        let cancel = options.cancellation.clone().unwrap_or_default();
        let (request, pending) = PipelineExecutionRequest::new(command, options);
        let id = request.id();

        let parked = tokio::select! {
            parked = self.set_invocation_request(Some(InvocationRequest::new(request, executor))) => parked,
            () = cancel.cancelled() => Err(ExecutionError::Cancelled),
        };
        if let Err(error) = parked {
            return IdleOutcome::Completed(Err(error));
        }

        // The prompt may have finished, drain included, while the request was parked.
        if !self.prompt_nest.is_read_line_busy() {
            if let Some(invocation) = self.take_if_current(id) {
                info!(target: "invocation_queue", request = %id, "prompt is gone, reclaiming invocation");
                let (command, options) = invocation.request.into_parts();
                return IdleOutcome::Reclaimed(command, options);
            }
        }

        IdleOutcome::Completed(self.await_result(id, pending, &cancel).await)
    }

    async fn await_result(
        &self,
        id: Uuid,
        pending: PendingExecution,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> ExecutionReply {
        let results = pending.results();
        tokio::pin!(results);

        tokio::select! {
            reply = &mut results => reply,
            () = cancel.cancelled() => {
                if self.take_if_current(id).is_some() {
                    debug!(target: "invocation_queue", request = %id, "cancelled before the idle tick");
                    return Err(ExecutionError::Cancelled);
                }
                // Already running; cancellation only covered the wait.
                results.await
            }
        }
    }

    /// Removes the parked invocation only if it is still `id`, so a slow caller can never
    /// clear someone else's request.
    fn take_if_current(&self, id: Uuid) -> Option<InvocationRequest> {
        let mut pending = self.pending.lock();
        if pending.as_ref().is_some_and(|p| p.invocation.id() == id) {
            pending.take().map(|p| p.invocation)
        } else {
            None
        }
    }

    fn ensure_idle_subscription(&self) {
        if self.engine.is_idle_subscribed() {
            return;
        }
        warn!(target: "invocation_queue", "idle subscription was torn down, resubscribing");
        if let Err(error) = self.engine.subscribe_idle() {
            warn!(target: "invocation_queue", %error, "failed to resubscribe to idle events");
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// True while a request is parked or running.
    pub fn is_in_flight(&self) -> bool {
        self.slot.available_permits() == 0
    }

    pub fn idle_skips(&self) -> u64 {
        self.idle_skips.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        request::ExecutionOutput,
        sim::{SimulatedEngine, SimulatedEngineConfig},
        value::PsValue,
    };

    fn queue() -> (Arc<PromptNest>, InvocationEventQueue) {
        let engine = SimulatedEngine::new(SimulatedEngineConfig::default());
        let nest = Arc::new(PromptNest::new(engine.clone()));
        let queue = InvocationEventQueue::new(engine, Arc::clone(&nest));
        (nest, queue)
    }

    fn depth_executor() -> IdleExecutor {
        Box::new(|handle, _, _| {
            Ok(ExecutionOutput {
                output: vec![PsValue::Int(handle.frame().depth as i64)],
                errors: Vec::new(),
            })
        })
    }

    fn invocation() -> (InvocationRequest, PendingExecution) {
        let (request, pending) =
            PipelineExecutionRequest::new(PsCommand::from_script("get-depth"), ExecutionOptions::default());
        (InvocationRequest::new(request, depth_executor()), pending)
    }

    #[tokio::test]
    async fn contended_tick_is_skipped_and_a_later_tick_makes_progress() {
        let (nest, queue) = queue();
        let (invocation, pending) = invocation();
        queue.set_invocation_request(Some(invocation)).await.unwrap();

        {
            let _guard = queue.pending.lock();
            queue.on_idle();
        }
        assert_eq!(queue.idle_skips(), 1);
        assert!(queue.has_pending());

        queue.on_idle();
        assert!(!queue.has_pending());
        assert!(!queue.is_in_flight());

        let output = pending.results().await.unwrap();
        assert_eq!(output.output, vec![PsValue::Int(1)]);
        assert_eq!(nest.depth(), 0, "the idle frame is popped again");
    }

    #[tokio::test]
    async fn second_request_waits_for_the_first_to_complete() {
        let (_nest, queue) = queue();
        let queue = Arc::new(queue);
        let (first, first_pending) = invocation();
        queue.set_invocation_request(Some(first)).await.unwrap();

        let (second, second_pending) = invocation();
        let setter = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.set_invocation_request(Some(second)).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!setter.is_finished(), "second request parked while the first is in flight");

        queue.on_idle();
        first_pending.results().await.unwrap();
        setter.await.unwrap().unwrap();

        queue.on_idle();
        second_pending.results().await.unwrap();
    }

    #[tokio::test]
    async fn clearing_waits_and_leaves_the_slot_empty() {
        let (_nest, queue) = queue();
        queue.set_invocation_request(None).await.unwrap();
        assert!(!queue.has_pending());
        assert!(!queue.is_in_flight());
    }

    #[tokio::test]
    async fn request_is_reclaimed_when_nobody_is_reading() {
        let (_nest, queue) = queue();
        let outcome = queue
            .execute_command_on_idle(
                PsCommand::from_script("echo 1"),
                ExecutionOptions::default(),
                depth_executor(),
            )
            .await;

        match outcome {
            IdleOutcome::Reclaimed(command, _) => assert_eq!(command.to_string(), "echo 1"),
            IdleOutcome::Completed(reply) => panic!("unexpected completion: {reply:?}"),
        }
        assert!(!queue.is_in_flight());
    }
}
