//! The execution orchestrator.
//!
//! `ExecutionService` decides, per command, which of four routes reaches the engine:
//!
//! 1. a message loop is open (debugger stop or nested prompt) and the caller is on another
//!    thread: the command is posted into the loop, which runs it on the pipeline thread;
//! 2. the caller is the loop's own thread: the command runs inline through the loop;
//! 3. the prompt is reading input: the command is parked in the `InvocationEventQueue`
//!    and runs on the engine's next idle tick;
//! 4. otherwise the caller waits for the current frame's `RunspaceHandle` and runs the
//!    command on a blocking worker.

mod host;
mod host_output;
mod message_loop;
mod runspace_tracking;

use std::sync::{Arc, atomic::AtomicU64};

use futures::channel::mpsc;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

pub use host_output::{HostOutput, NullHostOutput};
pub use message_loop::LoopKind;

use self::message_loop::{ActiveLoop, LoopSignal, Posted};
use crate::{
    ExecutionError, ServiceConfig,
    engine::{
        EngineError, EngineResult, InvocationOutput, ResumeAction, RunspaceDetails, ScriptEngine,
    },
    events::{ContextEvent, EventBus},
    invocation_queue::{IdleExecutor, IdleOutcome, InvocationEventQueue},
    operations::EngineOperations,
    pipeline::{ExecutionOptions, InvocationSettings, PsCommand},
    prompt_nest::PromptNest,
    request::{ExecutionOutput, ExecutionReply, PendingExecution, panic_message},
    runspace::{ExecutionResult, RunspaceHandle, SessionState, SessionStateMachine},
    value::{FromPsValue, PsValue},
};

/// Cheap to clone; all clones drive the same engine.
#[derive(Clone)]
pub struct ExecutionService {
    inner: Arc<ServiceInner>,
}

pub(crate) struct ServiceInner {
    engine: Arc<dyn ScriptEngine>,
    config: ServiceConfig,
    operations: EngineOperations,
    prompt_nest: Arc<PromptNest>,
    invocation_queue: InvocationEventQueue,
    state: SessionStateMachine,
    events: EventBus,
    host_output: Arc<dyn HostOutput>,
    loops: Mutex<Vec<ActiveLoop>>,
    next_loop_id: AtomicU64,
    read_lines: Mutex<Vec<ActiveReadLine>>,
    runspaces: Mutex<Vec<RunspaceDetails>>,
}

struct ActiveReadLine {
    id: Uuid,
    frame: Uuid,
    cancel: CancellationToken,
}

impl ExecutionService {
    /// Configures the engine for this host and moves the session to `Ready`.
    #[instrument(skip_all)]
    pub fn start(
        engine: Arc<dyn ScriptEngine>,
        config: ServiceConfig,
        host_output: Arc<dyn HostOutput>,
    ) -> Result<Self, ExecutionError> {
        let version = engine.version();
        let operations = EngineOperations::for_version(version);
        info!(target: "execution", %version, ?operations, ?config, "starting execution service");

        operations.configure_debugger(engine.as_ref());
        if !engine.is_idle_subscribed() {
            engine.subscribe_idle()?;
        }

        let base_runspace = engine.runspace_details().unwrap_or_else(|error| {
            warn!(target: "runspace", %error, "could not read the initial runspace, assuming local");
            RunspaceDetails::local()
        });

        let prompt_nest = Arc::new(PromptNest::new(Arc::clone(&engine)));
        let inner = Arc::new(ServiceInner {
            invocation_queue: InvocationEventQueue::new(Arc::clone(&engine), Arc::clone(&prompt_nest)),
            engine,
            config,
            operations,
            prompt_nest,
            state: SessionStateMachine::new(),
            events: EventBus::new(),
            host_output,
            loops: Mutex::new(Vec::new()),
            next_loop_id: AtomicU64::new(1),
            read_lines: Mutex::new(Vec::new()),
            runspaces: Mutex::new(vec![base_runspace]),
        });
        inner.set_state(SessionState::Ready, ExecutionResult::NotFinished, None);

        Ok(Self { inner })
    }

    /// Executes `command` and converts its output to `T`.
    pub async fn execute_command<T: FromPsValue>(
        &self,
        command: PsCommand,
        options: ExecutionOptions,
    ) -> Result<Vec<T>, ExecutionError> {
        Ok(self.execute_command_with_errors(command, options).await?.output)
    }

    /// Like `execute_command`, but also returns the non-terminating errors.
    pub async fn execute_command_with_errors<T: FromPsValue>(
        &self,
        command: PsCommand,
        options: ExecutionOptions,
    ) -> Result<ExecutionOutput<T>, ExecutionError> {
        Ok(self.inner.execute(command, options).await?.convert()?)
    }

    /// Leases the current frame's runspace directly.
    pub async fn get_runspace_handle(
        &self,
        cancel: &CancellationToken,
    ) -> Result<RunspaceHandle, ExecutionError> {
        self.inner.ensure_not_disposed()?;
        self.inner.prompt_nest.get_runspace_handle(cancel, false).await
    }

    /// Reads one line of user input through the engine on the current frame.
    ///
    /// While the line is being read, commands from other callers are run on the engine's
    /// idle ticks. Anything still parked when the line arrives runs before this returns.
    #[instrument(skip_all)]
    pub async fn invoke_read_line(&self, cancel: &CancellationToken) -> Result<String, ExecutionError> {
        self.inner.ensure_not_disposed()?;
        let handle = self.inner.prompt_nest.get_runspace_handle(cancel, true).await?;

        let registration = ActiveReadLine {
            id: Uuid::new_v4(),
            frame: handle.frame().id,
            cancel: cancel.child_token(),
        };
        let registration_id = registration.id;
        let token = registration.cancel.clone();
        self.inner.read_lines.lock().push(registration);

        let inner = Arc::clone(&self.inner);
        let line = tokio::task::spawn_blocking(move || {
            let line = handle.invoker().read_line(&token, inner.as_ref());
            handle.end_read_line();
            inner.invocation_queue.drain();
            inner
                .read_lines
                .lock()
                .retain(|read_line| read_line.id != registration_id);
            drop(handle);
            line
        })
        .await
        .map_err(join_error)?;

        Ok(line?)
    }

    /// Best-effort stop of whatever is running. Idempotent.
    #[instrument(skip_all)]
    pub fn abort_execution(&self) {
        self.inner.abort_execution();
    }

    /// Resumes a stopped debugger. Returns false (and logs) when the debugger is not stopped.
    pub fn resume_debugger(&self, action: ResumeAction) -> bool {
        self.inner.resume_debugger(action)
    }

    /// Asks the engine to break at the next statement.
    pub fn pause_debugger(&self) {
        self.inner.operations.pause_debugger(self.inner.engine.as_ref());
    }

    /// Leaves the innermost nested prompt. Returns false when none is open.
    pub fn exit_nested_prompt(&self) -> bool {
        self.inner.request_nested_prompt_exit()
    }

    pub fn push_runspace(&self, details: RunspaceDetails) {
        self.inner.push_runspace(details);
    }

    pub fn pop_runspace(&self) -> Result<RunspaceDetails, ExecutionError> {
        self.inner.pop_runspace()
    }

    pub fn current_runspace(&self) -> RunspaceDetails {
        self.inner.current_runspace()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ContextEvent> {
        self.inner.events.subscribe()
    }

    pub fn session_state(&self) -> (SessionState, ExecutionResult) {
        self.inner.state.snapshot()
    }

    pub fn operations(&self) -> EngineOperations {
        self.inner.operations
    }

    pub fn prompt_nest(&self) -> &PromptNest {
        &self.inner.prompt_nest
    }

    pub fn is_in_debugger(&self) -> bool {
        self.inner.has_loop(LoopKind::DebuggerStop)
    }

    pub fn is_nested_prompt(&self) -> bool {
        self.inner.has_loop(LoopKind::NestedPrompt)
    }

    pub fn is_read_line_busy(&self) -> bool {
        self.inner.prompt_nest.is_read_line_busy()
    }

    /// Stops accepting work and unblocks everything that is waiting on the engine.
    pub fn dispose(&self) {
        self.inner.dispose();
    }
}

impl ServiceInner {
    #[instrument(skip_all, fields(command = %command))]
    async fn execute(self: &Arc<Self>, command: PsCommand, options: ExecutionOptions) -> ExecutionReply {
        self.ensure_not_disposed()?;

        let mut routed = (command, options);
        loop {
            let (command, options) = routed;
            let (command, options) = match self.post_to_innermost_loop(command, options) {
                Posted::Pending(pending, cancel) => {
                    debug!(target: "execution", request = %pending.id(), "posted command to the pipeline thread");
                    return await_posted(pending, cancel).await;
                }
                Posted::Inline(context, command, options) => {
                    return self.run_in_loop(&context, command, &options);
                }
                Posted::NoLoop(command, options) => (command, options),
            };

            let (command, options) = if self.should_route_through_idle() {
                if options.interrupt_command_prompt {
                    debug!(target: "execution", "interrupting the command prompt");
                    self.cancel_read_line();
                    (command, options)
                } else {
                    let inner = Arc::clone(self);
                    let executor: IdleExecutor = Box::new(move |handle, command, options| {
                        inner.invoke_with_handle(handle, command, options)
                    });
                    match self
                        .invocation_queue
                        .execute_command_on_idle(command, options, executor)
                        .await
                    {
                        IdleOutcome::Completed(reply) => return reply,
                        IdleOutcome::Reclaimed(command, options) => (command, options),
                    }
                }
            } else {
                (command, options)
            };

            match self.execute_direct(command, options).await {
                Direct::Completed(reply) => return reply,
                Direct::LoopOpened(command, options) => routed = (command, options),
            }
        }
    }

    fn should_route_through_idle(&self) -> bool {
        self.config.enable_idle_invocation
            && !self.prompt_nest.is_remote()
            && (self.prompt_nest.is_read_line_busy() || self.invocation_queue.is_in_flight())
    }

    async fn execute_direct(self: &Arc<Self>, command: PsCommand, options: ExecutionOptions) -> Direct {
        let cancel = options.cancellation.clone().unwrap_or_default();
        let handle = match self.prompt_nest.get_runspace_handle(&cancel, false).await {
            Ok(handle) => handle,
            Err(error) => return Direct::Completed(Err(error)),
        };

        // A loop frame belongs to the pipeline thread parked in that loop; commands for it
        // go through the loop.
        let frame_type = handle.frame().frame_type;
        if frame_type.is_debug() || frame_type.is_nested_prompt() {
            // A loop pops its frame before it unregisters, so check ownership first.
            if !self.loop_owns_frame(handle.frame().id) && !handle.is_frame_popped() {
                return Direct::Completed(Err(ExecutionError::invariant(
                    "message loop frame is on top without a running loop",
                )));
            }
            debug!(target: "execution", depth = handle.frame().depth, ?frame_type, "a message loop owns the top frame, rerouting");
            drop(handle);
            return Direct::LoopOpened(command, options);
        }

        let inner = Arc::clone(self);
        let reply = tokio::task::spawn_blocking(move || inner.invoke_with_handle(&handle, command, &options))
            .await
            .unwrap_or_else(|error| Err(join_error(error)));

        if self.config.track_runspace_changes {
            self.update_runspace_details_if_session_changed();
        }
        Direct::Completed(reply)
    }

    /// Runs `command` on the leased frame. Must be called on a thread that may block.
    pub(crate) fn invoke_with_handle(
        &self,
        handle: &RunspaceHandle,
        command: PsCommand,
        options: &ExecutionOptions,
    ) -> ExecutionReply {
        let command = command.prepared_for(options);
        let settings = InvocationSettings::from(options);
        debug!(target: "execution", %command, depth = handle.frame().depth, "invoking command");

        let result = handle.invoker().invoke(&command, &settings, self);
        self.complete_invocation(result, options)
    }

    fn complete_invocation(
        &self,
        result: EngineResult<InvocationOutput>,
        options: &ExecutionOptions,
    ) -> ExecutionReply {
        match result {
            Ok(InvocationOutput { output, errors }) => Ok(ExecutionOutput { output, errors }),
            Err(EngineError::Runtime { message }) => Ok(self.report_runtime_error(message, options)),
            Err(error) => Err(error.into()),
        }
    }

    fn report_runtime_error(&self, message: String, options: &ExecutionOptions) -> ExecutionOutput<PsValue> {
        error!(target: "execution", %message, "command failed");
        if options.write_errors_to_host {
            self.host_output.write_error_line(&message);
        }
        ExecutionOutput {
            output: Vec::new(),
            errors: vec![message],
        }
    }

    fn abort_execution(&self) {
        let state = self.state.state();
        if matches!(state, SessionState::Aborting | SessionState::Disposed) {
            debug!(target: "execution", ?state, "abort already in progress");
            return;
        }

        let in_debugger = self.has_loop(LoopKind::DebuggerStop);
        if state == SessionState::Running || in_debugger {
            info!(target: "execution", in_debugger, "aborting execution");
            self.set_state(SessionState::Aborting, ExecutionResult::NotFinished, Some("execution aborted"));

            if in_debugger {
                self.operations.stop_command_in_debugger(self.engine.as_ref());
                self.signal_innermost(LoopKind::DebuggerStop, LoopSignal::Resume(ResumeAction::Stop));
            } else {
                self.engine.stop();
                if self.has_loop(LoopKind::NestedPrompt) {
                    self.signal_innermost(LoopKind::NestedPrompt, LoopSignal::ExitNestedPrompt);
                }
            }
        }

        if self.prompt_nest.is_read_line_busy() {
            self.cancel_read_line();
        }
    }

    fn resume_debugger(&self, action: ResumeAction) -> bool {
        if self.signal_innermost(LoopKind::DebuggerStop, LoopSignal::Resume(action)) {
            debug!(target: "debugger", ?action, "resume requested");
            true
        } else {
            warn!(target: "debugger", ?action, "resume requested while the debugger is not stopped");
            false
        }
    }

    fn request_nested_prompt_exit(&self) -> bool {
        let exited = self.signal_innermost(LoopKind::NestedPrompt, LoopSignal::ExitNestedPrompt);
        if !exited {
            warn!(target: "execution", "exit requested while no nested prompt is open");
        }
        exited
    }

    fn dispose(&self) {
        info!(target: "execution", "disposing execution service");
        self.set_state(SessionState::Disposed, ExecutionResult::NotFinished, Some("disposed"));

        let loops: Vec<_> = self.loops.lock().iter().map(|active| active.context.clone()).collect();
        for context in loops.iter().rev() {
            let signal = match context.kind {
                LoopKind::DebuggerStop => LoopSignal::Resume(ResumeAction::Stop),
                LoopKind::NestedPrompt => LoopSignal::ExitNestedPrompt,
            };
            context.send_signal(signal);
        }

        self.engine.stop();
        for read_line in self.read_lines.lock().iter() {
            read_line.cancel.cancel();
        }
    }

    fn ensure_not_disposed(&self) -> Result<(), ExecutionError> {
        if self.state.state() == SessionState::Disposed {
            return Err(ExecutionError::Disposed);
        }
        Ok(())
    }

    pub(crate) fn set_state(&self, state: SessionState, result: ExecutionResult, reason: Option<&str>) {
        if let Some(change) = self.state.transition(state, result, reason) {
            self.events.publish(ContextEvent::SessionStateChanged(change));
        }
    }

    /// Cancels the innermost prompt that is reading input.
    fn cancel_read_line(&self) {
        if let Some(read_line) = self.read_lines.lock().last() {
            debug!(target: "execution", frame = %read_line.frame, "cancelling read-line");
            read_line.cancel.cancel();
        }
    }

    fn cancel_read_lines_on(&self, frame: Uuid) {
        for read_line in self.read_lines.lock().iter().filter(|r| r.frame == frame) {
            read_line.cancel.cancel();
        }
    }
}

/// How a direct execution attempt ended.
enum Direct {
    Completed(ExecutionReply),
    /// The top frame turned out to be a message loop's; route the command again.
    LoopOpened(PsCommand, ExecutionOptions),
}

/// Waits for a command posted into a loop. Cancelling stops the wait; the loop skips the
/// request if it has not started it yet.
async fn await_posted(pending: PendingExecution, cancel: Option<CancellationToken>) -> ExecutionReply {
    let Some(cancel) = cancel else {
        return pending.results().await;
    };
    tokio::select! {
        reply = pending.results() => reply,
        () = cancel.cancelled() => {
            debug!(target: "execution", "stopped waiting for a posted command");
            Err(ExecutionError::Cancelled)
        }
    }
}

fn join_error(error: tokio::task::JoinError) -> ExecutionError {
    match error.try_into_panic() {
        Ok(panic) => ExecutionError::Panicked(panic_message(&*panic)),
        Err(_) => ExecutionError::Cancelled,
    }
}
