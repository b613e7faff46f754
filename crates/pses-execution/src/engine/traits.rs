use tokio_util::sync::CancellationToken;

use super::{
    BreakpointUpdate, DebugModes, DebuggerCommandResults, DebuggerStopEvent, EngineResult,
    EngineVersion, InvocationOutput, PsInvocationState, ResumeAction, RunspaceDetails,
};
use crate::{
    pipeline::{InvocationSettings, PsCommand},
    prompt_nest::FrameContext,
};

/// The single-threaded scripting engine.
///
/// Every method that takes a `host` runs synchronously on the calling thread, and the
/// engine must deliver all `EngineHost` callbacks on that same thread. Callers guarantee
/// that at most one invocation per frame is in progress, by holding that frame's
/// `RunspaceHandle` or by running inside the frame's message loop.
pub trait ScriptEngine: Send + Sync + 'static {
    fn version(&self) -> EngineVersion;

    fn invoke(
        &self,
        frame: &FrameContext,
        command: &PsCommand,
        settings: &InvocationSettings,
        host: &dyn EngineHost,
    ) -> EngineResult<InvocationOutput>;

    /// Reads one line of interactive input, calling `host.on_idle()` while waiting.
    fn read_line(
        &self,
        frame: &FrameContext,
        cancel: &CancellationToken,
        host: &dyn EngineHost,
    ) -> EngineResult<String>;

    /// Best-effort stop of the running invocation. Safe to call from any thread.
    fn stop(&self);

    /// Process pending engine events now so that `on_idle` fires promptly.
    fn request_idle_tick(&self);

    fn is_idle_subscribed(&self) -> bool;

    fn subscribe_idle(&self) -> EngineResult<()>;

    fn runspace_details(&self) -> EngineResult<RunspaceDetails>;

    fn debugger_process_command(
        &self,
        frame: &FrameContext,
        command: &PsCommand,
        host: &dyn EngineHost,
    ) -> EngineResult<DebuggerCommandResults>;

    fn debugger_stop_process_command(&self);

    fn debugger_set_step_mode(&self, enabled: bool);

    fn debugger_set_debug_mode(&self, modes: DebugModes);
}

/// Callbacks from the engine into the host, always made on the engine's execution thread.
pub trait EngineHost: Send + Sync {
    fn on_idle(&self);

    /// Blocks the engine until the host decides how to resume.
    fn on_debugger_stop(&self, event: &DebuggerStopEvent) -> ResumeAction;

    fn on_breakpoint_updated(&self, update: &BreakpointUpdate);

    fn on_invocation_state_changed(&self, state: PsInvocationState, reason: Option<&str>);

    /// Blocks the engine until `exit_nested_prompt` is requested.
    fn enter_nested_prompt(&self);

    fn exit_nested_prompt(&self);

    fn write_line(&self, line: &str);

    fn write_error_line(&self, line: &str);
}
