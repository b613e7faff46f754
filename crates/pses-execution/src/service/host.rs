use tracing::{debug, info};

use super::{
    ServiceInner,
    message_loop::{LoopKind, LoopSignal},
};
use crate::{
    ExecutionError,
    engine::{BreakpointUpdate, DebuggerStopEvent, EngineHost, PsInvocationState, ResumeAction},
    events::ContextEvent,
    runspace::{ExecutionResult, SessionState},
};

impl EngineHost for ServiceInner {
    fn on_idle(&self) {
        self.invocation_queue.on_idle();
    }

    fn on_debugger_stop(&self, event: &DebuggerStopEvent) -> ResumeAction {
        let signal = self.run_message_loop(LoopKind::DebuggerStop, |frame| {
            info!(target: "debugger", script = ?event.script_name, line = event.line, depth = frame.depth(), "debugger stopped");
            self.set_state(SessionState::Ready, ExecutionResult::Stopped, Some("debugger stopped"));
            self.events.publish(ContextEvent::DebuggerStop(event.clone()));
        });

        let action = match signal {
            LoopSignal::Resume(action) => action,
            LoopSignal::ExitNestedPrompt => {
                let _ = ExecutionError::invariant("debugger loop received a nested prompt exit");
                ResumeAction::Continue
            }
        };

        match action {
            ResumeAction::Stop => {
                self.set_state(SessionState::Ready, ExecutionResult::Aborted, Some("debugger stopped execution"));
            }
            _ => self.set_state(SessionState::Running, ExecutionResult::NotFinished, None),
        }
        debug!(target: "debugger", ?action, "debugger resuming");
        action
    }

    fn on_breakpoint_updated(&self, update: &BreakpointUpdate) {
        debug!(target: "debugger", id = update.id, kind = ?update.kind, "breakpoint updated");
        self.events.publish(ContextEvent::BreakpointUpdated(update.clone()));
    }

    fn on_invocation_state_changed(&self, state: PsInvocationState, reason: Option<&str>) {
        if let Some(change) = self.state.apply_invocation_state(state, reason) {
            self.events.publish(ContextEvent::SessionStateChanged(change));
        }
    }

    fn enter_nested_prompt(&self) {
        let signal = self.run_message_loop(LoopKind::NestedPrompt, |frame| {
            info!(target: "execution", depth = frame.depth(), "entering nested prompt");
        });

        if let LoopSignal::Resume(action) = signal {
            let _ = ExecutionError::invariant(format!("nested prompt received a debugger resume ({action:?})"));
        }
        info!(target: "execution", "left nested prompt");
    }

    fn exit_nested_prompt(&self) {
        self.request_nested_prompt_exit();
    }

    fn write_line(&self, line: &str) {
        self.host_output.write_line(line);
    }

    fn write_error_line(&self, line: &str) {
        self.host_output.write_error_line(line);
    }
}
