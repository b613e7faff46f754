//! Keeps remote frames in the prompt nest in step with the runspace the engine targets.
//!
//! Reconciliation is best-effort: the engine is polled after direct executions and a
//! broken transport unwinds every remote frame.

use tracing::{debug, info, warn};

use super::ServiceInner;
use crate::{
    ExecutionError,
    engine::{EngineError, RunspaceContext, RunspaceDetails},
    events::{ContextEvent, RunspaceChange, RunspaceChangeReason},
    prompt_nest::PromptNestFrameType,
};

impl ServiceInner {
    pub(crate) fn current_runspace(&self) -> RunspaceDetails {
        let runspaces = self.runspaces.lock();
        // The base runspace is never popped.
        runspaces[runspaces.len() - 1].clone()
    }

    pub(crate) fn push_runspace(&self, details: RunspaceDetails) {
        let reason = if details.context == RunspaceContext::EnteredProcess {
            RunspaceChangeReason::EnteredProcess
        } else {
            RunspaceChangeReason::PushedSession
        };

        let previous = self.current_runspace();
        self.prompt_nest.push(PromptNestFrameType::REMOTE);
        self.runspaces.lock().push(details.clone());
        info!(target: "runspace", id = %details.id, location = ?details.location, ?reason, "runspace pushed");

        self.events.publish(ContextEvent::RunspaceChanged(RunspaceChange {
            reason,
            previous,
            current: details,
        }));
    }

    pub(crate) fn pop_runspace(&self) -> Result<RunspaceDetails, ExecutionError> {
        self.pop_runspace_with(None)
    }

    fn pop_runspace_with(
        &self,
        reason: Option<RunspaceChangeReason>,
    ) -> Result<RunspaceDetails, ExecutionError> {
        if self.runspaces.lock().len() <= 1 {
            return Err(ExecutionError::invariant("no pushed runspace to pop"));
        }
        if self.prompt_nest.current_frame().frame_type() != PromptNestFrameType::REMOTE {
            return Err(ExecutionError::invariant(
                "cannot pop a runspace while a nested frame is active inside it",
            ));
        }

        self.prompt_nest.pop()?;
        let (popped, current) = {
            let mut runspaces = self.runspaces.lock();
            let popped = runspaces
                .pop()
                .ok_or_else(|| ExecutionError::invariant("runspace stack is empty"))?;
            (popped, runspaces[runspaces.len() - 1].clone())
        };

        let reason = reason.unwrap_or(if popped.context == RunspaceContext::EnteredProcess {
            RunspaceChangeReason::ExitedProcess
        } else {
            RunspaceChangeReason::PoppedSession
        });
        info!(target: "runspace", id = %popped.id, ?reason, "runspace popped");

        self.events.publish(ContextEvent::RunspaceChanged(RunspaceChange {
            reason,
            previous: popped.clone(),
            current,
        }));
        Ok(popped)
    }

    /// Polls the engine and pushes or pops remote frames to match.
    pub(crate) fn update_runspace_details_if_session_changed(&self) {
        match self.engine.runspace_details() {
            Ok(details) => self.reconcile_runspace(details),
            Err(EngineError::TransportBroken(message)) => {
                warn!(target: "runspace", %message, "remote session closed unexpectedly");
                self.unwind_remote_runspaces(RunspaceChangeReason::SessionClosed);
            }
            Err(error) => {
                debug!(target: "runspace", %error, "could not read runspace details");
            }
        }
    }

    fn reconcile_runspace(&self, details: RunspaceDetails) {
        let known = {
            let runspaces = self.runspaces.lock();
            if runspaces.last().is_some_and(|current| current.id == details.id) {
                return;
            }
            runspaces.iter().position(|runspace| runspace.id == details.id)
        };

        match known {
            Some(index) => {
                while self.runspaces.lock().len() > index + 1 {
                    if let Err(error) = self.pop_runspace_with(None) {
                        warn!(target: "runspace", %error, "stopped unwinding runspaces");
                        break;
                    }
                }
            }
            None => self.push_runspace(details),
        }
    }

    fn unwind_remote_runspaces(&self, reason: RunspaceChangeReason) {
        while self.runspaces.lock().len() > 1 {
            if let Err(error) = self.pop_runspace_with(Some(reason)) {
                warn!(target: "runspace", %error, "stopped unwinding runspaces");
                break;
            }
        }
    }
}
