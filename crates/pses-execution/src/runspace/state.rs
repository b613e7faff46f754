use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::engine::PsInvocationState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    NotStarted,
    Ready,
    Running,
    Aborting,
    Disposed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionResult {
    NotFinished,
    Failed,
    Aborted,
    Stopped,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStateChange {
    pub previous: SessionState,
    pub state: SessionState,
    pub result: ExecutionResult,
    pub reason: Option<String>,
}

impl SessionState {
    fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        match (self, next) {
            (Disposed, _) => false,
            (_, Disposed) => true,
            (NotStarted, NotStarted | Ready) => true,
            (Ready | Running, Ready | Running | Aborting) => true,
            (Aborting, Ready | Aborting) => true,
            _ => false,
        }
    }
}

/// Maps an engine invocation state onto the session state it implies.
pub fn translate_invocation_state(state: PsInvocationState) -> (SessionState, ExecutionResult) {
    match state {
        PsInvocationState::NotStarted => (SessionState::NotStarted, ExecutionResult::NotFinished),
        PsInvocationState::Running => (SessionState::Running, ExecutionResult::NotFinished),
        PsInvocationState::Stopping => (SessionState::Aborting, ExecutionResult::NotFinished),
        PsInvocationState::Stopped => (SessionState::Ready, ExecutionResult::Aborted),
        PsInvocationState::Completed => (SessionState::Ready, ExecutionResult::Completed),
        PsInvocationState::Failed | PsInvocationState::Disconnected => {
            (SessionState::Ready, ExecutionResult::Failed)
        }
    }
}

/// Session state guarded by the transition table; illegal transitions are logged and ignored.
#[derive(Debug)]
pub struct SessionStateMachine {
    current: Mutex<(SessionState, ExecutionResult)>,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self {
            current: Mutex::new((SessionState::NotStarted, ExecutionResult::NotFinished)),
        }
    }

    pub fn state(&self) -> SessionState {
        self.current.lock().0
    }

    pub fn snapshot(&self) -> (SessionState, ExecutionResult) {
        *self.current.lock()
    }

    /// Returns the change when the transition was applied, `None` when it was a no-op or
    /// illegal.
    pub fn transition(
        &self,
        next: SessionState,
        result: ExecutionResult,
        reason: Option<&str>,
    ) -> Option<SessionStateChange> {
        let mut current = self.current.lock();
        let (previous, previous_result) = *current;

        if previous == next && previous_result == result {
            return None;
        }

        if !previous.can_transition_to(next) {
            warn!(target: "session", ?previous, ?next, ?result, "ignoring illegal session state transition");
            return None;
        }

        *current = (next, result);
        debug!(target: "session", ?previous, ?next, ?result, "session state changed");

        Some(SessionStateChange {
            previous,
            state: next,
            result,
            reason: reason.map(str::to_string),
        })
    }

    pub fn apply_invocation_state(
        &self,
        state: PsInvocationState,
        reason: Option<&str>,
    ) -> Option<SessionStateChange> {
        let (next, result) = translate_invocation_state(state);
        self.transition(next, result, reason)
    }
}
