mod handle;
mod queue;
mod state;

pub use handle::RunspaceHandle;
pub use queue::AsyncWaitQueue;
pub use state::{
    ExecutionResult, SessionState, SessionStateChange, SessionStateMachine,
    translate_invocation_state,
};
