//! Stack of nested execution frames.
//!
//! Every frame (main prompt, nested prompt, debugger stop, remote session) owns a separate
//! handle queue, so a handle acquired at depth N can never be handed out again at depth
//! N+1. Only the top frame issues new handles.

mod frame;

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use frame::{FrameContext, PipelineInvoker, PromptNestFrame, PromptNestFrameType};

use crate::{ExecutionError, engine::ScriptEngine, runspace::RunspaceHandle};

pub struct PromptNest {
    engine: Arc<dyn ScriptEngine>,
    frames: Mutex<Vec<Arc<PromptNestFrame>>>,
}

impl PromptNest {
    pub fn new(engine: Arc<dyn ScriptEngine>) -> Self {
        let base = PromptNestFrame::new(Arc::clone(&engine), 0, PromptNestFrameType::NORMAL);
        Self {
            engine,
            frames: Mutex::new(vec![base]),
        }
    }

    /// Pushes a frame with a fresh, available handle. Frames pushed inside a remote frame
    /// stay remote.
    pub fn push(&self, frame_type: PromptNestFrameType) -> Arc<PromptNestFrame> {
        let mut frames = self.frames.lock();
        let inherited = frames
            .last()
            .filter(|top| top.frame_type().is_remote())
            .map_or(PromptNestFrameType::NORMAL, |_| PromptNestFrameType::REMOTE);

        let frame = PromptNestFrame::new(
            Arc::clone(&self.engine),
            frames.len(),
            frame_type | inherited,
        );
        frames.push(Arc::clone(&frame));
        debug!(target: "prompt_nest", frame = %frame.id(), depth = frame.depth(), frame_type = ?frame.frame_type(), "pushed frame");
        frame
    }

    /// Pops the top frame. The base frame is never popped.
    pub fn pop(&self) -> Result<Arc<PromptNestFrame>, ExecutionError> {
        let mut frames = self.frames.lock();
        if frames.len() <= 1 {
            return Err(ExecutionError::invariant("attempted to pop the base prompt frame"));
        }

        let Some(frame) = frames.pop() else {
            return Err(ExecutionError::invariant("prompt nest is empty"));
        };

        // Waiters parked on the frame move on to the new top frame.
        let moved = frame.pending_handle_requests();
        frame.close();
        debug!(target: "prompt_nest", frame = %frame.id(), depth = frame.depth(), handle_out = !frame.is_handle_available(), moved, "popped frame");
        Ok(frame)
    }

    /// Pops `expected`, which must be the top frame.
    pub fn pop_frame(&self, expected: &PromptNestFrame) -> Result<Arc<PromptNestFrame>, ExecutionError> {
        {
            let frames = self.frames.lock();
            if frames.last().map(|top| top.id()) != Some(expected.id()) {
                return Err(ExecutionError::invariant(format!(
                    "frame {} is not the top of the prompt nest",
                    expected.id()
                )));
            }
        }
        self.pop()
    }

    pub fn current_frame(&self) -> Arc<PromptNestFrame> {
        let frames = self.frames.lock();
        // The base frame is never popped, so the stack is never empty.
        Arc::clone(&frames[frames.len() - 1])
    }

    pub fn base_frame(&self) -> Arc<PromptNestFrame> {
        Arc::clone(&self.frames.lock()[0])
    }

    /// Number of frames above the base frame.
    pub fn depth(&self) -> usize {
        self.frames.lock().len() - 1
    }

    pub fn is_remote(&self) -> bool {
        self.current_frame().frame_type().is_remote()
    }

    pub fn is_in_debugger(&self) -> bool {
        self.current_frame().frame_type().is_debug()
    }

    pub fn is_nested_prompt(&self) -> bool {
        self.current_frame().frame_type().is_nested_prompt()
    }

    pub fn is_read_line_busy(&self) -> bool {
        self.current_frame().is_read_line_busy()
    }

    /// Pushes a frame for the duration of `action`, hands it that frame's handle and pops
    /// the frame afterwards, also when `action` unwinds.
    pub fn run_in_pushed_frame<R>(
        &self,
        frame_type: PromptNestFrameType,
        action: impl FnOnce(&RunspaceHandle) -> R,
    ) -> Result<R, ExecutionError> {
        let frame = self.push(frame_type);
        let handle = frame.try_take_handle(false);
        // Dropped before `handle`: the frame is gone before its handle is released, so the
        // handle can never pass to a waiter parked on it.
        let _pop = PopOnDrop { nest: self, frame: &frame };
        let Some(handle) = handle.as_ref() else {
            return Err(ExecutionError::invariant("freshly pushed frame has no handle"));
        };
        Ok(action(handle))
    }

    /// Waits for the handle of the top frame. If that frame is popped while waiting, the
    /// wait moves to the frame that is on top then.
    pub async fn get_runspace_handle(
        &self,
        cancel: &CancellationToken,
        is_read_line: bool,
    ) -> Result<RunspaceHandle, ExecutionError> {
        loop {
            let frame = self.current_frame();
            match frame.take_handle(cancel, is_read_line).await {
                Err(ExecutionError::ChannelClosed(_)) if frame.is_popped() => {
                    debug!(target: "prompt_nest", frame = %frame.id(), "frame popped while waiting for its handle, retrying on the top frame");
                }
                result => return result,
            }
        }
    }
}

struct PopOnDrop<'a> {
    nest: &'a PromptNest,
    frame: &'a PromptNestFrame,
}

impl Drop for PopOnDrop<'_> {
    fn drop(&mut self) {
        if let Err(error) = self.nest.pop_frame(self.frame) {
            warn!(target: "prompt_nest", frame = %self.frame.id(), %error, "failed to pop pushed frame");
        }
    }
}
