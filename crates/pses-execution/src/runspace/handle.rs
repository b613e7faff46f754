use std::{fmt, sync::Arc};

use tracing::{error, trace};

use crate::prompt_nest::{FrameContext, PipelineInvoker, PromptNestFrame};

/// An exclusive lease on one frame's engine invocation object.
///
/// Holding a handle is the only sanctioned way to run a command against its frame.
/// Dropping it releases the lease exactly once: the invoker goes to the next waiter on
/// the frame's queue, or back into the queue if nobody is waiting.
pub struct RunspaceHandle {
    invoker: Arc<PipelineInvoker>,
    frame: Arc<PromptNestFrame>,
    is_read_line: bool,
}

impl RunspaceHandle {
    pub(crate) fn new(
        invoker: Arc<PipelineInvoker>,
        frame: Arc<PromptNestFrame>,
        is_read_line: bool,
    ) -> Self {
        if is_read_line {
            frame.set_read_line_busy(true);
        }
        trace!(target: "runspace", frame = %frame.id(), depth = frame.depth(), is_read_line, "runspace handle acquired");
        Self {
            invoker,
            frame,
            is_read_line,
        }
    }

    pub fn invoker(&self) -> &PipelineInvoker {
        &self.invoker
    }

    pub fn frame(&self) -> &FrameContext {
        self.frame.context()
    }

    /// True once the frame this handle belongs to has left the prompt nest.
    pub fn is_frame_popped(&self) -> bool {
        self.frame.is_popped()
    }

    pub fn is_read_line(&self) -> bool {
        self.is_read_line
    }

    /// Marks the frame's prompt as no longer reading while the lease is still held.
    pub(crate) fn end_read_line(&self) {
        if self.is_read_line {
            self.frame.set_read_line_busy(false);
        }
    }

    /// Explicit release; equivalent to dropping the handle.
    pub fn release(self) {}
}

impl fmt::Debug for RunspaceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunspaceHandle")
            .field("frame", self.frame.context())
            .field("is_read_line", &self.is_read_line)
            .finish()
    }
}

impl Drop for RunspaceHandle {
    fn drop(&mut self) {
        if self.is_read_line {
            self.frame.set_read_line_busy(false);
        }

        if self
            .frame
            .queue()
            .try_enqueue(Arc::clone(&self.invoker))
            .is_err()
        {
            error!(target: "runspace", frame = %self.frame.id(), "runspace handle released into an occupied queue");
            debug_assert!(false, "runspace handle released into an occupied queue");
            return;
        }

        trace!(target: "runspace", frame = %self.frame.id(), "runspace handle released");
    }
}
