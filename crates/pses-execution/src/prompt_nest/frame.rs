use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    ExecutionError,
    engine::{EngineHost, EngineResult, InvocationOutput, ScriptEngine},
    pipeline::{InvocationSettings, PsCommand},
    runspace::{AsyncWaitQueue, RunspaceHandle},
};

/// Kind of a prompt nest frame, combinable with `|`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PromptNestFrameType(u8);

impl PromptNestFrameType {
    pub const NORMAL: Self = Self(0);
    pub const NESTED_PROMPT: Self = Self(1);
    pub const DEBUG: Self = Self(2);
    pub const REMOTE: Self = Self(4);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_remote(self) -> bool {
        self.contains(Self::REMOTE)
    }

    pub const fn is_debug(self) -> bool {
        self.contains(Self::DEBUG)
    }

    pub const fn is_nested_prompt(self) -> bool {
        self.contains(Self::NESTED_PROMPT)
    }
}

impl std::ops::BitOr for PromptNestFrameType {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for PromptNestFrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return write!(f, "Normal");
        }
        let mut first = true;
        for (flag, name) in [
            (Self::NESTED_PROMPT, "NestedPrompt"),
            (Self::DEBUG, "Debug"),
            (Self::REMOTE, "Remote"),
        ] {
            if self.contains(flag) {
                if !first {
                    write!(f, " | ")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Identity of a frame as seen by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameContext {
    pub id: Uuid,
    pub depth: usize,
    pub frame_type: PromptNestFrameType,
}

/// The isolated engine invocation object of one frame.
pub struct PipelineInvoker {
    context: FrameContext,
    engine: Arc<dyn ScriptEngine>,
}

impl PipelineInvoker {
    pub fn context(&self) -> &FrameContext {
        &self.context
    }

    pub fn invoke(
        &self,
        command: &PsCommand,
        settings: &InvocationSettings,
        host: &dyn EngineHost,
    ) -> EngineResult<InvocationOutput> {
        self.engine.invoke(&self.context, command, settings, host)
    }

    pub fn read_line(
        &self,
        cancel: &CancellationToken,
        host: &dyn EngineHost,
    ) -> EngineResult<String> {
        self.engine.read_line(&self.context, cancel, host)
    }
}

/// One level of nested execution with its own handle queue.
pub struct PromptNestFrame {
    context: FrameContext,
    queue: AsyncWaitQueue<Arc<PipelineInvoker>>,
    read_line_busy: AtomicBool,
}

impl PromptNestFrame {
    pub(crate) fn new(
        engine: Arc<dyn ScriptEngine>,
        depth: usize,
        frame_type: PromptNestFrameType,
    ) -> Arc<Self> {
        let context = FrameContext {
            id: Uuid::new_v4(),
            depth,
            frame_type,
        };
        let invoker = Arc::new(PipelineInvoker {
            context: context.clone(),
            engine,
        });

        Arc::new(Self {
            context,
            queue: AsyncWaitQueue::with_item(invoker),
            read_line_busy: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> Uuid {
        self.context.id
    }

    pub fn depth(&self) -> usize {
        self.context.depth
    }

    pub fn frame_type(&self) -> PromptNestFrameType {
        self.context.frame_type
    }

    pub fn context(&self) -> &FrameContext {
        &self.context
    }

    pub(crate) fn queue(&self) -> &AsyncWaitQueue<Arc<PipelineInvoker>> {
        &self.queue
    }

    /// Waits for this frame's handle.
    pub async fn take_handle(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        is_read_line: bool,
    ) -> Result<RunspaceHandle, ExecutionError> {
        let invoker = self.queue.dequeue(cancel).await?;
        Ok(RunspaceHandle::new(invoker, Arc::clone(self), is_read_line))
    }

    /// Takes this frame's handle only if it is available right now.
    pub fn try_take_handle(self: &Arc<Self>, is_read_line: bool) -> Option<RunspaceHandle> {
        self.queue
            .try_dequeue()
            .map(|invoker| RunspaceHandle::new(invoker, Arc::clone(self), is_read_line))
    }

    pub fn is_handle_available(&self) -> bool {
        self.queue.has_item()
    }

    /// A popped frame issues no further handles.
    pub fn is_popped(&self) -> bool {
        self.queue.is_closed()
    }

    pub(crate) fn close(&self) {
        self.queue.close();
    }

    pub fn pending_handle_requests(&self) -> usize {
        self.queue.waiter_count()
    }

    pub fn is_read_line_busy(&self) -> bool {
        self.read_line_busy.load(Ordering::Acquire)
    }

    pub(crate) fn set_read_line_busy(&self, busy: bool) {
        self.read_line_busy.store(busy, Ordering::Release);
    }
}

impl fmt::Debug for PromptNestFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromptNestFrame")
            .field("context", &self.context)
            .field("handle_available", &self.is_handle_available())
            .field("read_line_busy", &self.is_read_line_busy())
            .field("popped", &self.is_popped())
            .finish()
    }
}
