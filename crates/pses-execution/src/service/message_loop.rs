//! Blocking message loops run on the pipeline thread while the engine is paused.
//!
//! A debugger stop or a nested prompt parks the engine thread inside a host callback. The
//! loop keeps that thread busy doing the only useful thing it can: running commands posted
//! from other threads, until a resume or exit signal arrives. Loops nest; requests always
//! go to the innermost one.

use std::{
    sync::{Arc, atomic::Ordering},
    thread::{self, ThreadId},
};

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::ServiceInner;
use crate::{
    ExecutionError,
    engine::{DebuggerCommandResults, ResumeAction},
    pipeline::{ExecutionOptions, PsCommand},
    prompt_nest::{PromptNestFrame, PromptNestFrameType},
    request::{ExecutionOutput, ExecutionReply, PendingExecution, PipelineExecutionRequest},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    DebuggerStop,
    NestedPrompt,
}

impl LoopKind {
    pub(crate) const fn frame_type(self) -> PromptNestFrameType {
        match self {
            Self::DebuggerStop => PromptNestFrameType::DEBUG,
            Self::NestedPrompt => PromptNestFrameType::NESTED_PROMPT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopSignal {
    Resume(ResumeAction),
    ExitNestedPrompt,
}

/// What a running loop needs to know about itself.
#[derive(Clone)]
pub(crate) struct LoopContext {
    pub(crate) id: u64,
    pub(crate) kind: LoopKind,
    pub(crate) frame: Arc<PromptNestFrame>,
    signals: Sender<LoopSignal>,
}

impl LoopContext {
    /// At most one signal is pending per loop; later ones are refused.
    pub(crate) fn send_signal(&self, signal: LoopSignal) -> bool {
        match self.signals.try_send(signal) {
            Ok(()) => true,
            Err(TrySendError::Full(rejected)) => {
                warn!(target: "message_loop", loop_id = self.id, ?rejected, "loop already has a pending signal");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Registration of an open loop, visible to every thread.
pub(crate) struct ActiveLoop {
    pub(crate) context: LoopContext,
    pipeline_thread: ThreadId,
    requests: Sender<PipelineExecutionRequest>,
}

pub(crate) enum Posted {
    /// Posted into a loop; carries the caller's cancellation token.
    Pending(PendingExecution, Option<CancellationToken>),
    Inline(LoopContext, PsCommand, ExecutionOptions),
    NoLoop(PsCommand, ExecutionOptions),
}

impl ServiceInner {
    /// Pushes the loop's frame and runs the loop on the current thread until it is
    /// signalled. `on_open` runs once the loop can accept requests and signals, before any
    /// of them is processed.
    ///
    /// The frame is on top of the prompt nest exactly while the loop is registered, so a
    /// caller that sees the loop's frame also sees the loop and posts into it.
    pub(crate) fn run_message_loop(
        &self,
        kind: LoopKind,
        on_open: impl FnOnce(&PromptNestFrame),
    ) -> LoopSignal {
        let id = self.next_loop_id.fetch_add(1, Ordering::Relaxed);
        let (request_tx, requests) = channel::unbounded();
        let (signal_tx, signals) = channel::bounded(1);

        let context = {
            let mut loops = self.loops.lock();
            let frame = self.prompt_nest.push(kind.frame_type());
            let context = LoopContext {
                id,
                kind,
                frame,
                signals: signal_tx,
            };
            loops.push(ActiveLoop {
                context: context.clone(),
                pipeline_thread: thread::current().id(),
                requests: request_tx,
            });
            context
        };
        info!(target: "message_loop", loop_id = id, ?kind, depth = context.frame.depth(), "message loop opened");
        on_open(&context.frame);

        let signal = self.pump(&context, &requests, &signals);

        // A prompt still reading on the loop's frame would outlive it.
        self.cancel_read_lines_on(context.frame.id());
        loop {
            while let Ok(request) = requests.try_recv() {
                self.process_loop_request(&context, request);
            }

            // Posting happens under the same lock, so nothing can arrive once the channel is
            // seen empty here.
            let mut loops = self.loops.lock();
            if !requests.is_empty() {
                continue;
            }
            if let Err(error) = self.prompt_nest.pop_frame(&context.frame) {
                warn!(target: "message_loop", loop_id = id, frame = %context.frame.id(), %error, "failed to pop message loop frame");
            }
            loops.retain(|active| active.context.id != id);
            break;
        }

        info!(target: "message_loop", loop_id = id, ?kind, ?signal, "message loop closed");
        signal
    }

    fn pump(
        &self,
        context: &LoopContext,
        requests: &Receiver<PipelineExecutionRequest>,
        signals: &Receiver<LoopSignal>,
    ) -> LoopSignal {
        loop {
            // Queued work always goes before a resume.
            while let Ok(request) = requests.try_recv() {
                self.process_loop_request(context, request);
            }

            channel::select! {
                recv(requests) -> request => {
                    let Ok(request) = request else {
                        break loop_plumbing_failed(context.kind);
                    };
                    self.process_loop_request(context, request);
                },
                recv(signals) -> signal => {
                    let Ok(signal) = signal else {
                        break loop_plumbing_failed(context.kind);
                    };
                    break signal;
                },
            }
        }
    }

    fn process_loop_request(&self, context: &LoopContext, request: PipelineExecutionRequest) {
        if request
            .options()
            .cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
        {
            debug!(target: "message_loop", loop_id = context.id, request = %request.id(), "skipping cancelled request");
            return;
        }
        debug!(target: "message_loop", loop_id = context.id, request = %request.id(), "processing posted request");
        request.execute(|command, options| self.run_in_loop(context, command, options));
    }

    /// Runs a command the way the loop's own thread runs it.
    pub(crate) fn run_in_loop(
        &self,
        context: &LoopContext,
        command: PsCommand,
        options: &ExecutionOptions,
    ) -> ExecutionReply {
        match context.kind {
            LoopKind::DebuggerStop => {
                let command = command.prepared_for(options);
                let results = self.operations.execute_in_debugger(
                    self.engine.as_ref(),
                    context.frame.context(),
                    &command,
                    self,
                );
                match results {
                    Ok(DebuggerCommandResults {
                        output,
                        resume_action,
                    }) => {
                        if let Some(action) = resume_action {
                            context.send_signal(LoopSignal::Resume(action));
                        }
                        Ok(ExecutionOutput {
                            output: output.output,
                            errors: output.errors,
                        })
                    }
                    Err(ExecutionError::EngineRuntime(message)) => {
                        Ok(self.report_runtime_error(message, options))
                    }
                    Err(error) => Err(error),
                }
            }
            LoopKind::NestedPrompt => self
                .prompt_nest
                .run_in_pushed_frame(PromptNestFrameType::NORMAL, |handle| {
                    self.invoke_with_handle(handle, command, options)
                })?,
        }
    }

    /// Hands the command to the innermost loop, if any.
    pub(crate) fn post_to_innermost_loop(&self, command: PsCommand, options: ExecutionOptions) -> Posted {
        let loops = self.loops.lock();
        let Some(active) = loops.last() else {
            return Posted::NoLoop(command, options);
        };

        if active.pipeline_thread == thread::current().id() {
            return Posted::Inline(active.context.clone(), command, options);
        }

        let cancel = options.cancellation.clone();
        let (request, pending) = PipelineExecutionRequest::new(command, options);
        match active.requests.send(request) {
            Ok(()) => Posted::Pending(pending, cancel),
            Err(channel::SendError(request)) => {
                let (command, options) = request.into_parts();
                Posted::NoLoop(command, options)
            }
        }
    }

    pub(crate) fn signal_innermost(&self, kind: LoopKind, signal: LoopSignal) -> bool {
        self.loops
            .lock()
            .iter()
            .rev()
            .find(|active| active.context.kind == kind)
            .is_some_and(|active| active.context.send_signal(signal))
    }

    pub(crate) fn loop_owns_frame(&self, frame: Uuid) -> bool {
        self.loops.lock().iter().any(|active| active.context.frame.id() == frame)
    }

    pub(crate) fn has_loop(&self, kind: LoopKind) -> bool {
        self.loops.lock().iter().any(|active| active.context.kind == kind)
    }
}

fn loop_plumbing_failed(kind: LoopKind) -> LoopSignal {
    let _ = ExecutionError::invariant("message loop channel disconnected while the loop was open");
    debug_assert!(false, "message loop channel disconnected");
    match kind {
        LoopKind::DebuggerStop => LoopSignal::Resume(ResumeAction::Stop),
        LoopKind::NestedPrompt => LoopSignal::ExitNestedPrompt,
    }
}
