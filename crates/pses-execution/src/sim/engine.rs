use std::{
    cell::Cell,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering},
    },
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use typed_builder::TypedBuilder;

use crate::{
    engine::{
        BreakpointUpdate, BreakpointUpdateKind, DebugModes, DebuggerCommandResults,
        DebuggerStopEvent, EngineError, EngineHost, EngineResult, EngineVersion,
        InvocationOutput, PsInvocationState, ResumeAction, RunspaceDetails, ScriptEngine,
    },
    pipeline::{InvocationSettings, Parameter, PipelineCommand, PsCommand},
    prompt_nest::{FrameContext, PromptNestFrameType},
    value::PsValue,
};

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(2);

thread_local! {
    static INVOCATION_DEPTH: Cell<usize> = const { Cell::new(0) };
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct SimulatedEngineConfig {
    #[builder(default = EngineVersion::new(5, 1))]
    pub version: EngineVersion,

    /// How often `read_line` fires the idle callback when nothing happens.
    #[builder(default = Duration::from_millis(10))]
    pub idle_interval: Duration,
}

impl Default for SimulatedEngineConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalKind {
    InvokeStarted(String),
    InvokeFinished(String),
    DebuggerCommand(String),
    Resumed(ResumeAction),
    StopProcessCommand,
    ReadLine,
}

/// One thing the engine did, with where and on which thread it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub kind: JournalKind,
    pub depth: usize,
    pub frame_type: PromptNestFrameType,
    pub thread: ThreadId,
}

/// An in-process engine with a tiny command language.
///
/// Pipelines are evaluated stage by stage; each stage receives the previous stage's
/// output. `Out-Default` renders everything that reaches it through the host.
pub struct SimulatedEngine {
    config: SimulatedEngineConfig,
    input_tx: Sender<String>,
    input_rx: Receiver<String>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    stop_requested: AtomicBool,
    idle_subscribed: AtomicBool,
    idle_ticks: AtomicU64,
    runspaces: Mutex<Vec<RunspaceDetails>>,
    transport_broken: AtomicBool,
    debug_modes: AtomicU8,
    step_mode: AtomicBool,
    next_breakpoint_id: AtomicU32,
    history: Mutex<Vec<String>>,
    journal: Mutex<Vec<JournalEntry>>,
    top_level_active: AtomicUsize,
    max_concurrent_top_level: AtomicUsize,
}

impl SimulatedEngine {
    pub fn new(config: SimulatedEngineConfig) -> Arc<Self> {
        let (input_tx, input_rx) = channel::unbounded();
        let (wake_tx, wake_rx) = channel::bounded(1);
        Arc::new(Self {
            config,
            input_tx,
            input_rx,
            wake_tx,
            wake_rx,
            stop_requested: AtomicBool::new(false),
            idle_subscribed: AtomicBool::new(false),
            idle_ticks: AtomicU64::new(0),
            runspaces: Mutex::new(vec![RunspaceDetails::local()]),
            transport_broken: AtomicBool::new(false),
            debug_modes: AtomicU8::new(DebugModes::NONE.bits()),
            step_mode: AtomicBool::new(false),
            next_breakpoint_id: AtomicU32::new(1),
            history: Mutex::new(Vec::new()),
            journal: Mutex::new(Vec::new()),
            top_level_active: AtomicUsize::new(0),
            max_concurrent_top_level: AtomicUsize::new(0),
        })
    }

    /// Feeds lines to `read_line`.
    pub fn input_sender(&self) -> Sender<String> {
        self.input_tx.clone()
    }

    pub fn send_input(&self, line: impl Into<String>) {
        // Both ends live in `self`, so the channel cannot be disconnected.
        let _ = self.input_tx.send(line.into());
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        self.journal.lock().clone()
    }

    pub fn history(&self) -> Vec<String> {
        self.history.lock().clone()
    }

    pub fn debug_modes(&self) -> DebugModes {
        DebugModes::from_bits(self.debug_modes.load(Ordering::Acquire))
    }

    pub fn step_mode(&self) -> bool {
        self.step_mode.load(Ordering::Acquire)
    }

    pub fn idle_ticks(&self) -> u64 {
        self.idle_ticks.load(Ordering::Relaxed)
    }

    /// Highest number of top-level invocations that ever ran at the same time.
    pub fn max_concurrent_top_level(&self) -> usize {
        self.max_concurrent_top_level.load(Ordering::Acquire)
    }

    /// Simulates the engine tearing down the idle subscription behind the host's back.
    pub fn drop_idle_subscription(&self) {
        self.idle_subscribed.store(false, Ordering::Release);
    }

    fn record(&self, frame: &FrameContext, kind: JournalKind) {
        trace!(target: "sim", ?kind, depth = frame.depth, "engine activity");
        self.journal.lock().push(JournalEntry {
            kind,
            depth: frame.depth,
            frame_type: frame.frame_type,
            thread: thread::current().id(),
        });
    }

    fn idle(&self, host: &dyn EngineHost) {
        if self.idle_subscribed.load(Ordering::Acquire) {
            self.idle_ticks.fetch_add(1, Ordering::Relaxed);
            host.on_idle();
        }
    }

    fn check_stop(&self) -> EngineResult<()> {
        if self.stop_requested.load(Ordering::Acquire) {
            return Err(EngineError::PipelineStopped);
        }
        Ok(())
    }

    fn evaluate(
        &self,
        frame: &FrameContext,
        command: &PsCommand,
        host: &dyn EngineHost,
    ) -> EngineResult<InvocationOutput> {
        let merge_errors = command
            .commands()
            .first()
            .is_some_and(|first| first.merge_errors_to_output);
        let mut output: Vec<PsValue> = Vec::new();
        let mut errors: Vec<String> = Vec::new();

        for stage in command.commands().iter().flat_map(expand_stage) {
            self.check_stop()?;
            match stage {
                Stage::OutDefault => {
                    for value in output.drain(..) {
                        host.write_line(&value.to_string());
                    }
                    if merge_errors {
                        for error in &errors {
                            host.write_error_line(error);
                        }
                    }
                }
                Stage::Command { name, args } => {
                    output = self.run_stage(frame, &name, args, output, &mut errors, host)?;
                }
            }
        }

        Ok(InvocationOutput { output, errors })
    }

    fn run_stage(
        &self,
        frame: &FrameContext,
        name: &str,
        args: Vec<PsValue>,
        input: Vec<PsValue>,
        errors: &mut Vec<String>,
        host: &dyn EngineHost,
    ) -> EngineResult<Vec<PsValue>> {
        match name.to_ascii_lowercase().as_str() {
            "echo" | "write-output" => Ok(if args.is_empty() { input } else { args }),
            "add" => {
                let mut sum = 0_i64;
                for value in args.iter().chain(&input) {
                    match value {
                        PsValue::Int(n) => sum += n,
                        other => {
                            return Err(EngineError::runtime(format!(
                                "cannot add a {} value",
                                other.type_name()
                            )));
                        }
                    }
                }
                Ok(vec![PsValue::Int(sum)])
            }
            "write-error" => {
                errors.push(join(&args));
                Ok(input)
            }
            "throw" => {
                let message = join(&args);
                Err(EngineError::runtime(if message.is_empty() {
                    "ScriptHalted".to_string()
                } else {
                    message
                }))
            }
            "sleep" => {
                let millis = match args.first() {
                    Some(PsValue::Int(ms)) => u64::try_from(*ms).unwrap_or(0),
                    _ => 0,
                };
                self.sleep(Duration::from_millis(millis))?;
                Ok(input)
            }
            "breakpoint" => {
                let event = DebuggerStopEvent {
                    script_name: args.first().map(ToString::to_string),
                    line: 1,
                    column: 1,
                    breakpoint_ids: Vec::new(),
                };
                let action = host.on_debugger_stop(&event);
                self.record(frame, JournalKind::Resumed(action));
                if action == ResumeAction::Stop {
                    return Err(EngineError::PipelineStopped);
                }
                Ok(input)
            }
            "set-breakpoint" => {
                let line = match args.first() {
                    Some(PsValue::Int(line)) => u32::try_from(*line).unwrap_or(0),
                    _ => 0,
                };
                let id = self.next_breakpoint_id.fetch_add(1, Ordering::Relaxed);
                host.on_breakpoint_updated(&BreakpointUpdate {
                    id,
                    kind: BreakpointUpdateKind::Set,
                    script_name: None,
                    line,
                });
                Ok(vec![PsValue::Int(i64::from(id))])
            }
            "nested" => {
                host.enter_nested_prompt();
                self.check_stop()?;
                Ok(input)
            }
            "exit" => {
                host.exit_nested_prompt();
                Ok(input)
            }
            "enter-pssession" => {
                let Some(computer) = args.first() else {
                    return Err(EngineError::runtime("enter-pssession requires a computer name"));
                };
                self.runspaces
                    .lock()
                    .push(RunspaceDetails::remote(computer.to_string()));
                Ok(Vec::new())
            }
            "exit-pssession" => {
                let mut runspaces = self.runspaces.lock();
                if runspaces.len() > 1 {
                    runspaces.pop();
                }
                Ok(Vec::new())
            }
            "drop-session" => {
                self.transport_broken.store(true, Ordering::Release);
                Ok(Vec::new())
            }
            "get-history" => Ok(self.history().into_iter().map(PsValue::Str).collect()),
            "get-depth" => Ok(vec![PsValue::Int(
                i64::try_from(frame.depth).unwrap_or(i64::MAX),
            )]),
            _ => Err(EngineError::runtime(format!(
                "The term '{name}' is not recognized as a name of a cmdlet, function, script file, or executable program."
            ))),
        }
    }

    fn sleep(&self, duration: Duration) -> EngineResult<()> {
        let deadline = Instant::now() + duration;
        loop {
            self.check_stop()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep(STOP_POLL_INTERVAL.min(deadline - now));
        }
    }
}

impl ScriptEngine for SimulatedEngine {
    fn version(&self) -> EngineVersion {
        self.config.version
    }

    fn invoke(
        &self,
        frame: &FrameContext,
        command: &PsCommand,
        settings: &InvocationSettings,
        host: &dyn EngineHost,
    ) -> EngineResult<InvocationOutput> {
        let (_depth, top_level) = InvocationDepth::enter();
        let text = history_text(command);
        self.record(frame, JournalKind::InvokeStarted(text.clone()));

        if top_level {
            self.stop_requested.store(false, Ordering::Release);
            let active = self.top_level_active.fetch_add(1, Ordering::AcqRel) + 1;
            self.max_concurrent_top_level.fetch_max(active, Ordering::AcqRel);
            host.on_invocation_state_changed(PsInvocationState::Running, None);
        }

        let result = self.evaluate(frame, command, host);

        if settings.add_to_history {
            self.history.lock().push(text.clone());
        }
        if top_level {
            self.top_level_active.fetch_sub(1, Ordering::AcqRel);
            match &result {
                Ok(_) => host.on_invocation_state_changed(PsInvocationState::Completed, None),
                Err(EngineError::PipelineStopped) => {
                    host.on_invocation_state_changed(PsInvocationState::Stopped, None);
                }
                Err(error) => {
                    host.on_invocation_state_changed(PsInvocationState::Failed, Some(&error.to_string()));
                }
            }
        }

        self.record(frame, JournalKind::InvokeFinished(text));
        result
    }

    fn read_line(
        &self,
        frame: &FrameContext,
        cancel: &CancellationToken,
        host: &dyn EngineHost,
    ) -> EngineResult<String> {
        self.record(frame, JournalKind::ReadLine);
        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            channel::select! {
                recv(self.input_rx) -> line => {
                    return line.map_err(|_| EngineError::Cancelled);
                },
                recv(self.wake_rx) -> _ => self.idle(host),
                default(self.config.idle_interval) => self.idle(host),
            }
        }
    }

    fn stop(&self) {
        debug!(target: "sim", "stop requested");
        self.stop_requested.store(true, Ordering::Release);
    }

    fn request_idle_tick(&self) {
        // A wake-up already pending covers this one.
        let _ = self.wake_tx.try_send(());
    }

    fn is_idle_subscribed(&self) -> bool {
        self.idle_subscribed.load(Ordering::Acquire)
    }

    fn subscribe_idle(&self) -> EngineResult<()> {
        self.idle_subscribed.store(true, Ordering::Release);
        Ok(())
    }

    fn runspace_details(&self) -> EngineResult<RunspaceDetails> {
        let mut runspaces = self.runspaces.lock();
        if self.transport_broken.swap(false, Ordering::AcqRel) {
            runspaces.truncate(1);
            return Err(EngineError::TransportBroken("the remote session was closed".to_string()));
        }
        Ok(runspaces[runspaces.len() - 1].clone())
    }

    fn debugger_process_command(
        &self,
        frame: &FrameContext,
        command: &PsCommand,
        host: &dyn EngineHost,
    ) -> EngineResult<DebuggerCommandResults> {
        let text = history_text(command);
        self.record(frame, JournalKind::DebuggerCommand(text.clone()));

        let resume_action = match text.trim().to_ascii_lowercase().as_str() {
            "c" | "continue" => Some(ResumeAction::Continue),
            "s" | "stepinto" => Some(ResumeAction::StepInto),
            "v" | "stepover" => Some(ResumeAction::StepOver),
            "o" | "stepout" => Some(ResumeAction::StepOut),
            "q" | "quit" => Some(ResumeAction::Stop),
            _ => None,
        };
        if resume_action.is_some() {
            return Ok(DebuggerCommandResults {
                output: InvocationOutput::default(),
                resume_action,
            });
        }

        let output = self.invoke(frame, command, &InvocationSettings::default(), host)?;
        Ok(DebuggerCommandResults {
            output,
            resume_action: None,
        })
    }

    fn debugger_stop_process_command(&self) {
        self.journal.lock().push(JournalEntry {
            kind: JournalKind::StopProcessCommand,
            depth: 0,
            frame_type: PromptNestFrameType::NORMAL,
            thread: thread::current().id(),
        });
    }

    fn debugger_set_step_mode(&self, enabled: bool) {
        self.step_mode.store(enabled, Ordering::Release);
    }

    fn debugger_set_debug_mode(&self, modes: DebugModes) {
        self.debug_modes.store(modes.bits(), Ordering::Release);
    }
}

/// Tracks invocation nesting on the current thread; only the outermost one reports state.
struct InvocationDepth;

impl InvocationDepth {
    fn enter() -> (Self, bool) {
        let top_level = INVOCATION_DEPTH.with(|depth| {
            let current = depth.get();
            depth.set(current + 1);
            current == 0
        });
        (Self, top_level)
    }
}

impl Drop for InvocationDepth {
    fn drop(&mut self) {
        INVOCATION_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

enum Stage {
    OutDefault,
    Command { name: String, args: Vec<PsValue> },
}

/// Splits a pipeline command into the stages it stands for. Script text may itself hold
/// a `|`-separated pipeline; parameters attach to its last stage.
fn expand_stage(command: &PipelineCommand) -> Vec<Stage> {
    if command.is_output_default() {
        return vec![Stage::OutDefault];
    }

    let mut stages: Vec<Stage> = if command.is_script {
        command
            .command_text
            .split('|')
            .map(|segment| {
                let mut words = segment.split_whitespace();
                Stage::Command {
                    name: words.next().unwrap_or_default().to_string(),
                    args: words.map(parse_word).collect(),
                }
            })
            .collect()
    } else {
        vec![Stage::Command {
            name: command.command_text.clone(),
            args: Vec::new(),
        }]
    };

    if let Some(Stage::Command { args, .. }) = stages.last_mut() {
        for parameter in &command.parameters {
            match parameter {
                Parameter::Positional { value } | Parameter::Named { value, .. } => {
                    args.push(value.clone());
                }
                Parameter::Switch { .. } => {}
            }
        }
    }
    stages
}

fn parse_word(word: &str) -> PsValue {
    word.parse::<i64>()
        .map_or_else(|_| PsValue::Str(word.to_string()), PsValue::Int)
}

fn join(args: &[PsValue]) -> String {
    args.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

/// The command as the user wrote it, without the rendering stage the host appended.
fn history_text(command: &PsCommand) -> String {
    let mut visible = PsCommand::new();
    for stage in command.commands().iter().filter(|stage| !stage.is_output_default()) {
        visible.add_command(stage.clone());
    }
    visible.to_string()
}
