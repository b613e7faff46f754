use std::fmt;

use uuid::Uuid;

use crate::value::PsValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EngineVersion {
    pub major: u16,
    pub minor: u16,
}

impl EngineVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Invocation states as reported by the engine for top-level invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsInvocationState {
    NotStarted = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
    Completed = 4,
    Failed = 5,
    Disconnected = 6,
}

/// The debugger's next instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResumeAction {
    Continue,
    StepInto,
    StepOut,
    StepOver,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebuggerStopEvent {
    pub script_name: Option<String>,
    pub line: u32,
    pub column: u32,
    pub breakpoint_ids: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointUpdateKind {
    Set,
    Removed,
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointUpdate {
    pub id: u32,
    pub kind: BreakpointUpdateKind,
    pub script_name: Option<String>,
    pub line: u32,
}

/// Debugger modes, combinable with `|`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DebugModes(u8);

impl DebugModes {
    pub const NONE: Self = Self(0);
    pub const DEFAULT: Self = Self(1);
    pub const LOCAL_SCRIPT: Self = Self(2);
    pub const REMOTE_SCRIPT: Self = Self(4);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & 0b111)
    }
}

impl std::ops::BitOr for DebugModes {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for DebugModes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return write!(f, "DebugModes(None)");
        }
        let names: Vec<&str> = [
            (Self::DEFAULT, "Default"),
            (Self::LOCAL_SCRIPT, "LocalScript"),
            (Self::REMOTE_SCRIPT, "RemoteScript"),
        ]
        .into_iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| name)
        .collect();
        write!(f, "DebugModes({})", names.join(" | "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RunspaceLocation {
    Local,
    Remote { computer_name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunspaceContext {
    Original,
    EnteredProcess,
    DebuggedRunspace,
}

/// Identity of the runspace the engine is currently targeting.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunspaceDetails {
    pub id: Uuid,
    pub location: RunspaceLocation,
    pub context: RunspaceContext,
}

impl RunspaceDetails {
    pub fn local() -> Self {
        Self {
            id: Uuid::new_v4(),
            location: RunspaceLocation::Local,
            context: RunspaceContext::Original,
        }
    }

    pub fn remote(computer_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            location: RunspaceLocation::Remote {
                computer_name: computer_name.into(),
            },
            context: RunspaceContext::Original,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.location, RunspaceLocation::Remote { .. })
    }
}

/// Output of one engine invocation: pipeline output plus non-terminating errors.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InvocationOutput {
    pub output: Vec<PsValue>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DebuggerCommandResults {
    pub output: InvocationOutput,
    /// Set when the command was itself a debugger instruction (`c`, `s`, ...).
    pub resume_action: Option<ResumeAction>,
}
