use tracing::{debug, warn};

use crate::{
    ExecutionError,
    engine::{DebugModes, DebuggerCommandResults, EngineHost, EngineVersion, ScriptEngine},
    pipeline::PsCommand,
    prompt_nest::FrameContext,
};

/// Engine-version specific debugger operations, selected once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineOperations {
    V3,
    V4,
    V5,
}

impl EngineOperations {
    pub fn for_version(version: EngineVersion) -> Self {
        match version.major {
            0..=3 => Self::V3,
            4 => Self::V4,
            _ => Self::V5,
        }
    }

    pub fn configure_debugger(self, engine: &dyn ScriptEngine) {
        match self {
            Self::V3 | Self::V4 => {}
            Self::V5 => {
                engine.debugger_set_debug_mode(DebugModes::LOCAL_SCRIPT | DebugModes::REMOTE_SCRIPT);
            }
        }
    }

    pub fn pause_debugger(self, engine: &dyn ScriptEngine) {
        match self {
            Self::V3 | Self::V4 => {
                warn!(target: "debugger", operations = ?self, "pausing the debugger is not supported by this engine version");
            }
            Self::V5 => engine.debugger_set_step_mode(true),
        }
    }

    pub fn execute_in_debugger(
        self,
        engine: &dyn ScriptEngine,
        frame: &FrameContext,
        command: &PsCommand,
        host: &dyn EngineHost,
    ) -> Result<DebuggerCommandResults, ExecutionError> {
        match self {
            Self::V3 => Err(ExecutionError::NotSupported(
                "executing commands in the debugger requires engine version 4 or later",
            )),
            Self::V4 | Self::V5 => {
                debug!(target: "debugger", %command, depth = frame.depth, "processing command in debugger");
                Ok(engine.debugger_process_command(frame, command, host)?)
            }
        }
    }

    pub fn stop_command_in_debugger(self, engine: &dyn ScriptEngine) {
        match self {
            Self::V3 => {}
            Self::V4 | Self::V5 => engine.debugger_stop_process_command(),
        }
    }
}
