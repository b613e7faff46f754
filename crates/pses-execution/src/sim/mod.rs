//! A reference engine that runs in-process, used by the host binary and the tests.

mod engine;

use parking_lot::Mutex;

pub use engine::{JournalEntry, JournalKind, SimulatedEngine, SimulatedEngineConfig};

use crate::service::HostOutput;

/// Keeps everything written to the host, for inspection.
#[derive(Debug, Default)]
pub struct RecordingHostOutput {
    lines: Mutex<Vec<String>>,
    error_lines: Mutex<Vec<String>>,
}

impl RecordingHostOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    pub fn error_lines(&self) -> Vec<String> {
        self.error_lines.lock().clone()
    }
}

impl HostOutput for RecordingHostOutput {
    fn write_line(&self, line: &str) {
        self.lines.lock().push(line.to_string());
    }

    fn write_error_line(&self, line: &str) {
        self.error_lines.lock().push(line.to_string());
    }
}
