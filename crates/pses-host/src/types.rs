use std::io::Write;

use pses_execution::HostOutput;
use tracing::error;

/// Renders engine output on the process console.
#[derive(Debug, Default)]
pub struct ConsoleHost;

impl HostOutput for ConsoleHost {
    fn write_line(&self, line: &str) {
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = writeln!(stdout, "{line}").and_then(|()| stdout.flush()) {
            error!(error = %e, "failed to write to stdout");
        }
    }

    fn write_error_line(&self, line: &str) {
        let mut stderr = std::io::stderr().lock();
        if let Err(e) = writeln!(stderr, "{line}") {
            error!(error = %e, "failed to write to stderr");
        }
    }
}

/// Where the prompt currently is, used to render it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptLocation {
    pub in_debugger: bool,
    pub depth: usize,
    pub remote: bool,
}

impl PromptLocation {
    pub fn render(self) -> String {
        let mut prompt = String::new();
        if self.remote {
            prompt.push_str("[remote] ");
        }
        if self.in_debugger {
            prompt.push_str("[DBG]: ");
        }
        prompt.push_str("PS");
        prompt.push_str(&">".repeat(self.depth + 1));
        prompt.push(' ');
        prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_shows_debugger_and_nesting() {
        let top = PromptLocation {
            in_debugger: false,
            depth: 0,
            remote: false,
        };
        assert_eq!(top.render(), "PS> ");

        let stopped = PromptLocation {
            in_debugger: true,
            depth: 1,
            remote: true,
        };
        assert_eq!(stopped.render(), "[remote] [DBG]: PS>> ");
    }
}
