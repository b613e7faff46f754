/// Where rendered output and errors for the interactive user end up.
pub trait HostOutput: Send + Sync {
    fn write_line(&self, line: &str);

    fn write_error_line(&self, line: &str);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHostOutput;

impl HostOutput for NullHostOutput {
    fn write_line(&self, _line: &str) {}

    fn write_error_line(&self, _line: &str) {}
}
