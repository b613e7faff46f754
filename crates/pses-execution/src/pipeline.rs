use std::fmt;

use tokio_util::sync::CancellationToken;

use crate::value::PsValue;

/// Represents a single parameter for a command
#[derive(Debug, Clone, PartialEq)]
pub enum Parameter {
    Named { name: String, value: PsValue },
    Positional { value: PsValue },
    Switch { name: String, value: bool },
}

/// Represents a single command (one pipeline stage) in business logic terms
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineCommand {
    pub command_text: String,
    pub is_script: bool,
    pub parameters: Vec<Parameter>,
    /// Route the error stream of this stage into its output stream.
    pub merge_errors_to_output: bool,
}

impl PipelineCommand {
    pub fn new_script(script: impl Into<String>) -> Self {
        Self {
            command_text: script.into(),
            is_script: true,
            parameters: Vec::new(),
            merge_errors_to_output: false,
        }
    }

    pub fn new_command(command: impl Into<String>) -> Self {
        Self {
            command_text: command.into(),
            is_script: false,
            parameters: Vec::new(),
            merge_errors_to_output: false,
        }
    }

    pub fn add_parameter(&mut self, params: Parameter) {
        self.parameters.push(params);
    }

    pub fn with_parameter(mut self, params: Parameter) -> Self {
        self.parameters.push(params);
        self
    }

    pub fn with_argument(self, value: impl Into<PsValue>) -> Self {
        self.with_parameter(Parameter::Positional {
            value: value.into(),
        })
    }

    /// The command that renders everything that reaches it to the host.
    pub fn new_output_default() -> PipelineCommand {
        PipelineCommand::new_command(OUT_DEFAULT)
    }

    pub fn is_output_default(&self) -> bool {
        !self.is_script && self.command_text.eq_ignore_ascii_case(OUT_DEFAULT)
    }
}

pub const OUT_DEFAULT: &str = "Out-Default";

/// An ordered pipeline of commands submitted as one unit of work.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PsCommand {
    commands: Vec<PipelineCommand>,
}

impl PsCommand {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_script(script: impl Into<String>) -> Self {
        Self::new().with_command(PipelineCommand::new_script(script))
    }

    pub fn from_command(command: impl Into<String>) -> Self {
        Self::new().with_command(PipelineCommand::new_command(command))
    }

    pub fn add_command(&mut self, command: PipelineCommand) {
        self.commands.push(command);
    }

    pub fn with_command(mut self, command: PipelineCommand) -> Self {
        self.commands.push(command);
        self
    }

    pub fn commands(&self) -> &[PipelineCommand] {
        &self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Shapes the command for host rendering: merges errors into output and appends
    /// `Out-Default` when the caller asked for output on the host.
    pub(crate) fn prepared_for(mut self, options: &ExecutionOptions) -> Self {
        if options.write_output_to_host {
            if options.write_errors_to_host {
                if let Some(first) = self.commands.first_mut() {
                    first.merge_errors_to_output = true;
                }
            }
            if !self.commands.last().is_some_and(PipelineCommand::is_output_default) {
                self.commands.push(PipelineCommand::new_output_default());
            }
        }
        self
    }
}

impl fmt::Display for PsCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, command) in self.commands.iter().enumerate() {
            if i > 0 {
                write!(f, " | ")?;
            }
            write!(f, "{}", command.command_text)?;
            for parameter in &command.parameters {
                match parameter {
                    Parameter::Named { name, value } => write!(f, " -{name} {value}")?,
                    Parameter::Positional { value } => write!(f, " {value}")?,
                    Parameter::Switch { name, value: true } => write!(f, " -{name}")?,
                    Parameter::Switch { name, value: false } => write!(f, " -{name}:$false")?,
                }
            }
        }
        Ok(())
    }
}

/// How a command should be executed and where its results should go.
#[derive(Debug, Clone, Default, typed_builder::TypedBuilder)]
pub struct ExecutionOptions {
    #[builder(default)]
    pub write_output_to_host: bool,
    #[builder(default)]
    pub write_errors_to_host: bool,
    #[builder(default)]
    pub add_to_history: bool,
    #[builder(default)]
    pub interrupt_command_prompt: bool,
    /// Cancels the wait until the command starts running; does not stop a running command.
    #[builder(default, setter(strip_option))]
    pub cancellation: Option<CancellationToken>,
}

impl ExecutionOptions {
    /// Options used for commands typed by the user at the interactive prompt.
    pub fn interactive() -> Self {
        Self {
            write_output_to_host: true,
            write_errors_to_host: true,
            add_to_history: true,
            ..Self::default()
        }
    }
}

/// Settings forwarded to the engine with every invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InvocationSettings {
    pub add_to_history: bool,
}

impl From<&ExecutionOptions> for InvocationSettings {
    fn from(options: &ExecutionOptions) -> Self {
        Self {
            add_to_history: options.add_to_history,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writing_to_host_appends_output_default_once() {
        let options = ExecutionOptions::interactive();
        let command = PsCommand::from_script("echo hi").prepared_for(&options);
        assert_eq!(command.commands().len(), 2);
        assert!(command.commands()[0].merge_errors_to_output);
        assert!(command.commands()[1].is_output_default());

        let again = command.clone().prepared_for(&options);
        assert_eq!(again, command);
    }

    #[test]
    fn silent_execution_leaves_command_untouched() {
        let command = PsCommand::from_script("echo hi");
        let prepared = command.clone().prepared_for(&ExecutionOptions::default());
        assert_eq!(prepared, command);
    }

    #[test]
    fn display_renders_a_pipeline() {
        let command = PsCommand::from_command("Get-Item")
            .with_command(PipelineCommand::new_command("Select").with_argument("Name"));
        assert_eq!(command.to_string(), "Get-Item | Select Name");
    }
}
