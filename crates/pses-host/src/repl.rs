use std::{io::Write, time::Duration};

use futures::{channel::mpsc, StreamExt};
use pses_execution::{
    ContextEvent, ExecutionError, ExecutionOptions, ExecutionService, PsCommand, PsValue,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::types::PromptLocation;

const LOOP_POLL_INTERVAL: Duration = Duration::from_millis(20);

type CommandTask = JoinHandle<Result<Vec<PsValue>, ExecutionError>>;

/// How waiting on a command ended.
enum Wait {
    Finished(Result<Result<Vec<PsValue>, ExecutionError>, tokio::task::JoinError>),
    /// The command opened a debugger stop or nested prompt; the user gets the prompt back
    /// while it stays suspended.
    Suspended,
}

pub struct Repl {
    service: ExecutionService,
    events: mpsc::UnboundedReceiver<ContextEvent>,
    shutdown: CancellationToken,
    suspended: Vec<CommandTask>,
}

impl Repl {
    pub fn new(service: ExecutionService, shutdown: CancellationToken) -> Self {
        let events = service.subscribe();
        Self {
            service,
            events,
            shutdown,
            suspended: Vec::new(),
        }
    }

    /// Run the interactive loop until `exit` at the top level or end of input.
    pub async fn run(mut self) -> anyhow::Result<()> {
        info!("starting interactive mode");

        loop {
            // Leaving a loop lets the command that opened it carry on.
            while !self.in_message_loop() {
                let Some(task) = self.suspended.pop() else {
                    break;
                };
                self.wait_for(task).await;
            }

            self.print_prompt()?;

            let line = match self.service.invoke_read_line(&self.shutdown).await {
                Ok(line) => line,
                Err(ExecutionError::Cancelled) if self.shutdown.is_cancelled() => {
                    info!("input closed, leaving the prompt");
                    break;
                }
                Err(ExecutionError::Cancelled) => {
                    debug!("prompt interrupted");
                    println!();
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let command = line.trim();
            if command.is_empty() {
                continue;
            }
            if command.eq_ignore_ascii_case("exit") && !self.in_message_loop() {
                info!("exit command received, terminating the prompt");
                break;
            }

            info!(%command, "running command");
            let service = self.service.clone();
            let script = PsCommand::from_script(command);
            let task = tokio::spawn(async move {
                service
                    .execute_command::<PsValue>(script, ExecutionOptions::interactive())
                    .await
            });
            self.wait_for(task).await;
        }

        self.service.dispose();
        for task in self.suspended.drain(..) {
            task.abort();
        }
        info!("interactive mode completed");
        Ok(())
    }

    async fn wait_for(&mut self, mut task: CommandTask) {
        let loop_depth = self.service.prompt_nest().depth();
        let mut poll = tokio::time::interval(LOOP_POLL_INTERVAL);

        let wait = loop {
            tokio::select! {
                joined = &mut task => break Wait::Finished(joined),
                Some(event) = self.events.next() => {
                    if let ContextEvent::DebuggerStop(stop) = event {
                        let script = stop.script_name.as_deref().unwrap_or("<interactive>");
                        println!("Hit breakpoint at {script}:{}:{}", stop.line, stop.column);
                        break Wait::Suspended;
                    }
                }
                _ = poll.tick() => {
                    if self.service.is_nested_prompt() && self.service.prompt_nest().depth() > loop_depth {
                        break Wait::Suspended;
                    }
                }
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        warn!(error = %e, "failed to listen for Ctrl+C");
                    }
                    info!("Ctrl+C received, aborting the running command");
                    self.service.abort_execution();
                }
            }
        };

        match wait {
            Wait::Finished(Ok(Ok(_))) => {}
            Wait::Finished(Ok(Err(ExecutionError::PipelineStopped))) => {
                eprintln!("The pipeline has been stopped.");
            }
            Wait::Finished(Ok(Err(e))) => {
                error!(error = %e, "command failed");
                eprintln!("{e}");
            }
            Wait::Finished(Err(e)) => {
                error!(error = %e, "command task failed");
                eprintln!("command task failed: {e}");
            }
            Wait::Suspended => {
                debug!(suspended = self.suspended.len() + 1, "command suspended in a message loop");
                self.suspended.push(task);
            }
        }
    }

    fn in_message_loop(&self) -> bool {
        self.service.is_in_debugger() || self.service.is_nested_prompt()
    }

    fn print_prompt(&self) -> anyhow::Result<()> {
        let location = PromptLocation {
            in_debugger: self.service.is_in_debugger(),
            depth: self.service.prompt_nest().depth(),
            remote: self.service.prompt_nest().is_remote(),
        };
        let mut stdout = std::io::stdout().lock();
        write!(stdout, "{}", location.render())?;
        stdout.flush()?;
        Ok(())
    }
}
