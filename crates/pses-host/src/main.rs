mod config;
mod repl;
mod types;

use std::{io::BufRead, sync::Arc};

use anyhow::Context;
use clap::Parser;
use pses_execution::{sim::SimulatedEngine, ExecutionOptions, ExecutionService, PsCommand, PsValue};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use config::{init_logging, Args};
use repl::Repl;
use types::ConsoleHost;

#[tokio::main]
#[instrument(name = "main", level = "info")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args.log_file, args.verbose)
        .with_context(|| format!("failed to open log file {}", args.log_file))?;
    info!(
        engine_version = %args.engine_version,
        idle_tick_ms = args.idle_tick_ms,
        "starting pipeline execution host"
    );

    let engine = SimulatedEngine::new(args.engine_config());
    let service = ExecutionService::start(
        engine.clone(),
        args.service_config(),
        Arc::new(ConsoleHost),
    )
    .context("failed to start the execution service")?;

    if let Some(command) = args.command {
        // Non-interactive mode: execute command and exit
        info!(command = %command, "executing command in non-interactive mode");
        let result = service
            .execute_command::<PsValue>(PsCommand::from_script(command), ExecutionOptions::interactive())
            .await;
        service.dispose();

        if let Err(e) = result {
            error!(error = %e, "command failed");
            eprintln!("{e}");
            std::process::exit(1);
        }
        return Ok(());
    }

    // Lines typed on stdin feed the engine's read-line; end of input shuts the prompt.
    let shutdown = CancellationToken::new();
    let input = engine.input_sender();
    std::thread::spawn({
        let shutdown = shutdown.clone();
        move || {
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if input.send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to read stdin");
                        break;
                    }
                }
            }
            info!("stdin closed");
            shutdown.cancel();
        }
    });

    if let Err(e) = Repl::new(service, shutdown).run().await {
        error!(error = %e, "Interactive mode failed");
        eprintln!("Interactive mode failed: {e}");
        std::process::exit(1);
    }

    info!("Exiting main function");
    Ok(())
}
