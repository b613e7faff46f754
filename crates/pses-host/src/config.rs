use std::time::Duration;

use clap::Parser;
use pses_execution::{engine::EngineVersion, sim::SimulatedEngineConfig, ServiceConfig};
use tracing_subscriber::{fmt, prelude::*, registry::Registry, EnvFilter};

/// Interactive console on top of the pipeline execution service
#[derive(Parser)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Engine version to emulate; selects the debugger operations
    #[arg(long, default_value = "5.1", value_parser = parse_version, help = "Engine version (major.minor)")]
    pub engine_version: EngineVersion,

    /// How often the engine fires its idle callback while reading input
    #[arg(long, default_value_t = 10, help = "Idle tick interval in milliseconds")]
    pub idle_tick_ms: u64,

    /// Do not run other callers' commands while the prompt is reading
    #[arg(long, help = "Disable idle invocation")]
    pub no_idle_invocation: bool,

    /// Do not follow the engine into remote sessions
    #[arg(long, help = "Disable runspace change tracking")]
    pub no_runspace_tracking: bool,

    #[arg(long, default_value = "pses_host.log", help = "Log file path")]
    pub log_file: String,

    /// Verbose logging (can be repeated for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count, help = "Increase logging verbosity")]
    pub verbose: u8,

    /// Command to execute (if provided, runs in non-interactive mode)
    #[arg(short = 'c', long, help = "Command to execute")]
    pub command: Option<String>,
}

impl Args {
    pub fn engine_config(&self) -> SimulatedEngineConfig {
        SimulatedEngineConfig::builder()
            .version(self.engine_version)
            .idle_interval(Duration::from_millis(self.idle_tick_ms.max(1)))
            .build()
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig::builder()
            .enable_idle_invocation(!self.no_idle_invocation)
            .track_runspace_changes(!self.no_runspace_tracking)
            .build()
    }
}

fn parse_version(value: &str) -> Result<EngineVersion, String> {
    let (major, minor) = value.split_once('.').unwrap_or((value, "0"));
    let major = major
        .trim()
        .parse()
        .map_err(|_| format!("invalid major version in {value:?}"))?;
    let minor = minor
        .trim()
        .parse()
        .map_err(|_| format!("invalid minor version in {value:?}"))?;
    Ok(EngineVersion::new(major, minor))
}

/// Initialize logging with file output and proper structured logging
pub fn init_logging(log_file: &str, verbose_level: u8) -> anyhow::Result<()> {
    let log_file = std::fs::File::create(log_file)?;

    let log_level = match verbose_level {
        0 => "info,sim=warn",
        1 => "debug,sim=info",
        _ => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let subscriber = Registry::default().with(env_filter).with(
        fmt::layer()
            .with_writer(log_file)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(false)
            .compact(),
    );

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
