//! Command-line interface for stagehand.
use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for an env-filter directive.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            _ => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }
        trimmed
            .parse::<LevelFilter>()
            .map(LogLevelArg)
            .map_err(|_| format!("invalid log level '{trimmed}'"))
    }
}

/// Command-line interface for stagehand.
#[derive(Parser)]
#[command(name = "stagehand", version, author)]
#[command(about = "A supervised launcher for local service stacks", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for stagehand.
#[derive(Subcommand)]
pub enum Commands {
    /// Start the stack in the foreground and hold it until Ctrl-C.
    Up {
        /// Path to the configuration file (defaults to `stagehand.yaml`).
        #[arg(short, long, default_value = "stagehand.yaml")]
        config: String,
    },

    /// Validate the configuration and report start order and port state,
    /// without side effects.
    Check {
        /// Path to the configuration file (defaults to `stagehand.yaml`).
        #[arg(short, long, default_value = "stagehand.yaml")]
        config: String,
    },

    /// Report the last recorded run: per-service liveness and port state.
    Status,

    /// Reclaim a port from whatever holds it.
    FreePort {
        /// The port to free.
        port: u16,

        /// Skip the graceful pass and go straight to SIGKILL.
        #[arg(long)]
        force: bool,
    },
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
