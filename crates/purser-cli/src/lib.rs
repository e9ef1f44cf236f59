//! Shared bootstrapping for the purser worker binaries: common flags,
//! log-level wiring, and the register-and-work loop.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use purser::config::PurserConfig;
use purser::worker::{Signals, TaskRegistration, WorkerRuntime};

/// Flags every worker binary accepts.
#[derive(Parser, Debug)]
pub struct CommonArgs {
    /// Increase output verbosity (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Path to the purser configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl CommonArgs {
    pub fn load_config(&self) -> Result<PurserConfig> {
        PurserConfig::load_default(self.config.as_deref())
    }
}

/// WARNING at `-v`-less, INFO at `-v`, DEBUG at `-vv` and beyond.
pub fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Wire signals, connect to the broker, register the given task handlers,
/// and pull jobs until told to quit.
pub fn run_worker(
    config: PurserConfig,
    client_id: &str,
    registrations: Vec<TaskRegistration>,
) -> Result<()> {
    let signals = Signals::install()?;
    let mut runtime = WorkerRuntime::new(config, client_id, signals)?;
    for registration in registrations {
        runtime.register(registration)?;
    }
    runtime.work()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn common_args_parse_repeated_verbosity() {
        let args = CommonArgs::parse_from(["worker", "-vv"]);
        assert_eq!(args.verbose, 2);
        assert!(args.config.is_none());
    }

    #[test]
    fn common_args_accept_config_path() {
        let args = CommonArgs::parse_from(["worker", "--config", "/tmp/purser.toml"]);
        assert_eq!(args.config.as_deref(), Some(std::path::Path::new("/tmp/purser.toml")));
    }

    #[test]
    fn load_config_reads_explicit_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "broker = \"10.0.0.5:4730\"").unwrap();

        let args = CommonArgs::parse_from([
            "worker",
            "--config",
            &file.path().to_string_lossy(),
        ]);
        let config = args.load_config().unwrap();
        assert_eq!(config.broker, "10.0.0.5:4730");
    }
}
