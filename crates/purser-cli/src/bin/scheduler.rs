//! Transfer scheduler daemon.

use anyhow::Result;
use clap::Parser;

use purser::worker::Signals;
use purser_cli::{CommonArgs, init_logging};

#[derive(Parser, Debug)]
#[command(name = "purser-scheduler", version)]
#[command(about = "Periodically submit transfer jobs and purge stale logs")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// Interval in minutes between transfer job submissions.
    #[arg(short, long)]
    interval: Option<u64>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.common.verbose);

    let config = cli.common.load_config()?;
    let interval = cli.interval.unwrap_or(config.transfer_interval);

    let signals = Signals::install()?;
    purser::scheduler::run(&config, interval, &signals.quit)
}
