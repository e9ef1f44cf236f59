//! Directory size cacher daemon.

use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use purser::worker::Signals;
use purser_cli::{CommonArgs, init_logging};

#[derive(Parser, Debug)]
#[command(name = "purser-size-cacher", version)]
#[command(about = "Measure cruise and lowering directory sizes")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// Minimum interval in seconds between size calculations.
    #[arg(long, default_value_t = 10)]
    interval: u64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.common.verbose);

    let config = cli.common.load_config()?;
    let signals = Signals::install()?;
    purser::size_cacher::run(&config, Duration::from_secs(cli.interval), &signals.quit)
}
