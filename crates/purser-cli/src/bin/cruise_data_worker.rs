//! Worker handling cruise data transfer related tasks.

use anyhow::Result;
use clap::Parser;

use purser::handlers::cruise_data;
use purser_cli::{CommonArgs, init_logging, run_worker};

#[derive(Parser, Debug)]
#[command(name = "purser-cruise-data-worker", version)]
#[command(about = "Handle cruise data transfer related tasks")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.common.verbose);

    let config = cli.common.load_config()?;
    run_worker(config, "purser-cruise-data-worker", cruise_data::registrations())
}
