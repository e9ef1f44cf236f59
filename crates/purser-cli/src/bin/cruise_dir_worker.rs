//! Worker handling cruise data directory related tasks.

use anyhow::Result;
use clap::Parser;

use purser::handlers::cruise_directory;
use purser_cli::{CommonArgs, init_logging, run_worker};

#[derive(Parser, Debug)]
#[command(name = "purser-cruise-dir-worker", version)]
#[command(about = "Handle cruise data directory related tasks")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.common.verbose);

    let config = cli.common.load_config()?;
    run_worker(config, "purser-cruise-dir-worker", cruise_directory::registrations())
}
