//! Worker handling cruise-level tasks.

use anyhow::Result;
use clap::Parser;

use purser::handlers::cruise;
use purser_cli::{CommonArgs, init_logging, run_worker};

#[derive(Parser, Debug)]
#[command(name = "purser-cruise-worker", version)]
#[command(about = "Handle cruise-level tasks")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.common.verbose);

    let config = cli.common.load_config()?;
    run_worker(config, "purser-cruise-worker", cruise::registrations())
}
