//! Worker handling collection system transfer jobs.

use anyhow::Result;
use clap::Parser;

use purser::handlers::collection_system;
use purser_cli::{CommonArgs, init_logging, run_worker};

#[derive(Parser, Debug)]
#[command(name = "purser-transfer-worker", version)]
#[command(about = "Handle collection system transfer related tasks")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.common.verbose);

    let config = cli.common.load_config()?;
    run_worker(config, "purser-transfer-worker", collection_system::registrations())
}
