//! Worker handling lowering-level tasks.

use anyhow::Result;
use clap::Parser;

use purser::handlers::lowering;
use purser_cli::{CommonArgs, init_logging, run_worker};

#[derive(Parser, Debug)]
#[command(name = "purser-lowering-worker", version)]
#[command(about = "Handle lowering-level tasks")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.common.verbose);

    let config = cli.common.load_config()?;
    run_worker(config, "purser-lowering-worker", lowering::registrations())
}
