//! Worker handling lowering data directory related tasks.

use anyhow::Result;
use clap::Parser;

use purser::handlers::lowering_directory;
use purser_cli::{CommonArgs, init_logging, run_worker};

#[derive(Parser, Debug)]
#[command(name = "purser-lowering-dir-worker", version)]
#[command(about = "Handle lowering data directory related tasks")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.common.verbose);

    let config = cli.common.load_config()?;
    run_worker(config, "purser-lowering-dir-worker", lowering_directory::registrations())
}
