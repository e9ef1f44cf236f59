//! Worker handling dynamic stopping of other tasks.

use anyhow::Result;
use clap::Parser;

use purser::handlers::stop_job;
use purser_cli::{CommonArgs, init_logging, run_worker};

#[derive(Parser, Debug)]
#[command(name = "purser-stop-worker", version)]
#[command(about = "Handle dynamic stopping of other tasks")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.common.verbose);

    let config = cli.common.load_config()?;
    run_worker(config, "purser-stop-worker", stop_job::registrations())
}
