//! Worker handling data dashboard related tasks.

use anyhow::Result;
use clap::Parser;

use purser::handlers::data_dashboard;
use purser_cli::{CommonArgs, init_logging, run_worker};

#[derive(Parser, Debug)]
#[command(name = "purser-dashboard-worker", version)]
#[command(about = "Handle data dashboard related tasks")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.common.verbose);

    let config = cli.common.load_config()?;
    run_worker(config, "purser-dashboard-worker", data_dashboard::registrations())
}
