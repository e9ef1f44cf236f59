//! Worker handling post-hook processes.

use anyhow::Result;
use clap::Parser;

use purser::handlers::post_hooks;
use purser_cli::{CommonArgs, init_logging, run_worker};

#[derive(Parser, Debug)]
#[command(name = "purser-hook-worker", version)]
#[command(about = "Handle post-hook processes")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.common.verbose);

    let config = cli.common.load_config()?;
    run_worker(config, "purser-hook-worker", post_hooks::registrations())
}
