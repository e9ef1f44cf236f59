//! Worker handling MD5 summary related tasks.

use anyhow::Result;
use clap::Parser;

use purser::handlers::md5_summary;
use purser_cli::{CommonArgs, init_logging, run_worker};

#[derive(Parser, Debug)]
#[command(name = "purser-md5-worker", version)]
#[command(about = "Handle MD5 summary related tasks")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.common.verbose);

    let config = cli.common.load_config()?;
    run_worker(config, "purser-md5-worker", md5_summary::registrations())
}
