//! Worker handling ship-to-shore transfer jobs.

use anyhow::Result;
use clap::Parser;

use purser::handlers::ship_to_shore::{self, Transport};
use purser_cli::{CommonArgs, init_logging, run_worker};

#[derive(Parser, Debug)]
#[command(name = "purser-shore-worker", version)]
#[command(about = "Handle ship-to-shore transfer related tasks")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// Use rclone instead of rsync-over-ssh as the transport.
    #[arg(long)]
    rclone: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.common.verbose);

    let transport = if cli.rclone {
        Transport::Rclone
    } else {
        Transport::Rsync
    };

    let config = cli.common.load_config()?;
    run_worker(
        config,
        "purser-shore-worker",
        ship_to_shore::registrations(transport),
    )
}
