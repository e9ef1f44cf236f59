//! One-shot reset after an unscheduled reboot: return every record to idle
//! and clear the broker job table.

use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use purser::api::ApiClient;
use purser_cli::{CommonArgs, init_logging};

#[derive(Parser, Debug)]
#[command(name = "purser-reboot-reset", version)]
#[command(about = "Reset engine state after an unscheduled system reboot")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.common.verbose);

    let config = cli.common.load_config()?;
    let api = ApiClient::new(&config.site_root)?;

    thread::sleep(Duration::from_secs(5));

    info!("setting all tasks to idle");
    for task in api.tasks()? {
        api.set_idle_task(&task.task_id)?;
    }

    info!("setting all collection system transfers to idle");
    for transfer in api.collection_system_transfers()? {
        if transfer.status != "3" {
            api.set_idle_collection_system_transfer(&transfer.id)?;
        }
    }

    info!("setting all cruise data transfers to idle");
    for transfer in api.cruise_data_transfers()? {
        if transfer.status != "3" {
            api.set_idle_cruise_data_transfer(&transfer.id)?;
        }
    }
    for transfer in api.required_cruise_data_transfers()? {
        if transfer.status != "3" {
            api.set_idle_cruise_data_transfer(&transfer.id)?;
        }
    }

    info!("clearing all jobs from the broker table");
    api.clear_all_jobs()?;

    info!("done!");
    Ok(())
}
