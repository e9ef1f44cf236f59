//! Transfer scheduler: on each tick, submit background jobs for every
//! active collection system transfer, every cruise data transfer, and the
//! required ship-to-shore transfer, then purge stale transfer logs.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use chrono::{Timelike, Utc};
use serde_json::json;
use tracing::{info, warn};

use crate::api::ApiClient;
use crate::broker::BrokerClient;
use crate::config::PurserConfig;

/// Pause between individual job submissions.
const SUBMIT_SPACING: Duration = Duration::from_secs(2);

/// Startup grace period before the first tick.
const STARTUP_DELAY: Duration = Duration::from_secs(10);

/// Sleep in one-second slices so the quit flag stays responsive.
fn sleep_checking(duration: Duration, quit: &AtomicBool) -> bool {
    let mut remaining = duration;
    while !remaining.is_zero() {
        if quit.load(Ordering::SeqCst) {
            return false;
        }
        let slice = remaining.min(Duration::from_secs(1));
        thread::sleep(slice);
        remaining -= slice;
    }
    !quit.load(Ordering::SeqCst)
}

/// Wait until the next wall-clock minute boundary.
fn align_to_minute(quit: &AtomicBool) -> bool {
    let second = Utc::now().second() as u64;
    sleep_checking(Duration::from_secs(60 - second.min(59)), quit)
}

fn purge_transfer_logs(api: &ApiClient, config: &PurserConfig) {
    info!("purging old transfer logs");

    let purge = || -> Result<()> {
        let warehouse = api.warehouse_config()?;
        let Some(cruise_id) = api.cruise_id()? else {
            return Ok(());
        };
        let Some(log_dir) = api.required_extra_directory_by_name("Transfer_Logs")? else {
            return Ok(());
        };
        let timedelta = api
            .logfile_purge_timedelta()?
            .or_else(|| config.logfile_purge_timedelta.clone());

        let path = Path::new(&warehouse.base_dir)
            .join(&cruise_id)
            .join(&log_dir.dest_dir);
        crate::fsutil::purge_old_files(&path, Some("*Exclude.log"), timedelta.as_deref(), false)
    };

    if let Err(err) = purge() {
        warn!("transfer log purge failed: {err:#}");
    }
}

/// One scheduler tick: submit all the periodic transfer jobs. Returns the
/// number of jobs submitted.
fn submit_round(api: &ApiClient, config: &PurserConfig, quit: &AtomicBool) -> Result<usize> {
    let mut client = BrokerClient::connect(&config.broker)?;
    let mut submitted = 0;

    for transfer in api.active_collection_system_transfers(true, true)? {
        info!("submitting collection system transfer job for: {}", transfer.long_name);
        let payload = json!({
            "collectionSystemTransfer": { "collectionSystemTransferID": transfer.id }
        });
        if let Err(err) =
            client.submit_background("runCollectionSystemTransfer", &payload.to_string())
        {
            warn!("failed to submit transfer job: {err:#}");
        }
        submitted += 1;
        if !sleep_checking(SUBMIT_SPACING, quit) {
            return Ok(submitted);
        }
    }

    for transfer in api.cruise_data_transfers()? {
        info!("submitting cruise data transfer job for: {}", transfer.long_name);
        let payload = json!({
            "cruiseDataTransfer": { "cruiseDataTransferID": transfer.id }
        });
        if let Err(err) = client.submit_background("runCruiseDataTransfer", &payload.to_string()) {
            warn!("failed to submit transfer job: {err:#}");
        }
        submitted += 1;
        if !sleep_checking(SUBMIT_SPACING, quit) {
            return Ok(submitted);
        }
    }

    for transfer in api.required_cruise_data_transfers()? {
        if transfer.name == crate::handlers::ship_to_shore::SSDW_TRANSFER {
            info!("submitting ship-to-shore transfer job for: {}", transfer.long_name);
            if let Err(err) = client.submit_background("runShipToShoreTransfer", "{}") {
                warn!("failed to submit transfer job: {err:#}");
            }
        }
        if !sleep_checking(SUBMIT_SPACING, quit) {
            return Ok(submitted);
        }
    }

    Ok(submitted)
}

/// Run the scheduler loop until the quit flag is raised.
pub fn run(config: &PurserConfig, interval_minutes: u64, quit: &AtomicBool) -> Result<()> {
    let api = ApiClient::new(&config.site_root)?;

    if let Some(phrase) = &config.logfile_purge_timedelta {
        info!("logfile purge age set to: {phrase}");
    }

    if !sleep_checking(STARTUP_DELAY, quit) {
        return Ok(());
    }

    loop {
        if !align_to_minute(quit) {
            return Ok(());
        }

        let submitted = match submit_round(&api, config, quit) {
            Ok(submitted) => submitted,
            Err(err) => {
                // Control plane or broker unreachable: retry next tick.
                warn!("scheduler round failed: {err:#}");
                0
            }
        };

        purge_transfer_logs(&api, config);

        let consumed = submitted as u64 * SUBMIT_SPACING.as_secs() + 2;
        let delay = (interval_minutes * 60).saturating_sub(consumed);
        info!("waiting {delay} seconds until next round of tasks are queued");
        if !sleep_checking(Duration::from_secs(delay), quit) {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_checking_honors_quit() {
        let quit = AtomicBool::new(true);
        assert!(!sleep_checking(Duration::from_secs(30), &quit));
    }

    #[test]
    fn sleep_checking_runs_to_completion() {
        let quit = AtomicBool::new(false);
        assert!(sleep_checking(Duration::from_millis(10), &quit));
    }
}
