//! Size cacher: periodically measure the current cruise and lowering
//! directories and post the sizes back to the control plane.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::api::ApiClient;
use crate::config::PurserConfig;

fn sleep_remainder(start: Instant, interval: Duration, quit: &AtomicBool) -> bool {
    let elapsed = start.elapsed();
    debug!("elapsed time: {:.2} seconds", elapsed.as_secs_f64());

    let mut remaining = interval.saturating_sub(elapsed);
    if !remaining.is_zero() {
        info!("sleeping for {:.2} seconds", remaining.as_secs_f64());
    }
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

/// Measure and publish directory sizes every `interval` until quit.
pub fn run(config: &PurserConfig, interval: Duration, quit: &AtomicBool) -> Result<()> {
    let api = ApiClient::new(&config.site_root)?;

    loop {
        let start = Instant::now();

        let state = (|| -> Result<_> {
            let warehouse = api.warehouse_config()?;
            let cruise_id = api.cruise_id()?;
            let lowering_id = if api.show_lowering_components()? {
                api.lowering_id()?
            } else {
                None
            };
            Ok((warehouse, cruise_id, lowering_id))
        })();

        let (warehouse, cruise_id, lowering_id) = match state {
            Ok(state) => state,
            Err(err) => {
                warn!("unable to retrieve data from control-plane API: {err:#}");
                if !sleep_remainder(start, interval, quit) {
                    return Ok(());
                }
                continue;
            }
        };

        let Some(cruise_id) = cruise_id else {
            if !sleep_remainder(start, interval, quit) {
                return Ok(());
            }
            continue;
        };

        let cruise_dir = warehouse.cruise_dir(&cruise_id);
        debug!("cruise directory: {}", cruise_dir.display());

        let cruise_size = crate::fsutil::dir_size_bytes(&cruise_dir);
        if let Some(size) = &cruise_size {
            info!("cruise size: {size}");
            if let Err(err) = api.set_cruise_size(size) {
                warn!("unable to post cruise size: {err:#}");
            }
        }

        if let Some(lowering_id) = &lowering_id {
            let lowering_dir = warehouse.lowering_dir(&cruise_id, lowering_id);
            debug!("lowering directory: {}", lowering_dir.display());

            if let Some(size) = crate::fsutil::dir_size_bytes(&lowering_dir) {
                info!("lowering size: {size}");
                if let Err(err) = api.set_lowering_size(&size) {
                    warn!("unable to post lowering size: {err:#}");
                }
            }
        }

        if !sleep_remainder(start, interval, quit) {
            return Ok(());
        }
    }
}
