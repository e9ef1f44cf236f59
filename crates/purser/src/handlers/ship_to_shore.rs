//! Ship-to-shore transfer: a prioritized subset of the cruise tree pushed
//! over the bandwidth-limited shore path, by rsync-over-ssh or rclone.

use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::connection::{
    self, RemoteAuth, RsyncBehavior, RsyncMode, TransferScratch, build_rsync_command,
    build_rsync_options,
};
use crate::executor;
use crate::filters::split_patterns;
use crate::types::{
    CdtJobPayload, CruiseDataTransfer, FileReport, JobReport, PartResult, TransferKind,
};
use crate::worker::{JobContext, OwnerSpec, TaskRegistration};
use globset::Glob;
use walkdir::WalkDir;

use super::Scope;

pub const RUN_TASK: &str = "runShipToShoreTransfer";

/// The required cruise data transfer backing the shore path.
pub const SSDW_TRANSFER: &str = "SSDW";

/// Transport selector; rclone trades per-file itemization for the remote
/// back-ends it supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Rsync,
    Rclone,
}

pub fn registrations(transport: Transport) -> Vec<TaskRegistration> {
    vec![TaskRegistration::new(
        RUN_TASK,
        OwnerSpec::CdtRequiredByName(SSDW_TRANSFER),
        move |ctx| run_transfer(ctx, transport),
    )]
}

/// Assemble the shore include patterns: every enabled ship-to-shore bundle,
/// in priority order 1..5, its filters rooted under the bundle's collection
/// system or extra directory and expanded against every lowering.
fn build_shore_patterns(ctx: &JobContext, scope: &Scope) -> Result<Vec<String>> {
    let mut transfers = ctx.api.ship_to_shore_transfers()?;
    transfers.extend(ctx.api.required_ship_to_shore_transfers()?);

    let lowerings = ctx.api.lowerings()?;
    let mut patterns = Vec::new();

    for priority in 1..=5u8 {
        let priority = priority.to_string();
        for transfer in transfers.iter().filter(|t| t.priority == priority && t.enabled()) {
            let mut base_path = format!("*/{}", scope.cruise_id);

            let prefix = if transfer.collection_system != "0" {
                let cs = ctx
                    .api
                    .collection_system_transfer(&transfer.collection_system)?
                    .with_context(|| {
                        format!("unknown collection system {}", transfer.collection_system)
                    })?;
                if cs.lowering_scoped() {
                    base_path = format!(
                        "{base_path}/{}/{{loweringID}}",
                        scope.warehouse.lowering_data_base_dir
                    );
                }
                format!("{base_path}/{}", cs.dest_dir)
            } else if transfer.extra_directory != "0" {
                let extra_dir = ctx
                    .api
                    .extra_directory(&transfer.extra_directory)?
                    .with_context(|| {
                        format!("unknown extra directory {}", transfer.extra_directory)
                    })?;
                if extra_dir.lowering_scoped() {
                    base_path = format!(
                        "{base_path}/{}/{{loweringID}}",
                        scope.warehouse.lowering_data_base_dir
                    );
                }
                format!("{base_path}/{}", extra_dir.dest_dir)
            } else {
                base_path
            };

            for filter in split_patterns(&transfer.include_filter) {
                let joined = format!(
                    "{prefix}/{}",
                    filter.replace("{cruiseID}", &scope.cruise_id)
                );
                if joined.contains("{loweringID}") {
                    patterns.extend(
                        lowerings
                            .iter()
                            .map(|lowering| joined.replace("{loweringID}", lowering)),
                    );
                } else {
                    patterns.push(joined);
                }
            }
        }
    }

    debug!("processed filters: {patterns:?}");
    Ok(patterns)
}

/// Walk the cruise tree and keep files matching any shore pattern, relative
/// to the cruise directory.
fn build_filelist(patterns: &[String], cruise_dir: &Path) -> Result<Vec<String>> {
    let mut builder = globset::GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("bad shore pattern: {pattern}"))?);
    }
    let set = builder.build().context("failed to build shore pattern set")?;

    let mut include = Vec::new();
    for entry in WalkDir::new(cruise_dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let full = entry.path().to_string_lossy();
        if set.is_match(full.as_ref()) {
            if let Ok(rel) = entry.path().strip_prefix(cruise_dir) {
                include.push(rel.to_string_lossy().to_string());
            }
        }
    }
    Ok(include)
}

fn rsync_transfer(
    ctx: &JobContext,
    cdt: &CruiseDataTransfer,
    scope: &Scope,
    include: &[String],
) -> Result<FileReport> {
    let auth = RemoteAuth::from(cdt);
    let scratch = TransferScratch::new()?;
    let is_darwin = connection::check_darwin(&auth);

    let include_file = scratch.include_file();
    crate::fsutil::build_include_file(include, &include_file)
        .context("Failed to write include file")?;

    let behavior = RsyncBehavior::from_cdt(cdt);
    let flags = build_rsync_options(TransferKind::Ssh, &behavior, RsyncMode::Real, is_darwin);
    let extra_args: Vec<String> = vec!["-e".into(), "ssh".into()];

    let dest = format!(
        "{}@{}:{}/",
        cdt.ssh_user,
        cdt.ssh_server,
        cdt.dest_dir.trim_end_matches('/')
    );
    let source = scope.cruise_dir.to_string_lossy().to_string();

    let mut cmd = build_rsync_command(&flags, &extra_args, &source, Some(&dest), Some(&include_file));
    if !cdt.ssh_use_key() {
        let mut wrapped: Vec<String> = vec!["sshpass".into(), "-p".into(), cdt.ssh_pass.clone()];
        wrapped.extend(cmd);
        cmd = wrapped;
    }

    let outcome = executor::run_transfer_command(&cmd, include.len(), ctx.cancel, |pct| {
        ctx.send_percent_in_range(20, 95, pct)
    })?;

    if outcome.cancelled {
        anyhow::bail!("Transfer stopped by user");
    }
    if !outcome.succeeded() {
        anyhow::bail!(
            "Transfer command exited with code {}",
            outcome.exit_code.unwrap_or(-1)
        );
    }

    Ok(FileReport {
        new: outcome.new,
        updated: outcome.updated,
        ..FileReport::default()
    })
}

fn rclone_transfer(
    ctx: &JobContext,
    cdt: &CruiseDataTransfer,
    scope: &Scope,
    include: &[String],
) -> Result<FileReport> {
    let scratch = TransferScratch::new()?;

    // rclone paths are rooted at the warehouse base, so the include list
    // carries the cruise id prefix.
    let prefixed: Vec<String> = include
        .iter()
        .map(|path| format!("{}/{path}", scope.cruise_id))
        .collect();
    let include_file = scratch.include_file();
    crate::fsutil::build_include_file(&prefixed, &include_file)
        .context("Failed to write include file")?;

    let mut cmd: Vec<String> = vec![
        "rclone".into(),
        "copy".into(),
        "--create-empty-src-dirs".into(),
        "--progress".into(),
    ];
    if cdt.bandwidth_limit_kbps() != 0 {
        cmd.push(format!("--bwlimit={}k", cdt.bandwidth_limit_kbps()));
    }
    cmd.push(format!("--files-from={}", include_file.display()));
    cmd.push(format!("{}/", scope.warehouse.base_dir.trim_end_matches('/')));
    cmd.push(format!("{}/", cdt.dest_dir.trim_end_matches('/')));

    let outcome = executor::run_rclone_command(&cmd, include.len(), ctx.cancel, |pct| {
        ctx.send_percent_in_range(20, 95, pct)
    })?;

    if outcome.cancelled {
        anyhow::bail!("Transfer stopped by user");
    }
    if !outcome.succeeded() {
        anyhow::bail!(
            "Transfer command exited with code {}",
            outcome.exit_code.unwrap_or(-1)
        );
    }

    // rclone does not itemize per-file changes.
    Ok(FileReport::default())
}

fn run_transfer(ctx: &JobContext, transport: Transport) -> Result<JobReport> {
    thread::sleep(Duration::from_secs(rand::thread_rng().gen_range(0..=2)));

    let mut cdt = ctx.cdt().context("runtime resolved no transfer")?.clone();
    let mut report = JobReport::new();
    report.pass("Transfer In-Progress").pass("Transfer Enabled");

    // The shore bandwidth cap only applies while the installation-wide
    // flag is on.
    let payload: CdtJobPayload = ctx.payload().unwrap_or_default();
    let limited = match payload.bandwidth_limit_status {
        Some(flag) => flag,
        None => ctx.api.ship_to_shore_bw_limit_enabled()?,
    };
    if !limited {
        cdt.bandwidth_limit = "0".to_string();
    }

    let scope = Scope::resolve(ctx)?;

    info!("testing destination");
    ctx.send_status(1, 10);
    match transport {
        Transport::Rsync => {
            let parts = connection::test_cdt_destination(&cdt);
            if let Some(last) = parts.last()
                && last.result == PartResult::Fail
            {
                warn!("destination test failed, quitting job");
                report.fail(
                    "Connection Test",
                    last.reason.clone().unwrap_or_else(|| "undefined".into()),
                );
                return Ok(report);
            }
            report.pass("Connection Test");
        }
        // rclone validates its remote at copy time.
        Transport::Rclone => {
            report.pass("Connection Test");
        }
    }

    info!("building file list");
    ctx.send_status(2, 10);
    let patterns = build_shore_patterns(ctx, &scope)?;
    let include = build_filelist(&patterns, &scope.cruise_dir)?;
    debug!("{} file(s) selected for shore transfer", include.len());

    info!("transferring files");
    let result = match transport {
        Transport::Rsync => rsync_transfer(ctx, &cdt, &scope, &include),
        Transport::Rclone => rclone_transfer(ctx, &cdt, &scope, &include),
    };
    let files = match result {
        Ok(files) => files,
        Err(err) => {
            report.fail("Transfer Files", format!("{err:#}"));
            return Ok(report);
        }
    };
    report.pass("Transfer Files");

    if !files.new.is_empty() || !files.updated.is_empty() {
        info!("writing transfer logfile");
        ctx.send_status(96, 100);
        let log_name = format!("{}_{}.log", cdt.name, super::timestamp_utc());
        let contents = json!({ "new": files.new, "updated": files.updated });
        if let Err(err) = super::write_transfer_log(ctx, &scope, &log_name, &contents) {
            report.fail("Write transfer logfile", format!("{err:#}"));
            return Ok(report);
        }
        report.pass("Write transfer logfile");
    }

    ctx.send_status(10, 10);
    report.files = Some(files);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn filelist_matches_patterns_and_relativizes() {
        let tmp = tempfile::tempdir().unwrap();
        let cruise_dir = tmp.path().join("FK250801");
        fs::create_dir_all(cruise_dir.join("SCS")).unwrap();
        fs::create_dir_all(cruise_dir.join("EM124")).unwrap();
        fs::write(cruise_dir.join("SCS/pos.txt"), b"x").unwrap();
        fs::write(cruise_dir.join("EM124/swath.raw"), b"x").unwrap();

        let patterns = vec!["*/FK250801/SCS/*.txt".to_string()];
        let include = build_filelist(&patterns, &cruise_dir).unwrap();
        assert_eq!(include, vec!["SCS/pos.txt"]);
    }

    #[test]
    fn empty_patterns_select_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("a.txt"), b"x").unwrap();
        assert!(build_filelist(&[], tmp.path()).unwrap().is_empty());
    }
}
