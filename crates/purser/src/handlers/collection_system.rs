//! Collection system transfers: pull data from an acquisition source into
//! the cruise tree, then chain the dashboard and MD5 updates.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{TimeDelta, Utc};
use rand::Rng;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::connection::{
    self, RemoteAuth, RsyncBehavior, RsyncMode, TransferScratch, build_rsync_command,
    build_rsync_options,
};
use crate::executor;
use crate::filelist::{self, FileListRequest};
use crate::filters::{self, TokenContext};
use crate::types::{
    CollectionSystemTransfer, FileReport, JobReport, PartResult, TransferKind,
};
use crate::worker::{JobContext, OwnerSpec, TaskRegistration};

use super::Scope;

pub const RUN_TASK: &str = "runCollectionSystemTransfer";
pub const TEST_TASK: &str = "testCollectionSystemTransfer";

pub fn registrations() -> Vec<TaskRegistration> {
    vec![
        TaskRegistration::new(RUN_TASK, OwnerSpec::CstFromPayload { test: false }, run_transfer)
            .with_hook_payload(hook_payload),
        TaskRegistration::new(TEST_TASK, OwnerSpec::CstFromPayload { test: true }, test_transfer),
    ]
}

/// Expanded destination directory relative to the cruise root. `None` when a
/// lowering-scoped transfer has no lowering to land in.
fn build_rel_dir(cst: &CollectionSystemTransfer, scope: &Scope, ctx_tokens: &TokenContext) -> Option<String> {
    let dest = filters::keyword_replace(&cst.dest_dir, ctx_tokens);
    let dest = dest.trim_start_matches('/').to_string();

    if cst.lowering_scoped() {
        let lowering_id = scope.lowering_id.as_ref()?;
        let mut rel = PathBuf::from(&scope.warehouse.lowering_data_base_dir);
        rel.push(lowering_id);
        rel.push(dest);
        Some(rel.to_string_lossy().to_string())
    } else {
        Some(dest)
    }
}

/// Temporal bounds for the transfer, per the transfer's scope settings.
fn data_window(ctx: &JobContext, cst: &CollectionSystemTransfer) -> Result<(i64, i64)> {
    let mut start_str = filelist::EPOCH_START.to_string();
    let mut end_str = filelist::FAR_FUTURE_END.to_string();

    if cst.use_start_date() {
        if !cst.lowering_scoped() {
            debug!("using cruise time bounds");
            if let Some(start) = ctx.api.cruise_start_date()? {
                start_str = start;
            }
            if let Some(end) = ctx.api.cruise_end_date()? {
                end_str = format!("{end}:59");
            }
        } else {
            debug!("using lowering time bounds");
            if let Some(start) = ctx.api.lowering_start_date()? {
                start_str = start;
            }
            if let Some(end) = ctx.api.lowering_end_date()? {
                end_str = format!("{end}:59");
            }
        }
    }

    let start = filelist::parse_window_start(&start_str)?;
    let mut end = filelist::parse_window_end(&end_str)?;

    let staleness = cst.staleness_secs();
    if staleness > 0 {
        let pulled_back = (Utc::now() - TimeDelta::seconds(staleness as i64)).timestamp();
        if pulled_back < end {
            end = pulled_back;
        }
    }

    debug!("time window: {start}..{end}");
    Ok((start, end))
}

/// Build the file list, materialize the include file, run the rsync, and
/// prune the destination when mirroring.
fn transfer_from_source(
    ctx: &JobContext,
    cst: &CollectionSystemTransfer,
    scope: &Scope,
    source_dir: &str,
    dest_dir: &Path,
    window: (i64, i64),
) -> Result<FileReport> {
    let kind = cst.kind().context("unknown transfer type")?;
    let auth = RemoteAuth::from(cst);
    let scratch = TransferScratch::new()?;

    let mut mount_prefix = None;
    let mut password_file = None;
    let mut is_darwin = false;

    match kind {
        TransferKind::Smb => {
            let mntpoint = scratch.mountpoint();
            std::fs::create_dir(&mntpoint).context("failed to create SMB mountpoint")?;
            let version =
                connection::detect_smb_version(&auth).context("failed to probe SMB server")?;
            if !connection::mount_smb_share(&auth, &mntpoint, &version, cst.remove_source_files()) {
                anyhow::bail!("Failed to mount SMB share");
            }
            mount_prefix = Some(mntpoint);
        }
        TransferKind::Rsync => {
            password_file = scratch
                .write_password_file(&auth)
                .context("Error writing rsync password file")?;
        }
        TransferKind::Ssh => {
            is_darwin = connection::check_darwin(&auth);
        }
        TransferKind::Local => {}
    }

    let token_ctx = scope.token_ctx();
    let request = FileListRequest {
        cst,
        source_dir,
        mount_prefix: mount_prefix.as_deref(),
        password_file: password_file.as_deref(),
        is_darwin,
        token_ctx: &token_ctx,
        data_start: window.0,
        data_end: window.1,
    };
    let list = filelist::build(&request, ctx.cancel)?;

    let include_file = scratch.include_file();
    crate::fsutil::build_include_file(&list.include, &include_file)
        .context("Error writing file list")?;

    let source_path = match kind {
        TransferKind::Local => {
            if source_dir == "/" {
                source_dir.to_string()
            } else {
                source_dir.trim_end_matches('/').to_string()
            }
        }
        TransferKind::Rsync => {
            format!("rsync://{}@{}{}", cst.rsync_user, cst.rsync_server, source_dir)
        }
        TransferKind::Ssh => format!("{}@{}:{}", cst.ssh_user, cst.ssh_server, source_dir),
        TransferKind::Smb => mount_prefix
            .as_ref()
            .map(|m| {
                m.join(source_dir.trim_matches('/'))
                    .to_string_lossy()
                    .to_string()
            })
            .unwrap_or_default(),
    };
    let source_path = format!("{source_path}/");

    let extra_args: Vec<String> = match kind {
        TransferKind::Ssh => vec!["-e".into(), "ssh".into()],
        TransferKind::Rsync => password_file
            .as_ref()
            .map(|p| vec![format!("--password-file={}", p.display())])
            .unwrap_or_default(),
        _ => Vec::new(),
    };

    let flags = build_rsync_options(kind, &RsyncBehavior::from_cst(cst), RsyncMode::Real, is_darwin);
    let mut cmd = build_rsync_command(
        &flags,
        &extra_args,
        &source_path,
        Some(&dest_dir.to_string_lossy()),
        Some(&include_file),
    );
    if kind == TransferKind::Ssh && !cst.ssh_use_key() {
        let mut wrapped: Vec<String> = vec!["sshpass".into(), "-p".into(), cst.ssh_pass.clone()];
        wrapped.extend(cmd);
        cmd = wrapped;
    }

    let outcome = executor::run_transfer_command(&cmd, list.include.len(), ctx.cancel, |pct| {
        ctx.send_percent_in_range(20, 70, pct)
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

    let mut files = FileReport {
        new: outcome.new,
        updated: outcome.updated,
        deleted: Vec::new(),
        exclude: list.exclude,
    };

    if cst.sync_from_source() {
        files.deleted = crate::fsutil::delete_from_dest(dest_dir, &list.include);
    }

    Ok(files)
}

fn run_transfer(ctx: &JobContext) -> Result<JobReport> {
    // Spread simultaneous scheduler submissions apart.
    thread::sleep(Duration::from_secs(rand::thread_rng().gen_range(0..=2)));

    let cst = ctx.cst().context("runtime resolved no transfer")?.clone();
    let mut report = JobReport::new();
    report.pass("Transfer In-Progress").pass("Transfer Enabled");

    let transfer_start = super::timestamp_utc();
    let scope = Scope::resolve(ctx)?;

    if (cst.lowering_scoped() || filters::has_unresolved_lowering(&cst.dest_dir))
        && scope.lowering_id.is_none()
    {
        report.fail("Verify lowering ID", "Lowering ID is undefined");
        return Ok(report);
    }

    let token_ctx = scope.token_ctx();
    let source_dir = filters::keyword_replace(&cst.source_dir, &token_ctx);
    let Some(rel_dir) = build_rel_dir(&cst, &scope, &token_ctx) else {
        report.fail("Verify lowering ID", "Lowering ID is undefined");
        return Ok(report);
    };
    let dest_dir = scope.cruise_dir.join(&rel_dir);

    let window = data_window(ctx, &cst)?;

    info!("testing source");
    ctx.send_status(1, 10);
    let source_parts = connection::test_cst_source(&cst, &source_dir);
    if let Some(last) = source_parts.last()
        && last.result == PartResult::Fail
    {
        warn!("source test failed, quitting job");
        report.fail(
            "Source Test",
            last.reason.clone().unwrap_or_else(|| "undefined".into()),
        );
        return Ok(report);
    }
    report.pass("Source Test");

    info!("testing destination");
    ctx.send_status(15, 100);
    if !dest_dir.is_dir() {
        warn!("destination test failed, quitting job");
        report.fail(
            "Destination Test",
            format!("Unable to find destination directory: {}", dest_dir.display()),
        );
        return Ok(report);
    }
    report.pass("Destination Test");

    info!("transferring files");
    ctx.send_status(2, 10);
    let files = match transfer_from_source(ctx, &cst, &scope, &source_dir, &dest_dir, window) {
        Ok(files) => files,
        Err(err) => {
            report.fail("Transfer Files", format!("{err:#}"));
            return Ok(report);
        }
    };
    report.pass("Transfer Files");

    if !files.new.is_empty() {
        debug!("{} file(s) added", files.new.len());
    }
    if !files.updated.is_empty() {
        debug!("{} file(s) updated", files.updated.len());
    }
    if !files.exclude.is_empty() {
        debug!("{} misnamed file(s) encountered", files.exclude.len());
    }
    if !files.deleted.is_empty() {
        debug!("{} file(s) deleted", files.deleted.len());
    }

    if !files.new.is_empty() || !files.updated.is_empty() {
        if !scope.warehouse.base_dir_is_mount_point() {
            info!("setting file permissions");
            ctx.send_status(9, 10);
            if let Err(err) =
                crate::fsutil::set_owner_group_permissions(&scope.warehouse.username, &dest_dir)
            {
                report.fail(
                    "Setting file/directory ownership/permissions",
                    format!("{err:#}"),
                );
                return Ok(report);
            }
            report.pass("Setting file/directory ownership/permissions");
        }

        info!("writing transfer logfile");
        ctx.send_status(93, 100);
        let log_name = format!("{}_{transfer_start}.log", cst.name);
        let contents = json!({ "new": files.new, "updated": files.updated });
        if let Err(err) = super::write_transfer_log(ctx, &scope, &log_name, &contents) {
            report.fail("Write transfer logfile", format!("{err:#}"));
            return Ok(report);
        }
        report.pass("Write transfer logfile");
    }

    info!("writing exclude logfile");
    ctx.send_status(95, 100);
    let exclude_name = format!("{}_Exclude.log", cst.name);
    let contents = json!({ "exclude": files.exclude });
    if let Err(err) = super::write_transfer_log(ctx, &scope, &exclude_name, &contents) {
        report.fail("Write exclude logfile", format!("{err:#}"));
        return Ok(report);
    }
    report.pass("Write exclude logfile");

    ctx.send_status(10, 10);
    report.files = Some(files);
    Ok(report)
}

/// Follow-on payload: cruise id, transfer id, and the file sets rebased onto
/// the expanded destination directory. Empty file sets suppress the hooks.
fn hook_payload(ctx: &JobContext, report: &JobReport) -> Option<Value> {
    let files = report.files.as_ref()?;
    if files.new.is_empty() && files.updated.is_empty() && files.deleted.is_empty() {
        return None;
    }

    let cst = ctx.cst()?;
    let scope = Scope::resolve(ctx).ok()?;
    let token_ctx = scope.token_ctx();
    let rel_dir = build_rel_dir(cst, &scope, &token_ctx)?;

    let rebase = |paths: &[String]| -> Vec<String> {
        paths
            .iter()
            .map(|p| format!("{rel_dir}/{p}"))
            .collect()
    };

    info!("preparing subsequent jobs");
    Some(json!({
        "cruiseID": scope.cruise_id,
        "collectionSystemTransferID": cst.id,
        "files": {
            "new": rebase(&files.new),
            "updated": rebase(&files.updated),
            "deleted": rebase(&files.deleted),
        }
    }))
}

fn test_transfer(ctx: &JobContext) -> Result<JobReport> {
    let cst = ctx.cst().context("runtime resolved no transfer")?.clone();
    let mut report = JobReport::new();
    let scope = Scope::resolve(ctx)?;
    let token_ctx = scope.token_ctx();
    let source_dir = filters::keyword_replace(&cst.source_dir, &token_ctx);

    info!("testing source");
    ctx.send_status(33, 100);
    report.parts.extend(connection::test_cst_source(&cst, &source_dir));

    if cst.enabled() {
        info!("testing destination");
        ctx.send_status(66, 100);
        match build_rel_dir(&cst, &scope, &token_ctx) {
            Some(rel_dir) => {
                let dest_dir = scope.cruise_dir.join(rel_dir);
                if dest_dir.is_dir() {
                    report.pass("Destination directory");
                } else {
                    report.fail(
                        "Destination directory",
                        format!("Unable to find destination directory: {}", dest_dir.display()),
                    );
                }
            }
            None => {
                report.fail("Destination directory", "Lowering ID is undefined");
            }
        }
    }

    let failure = report
        .parts
        .iter()
        .find(|p| p.result == PartResult::Fail)
        .cloned();
    match failure {
        Some(part) => {
            report.fail(
                "Final Verdict",
                part.reason.unwrap_or_else(|| "undefined".into()),
            );
        }
        None => {
            report.pass("Final Verdict");
        }
    }

    ctx.send_status(10, 10);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WarehouseConfig;

    fn scope(lowering: Option<&str>) -> Scope {
        Scope {
            cruise_id: "FK250801".into(),
            lowering_id: lowering.map(str::to_string),
            warehouse: WarehouseConfig {
                lowering_data_base_dir: "Lowerings".into(),
                base_dir: "/data/cruises".into(),
                ..WarehouseConfig::default()
            },
            cruise_dir: "/data/cruises/FK250801".into(),
        }
    }

    fn cst(dest: &str, lowering_scoped: bool) -> CollectionSystemTransfer {
        CollectionSystemTransfer {
            dest_dir: dest.into(),
            cruise_or_lowering: if lowering_scoped { "1" } else { "0" }.into(),
            ..CollectionSystemTransfer::default()
        }
    }

    #[test]
    fn rel_dir_for_cruise_scoped_transfer() {
        let scope = scope(Some("S0412"));
        let token_ctx = scope.token_ctx();
        let rel = build_rel_dir(&cst("SCS", false), &scope, &token_ctx).unwrap();
        assert_eq!(rel, "SCS");
    }

    #[test]
    fn rel_dir_for_lowering_scoped_transfer() {
        let scope = scope(Some("S0412"));
        let token_ctx = scope.token_ctx();
        let rel = build_rel_dir(&cst("SUBNAV", true), &scope, &token_ctx).unwrap();
        assert_eq!(rel, "Lowerings/S0412/SUBNAV");
    }

    #[test]
    fn rel_dir_expands_tokens() {
        let scope = scope(Some("S0412"));
        let token_ctx = scope.token_ctx();
        let rel = build_rel_dir(&cst("raw/{cruiseID}/{loweringID}/nav", false), &scope, &token_ctx)
            .unwrap();
        assert_eq!(rel, "raw/FK250801/S0412/nav");
    }

    #[test]
    fn lowering_scoped_without_lowering_is_none() {
        let scope = scope(None);
        let token_ctx = scope.token_ctx();
        assert!(build_rel_dir(&cst("SUBNAV", true), &scope, &token_ctx).is_none());
    }
}
