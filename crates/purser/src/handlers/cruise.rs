//! Cruise lifecycle: create, finalize, export the cruise config, and mirror
//! the PublicData share into the cruise tree.

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::connection::build_rsync_command;
use crate::executor;
use crate::filters::{is_ascii, is_rsync_partial};
use crate::types::{FileReport, JobReport, PartResult, ScopeJobPayload};
use crate::worker::{JobContext, OwnerSpec, TaskRegistration};

use super::Scope;

pub const CREATE_TASK: &str = "setupNewCruise";
pub const FINALIZE_TASK: &str = "finalizeCurrentCruise";
pub const EXPORT_CONFIG_TASK: &str = "exportOVDMConfig";
pub const SYNC_PUBLICDATA_TASK: &str = "rsyncPublicDataToCruiseData";

pub fn registrations() -> Vec<TaskRegistration> {
    vec![
        TaskRegistration::new(CREATE_TASK, OwnerSpec::Task(&[]), setup_new_cruise)
            .with_hook_payload(cruise_hook_payload),
        TaskRegistration::new(FINALIZE_TASK, OwnerSpec::Task(&[]), finalize_current_cruise)
            .with_hook_payload(cruise_hook_payload),
        TaskRegistration::new(EXPORT_CONFIG_TASK, OwnerSpec::Task(&[]), export_config_task),
        TaskRegistration::new(SYNC_PUBLICDATA_TASK, OwnerSpec::Task(&[]), sync_publicdata_task),
    ]
}

fn cruise_hook_payload(ctx: &JobContext, _report: &JobReport) -> Option<Value> {
    let payload: ScopeJobPayload = ctx.payload().unwrap_or_default();
    let cruise_id = payload
        .cruise_id
        .or_else(|| ctx.api.cruise_id().ok().flatten());
    let cruise_start_date = payload
        .cruise_start_date
        .or_else(|| ctx.api.cruise_start_date().ok().flatten());
    Some(json!({ "cruiseID": cruise_id, "cruiseStartDate": cruise_start_date }))
}

/// Hand a file set to the MD5 summary worker and wait for it.
fn update_md5_summary(ctx: &JobContext, scope: &Scope, files: &FileReport) -> Result<()> {
    let payload = json!({
        "cruiseID": scope.cruise_id,
        "files": {
            "new": files.new,
            "updated": files.updated,
            "deleted": files.deleted,
        }
    });
    let mut client = ctx.broker_client()?;
    client.submit(super::md5_summary::UPDATE_TASK, &payload.to_string())?;
    debug!("MD5 summary task complete");
    Ok(())
}

/// Strip per-transfer credentials out of an exported config list, keeping
/// only the descriptive fields.
fn scrub_transfers(config: &mut Value, key: &str) {
    let allowed = ["name", "longName", "destDir"];
    if let Some(list) = config.get_mut(key).and_then(Value::as_array_mut) {
        for transfer in list {
            if let Some(obj) = transfer.as_object_mut() {
                obj.retain(|k, _| allowed.contains(&k.as_str()));
            }
        }
    }
}

/// Export the cruise configuration to `{cruise}/{cruiseConfigFn}`. With
/// `finalize` the config is stamped finalized as of its creation time;
/// otherwise an existing finalized-on marker is carried forward.
fn export_cruise_config(ctx: &JobContext, scope: &Scope, finalize: bool) -> Result<()> {
    let config_fn = &scope.warehouse.cruise_config_fn;
    let config_path = scope.cruise_dir.join(config_fn);
    let mut cruise_config = ctx.api.cruise_config()?;

    if finalize {
        let created_on = cruise_config.get("configCreatedOn").cloned().unwrap_or(Value::Null);
        cruise_config["cruiseFinalizedOn"] = created_on;
    } else if config_path.is_file() {
        debug!("reading existing configuration file");
        let existing: Value = serde_json::from_str(
            &std::fs::read_to_string(&config_path)
                .context("Unable to read existing configuration file")?,
        )
        .context("Unable to parse existing configuration file")?;
        cruise_config["cruiseFinalizedOn"] =
            existing.get("cruiseFinalizedOn").cloned().unwrap_or(Value::Null);
    }

    scrub_transfers(&mut cruise_config, "collectionSystemTransfersConfig");
    scrub_transfers(&mut cruise_config, "extraDirectoriesConfig");

    cruise_config["md5SummaryFn"] = Value::String(scope.warehouse.md5_summary_fn.clone());
    cruise_config["md5SummaryMd5Fn"] = Value::String(scope.warehouse.md5_summary_md5_fn.clone());

    if let Some(obj) = cruise_config.as_object_mut() {
        obj.remove("warehouseConfig");
        obj.remove("cruiseDataTransfersConfig");
        obj.remove("shipToShoreTransfersConfig");
    }

    crate::fsutil::write_json_atomic(&config_path, &cruise_config)?;
    crate::fsutil::set_owner_group_permissions(&scope.warehouse.username, &config_path)?;

    update_md5_summary(
        ctx,
        scope,
        &FileReport {
            updated: vec![config_fn.clone()],
            ..FileReport::default()
        },
    )
}

/// Every transferable file under a directory: ASCII names in, the rest
/// reported as excluded.
fn publicdata_filelist(source_dir: &Path) -> (Vec<String>, Vec<String>) {
    let mut include = Vec::new();
    let mut exclude = Vec::new();
    for entry in WalkDir::new(source_dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() || entry.path_is_symlink() {
            continue;
        }
        if is_rsync_partial(&entry.file_name().to_string_lossy()) {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(source_dir) else {
            continue;
        };
        let rel = rel.to_string_lossy().to_string();
        if is_ascii(&rel) {
            include.push(rel);
        } else {
            exclude.push(rel);
        }
    }
    (include, exclude)
}

/// Mirror the PublicData share into `From_PublicData/` under the cruise
/// root, logging transfers and chaining the MD5 update.
fn transfer_publicdata_dir(ctx: &JobContext, scope: &Scope, range: (u64, u64)) -> Result<()> {
    let (start, end) = range;
    let span = end - start;
    let source_dir = Path::new(&scope.warehouse.public_data_dir);

    let from_publicdata_rel = ctx
        .api
        .required_extra_directory_by_name("From_PublicData")?
        .context("no From_PublicData extra directory configured")?
        .dest_dir;
    let dest_dir = scope.cruise_dir.join(&from_publicdata_rel);

    debug!("verify PublicData directory exists");
    if !source_dir.exists() {
        anyhow::bail!("PublicData directory: {} could not be found", source_dir.display());
    }
    debug!("verify From_PublicData directory exists within the cruise data directory");
    if !dest_dir.exists() {
        anyhow::bail!("From_PublicData directory: {} could not be found", dest_dir.display());
    }

    let (include, exclude) = publicdata_filelist(source_dir);
    ctx.send_status(start + span * 10 / 100, 100);

    if !exclude.is_empty() {
        info!("found {} problem filename(s)", exclude.len());
    }
    super::write_transfer_log(
        ctx,
        scope,
        "PublicData_Exclude.log",
        &json!({ "exclude": exclude }),
    )
    .context("Error writing exclude logfile")?;

    let scratch = crate::connection::TransferScratch::new()?;
    let include_file = scratch.include_file();
    crate::fsutil::build_include_file(&include, &include_file)
        .context("Error Saving temporary rsync filelist file")?;
    ctx.send_status(start + span * 20 / 100, 100);

    let flags: Vec<String> = ["-trivm", "--progress", "--protect-args", "--min-size=1"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let cmd = build_rsync_command(
        &flags,
        &[],
        &source_dir.to_string_lossy(),
        Some(&dest_dir.to_string_lossy()),
        Some(&include_file),
    );

    let outcome = executor::run_transfer_command(&cmd, include.len(), ctx.cancel, |pct| {
        ctx.send_status(start + span * 20 / 100 + span * 50 / 100 * u64::from(pct) / 100, 100)
    })?;
    if !outcome.succeeded() {
        anyhow::bail!(
            "PublicData transfer exited with code {}",
            outcome.exit_code.unwrap_or(-1)
        );
    }

    let rebase = |paths: Vec<String>| -> Vec<String> {
        paths
            .into_iter()
            .map(|p| format!("{from_publicdata_rel}/{p}"))
            .collect()
    };
    let mut files = FileReport {
        new: rebase(outcome.new),
        updated: rebase(outcome.updated),
        ..FileReport::default()
    };
    ctx.send_status(start + span * 70 / 100, 100);

    files.deleted = rebase(crate::fsutil::delete_from_dest(&dest_dir, &include));

    crate::fsutil::set_owner_group_permissions(&scope.warehouse.username, &dest_dir)?;
    ctx.send_status(start + span * 80 / 100, 100);

    let log_name = format!("PublicData_{}.log", super::timestamp_utc());
    super::write_transfer_log(
        ctx,
        scope,
        &log_name,
        &json!({ "new": files.new, "updated": files.updated }),
    )
    .context("Error writing transfer logfile")?;

    update_md5_summary(ctx, scope, &files)?;
    ctx.send_status(start + span * 90 / 100, 100);

    Ok(())
}

/// Submit a job and surface its final verdict.
fn submit_and_check(ctx: &JobContext, task: &str, payload: &str) -> Result<(), String> {
    let outcome = ctx
        .broker_client()
        .and_then(|mut client| client.submit(task, payload))
        .map_err(|err| format!("{err:#}"))?;

    let report: JobReport = outcome
        .data
        .as_deref()
        .and_then(|data| serde_json::from_str(data).ok())
        .ok_or_else(|| format!("{task} returned no result"))?;

    match report.final_verdict() {
        Some(part) if part.result == PartResult::Fail => {
            Err(part.reason.clone().unwrap_or_else(|| "undefined".into()))
        }
        _ => Ok(()),
    }
}

fn setup_new_cruise(ctx: &JobContext) -> Result<JobReport> {
    let mut report = JobReport::new();
    let scope = Scope::resolve(ctx)?;

    info!("start of task");
    ctx.send_status(1, 10);

    info!("set ownership/permissions for the CruiseData directory");
    if let Err(reason) = submit_and_check(
        ctx,
        super::cruise_directory::SET_PERMISSIONS_TASK,
        &ctx.job.payload,
    ) {
        report.fail("Set ownership/permissions for CruiseData directory", reason);
        return Ok(report);
    }
    report.pass("Set ownership/permissions for CruiseData directory");

    info!("creating cruise data directory");
    ctx.send_status(2, 10);
    if let Err(reason) = submit_and_check(
        ctx,
        super::cruise_directory::CREATE_TASK,
        &ctx.job.payload,
    ) {
        report.fail("Create cruise data directory structure", reason);
        return Ok(report);
    }
    report.pass("Create cruise data directory structure");

    info!("creating MD5 summary files");
    ctx.send_status(5, 10);
    if let Err(reason) = submit_and_check(ctx, super::md5_summary::REBUILD_TASK, &ctx.job.payload) {
        report.fail("Create MD5 summary files", reason);
        return Ok(report);
    }
    report.pass("Create MD5 summary files");

    info!("exporting cruise configuration");
    ctx.send_status(6, 10);
    if let Err(err) = export_cruise_config(ctx, &scope, false) {
        report.fail("Export cruise config data to file", format!("{err:#}"));
        return Ok(report);
    }
    report.pass("Export cruise config data to file");

    info!("creating data dashboard directory structure and manifest file");
    ctx.send_status(7, 10);
    if let Err(reason) =
        submit_and_check(ctx, super::data_dashboard::REBUILD_TASK, &ctx.job.payload)
    {
        report.fail(
            "Create data dashboard directory structure and manifest file",
            reason,
        );
        return Ok(report);
    }
    report.pass("Create data dashboard directory structure and manifest file");

    if ctx.config.transfer_public_data {
        info!("clear out PublicData directory");
        ctx.send_status(9, 10);
        if let Err(err) =
            crate::fsutil::clear_directory(Path::new(&scope.warehouse.public_data_dir))
        {
            report.fail("Clear out PublicData directory", format!("{err:#}"));
            return Ok(report);
        }
        report.pass("Clear out PublicData directory");
    }

    info!("updating cruise size");
    ctx.send_status(9, 10);
    let size = crate::fsutil::dir_size_bytes(&scope.cruise_dir).unwrap_or_else(|| "0".to_string());
    let _ = ctx.api.set_cruise_size(&size);
    let _ = ctx.api.set_lowering_size("0");

    ctx.send_status(10, 10);
    Ok(report)
}

fn finalize_current_cruise(ctx: &JobContext) -> Result<JobReport> {
    let mut report = JobReport::new();
    let scope = Scope::resolve(ctx)?;

    info!("start of task");
    ctx.send_status(1, 10);

    if !scope.cruise_dir.exists() {
        report.fail(
            "Verify cruise directory exists",
            format!("Cruise directory does not exist: {}", scope.cruise_dir.display()),
        );
        return Ok(report);
    }
    report.pass("Verify cruise directory exists");

    info!("queuing collection system transfers jobs");
    ctx.send_status(2, 10);

    let transfers = ctx.api.active_collection_system_transfers(true, false)?;
    let jobs: Vec<(String, String)> = transfers
        .iter()
        .map(|cst| {
            let payload = json!({
                "cruiseID": scope.cruise_id,
                "systemStatus": "On",
                "collectionSystemTransfer": { "collectionSystemTransferID": cst.id },
            });
            (
                super::collection_system::RUN_TASK.to_string(),
                payload.to_string(),
            )
        })
        .collect();

    info!("submitting {} transfer jobs", jobs.len());
    ctx.send_status(3, 10);
    if !jobs.is_empty() {
        let mut client = ctx.broker_client()?;
        client.submit_many(&jobs)?;
    }
    report.pass("Run Collection System Transfers jobs");

    if ctx.config.transfer_public_data {
        debug!("transferring public data files to cruise data directory");
        ctx.send_status(7, 10);
        if let Err(err) = transfer_publicdata_dir(ctx, &scope, (70, 90)) {
            report.fail("Transfer PublicData files", format!("{err:#}"));
            return Ok(report);
        }
        report.pass("Transfer PublicData files");
    }

    info!("exporting cruise configuration");
    ctx.send_status(9, 10);
    if let Err(err) = export_cruise_config(ctx, &scope, true) {
        report.fail("Export cruise config data to file", format!("{err:#}"));
        return Ok(report);
    }
    report.pass("Export cruise config data to file");

    ctx.send_status(10, 10);
    Ok(report)
}

fn export_config_task(ctx: &JobContext) -> Result<JobReport> {
    let mut report = JobReport::new();
    let scope = Scope::resolve(ctx)?;

    info!("exporting cruise configuration");
    ctx.send_status(1, 10);

    if let Err(err) = export_cruise_config(ctx, &scope, false) {
        report.fail("Export cruise config data to file", format!("{err:#}"));
        return Ok(report);
    }
    report.pass("Export cruise config data to file");

    ctx.send_status(10, 10);
    Ok(report)
}

fn sync_publicdata_task(ctx: &JobContext) -> Result<JobReport> {
    let mut report = JobReport::new();
    let scope = Scope::resolve(ctx)?;

    info!("transferring files from PublicData to the cruise data directory");
    ctx.send_status(1, 10);

    if let Err(err) = transfer_publicdata_dir(ctx, &scope, (10, 90)) {
        report.fail("Transfer files", format!("{err:#}"));
        return Ok(report);
    }
    report.pass("Transfer files");

    ctx.send_status(10, 10);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn scrub_keeps_descriptive_fields_only() {
        let mut config = json!({
            "collectionSystemTransfersConfig": [
                {"name": "SCS", "longName": "Ship Computer System", "destDir": "SCS",
                 "sshPass": "hunter2", "status": "2"}
            ]
        });
        scrub_transfers(&mut config, "collectionSystemTransfersConfig");
        let transfer = &config["collectionSystemTransfersConfig"][0];
        assert_eq!(transfer["name"], "SCS");
        assert_eq!(transfer["destDir"], "SCS");
        assert!(transfer.get("sshPass").is_none());
        assert!(transfer.get("status").is_none());
    }

    #[test]
    fn publicdata_filelist_separates_non_ascii() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("report.pdf"), b"x").unwrap();
        fs::write(tmp.path().join("caf\u{e9}.pdf"), b"x").unwrap();

        let (include, exclude) = publicdata_filelist(tmp.path());
        assert_eq!(include, vec!["report.pdf"]);
        assert_eq!(exclude.len(), 1);
    }
}
