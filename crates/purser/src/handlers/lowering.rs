//! Lowering lifecycle: create, finalize (with synchronous pre-finalize
//! hooks), and export the lowering config.

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::types::{FileReport, JobReport, ScopeJobPayload};
use crate::worker::{JobContext, OwnerSpec, TaskRegistration};

use super::Scope;

pub const CREATE_TASK: &str = "setupNewLowering";
pub const FINALIZE_TASK: &str = "finalizeCurrentLowering";
pub const EXPORT_CONFIG_TASK: &str = "exportLoweringConfig";

pub fn registrations() -> Vec<TaskRegistration> {
    vec![
        TaskRegistration::new(CREATE_TASK, OwnerSpec::Task(&[]), setup_new_lowering)
            .with_hook_payload(lowering_hook_payload),
        TaskRegistration::new(FINALIZE_TASK, OwnerSpec::Task(&[]), finalize_current_lowering)
            .with_hook_payload(lowering_hook_payload),
        TaskRegistration::new(EXPORT_CONFIG_TASK, OwnerSpec::Task(&[]), export_config_task),
    ]
}

fn lowering_hook_payload(ctx: &JobContext, _report: &JobReport) -> Option<Value> {
    let payload: ScopeJobPayload = ctx.payload().unwrap_or_default();
    let cruise_id = payload
        .cruise_id
        .or_else(|| ctx.api.cruise_id().ok().flatten());
    let lowering_id = payload
        .lowering_id
        .or_else(|| ctx.api.lowering_id().ok().flatten());
    let lowering_start_date = payload
        .lowering_start_date
        .or_else(|| ctx.api.lowering_start_date().ok().flatten());
    Some(json!({
        "cruiseID": cruise_id,
        "loweringID": lowering_id,
        "loweringStartDate": lowering_start_date,
    }))
}

/// Scope with a mandatory lowering id.
fn lowering_scope(ctx: &JobContext) -> Result<(Scope, String), JobReport> {
    let scope = match Scope::resolve(ctx) {
        Ok(scope) => scope,
        Err(err) => return Err(JobReport::failed("Retrieve job data", format!("{err:#}"))),
    };
    match scope.lowering_id.clone() {
        Some(lowering_id) => Ok((scope, lowering_id)),
        None => Err(JobReport::failed("Verify lowering ID", "Lowering ID is undefined")),
    }
}

/// Export the lowering configuration to
/// `{cruise}/{loweringBase}/{loweringID}/{loweringConfigFn}`.
fn export_lowering_config(ctx: &JobContext, scope: &Scope, finalize: bool) -> Result<()> {
    let lowering_id = scope
        .lowering_id
        .as_ref()
        .context("Lowering ID is undefined")?;
    let config_fn = &scope.warehouse.lowering_config_fn;
    let rel_path = format!(
        "{}/{lowering_id}/{config_fn}",
        scope.warehouse.lowering_data_base_dir
    );
    let config_path = scope.cruise_dir.join(&rel_path);

    let mut lowering_config = ctx.api.lowering_config()?;

    if finalize {
        let created_on = lowering_config
            .get("configCreatedOn")
            .cloned()
            .unwrap_or(Value::Null);
        lowering_config["loweringFinalizedOn"] = created_on;
    } else if config_path.is_file() {
        debug!("reading existing configuration file");
        let existing: Value = serde_json::from_str(
            &std::fs::read_to_string(&config_path)
                .with_context(|| format!("Unable to read configuration file: {config_fn}"))?,
        )
        .with_context(|| format!("Unable to parse configuration file: {config_fn}"))?;
        lowering_config["loweringFinalizedOn"] = existing
            .get("loweringFinalizedOn")
            .cloned()
            .unwrap_or(Value::Null);
    }

    if let Some(list) = lowering_config
        .get_mut("collectionSystemTransfersConfig")
        .and_then(Value::as_array_mut)
    {
        let allowed = ["name", "longName", "destDir"];
        for transfer in list {
            if let Some(obj) = transfer.as_object_mut() {
                obj.retain(|k, _| allowed.contains(&k.as_str()));
            }
        }
    }

    crate::fsutil::write_json_atomic(&config_path, &lowering_config)?;
    crate::fsutil::set_owner_group_permissions(&scope.warehouse.username, &config_path)?;

    let payload = json!({
        "cruiseID": scope.cruise_id,
        "files": FileReport {
            updated: vec![rel_path],
            ..FileReport::default()
        }
    });
    let mut client = ctx.broker_client()?;
    client.submit(super::md5_summary::UPDATE_TASK, &payload.to_string())?;
    Ok(())
}

fn setup_new_lowering(ctx: &JobContext) -> Result<JobReport> {
    let mut report = JobReport::new();
    let (scope, lowering_id) = match lowering_scope(ctx) {
        Ok(ok) => ok,
        Err(report) => return Ok(report),
    };

    info!("start of task");
    ctx.send_status(1, 10);

    info!("creating lowering data directory");
    ctx.send_status(2, 10);
    let outcome = ctx
        .broker_client()?
        .submit(super::lowering_directory::CREATE_TASK, &ctx.job.payload)?;
    let sub_report: Option<JobReport> = outcome
        .data
        .as_deref()
        .and_then(|data| serde_json::from_str(data).ok());
    let failed = sub_report
        .as_ref()
        .and_then(|r| r.final_verdict())
        .map(|p| p.result == crate::types::PartResult::Fail)
        .unwrap_or(true);
    if failed {
        let reason = sub_report
            .as_ref()
            .and_then(|r| r.final_verdict())
            .and_then(|p| p.reason.clone())
            .unwrap_or_else(|| "undefined".into());
        warn!("failed to create lowering data directory");
        report.fail("Create lowering data directory structure", reason);
        return Ok(report);
    }
    report.pass("Create lowering data directory structure");

    info!("exporting lowering configuration");
    ctx.send_status(5, 10);
    if let Err(err) = export_lowering_config(ctx, &scope, false) {
        report.fail("Export lowering config data to file", format!("{err:#}"));
        return Ok(report);
    }
    report.pass("Export lowering config data to file");

    info!("updating lowering size");
    ctx.send_status(9, 10);
    let lowering_dir = scope.warehouse.lowering_dir(&scope.cruise_id, &lowering_id);
    let size = crate::fsutil::dir_size_bytes(&lowering_dir).unwrap_or_else(|| "0".to_string());
    let _ = ctx.api.set_lowering_size(&size);

    ctx.send_status(10, 10);
    Ok(report)
}

/// Pre-finalize hooks run synchronously before the finalize body.
fn run_pre_finalize_hooks(ctx: &JobContext, scope: &Scope) -> Result<()> {
    let hook_tasks = ctx.config.tasks_for_hook("preFinalizeCurrentLowering");
    if hook_tasks.is_empty() {
        info!("no pre-finalize tasks found, skipping");
        return Ok(());
    }

    let payload = json!({
        "cruiseID": scope.cruise_id,
        "loweringID": scope.lowering_id,
        "loweringStartDate": ctx.api.lowering_start_date().ok().flatten(),
        "loweringEndDate": ctx.api.lowering_end_date().ok().flatten(),
    })
    .to_string();

    let jobs: Vec<(String, String)> = hook_tasks
        .iter()
        .map(|task| {
            info!("adding pre-finalize task: {task}");
            (task.clone(), payload.clone())
        })
        .collect();

    let mut client = ctx.broker_client()?;
    for outcome in client.submit_many(&jobs)? {
        if outcome.failed {
            warn!("pre-finalize task {} failed", outcome.handle);
        } else {
            info!("pre-finalize task {} completed successfully", outcome.handle);
        }
    }
    Ok(())
}

fn finalize_current_lowering(ctx: &JobContext) -> Result<JobReport> {
    let mut report = JobReport::new();
    let (scope, lowering_id) = match lowering_scope(ctx) {
        Ok(ok) => ok,
        Err(report) => return Ok(report),
    };

    if let Err(err) = run_pre_finalize_hooks(ctx, &scope) {
        warn!("error while running pre-finalize jobs: {err:#}");
    }

    info!("start of task");
    ctx.send_status(1, 10);

    let lowering_dir = scope.warehouse.lowering_dir(&scope.cruise_id, &lowering_id);
    if !lowering_dir.exists() {
        report.fail(
            "Verify lowering directory exists",
            format!("Lowering directory does not exist: {}", lowering_dir.display()),
        );
        return Ok(report);
    }
    report.pass("Verify lowering directory exists");

    info!("queuing collection system transfers jobs");
    ctx.send_status(2, 10);

    let transfers = ctx.api.active_collection_system_transfers(false, true)?;
    let jobs: Vec<(String, String)> = transfers
        .iter()
        .map(|cst| {
            let payload = json!({
                "loweringID": lowering_id,
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
    report.pass("Run collection system transfers jobs");

    info!("exporting lowering configuration");
    ctx.send_status(9, 10);
    if let Err(err) = export_lowering_config(ctx, &scope, true) {
        report.fail("Export lowering config data to file", format!("{err:#}"));
        return Ok(report);
    }
    report.pass("Export lowering config data to file");

    ctx.send_status(10, 10);
    Ok(report)
}

fn export_config_task(ctx: &JobContext) -> Result<JobReport> {
    let mut report = JobReport::new();
    let (scope, _) = match lowering_scope(ctx) {
        Ok(ok) => ok,
        Err(report) => return Ok(report),
    };

    info!("start of task");
    ctx.send_status(1, 10);

    if let Err(err) = export_lowering_config(ctx, &scope, false) {
        report.fail("Export lowering config data to file", format!("{err:#}"));
        return Ok(report);
    }
    report.pass("Export lowering config data to file");

    ctx.send_status(10, 10);
    Ok(report)
}
