//! Data-dashboard maintenance: run each collection system's parser plugin
//! over new raw files and keep the manifest consistent with the outputs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::dashboard::{Manifest, ManifestEntry, Plugin};
use crate::filters;
use crate::lock::IndexLock;
use crate::types::{CollectionSystemTransfer, FileReport, FilesJobPayload, JobReport};
use crate::worker::{JobContext, OwnerSpec, TaskRegistration};

use super::Scope;

pub const UPDATE_TASK: &str = "updateDataDashboard";
pub const REBUILD_TASK: &str = "rebuildDataDashboard";

const SYNTHETIC: &[(&str, &str)] = &[(UPDATE_TASK, "Updating Data Dashboard")];

const LOCK_WAIT: Duration = Duration::from_secs(60);

pub fn registrations() -> Vec<TaskRegistration> {
    vec![
        TaskRegistration::new(UPDATE_TASK, OwnerSpec::Task(SYNTHETIC), update_dashboard)
            .with_hook_payload(hook_payload),
        TaskRegistration::new(REBUILD_TASK, OwnerSpec::Task(SYNTHETIC), rebuild_dashboard)
            .with_hook_payload(hook_payload),
    ]
}

fn hook_payload(ctx: &JobContext, report: &JobReport) -> Option<Value> {
    let payload: FilesJobPayload = ctx.payload().unwrap_or_default();
    let scope = Scope::resolve(ctx).ok()?;
    let files = report.files.clone().unwrap_or_default();

    let mut value = json!({
        "cruiseID": scope.cruise_id,
        "loweringID": scope.lowering_id,
        "files": files,
    });
    if let Some(cst_id) = payload.collection_system_transfer_id {
        value["collectionSystemTransferID"] = Value::String(cst_id);
    }
    Some(value)
}

struct DashboardPaths {
    dashboard_dir: PathBuf,
    manifest_path: PathBuf,
    /// `Dashboard_Data`-style destination, relative to the cruise root.
    dashboard_rel: String,
}

fn dashboard_paths(ctx: &JobContext, scope: &Scope) -> Result<DashboardPaths> {
    let extra_dir = ctx
        .api
        .required_extra_directory_by_name("Dashboard_Data")?
        .context("no Dashboard_Data extra directory configured")?;
    let dashboard_dir = scope.cruise_dir.join(&extra_dir.dest_dir);
    let manifest_path = dashboard_dir.join(&scope.warehouse.data_dashboard_manifest_fn);
    Ok(DashboardPaths {
        dashboard_dir,
        manifest_path,
        dashboard_rel: extra_dir.dest_dir,
    })
}

/// Outcome of one plugin pass over a file list.
#[derive(Default)]
struct ProcessedFiles {
    added: Vec<ManifestEntry>,
    removed: Vec<ManifestEntry>,
}

/// Feed each raw file through the plugin twice: a `--dataType` probe, then
/// the parse run. Per-file problems are skips, not job failures.
fn process_filelist(
    ctx: &JobContext,
    scope: &Scope,
    paths: &DashboardPaths,
    plugin: &Plugin,
    filelist: &[String],
    report: &mut JobReport,
    progress: (u64, u64),
) -> Result<ProcessedFiles> {
    let base_dir = Path::new(&scope.warehouse.base_dir);
    let mut processed = ProcessedFiles::default();
    let (start, end) = progress;
    let span = end.saturating_sub(start);

    for (index, filename) in filelist.iter().enumerate() {
        if ctx.cancelled() {
            break;
        }

        info!("processing file: {filename}");
        let raw_path = scope.cruise_dir.join(filename);
        let json_rel = Path::new(filename).with_extension("json");
        let json_path = paths.dashboard_dir.join(&json_rel);

        let manifest_entry = |data_type: Option<String>| ManifestEntry {
            data_type,
            dd_json: json_path
                .strip_prefix(base_dir)
                .unwrap_or(&json_path)
                .to_string_lossy()
                .to_string(),
            raw_data: raw_path
                .strip_prefix(base_dir)
                .unwrap_or(&raw_path)
                .to_string_lossy()
                .to_string(),
        };

        if !raw_path.is_file() {
            report.fail(
                "Verify data file exists",
                format!("Unable to find data file: {filename}"),
            );
            continue;
        }
        if raw_path.metadata().map(|m| m.len() == 0).unwrap_or(true) {
            warn!("file is empty {filename}, skipping");
            continue;
        }

        let probe = plugin.data_type(&raw_path)?;
        if probe.stdout.is_empty() {
            warn!("file is of unknown datatype: {}", raw_path.display());
            processed.removed.push(manifest_entry(None));
            if !probe.stderr.is_empty() {
                warn!("err: {}", probe.stderr);
            }
            continue;
        }
        let data_type = probe.stdout;
        debug!("datatype found to be: {data_type}");

        let parsed = plugin.process(&raw_path)?;
        if parsed.stdout.is_empty() {
            let msg = format!(
                "No JSON output received from file. Parsing Command: {}",
                parsed.command
            );
            warn!("{msg}");
            let _ = ctx.api.send_msg("Data Dashboard Processing failed", &msg);
            processed.removed.push(manifest_entry(None));
            if !parsed.stderr.is_empty() {
                warn!("err: {}", parsed.stderr);
            }
            continue;
        }

        let output: Value = match serde_json::from_str(&parsed.stdout) {
            Ok(output) => output,
            Err(err) => {
                warn!("error parsing JSON output from file {filename}: {err}");
                report.fail(
                    &format!("Parsing JSON output from file {filename}"),
                    format!("Error parsing JSON output from file: {filename}"),
                );
                continue;
            }
        };

        if output.is_null() || output.as_object().map(|o| o.is_empty()).unwrap_or(false) {
            let msg = format!("Parser returned no output. Parsing command: {}", parsed.command);
            warn!("datafile parsing error: {msg}");
            let _ = ctx.api.send_msg("Datafile Parsing error", &msg);
            continue;
        }
        if let Some(error) = output.get("error") {
            warn!("datafile parsing error: {error}");
            let _ = ctx
                .api
                .send_msg("Datafile Parsing error", &error.to_string());
            continue;
        }

        if let Err(err) = crate::fsutil::write_json_atomic(&json_path, &output) {
            let msg = format!("Error Writing DashboardData file: {filename}. Reason: {err:#}");
            warn!("data dashboard processing failed: {msg}");
            let _ = ctx.api.send_msg("Data Dashboard Processing failed", &msg);
            report.fail(
                &format!("Writing Dashboard file: {filename}"),
                format!("{err:#}"),
            );
            continue;
        }
        report.pass(&format!("Writing DashboardData file: {filename}"));

        processed.added.push(manifest_entry(Some(data_type)));

        if !filelist.is_empty() {
            ctx.send_status(start + span * index as u64 / filelist.len() as u64, 100);
        }
    }

    Ok(processed)
}

fn update_dashboard(ctx: &JobContext) -> Result<JobReport> {
    let mut report = JobReport::new();
    let payload: FilesJobPayload = ctx.payload()?;
    let scope = Scope::resolve(ctx)?;
    let paths = dashboard_paths(ctx, &scope)?;

    let cst_id = payload
        .collection_system_transfer_id
        .clone()
        .unwrap_or_default();
    let Some(cst) = ctx.api.collection_system_transfer(&cst_id)? else {
        report.fail(
            "Retrieve Collection System Transfer Data",
            "Could not find configuration data for collection system transfer",
        );
        return Ok(report);
    };
    info!("collection system transfer: {}", cst.name);

    info!("verifying plugin file exists");
    ctx.send_status(5, 100);
    let Some(plugin) = Plugin::locate(
        &ctx.config.plugin_dir,
        &cst.name,
        &ctx.config.plugin_suffix,
    ) else {
        let reason = format!("Processing script not found for {}", cst.name);
        warn!("{reason}");
        report.fail("Dashboard Processing File Located", reason);
        return Ok(report);
    };
    report.pass("Dashboard Processing File Located");

    info!("build filelist for processing");
    ctx.send_status(10, 100);
    let mut filelist = payload.files.new.clone();
    filelist.extend(payload.files.updated.iter().cloned());
    if filelist.is_empty() {
        return Ok(JobReport::ignored(
            "Retrieve Filelist",
            "No new or updated files to process",
        ));
    }
    report.pass("Retrieve Filelist");

    info!("processing files");
    ctx.send_status(15, 100);
    let processed = process_filelist(ctx, &scope, &paths, &plugin, &filelist, &mut report, (15, 90))?;

    info!("updating manifest file: {}", paths.manifest_path.display());
    ctx.send_status(9, 10);

    if processed.added.is_empty() && processed.removed.is_empty() {
        report.ignore("Retrieve Filelist", "No new, updated or obsolete entries to process");
        return Ok(report);
    }

    let _lock = IndexLock::acquire(&scope.cruise_dir, LOCK_WAIT)?;

    let mut manifest = match Manifest::load(&paths.manifest_path) {
        Ok(manifest) => manifest,
        Err(err) => {
            report.fail(
                "Reading pre-existing Dashboard manifest file",
                format!("{err:#}"),
            );
            return Ok(report);
        }
    };
    report.pass("Reading pre-existing Dashboard manifest file");

    let base_dir = Path::new(&scope.warehouse.base_dir);
    let removed = manifest.remove(&processed.removed, base_dir);

    let mut files = FileReport::default();
    let cruise_prefix = format!("{}/", scope.cruise_id);
    for entry in processed.added {
        let dd_json_rel = entry
            .dd_json
            .strip_prefix(&cruise_prefix)
            .unwrap_or(&entry.dd_json)
            .to_string();
        if manifest.upsert(entry) {
            files.new.push(dd_json_rel);
        } else {
            files.updated.push(dd_json_rel);
        }
    }

    if !files.new.is_empty() {
        info!("{} row(s) added", files.new.len());
    }
    if !files.updated.is_empty() {
        info!("{} row(s) updated", files.updated.len());
    }
    if removed > 0 {
        info!("{removed} row(s) removed");
    }

    if let Err(err) = manifest.write(&paths.manifest_path) {
        warn!("error writing manifest file: {}", paths.manifest_path.display());
        report.fail("Writing Dashboard manifest file", format!("{err:#}"));
        return Ok(report);
    }
    report.pass("Writing Dashboard manifest file");

    files.updated.push(format!(
        "{}/{}",
        paths.dashboard_rel, scope.warehouse.data_dashboard_manifest_fn
    ));

    info!("setting file ownership/permissions");
    ctx.send_status(9, 10);
    if let Err(err) =
        crate::fsutil::set_owner_group_permissions(&scope.warehouse.username, &paths.dashboard_dir)
    {
        report.fail("Set file/directory ownership", format!("{err:#}"));
        return Ok(report);
    }
    report.pass("Set file/directory ownership");

    ctx.send_status(10, 10);
    report.files = Some(files);
    Ok(report)
}

/// Relative file paths under `dir`.
fn walk_relative(dir: &Path) -> Vec<String> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            e.path()
                .strip_prefix(dir)
                .ok()
                .map(|p| p.to_string_lossy().to_string())
        })
        .collect()
}

/// Input files for one collection system during a rebuild, relative to the
/// cruise root.
fn rebuild_inputs(
    ctx: &JobContext,
    scope: &Scope,
    cst: &CollectionSystemTransfer,
) -> Result<Vec<String>> {
    let token_ctx = scope.token_ctx();
    let dest_dir = filters::keyword_replace(&cst.dest_dir, &token_ctx);

    if !cst.lowering_scoped() {
        if filters::has_unresolved_lowering(&dest_dir) {
            return Ok(Vec::new());
        }
        let input_dir = scope.cruise_dir.join(&dest_dir);
        Ok(walk_relative(&input_dir)
            .into_iter()
            .map(|f| format!("{dest_dir}/{f}"))
            .collect())
    } else {
        let lowering_base = &scope.warehouse.lowering_data_base_dir;
        let mut filelist = Vec::new();
        for lowering in ctx.api.lowerings()? {
            let per_lowering_dest = cst.dest_dir.replace("{loweringID}", &lowering);
            let per_lowering_dest =
                filters::keyword_replace(&per_lowering_dest, &token_ctx);
            let input_dir = scope
                .cruise_dir
                .join(lowering_base)
                .join(&lowering)
                .join(&per_lowering_dest);
            filelist.extend(
                walk_relative(&input_dir)
                    .into_iter()
                    .map(|f| format!("{lowering_base}/{lowering}/{per_lowering_dest}/{f}")),
            );
        }
        Ok(filelist)
    }
}

fn rebuild_dashboard(ctx: &JobContext) -> Result<JobReport> {
    let mut report = JobReport::new();
    let scope = Scope::resolve(ctx)?;
    let paths = dashboard_paths(ctx, &scope)?;

    info!("rebuilding data dashboard");
    ctx.send_status(1, 100);

    if !paths.dashboard_dir.exists() {
        report.fail(
            "Verify Data Dashboard Directory exists",
            format!(
                "Unable to locate the data dashboard directory: {}",
                paths.dashboard_dir.display()
            ),
        );
        return Ok(report);
    }
    report.pass("Verify Data Dashboard Directory exists");

    let transfers = ctx.api.active_collection_system_transfers(true, true)?;
    let transfer_count = transfers.len() as u64;
    let mut all_entries: Vec<ManifestEntry> = Vec::new();

    for (index, cst) in transfers.iter().enumerate() {
        if ctx.cancelled() {
            break;
        }
        info!("processing data from: {}", cst.name);
        let start = 10 + 80 * index as u64 / transfer_count.max(1);
        let end = 10 + 80 * (index as u64 + 1) / transfer_count.max(1);
        ctx.send_status(start, 100);

        let Some(plugin) = Plugin::locate(
            &ctx.config.plugin_dir,
            &cst.name,
            &ctx.config.plugin_suffix,
        ) else {
            warn!("processing script not found for {}", cst.name);
            continue;
        };

        let filelist = rebuild_inputs(ctx, &scope, cst)?;
        debug!("filelist: {filelist:?}");

        let processed =
            process_filelist(ctx, &scope, &paths, &plugin, &filelist, &mut report, (start, end))?;
        all_entries.extend(processed.added);
    }

    info!("updating manifest file: {}", paths.manifest_path.display());
    ctx.send_status(9, 10);

    let _lock = IndexLock::acquire(&scope.cruise_dir, LOCK_WAIT)?;
    let mut manifest = Manifest::new();
    for entry in all_entries {
        manifest.upsert(entry);
    }
    if let Err(err) = manifest.write(&paths.manifest_path) {
        warn!("error updating manifest file {}", paths.manifest_path.display());
        report.fail("Updating manifest file", format!("{err:#}"));
        return Ok(report);
    }
    report.pass("Updating manifest file");

    info!("setting file ownership/permissions");
    ctx.send_status(95, 100);
    if let Err(err) =
        crate::fsutil::set_owner_group_permissions(&scope.warehouse.username, &paths.dashboard_dir)
    {
        report.fail("Setting file/directory ownership", format!("{err:#}"));
        return Ok(report);
    }
    report.pass("Setting file/directory ownership");

    ctx.send_status(99, 100);
    let files = FileReport {
        updated: walk_relative(&paths.dashboard_dir)
            .into_iter()
            .map(|f| format!("{}/{f}", paths.dashboard_rel))
            .collect(),
        ..FileReport::default()
    };

    ctx.send_status(10, 10);
    report.files = Some(files);
    Ok(report)
}
