//! MD5 summary maintenance: incremental merge after each transfer and the
//! full cruise-tree rebuild.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::lock::IndexLock;
use crate::md5::{self, Md5Summary};
use crate::types::{FilesJobPayload, JobReport};
use crate::worker::{JobContext, OwnerSpec, TaskRegistration};

use super::Scope;

pub const UPDATE_TASK: &str = "updateMD5Summary";
pub const REBUILD_TASK: &str = "rebuildMD5Summary";

const SYNTHETIC: &[(&str, &str)] = &[(UPDATE_TASK, "Updating MD5 Summary")];

const LOCK_WAIT: Duration = Duration::from_secs(60);

pub fn registrations() -> Vec<TaskRegistration> {
    vec![
        TaskRegistration::new(UPDATE_TASK, OwnerSpec::Task(SYNTHETIC), update_summary),
        TaskRegistration::new(REBUILD_TASK, OwnerSpec::Task(SYNTHETIC), rebuild_summary),
    ]
}

struct SummaryPaths {
    summary: PathBuf,
    summary_md5: PathBuf,
}

fn summary_paths(scope: &Scope) -> SummaryPaths {
    SummaryPaths {
        summary: scope.cruise_dir.join(&scope.warehouse.md5_summary_fn),
        summary_md5: scope.cruise_dir.join(&scope.warehouse.md5_summary_md5_fn),
    }
}

/// Effective byte limit above which files are fingerprinted as asterisks.
fn filesize_limit(ctx: &JobContext) -> Result<Option<u64>> {
    if !ctx.api.md5_filesize_limit_enabled()? {
        return Ok(None);
    }
    let limit_mb: u64 = ctx.api.md5_filesize_limit()?.parse().unwrap_or(0);
    Ok((limit_mb != 0).then_some(limit_mb * 1_000_000))
}

/// Write the sorted summary and its MD5 companion, handing both to the
/// warehouse user. Emits one part per step.
fn write_summary_files(
    summary: &mut Md5Summary,
    paths: &SummaryPaths,
    username: &str,
    report: &mut JobReport,
) -> bool {
    if let Err(err) = summary.write(&paths.summary) {
        report.fail("Writing MD5 Summary file", format!("{err:#}"));
        return false;
    }
    report.pass("Writing MD5 Summary file");

    if let Err(err) = crate::fsutil::set_owner_group_permissions(username, &paths.summary) {
        report.fail("Set MD5 Summary file ownership/permissions", format!("{err:#}"));
        return false;
    }
    report.pass("Set MD5 Summary file ownership/permissions");

    if let Err(err) = md5::write_summary_md5(&paths.summary, &paths.summary_md5) {
        report.fail("Writing MD5 Summary MD5 file", format!("{err:#}"));
        return false;
    }
    report.pass("Writing MD5 Summary MD5 file");

    if let Err(err) = crate::fsutil::set_owner_group_permissions(username, &paths.summary_md5) {
        report.fail(
            "Set MD5 Summary MD5 file ownership/permissions",
            format!("{err:#}"),
        );
        return false;
    }
    report.pass("Set MD5 Summary MD5 file ownership/permissions");
    true
}

fn update_summary(ctx: &JobContext) -> Result<JobReport> {
    let mut report = JobReport::new();
    let payload: FilesJobPayload = ctx.payload()?;
    let scope = Scope::resolve(ctx)?;
    let paths = summary_paths(&scope);

    debug!("building filelist");
    ctx.send_status(1, 10);

    let files = payload.files;
    if files.new.is_empty() && files.updated.is_empty() && files.deleted.is_empty() {
        return Ok(JobReport::ignored("Update MD5 Summary", "Nothing to update"));
    }

    let mut filelist = files.new.clone();
    filelist.extend(files.updated.iter().cloned());

    debug!("building hashes");
    ctx.send_status(2, 10);

    let limit = filesize_limit(ctx)?;
    let hashes = md5::build_hashes(&scope.cruise_dir, &filelist, limit, ctx.cancel, |done, total| {
        if total > 0 {
            ctx.send_status((60 * done / total) as u64 + 20, 100);
        }
    });
    report.pass("Calculate Hashes");

    debug!("processing existing MD5 summary file");
    ctx.send_status(8, 10);

    let _lock = IndexLock::acquire(&scope.cruise_dir, LOCK_WAIT)?;

    let mut summary = match Md5Summary::load(&paths.summary) {
        Ok(summary) => summary,
        Err(err) => {
            report.fail("Reading pre-existing MD5 Summary file", format!("{err:#}"));
            return Ok(report);
        }
    };
    report.pass("Reading pre-existing MD5 Summary file");

    let (updated, added) = summary.merge(hashes);
    let deleted = summary.remove(&files.deleted);
    for (label, count) in [("added", added), ("updated", updated), ("deleted", deleted)] {
        if count > 0 {
            debug!("{count} row(s) {label}");
        }
    }

    debug!("building MD5 summary file");
    ctx.send_status(9, 10);
    if !write_summary_files(&mut summary, &paths, &scope.warehouse.username, &mut report) {
        return Ok(report);
    }

    ctx.send_status(10, 10);
    Ok(report)
}

/// Relative paths of every file under the cruise root, minus the summary
/// files themselves and the transfer logs.
fn rebuild_filelist(ctx: &JobContext, scope: &Scope) -> Result<Vec<String>> {
    let exclude_names = [
        scope.warehouse.md5_summary_fn.as_str(),
        scope.warehouse.md5_summary_md5_fn.as_str(),
    ];
    let log_prefix = ctx
        .api
        .required_extra_directory_by_name("Transfer_Logs")?
        .map(|d| format!("{}/", d.dest_dir))
        .unwrap_or_default();

    let mut filelist = Vec::new();
    for entry in WalkDir::new(&scope.cruise_dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() || entry.path_is_symlink() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(&scope.cruise_dir) else {
            continue;
        };
        let rel = rel.to_string_lossy().to_string();
        if exclude_names.contains(&rel.as_str()) {
            continue;
        }
        if !log_prefix.is_empty() && rel.starts_with(&log_prefix) {
            continue;
        }
        filelist.push(rel);
    }
    Ok(filelist)
}

fn rebuild_summary(ctx: &JobContext) -> Result<JobReport> {
    let mut report = JobReport::new();
    let scope = Scope::resolve(ctx)?;
    let paths = summary_paths(&scope);

    info!("rebuild MD5 summary");
    ctx.send_status(1, 10);

    if !Path::new(&scope.cruise_dir).exists() {
        report.fail(
            "Verify Cruise Directory exists",
            format!("Unable to locate the cruise directory: {}", scope.cruise_dir.display()),
        );
        return Ok(report);
    }
    report.pass("Verify Cruise Directory exists");

    info!("building filelist");
    let filelist = rebuild_filelist(ctx, &scope)?;
    report.pass("Retrieve Filelist");

    ctx.send_status(2, 10);

    info!("building hashes");
    let limit = filesize_limit(ctx)?;
    let hashes = md5::build_hashes(&scope.cruise_dir, &filelist, limit, ctx.cancel, |done, total| {
        if total > 0 {
            ctx.send_status((60 * done / total) as u64 + 20, 100);
        }
    });

    if ctx.cancelled() {
        report.fail("Calculate Hashes", "Job was stopped by user");
        return Ok(report);
    }
    report.pass("Calculate Hashes");

    info!("building MD5 summary file");
    ctx.send_status(80, 100);

    let _lock = IndexLock::acquire(&scope.cruise_dir, LOCK_WAIT)?;
    let mut summary = Md5Summary::new();
    summary.merge(hashes);
    if !write_summary_files(&mut summary, &paths, &scope.warehouse.username, &mut report) {
        return Ok(report);
    }

    ctx.send_status(10, 10);
    Ok(report)
}
