//! Lowering directory tree: create and rebuild the per-dive directory
//! structure under the cruise's lowering base.

use std::path::PathBuf;

use anyhow::Result;
use tracing::{debug, info};

use crate::filters;
use crate::types::JobReport;
use crate::worker::{JobContext, OwnerSpec, TaskRegistration};

use super::Scope;

pub const CREATE_TASK: &str = "createLoweringDirectory";
pub const REBUILD_TASK: &str = "rebuildLoweringDirectory";
pub const SET_PERMISSIONS_TASK: &str = "setLoweringDataDirectoryPermissions";

const SYNTHETIC: &[(&str, &str)] = &[
    (CREATE_TASK, "Creating lowering directory"),
    (SET_PERMISSIONS_TASK, "Setting lowering data directory permissions"),
];

pub fn registrations() -> Vec<TaskRegistration> {
    vec![
        TaskRegistration::new(CREATE_TASK, OwnerSpec::Task(SYNTHETIC), create_directory),
        TaskRegistration::new(REBUILD_TASK, OwnerSpec::Task(SYNTHETIC), rebuild_directory),
        TaskRegistration::new(SET_PERMISSIONS_TASK, OwnerSpec::Task(SYNTHETIC), set_permissions),
    ]
}

struct LoweringDirs {
    base: PathBuf,
    full: PathBuf,
}

fn lowering_dirs(scope: &Scope, lowering_id: &str) -> LoweringDirs {
    let base = scope.cruise_dir.join(&scope.warehouse.lowering_data_base_dir);
    LoweringDirs {
        full: base.join(lowering_id),
        base,
    }
}

fn require_lowering(ctx: &JobContext) -> Result<(Scope, String), JobReport> {
    let scope = match Scope::resolve(ctx) {
        Ok(scope) => scope,
        Err(err) => return Err(JobReport::failed("Retrieve job data", format!("{err:#}"))),
    };
    match scope.lowering_id.clone() {
        Some(lowering_id) => Ok((scope, lowering_id)),
        None => Err(JobReport::failed("Verify lowering ID", "Lowering ID is undefined")),
    }
}

/// Destination directories of active lowering-scoped transfers and extra
/// directories, rooted under the lowering directory.
fn build_directorylist(ctx: &JobContext, scope: &Scope, dirs: &LoweringDirs) -> Result<Vec<PathBuf>> {
    let token_ctx = scope.token_ctx();
    let mut directories = vec![dirs.full.clone()];

    let expand = |dest_dir: &str| -> Option<PathBuf> {
        let expanded = filters::keyword_replace(dest_dir, &token_ctx);
        if filters::has_unresolved_lowering(&expanded) {
            return None;
        }
        Some(dirs.full.join(expanded.trim_start_matches('/')))
    };

    let transfers = ctx.api.active_collection_system_transfers(false, true)?;
    directories.extend(transfers.iter().filter_map(|t| expand(&t.dest_dir)));

    let extra_dirs = ctx.api.active_extra_directories(false, true)?;
    directories.extend(extra_dirs.iter().filter_map(|d| expand(&d.dest_dir)));

    directories.sort();
    directories.dedup();
    Ok(directories)
}

fn create_directory(ctx: &JobContext) -> Result<JobReport> {
    let mut report = JobReport::new();
    let (scope, lowering_id) = match require_lowering(ctx) {
        Ok(ok) => ok,
        Err(report) => return Ok(report),
    };
    let dirs = lowering_dirs(&scope, &lowering_id);

    info!("creating lowering directory");
    ctx.send_status(1, 10);

    debug!("pre-task checks");
    if !scope.cruise_dir.exists() {
        report.fail(
            "Verify cruise directory exists",
            format!("Cruise directory {} does not exists", scope.cruise_dir.display()),
        );
        return Ok(report);
    }
    report.pass("Verify cruise directory exists");

    if !dirs.base.exists() {
        report.fail(
            "Verify lowering base directory exists",
            format!("Lowering base directory {} does not exists", dirs.base.display()),
        );
        return Ok(report);
    }
    report.pass("Verify lowering base directory exists");

    if dirs.full.exists() {
        report.fail(
            "Verify lowering directory does not exists",
            format!("Lowering directory {} already exists", dirs.full.display()),
        );
        return Ok(report);
    }
    report.pass("Verify lowering directory does not exists");

    debug!("building directory list");
    ctx.send_status(2, 10);
    let directorylist = build_directorylist(ctx, &scope, &dirs)?;
    debug!("directory list: {directorylist:?}");
    report.pass("Build Directory List");

    debug!("creating lowering directories");
    ctx.send_status(5, 10);
    if let Err(err) = crate::fsutil::create_directories(&directorylist) {
        report.fail("Create Directories", format!("{err:#}"));
        return Ok(report);
    }
    report.pass("Create Directories");

    debug!("setting lowering directory ownership/permissions");
    ctx.send_status(8, 10);
    if let Err(err) =
        crate::fsutil::set_owner_group_permissions(&scope.warehouse.username, &dirs.full)
    {
        report.fail("Set lowering directory ownership/permissions", format!("{err:#}"));
        return Ok(report);
    }
    report.pass("Set lowering directory ownership/permissions");

    ctx.send_status(10, 10);
    Ok(report)
}

fn rebuild_directory(ctx: &JobContext) -> Result<JobReport> {
    let mut report = JobReport::new();
    let (scope, lowering_id) = match require_lowering(ctx) {
        Ok(ok) => ok,
        Err(report) => return Ok(report),
    };
    let dirs = lowering_dirs(&scope, &lowering_id);

    info!("start of task");
    ctx.send_status(1, 10);

    debug!("pre-task checks");
    if !dirs.full.exists() {
        report.fail(
            "Verify lowering directory exists",
            format!("Unable to find lowering directory: {}", dirs.full.display()),
        );
        return Ok(report);
    }
    report.pass("Verify lowering directory exists");

    info!("building directory list");
    ctx.send_status(2, 10);
    let directorylist = build_directorylist(ctx, &scope, &dirs)?;
    debug!("directory list: {directorylist:?}");
    report.pass("Build Directory List");

    if !directorylist.is_empty() {
        info!("creating directories");
        ctx.send_status(5, 10);
        if let Err(err) = crate::fsutil::create_directories(&directorylist) {
            report.fail("Create Directories", format!("{err:#}"));
            return Ok(report);
        }
        report.pass("Create Directories");
    }

    info!("setting directory ownership/permissions");
    ctx.send_status(7, 10);
    if let Err(err) =
        crate::fsutil::set_owner_group_permissions(&scope.warehouse.username, &dirs.full)
    {
        report.fail("Set Directory ownership/permissions", format!("{err:#}"));
        return Ok(report);
    }
    report.pass("Set Directory ownership/permissions");

    ctx.send_status(10, 10);
    Ok(report)
}

fn set_permissions(ctx: &JobContext) -> Result<JobReport> {
    let mut report = JobReport::new();
    let (scope, lowering_id) = match require_lowering(ctx) {
        Ok(ok) => ok,
        Err(report) => return Ok(report),
    };
    let dirs = lowering_dirs(&scope, &lowering_id);

    info!("start of task");
    ctx.send_status(1, 10);

    if !dirs.base.is_dir() {
        report.fail(
            "Verify lowering base directory exists",
            format!("Lowering base directory {} does not exist", dirs.base.display()),
        );
        return Ok(report);
    }

    info!("setting ownership/permissions for lowering base directory");
    ctx.send_status(5, 10);
    if let Err(err) =
        crate::fsutil::set_owner_group_permissions(&scope.warehouse.username, &dirs.base)
    {
        report.fail(
            "Set lowering base directory ownership/permissions",
            format!("{err:#}"),
        );
        return Ok(report);
    }
    report.pass("Set lowering base directory ownership/permissions");

    ctx.send_status(10, 10);
    Ok(report)
}
