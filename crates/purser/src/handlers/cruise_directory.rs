//! Cruise directory tree: create, rebuild, and lock down sibling cruises.

use std::path::PathBuf;

use anyhow::Result;
use tracing::{debug, info};

use crate::filters;
use crate::types::JobReport;
use crate::worker::{JobContext, OwnerSpec, TaskRegistration};

use super::Scope;

pub const CREATE_TASK: &str = "createCruiseDirectory";
pub const REBUILD_TASK: &str = "rebuildCruiseDirectory";
pub const SET_PERMISSIONS_TASK: &str = "setCruiseDataDirectoryPermissions";

const SYNTHETIC: &[(&str, &str)] = &[
    (CREATE_TASK, "Creating cruise directory"),
    (SET_PERMISSIONS_TASK, "Setting CruiseData directory permissions"),
];

pub fn registrations() -> Vec<TaskRegistration> {
    vec![
        TaskRegistration::new(CREATE_TASK, OwnerSpec::Task(SYNTHETIC), create_directory),
        TaskRegistration::new(REBUILD_TASK, OwnerSpec::Task(SYNTHETIC), rebuild_directory),
        TaskRegistration::new(SET_PERMISSIONS_TASK, OwnerSpec::Task(SYNTHETIC), set_permissions),
    ]
}

/// The set of directories a cruise needs: required extra directories, the
/// lowering base (when lowerings are shown), and every active cruise-scoped
/// destination whose tokens resolve.
fn build_directorylist(ctx: &JobContext, scope: &Scope) -> Result<Vec<PathBuf>> {
    let token_ctx = scope.token_ctx();
    let mut directories = Vec::new();

    let expand = |dest_dir: &str| -> Option<PathBuf> {
        let expanded = filters::keyword_replace(dest_dir, &token_ctx);
        if scope.lowering_id.is_none() && filters::has_unresolved_lowering(&expanded) {
            return None;
        }
        Some(scope.cruise_dir.join(expanded.trim_start_matches('/')))
    };

    let mut required = ctx.api.required_extra_directories()?;
    if !ctx.config.transfer_public_data {
        required.retain(|d| d.name != "From_PublicData");
    }
    directories.extend(required.iter().filter_map(|d| expand(&d.dest_dir)));

    if ctx.api.show_lowering_components()? {
        directories.push(scope.cruise_dir.join(&scope.warehouse.lowering_data_base_dir));
    }

    let mut transfers = ctx.api.active_collection_system_transfers(true, false)?;
    if !ctx.config.transfer_public_data {
        transfers.retain(|t| t.name != "From_PublicData");
    }
    directories.extend(transfers.iter().filter_map(|t| expand(&t.dest_dir)));

    let extra_dirs = ctx.api.active_extra_directories(true, false)?;
    directories.extend(
        extra_dirs
            .iter()
            .filter(|d| !d.required())
            .filter_map(|d| expand(&d.dest_dir)),
    );

    directories.sort();
    directories.dedup();
    Ok(directories)
}

/// Restrict sibling cruise directories so only the current cruise is
/// readable.
fn lockdown_siblings(ctx: &JobContext, scope: &Scope, report: &mut JobReport) -> bool {
    if !ctx.config.show_only_current_cruise_dir {
        return true;
    }
    info!("resetting permissions for CruiseData directory");
    let base = std::path::Path::new(&scope.warehouse.base_dir);
    if let Err(err) = crate::fsutil::lockdown_directory(base, &[scope.cruise_dir.clone()]) {
        report.fail(
            "Clear CruiseData directory read permissions",
            format!("{err:#}"),
        );
        return false;
    }
    report.pass("Clear CruiseData directory read permissions");
    true
}

fn create_directory(ctx: &JobContext) -> Result<JobReport> {
    let mut report = JobReport::new();
    let scope = Scope::resolve(ctx)?;

    info!("start of task");
    ctx.send_status(1, 10);

    debug!("pre-task checks");
    if !std::path::Path::new(&scope.warehouse.base_dir).exists() {
        report.fail(
            "Verify base directory exists",
            format!("Failed to find base directory: {}", scope.warehouse.base_dir),
        );
        return Ok(report);
    }
    report.pass("Verify base directory exists");

    if scope.cruise_dir.exists() {
        report.fail(
            "Verify cruise directory does not exists",
            format!("Cruise directory {} already exists", scope.cruise_dir.display()),
        );
        return Ok(report);
    }
    report.pass("Verify cruise directory does not exists");

    info!("building directory list");
    ctx.send_status(2, 10);
    let directorylist = build_directorylist(ctx, &scope)?;
    debug!("directory list: {directorylist:?}");

    if directorylist.is_empty() {
        report.fail("Build directory list", "Empty list of directories to create");
        return Ok(report);
    }
    report.pass("Build directory list");

    info!("creating directories");
    ctx.send_status(5, 10);
    if let Err(err) = crate::fsutil::create_directories(&directorylist) {
        report.fail("Create directories", format!("{err:#}"));
        return Ok(report);
    }
    report.pass("Create directories");

    ctx.send_status(7, 10);
    if !lockdown_siblings(ctx, &scope, &mut report) {
        return Ok(report);
    }

    info!("setting ownership/permissions for cruise directory");
    ctx.send_status(8, 10);
    if let Err(err) =
        crate::fsutil::set_owner_group_permissions(&scope.warehouse.username, &scope.cruise_dir)
    {
        report.fail("Set cruise directory ownership/permissions", format!("{err:#}"));
        return Ok(report);
    }
    report.pass("Set cruise directory ownership/permissions");

    ctx.send_status(10, 10);
    Ok(report)
}

fn rebuild_directory(ctx: &JobContext) -> Result<JobReport> {
    let mut report = JobReport::new();
    let scope = Scope::resolve(ctx)?;

    info!("start of task");
    ctx.send_status(1, 10);

    if !scope.cruise_dir.exists() {
        report.fail(
            "Verify cruise directory exists",
            format!("Unable to locate the cruise directory: {}", scope.cruise_dir.display()),
        );
        return Ok(report);
    }
    report.pass("Verify cruise directory exists");

    ctx.send_status(2, 100);
    if !lockdown_siblings(ctx, &scope, &mut report) {
        return Ok(report);
    }

    info!("build directory list");
    ctx.send_status(3, 10);
    let directorylist = build_directorylist(ctx, &scope)?;
    debug!("directory list: {directorylist:?}");
    report.pass("Build directory list");

    info!("create directories");
    ctx.send_status(5, 10);
    if let Err(err) = crate::fsutil::create_directories(&directorylist) {
        report.fail("Create directories", format!("{err:#}"));
        return Ok(report);
    }
    report.pass("Create directories");

    info!("set directory ownership/permissions");
    ctx.send_status(7, 10);
    if let Err(err) =
        crate::fsutil::set_owner_group_permissions(&scope.warehouse.username, &scope.cruise_dir)
    {
        report.fail("Set directory ownership/permissions", format!("{err:#}"));
        return Ok(report);
    }
    report.pass("Set directory ownership/permissions");

    ctx.send_status(10, 10);
    Ok(report)
}

fn set_permissions(ctx: &JobContext) -> Result<JobReport> {
    let mut report = JobReport::new();
    let scope = Scope::resolve(ctx)?;

    info!("start of task");
    ctx.send_status(1, 10);

    ctx.send_status(2, 10);
    if !lockdown_siblings(ctx, &scope, &mut report) {
        return Ok(report);
    }

    info!("setting ownership/permissions for cruise data directory");
    ctx.send_status(6, 10);

    if !scope.cruise_dir.is_dir() {
        report.fail(
            "Set directory permissions for current cruise",
            "Cruise directory not found",
        );
        return Ok(report);
    }

    if let Err(err) =
        crate::fsutil::set_owner_group_permissions(&scope.warehouse.username, &scope.cruise_dir)
    {
        report.fail("Set directory permissions for current cruise", format!("{err:#}"));
        return Ok(report);
    }
    report.pass("Set directory permissions for current cruise");

    ctx.send_status(10, 10);
    Ok(report)
}
