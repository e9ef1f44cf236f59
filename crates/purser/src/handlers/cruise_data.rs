//! Cruise data transfers: replicate the assembled cruise tree to an
//! external destination (local path, SMB share, rsync daemon, SSH host).

use std::path::Path;
use std::process::Command;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::connection::{
    self, RemoteAuth, RsyncBehavior, RsyncMode, TransferScratch, build_rsync_command,
    build_rsync_options,
};
use crate::executor;
use crate::filters::{FilterOutcome, FilterSet, is_ascii, is_rsync_partial, split_patterns};
use crate::types::{CruiseDataTransfer, FileReport, JobReport, PartResult, TransferKind};
use crate::worker::{JobContext, OwnerSpec, TaskRegistration};
use walkdir::WalkDir;

use super::Scope;

pub const RUN_TASK: &str = "runCruiseDataTransfer";
pub const TEST_TASK: &str = "testCruiseDataTransfer";

pub fn registrations() -> Vec<TaskRegistration> {
    vec![
        TaskRegistration::new(RUN_TASK, OwnerSpec::CdtFromPayload { test: false }, run_transfer),
        TaskRegistration::new(TEST_TASK, OwnerSpec::CdtFromPayload { test: true }, test_transfer),
    ]
}

/// Exclusion globs for the outbound copy: engine-owned metadata files when
/// `includeOVDMFiles` is off, plus any excluded collection-system subtrees
/// and extra directories.
fn build_exclude_filterlist(
    ctx: &JobContext,
    cdt: &CruiseDataTransfer,
    scope: &Scope,
) -> Vec<String> {
    let mut excludes = Vec::new();

    if !cdt.include_ovdm_files() {
        excludes.push(format!("*{}", scope.warehouse.cruise_config_fn));
        excludes.push(format!("*{}", scope.warehouse.md5_summary_fn));
        excludes.push(format!("*{}", scope.warehouse.md5_summary_md5_fn));
    }

    for id in split_patterns(&cdt.excluded_collection_systems) {
        if id == "0" {
            continue;
        }
        match ctx.api.collection_system_transfer(&id) {
            Ok(Some(cst)) => {
                if !cst.lowering_scoped() {
                    let dest = cst.dest_dir.replace("{cruiseID}", &scope.cruise_id);
                    excludes.push(format!("*{dest}*"));
                } else if let Ok(lowerings) = ctx.api.lowerings() {
                    for lowering in lowerings {
                        let dest = cst
                            .dest_dir
                            .replace("{cruiseID}", &scope.cruise_id)
                            .replace("{loweringID}", &lowering);
                        excludes.push(format!("*{lowering}/{dest}*"));
                    }
                }
            }
            _ => warn!("could not retrieve collection system transfer {id}"),
        }
    }

    for id in split_patterns(&cdt.excluded_extra_directories) {
        if id == "0" {
            continue;
        }
        if let Ok(Some(extra_dir)) = ctx.api.extra_directory(&id) {
            let dest = extra_dir.dest_dir.replace("{cruiseID}", &scope.cruise_id);
            excludes.push(format!("*{dest}*"));
        }
    }

    debug!("exclude filters: {excludes:?}");
    excludes
}

/// Files the walk admitted for transfer, and those the exclusion list or
/// the ASCII rule kept back. Paths relative to the cruise directory.
#[derive(Debug, Default)]
struct CruiseFileList {
    include: Vec<String>,
    exclude: Vec<String>,
}

/// Walk the cruise tree and split it into transferable and excluded files.
fn build_filelist(excludes: &[String], cruise_dir: &Path) -> Result<CruiseFileList> {
    let filters = FilterSet::new(&["*".to_string()], excludes, &[])?;
    let mut list = CruiseFileList::default();

    for entry in WalkDir::new(cruise_dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() || entry.path_is_symlink() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if is_rsync_partial(&name) {
            continue;
        }

        let path = entry.path().to_string_lossy().to_string();
        let rel = entry
            .path()
            .strip_prefix(cruise_dir)
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|_| path.clone());

        match filters.classify(&path) {
            FilterOutcome::Include if is_ascii(&path) => list.include.push(rel),
            FilterOutcome::Include | FilterOutcome::Exclude => list.exclude.push(rel),
            FilterOutcome::Drop => {}
        }
    }

    Ok(list)
}

/// Escape glob metacharacters rsync would otherwise expand in exclude
/// patterns read from the exclude file.
fn escape_exclude(path: &str) -> String {
    path.replace('[', "\\[").replace(']', "\\]")
}

fn write_exclude_file(excluded: &[String], path: &Path) -> Result<()> {
    let escaped: Vec<String> = excluded.iter().map(|p| escape_exclude(p)).collect();
    crate::fsutil::build_include_file(&escaped, path)
}

/// Dry run with `--stats` to learn the regular-file count; zero skips the
/// real run entirely.
fn count_files(cmd: &[String]) -> Result<u64> {
    debug!("file count command: {}", cmd.join(" "));
    let output = Command::new(&cmd[0])
        .args(&cmd[1..])
        .output()
        .context("failed to run rsync dry run")?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    let count = executor::parse_stats_file_count(&stdout).unwrap_or(0);
    info!("file count: {count}");
    Ok(count)
}

fn transfer_to_dest(
    ctx: &JobContext,
    cdt: &CruiseDataTransfer,
    scope: &Scope,
) -> Result<FileReport> {
    let kind = cdt.kind().context("Unknown transfer type")?;
    let auth = RemoteAuth::from(cdt);
    let scratch = TransferScratch::new()?;

    let excludes = build_exclude_filterlist(ctx, cdt, scope);
    let list = build_filelist(&excludes, &scope.cruise_dir)?;
    debug!(
        "{} file(s) eligible, {} excluded",
        list.include.len(),
        list.exclude.len()
    );

    let exclude_file = scratch.exclude_file();
    write_exclude_file(&list.exclude, &exclude_file)
        .context("Error saving temporary rsync exclude list")?;

    let mut is_darwin = false;
    let mut password_file = None;

    let dest: String = match kind {
        TransferKind::Local => cdt.dest_dir.trim_end_matches('/').to_string(),
        TransferKind::Smb => {
            let mntpoint = scratch.mountpoint();
            std::fs::create_dir(&mntpoint).context("failed to create SMB mountpoint")?;
            let version =
                connection::detect_smb_version(&auth).context("failed to probe SMB server")?;
            if !connection::mount_smb_share(&auth, &mntpoint, &version, true) {
                anyhow::bail!("Failed to mount SMB share");
            }
            if cdt.dest_dir == "/" {
                mntpoint.to_string_lossy().to_string()
            } else {
                mntpoint
                    .join(cdt.dest_dir.trim_matches('/'))
                    .to_string_lossy()
                    .to_string()
            }
        }
        TransferKind::Rsync => {
            password_file = scratch
                .write_password_file(&auth)
                .context("Error writing rsync password file")?;
            format!(
                "rsync://{}@{}{}",
                cdt.rsync_user,
                cdt.rsync_server,
                cdt.dest_dir.trim_end_matches('/')
            )
        }
        TransferKind::Ssh => {
            is_darwin = connection::check_darwin(&auth);
            format!("{}@{}:{}", cdt.ssh_user, cdt.ssh_server, cdt.dest_dir)
        }
    };

    let mut extra_args: Vec<String> = vec![format!("--exclude-from={}", exclude_file.display())];
    match kind {
        TransferKind::Ssh => {
            extra_args.push("-e".into());
            extra_args.push("ssh".into());
        }
        TransferKind::Rsync => {
            if let Some(password_file) = &password_file {
                extra_args.push(format!("--password-file={}", password_file.display()));
            }
        }
        _ => {}
    }

    let wrap = |mut cmd: Vec<String>| {
        if kind == TransferKind::Ssh && !cdt.ssh_use_key() {
            let mut wrapped: Vec<String> =
                vec!["sshpass".into(), "-p".into(), cdt.ssh_pass.clone()];
            wrapped.extend(cmd.drain(..));
            cmd = wrapped;
        }
        cmd
    };

    let behavior = RsyncBehavior::from_cdt(cdt);
    let source = scope.cruise_dir.to_string_lossy().to_string();

    let dry_flags = build_rsync_options(kind, &behavior, RsyncMode::DryRun, is_darwin);
    let dry_cmd = wrap(build_rsync_command(&dry_flags, &extra_args, &source, Some(&dest), None));
    let file_count = count_files(&dry_cmd)?;

    let mut report = FileReport {
        exclude: list.exclude,
        ..FileReport::default()
    };
    if file_count == 0 {
        debug!("nothing to transfer");
        return Ok(report);
    }

    let real_flags = build_rsync_options(kind, &behavior, RsyncMode::Real, is_darwin);
    let real_cmd = wrap(build_rsync_command(&real_flags, &extra_args, &source, Some(&dest), None));

    let outcome =
        executor::run_transfer_command(&real_cmd, file_count as usize, ctx.cancel, |pct| {
            ctx.send_percent_in_range(20, 90, pct)
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

    report.new = outcome.new;
    report.updated = outcome.updated;

    if kind == TransferKind::Local && !cdt.local_dir_is_mount_point() {
        info!("setting file permissions");
        let dest_cruise = Path::new(&dest).join(&scope.cruise_id);
        crate::fsutil::set_owner_group_permissions(&scope.warehouse.username, &dest_cruise)?;
    }

    Ok(report)
}

fn run_transfer(ctx: &JobContext) -> Result<JobReport> {
    thread::sleep(Duration::from_secs(rand::thread_rng().gen_range(0..=2)));

    let cdt = ctx.cdt().context("runtime resolved no transfer")?.clone();
    let mut report = JobReport::new();
    report.pass("Transfer In-Progress").pass("Transfer Enabled");

    let scope = Scope::resolve(ctx)?;

    info!("testing configuration");
    ctx.send_status(1, 10);

    let test_parts = connection::test_cdt_destination(&cdt);
    match test_parts.last() {
        Some(part) if part.result == PartResult::Fail => {
            warn!("connection test failed, quitting job");
            report.fail(
                "Connection Test",
                part.reason.clone().unwrap_or_else(|| "undefined".into()),
            );
            return Ok(report);
        }
        _ => {
            debug!("connection test passed");
            report.pass("Connection Test");
        }
    }

    ctx.send_status(2, 10);
    info!("transferring files");

    let files = match transfer_to_dest(ctx, &cdt, &scope) {
        Ok(files) => files,
        Err(err) => {
            warn!("transfer of cruise data failed: {err:#}");
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
        debug!("{} file(s) intentionally skipped", files.exclude.len());
    }

    ctx.send_status(10, 10);
    report.files = Some(files);
    Ok(report)
}

fn test_transfer(ctx: &JobContext) -> Result<JobReport> {
    let cdt = ctx.cdt().context("runtime resolved no transfer")?.clone();
    let mut report = JobReport::new();

    info!("testing destination");
    ctx.send_status(2, 10);
    report.parts.extend(connection::test_cdt_destination(&cdt));

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
    use std::fs;

    #[test]
    fn exclude_escaping_protects_brackets() {
        assert_eq!(escape_exclude("nav/file[1].raw"), "nav/file\\[1\\].raw");
        assert_eq!(escape_exclude("plain.txt"), "plain.txt");
    }

    #[test]
    fn filelist_splits_includes_and_excludes() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("SCS")).unwrap();
        fs::write(tmp.path().join("SCS/keep.raw"), b"x").unwrap();
        fs::write(tmp.path().join("MD5_Summary.txt"), b"x").unwrap();

        let list =
            build_filelist(&["*MD5_Summary.txt".to_string()], tmp.path()).unwrap();

        assert_eq!(list.include, vec!["SCS/keep.raw"]);
        assert_eq!(list.exclude, vec!["MD5_Summary.txt"]);
    }

    #[test]
    fn filelist_skips_partials_and_symlinks() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join(".upload.raw.a1B2c3"), b"x").unwrap();
        fs::write(tmp.path().join("real.raw"), b"x").unwrap();
        std::os::unix::fs::symlink(tmp.path().join("real.raw"), tmp.path().join("link.raw"))
            .unwrap();

        let list = build_filelist(&[], tmp.path()).unwrap();
        assert_eq!(list.include, vec!["real.raw"]);
        assert!(list.exclude.is_empty());
    }
}
