//! Filesystem helpers shared by the task handlers: directory creation,
//! ownership and permission sweeps, destination pruning, log purging, and
//! atomic JSON writes.

use std::collections::HashSet;
use std::fs::{self, File, Permissions};
use std::io::Write;
use std::os::unix::fs::{MetadataExt, PermissionsExt, chown};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::SystemTime;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const DIR_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o644;
const LOCKED_DIR_MODE: u32 = 0o700;
const LOCKED_FILE_MODE: u32 = 0o600;

/// Create every directory in `paths`; existing directories count as created.
/// Failures are collected into one error.
pub fn create_directories(paths: &[PathBuf]) -> Result<()> {
    let mut reasons = Vec::new();
    for path in paths {
        if let Err(err) = fs::create_dir_all(path) {
            warn!("unable to create directory {}: {err}", path.display());
            reasons.push(format!("Unable to create directory: {}", path.display()));
        }
    }

    if reasons.is_empty() {
        Ok(())
    } else {
        Err(anyhow!(reasons.join("\n")))
    }
}

/// Resolve a warehouse username to (uid, gid).
pub fn resolve_user(username: &str) -> Result<(u32, u32)> {
    let user = nix::unistd::User::from_name(username)
        .with_context(|| format!("failed to look up user {username}"))?
        .with_context(|| format!("no such user: {username}"))?;
    Ok((user.uid.as_raw(), user.gid.as_raw()))
}

fn apply_owner_mode(path: &Path, uid: u32, gid: u32, mode: u32, reasons: &mut Vec<String>) {
    let result = chown(path, Some(uid), Some(gid))
        .and_then(|_| fs::set_permissions(path, Permissions::from_mode(mode)));
    if result.is_err() {
        debug!("unable to set ownership/permissions for {}", path.display());
        reasons.push(format!(
            "Unable to set ownership/permissions for {}",
            path.display()
        ));
    }
}

/// Recursively chown to `username` and chmod (dirs 0755, files 0644) the
/// given path. Individual failures are collected; the error message reports
/// the failure count the way operators are used to seeing it.
pub fn set_owner_group_permissions(username: &str, path: &Path) -> Result<()> {
    let (uid, gid) = resolve_user(username)?;
    let mut reasons = Vec::new();

    if path.is_file() {
        apply_owner_mode(path, uid, gid, FILE_MODE, &mut reasons);
    } else {
        apply_owner_mode(path, uid, gid, DIR_MODE, &mut reasons);
        for entry in WalkDir::new(path).min_depth(1).into_iter().filter_map(|e| e.ok()) {
            let mode = if entry.file_type().is_dir() { DIR_MODE } else { FILE_MODE };
            apply_owner_mode(entry.path(), uid, gid, mode, &mut reasons);
        }
    }

    if reasons.is_empty() {
        Ok(())
    } else {
        bail!("Unable to set ownership/permissions for {} file(s)", reasons.len())
    }
}

/// Lock down the immediate children of `base_dir` (dirs 0700, files 0600),
/// leaving the exempt directories readable.
pub fn lockdown_directory(base_dir: &Path, exempt: &[PathBuf]) -> Result<()> {
    let entries = fs::read_dir(base_dir)
        .with_context(|| format!("failed to list {}", base_dir.display()))?;

    for entry in entries {
        let path = entry?.path();
        if path.is_file() {
            fs::set_permissions(&path, Permissions::from_mode(LOCKED_FILE_MODE))
                .with_context(|| format!("failed to lock down {}", path.display()))?;
        } else if path.is_dir() && !exempt.contains(&path) {
            fs::set_permissions(&path, Permissions::from_mode(LOCKED_DIR_MODE))
                .with_context(|| format!("failed to lock down {}", path.display()))?;
        }
    }
    Ok(())
}

/// Whether the current user can create files in `dir`.
pub fn verify_write_access(dir: &Path) -> bool {
    let probe = dir.join("writeTest.txt");
    let ok = fs::write(&probe, b"This file tests if the directory can be written to.").is_ok();
    if ok {
        let _ = fs::remove_file(&probe);
        info!("write test passed for {}", dir.display());
    } else {
        warn!("write test failed for {}", dir.display());
    }
    ok
}

/// Remove from `dest_dir` every file whose path relative to `dest_dir` is
/// not in `keep`. Returns the relative paths of the files deleted.
pub fn delete_from_dest(dest_dir: &Path, keep: &[String]) -> Vec<String> {
    let keep: HashSet<&str> = keep.iter().map(String::as_str).collect();
    let mut deleted = Vec::new();

    for entry in WalkDir::new(dest_dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = match entry.path().strip_prefix(dest_dir) {
            Ok(rel) => rel.to_string_lossy().to_string(),
            Err(_) => continue,
        };
        if keep.contains(rel.as_str()) {
            continue;
        }

        match fs::remove_file(entry.path()) {
            Ok(()) => {
                info!("deleted: {}", entry.path().display());
                deleted.push(rel);
            }
            Err(err) => warn!("could not delete {}: {err}", entry.path().display()),
        }
    }

    deleted
}

/// Delete everything inside `dir`, keeping the directory itself.
pub fn clear_directory(dir: &Path) -> Result<()> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        result.with_context(|| format!("failed to remove {}", path.display()))?;
    }
    Ok(())
}

/// Delete files under `dir` older than the `timedelta_phrase` threshold
/// (default `"12 hours"`). `excludes` is a comma-separated glob list matched
/// against full paths; directories are only entered when `recursive` is set.
pub fn purge_old_files(
    dir: &Path,
    excludes: Option<&str>,
    timedelta_phrase: Option<&str>,
    recursive: bool,
) -> Result<()> {
    let phrase = timedelta_phrase.unwrap_or("12 hours");
    let max_age = purser_duration::parse_timedelta(phrase)
        .map_err(|err| anyhow!("invalid timedelta phrase {phrase:?}: {err}"))?;
    let cutoff = SystemTime::now()
        .checked_sub(max_age)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let exclude_set = match excludes {
        Some(raw) => Some(
            crate::filters::FilterSet::new(&crate::filters::split_patterns(raw), &[], &[])
                .context("bad exclude pattern for purge")?,
        ),
        None => None,
    };

    purge_dir(dir, exclude_set.as_ref(), cutoff, recursive)
}

fn purge_dir(
    dir: &Path,
    excludes: Option<&crate::filters::FilterSet>,
    cutoff: SystemTime,
    recursive: bool,
) -> Result<()> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))?;

    for entry in entries {
        let path = entry?.path();
        let path_str = path.to_string_lossy();

        if let Some(excludes) = excludes
            && excludes.classify(&path_str) == crate::filters::FilterOutcome::Include
        {
            debug!("{path_str} excluded from purge");
            continue;
        }

        if path.is_file() {
            let modified = path.metadata().and_then(|m| m.modified());
            if let Ok(modified) = modified
                && modified < cutoff
            {
                match fs::remove_file(&path) {
                    Ok(()) => info!("deleted: {}", path.display()),
                    Err(err) => warn!("error deleting {}: {err}", path.display()),
                }
            }
        } else if path.is_dir() && recursive {
            purge_dir(&path, excludes, cutoff, recursive)?;
        }
    }
    Ok(())
}

/// Serialize `contents` as pretty JSON and write it atomically: tmp file in
/// the same directory, fsync, rename. Parent directories are created as
/// needed.
pub fn write_json_atomic<T: serde::Serialize>(path: &Path, contents: &T) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("no parent directory for {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent directory {}", parent.display()))?;

    let json = serde_json::to_string_pretty(contents).context("failed to serialize JSON")?;
    write_atomic(path, json.as_bytes())
}

/// Write raw bytes atomically (tmp in same dir, fsync, rename).
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .with_context(|| format!("no file name in {}", path.display()))?;
    let tmp_path = path.with_file_name(format!("{}.tmp", file_name.to_string_lossy()));
    {
        let mut file = File::create(&tmp_path)
            .with_context(|| format!("failed to create {}", tmp_path.display()))?;
        file.write_all(bytes)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to sync {}", tmp_path.display()))?;
    }
    fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename into place: {}", path.display()))?;
    Ok(())
}

/// Write one path per line, newline-joined with a trailing NUL, for
/// `rsync --files-from`.
pub fn build_include_file(paths: &[String], filepath: &Path) -> Result<()> {
    let mut body = paths.join("\n").into_bytes();
    body.push(0);
    fs::write(filepath, body)
        .with_context(|| format!("failed to write include file {}", filepath.display()))
}

/// Directory size in bytes via `du -sb`, `None` when the path is not a
/// directory or `du` fails.
pub fn dir_size_bytes(path: &Path) -> Option<String> {
    if !path.is_dir() {
        return None;
    }
    let output = Command::new("du").arg("-sb").arg(path).output().ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .split_whitespace()
        .next()
        .map(str::to_string)
}

/// Whether `path` is a mount point (its device differs from its parent's).
pub fn is_mount_point(path: &Path) -> bool {
    let Ok(meta) = path.metadata() else {
        return false;
    };
    let Some(parent) = path.parent() else {
        return true;
    };
    match parent.metadata() {
        Ok(parent_meta) => meta.dev() != parent_meta.dev() || meta.ino() == parent_meta.ino(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn current_username() -> String {
        nix::unistd::User::from_uid(nix::unistd::getuid())
            .unwrap()
            .unwrap()
            .name
    }

    #[test]
    fn create_directories_tolerates_existing() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a/b/c");
        let b = tmp.path().join("a");
        create_directories(&[a.clone(), b]).unwrap();
        assert!(a.is_dir());
        // Second call over the same list succeeds.
        create_directories(&[a.clone()]).unwrap();
    }

    #[test]
    fn ownership_sweep_applies_modes() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("Cruise/SCS");
        fs::create_dir_all(&dir).unwrap();
        let file = dir.join("gps.raw");
        fs::write(&file, b"x").unwrap();

        set_owner_group_permissions(&current_username(), tmp.path()).unwrap();

        assert_eq!(dir.metadata().unwrap().permissions().mode() & 0o777, DIR_MODE);
        assert_eq!(file.metadata().unwrap().permissions().mode() & 0o777, FILE_MODE);
    }

    #[test]
    fn unknown_user_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(set_owner_group_permissions("no-such-user-xyzzy", tmp.path()).is_err());
    }

    #[test]
    fn lockdown_skips_exempt_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let current = tmp.path().join("FK250801");
        let old = tmp.path().join("FK250613");
        let loose_file = tmp.path().join("notes.txt");
        fs::create_dir_all(&current).unwrap();
        fs::create_dir_all(&old).unwrap();
        fs::write(&loose_file, b"x").unwrap();

        lockdown_directory(tmp.path(), &[current.clone()]).unwrap();

        assert_eq!(old.metadata().unwrap().permissions().mode() & 0o777, LOCKED_DIR_MODE);
        assert_eq!(
            loose_file.metadata().unwrap().permissions().mode() & 0o777,
            LOCKED_FILE_MODE
        );
        assert_ne!(
            current.metadata().unwrap().permissions().mode() & 0o777,
            LOCKED_DIR_MODE
        );
    }

    #[test]
    fn delete_from_dest_keeps_include_set() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("nav")).unwrap();
        fs::write(tmp.path().join("nav/keep.raw"), b"k").unwrap();
        fs::write(tmp.path().join("nav/drop.raw"), b"d").unwrap();

        let deleted = delete_from_dest(tmp.path(), &["nav/keep.raw".to_string()]);

        assert_eq!(deleted, vec!["nav/drop.raw"]);
        assert!(tmp.path().join("nav/keep.raw").exists());
        assert!(!tmp.path().join("nav/drop.raw").exists());
    }

    #[test]
    fn clear_directory_empties_but_keeps_root() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("sub/deeper")).unwrap();
        fs::write(tmp.path().join("f.txt"), b"x").unwrap();

        clear_directory(tmp.path()).unwrap();

        assert!(tmp.path().exists());
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn purge_respects_excludes_and_age() {
        let tmp = tempfile::tempdir().unwrap();
        let stale = tmp.path().join("SCS_20250101T000000Z.log");
        let excluded = tmp.path().join("SCS_Exclude.log");
        fs::write(&stale, b"old").unwrap();
        fs::write(&excluded, b"old").unwrap();

        // Zero-second threshold: everything is stale.
        purge_old_files(tmp.path(), Some("*Exclude.log"), Some("0 seconds"), false).unwrap();

        assert!(!stale.exists());
        assert!(excluded.exists());
    }

    #[test]
    fn purge_rejects_bad_phrase() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(purge_old_files(tmp.path(), None, Some("sideways"), false).is_err());
    }

    #[test]
    fn atomic_json_write_creates_parents() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("Dashboard_Data/manifest.json");
        write_json_atomic(&path, &serde_json::json!([{"type": "gga"}])).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value[0]["type"], "gga");
        assert!(!path.with_file_name("manifest.json.tmp").exists());
    }

    #[test]
    fn include_file_is_nul_terminated() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("rsyncFileList.txt");
        build_include_file(&["a.txt".into(), "b/c.txt".into()], &path).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"a.txt\nb/c.txt\0");
    }

    #[test]
    fn dir_size_reports_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("f"), vec![0u8; 1024]).unwrap();
        let size: u64 = dir_size_bytes(tmp.path()).unwrap().parse().unwrap();
        assert!(size >= 1024);
        assert!(dir_size_bytes(&tmp.path().join("missing")).is_none());
    }
}
