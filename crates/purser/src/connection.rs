//! Transfer connection primitives: SMB version probe and mount, SSH/Darwin
//! probe, rsync option and command builders, and the kind-dispatched
//! source/destination connection tests.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::types::{
    CollectionSystemTransfer, CruiseDataTransfer, JobPart, PartResult, TransferKind,
};

use crate::executor::RSYNC_VANISHED;

/// Borrowed view of the credential fields shared by CSTs and CDTs.
#[derive(Debug, Clone, Copy)]
pub struct RemoteAuth<'a> {
    pub smb_server: &'a str,
    pub smb_user: &'a str,
    pub smb_pass: &'a str,
    pub smb_domain: &'a str,
    pub rsync_server: &'a str,
    pub rsync_user: &'a str,
    pub rsync_pass: &'a str,
    pub ssh_server: &'a str,
    pub ssh_user: &'a str,
    pub ssh_pass: &'a str,
    pub ssh_use_key: bool,
}

impl<'a> From<&'a CollectionSystemTransfer> for RemoteAuth<'a> {
    fn from(cst: &'a CollectionSystemTransfer) -> Self {
        Self {
            smb_server: &cst.smb_server,
            smb_user: &cst.smb_user,
            smb_pass: &cst.smb_pass,
            smb_domain: &cst.smb_domain,
            rsync_server: &cst.rsync_server,
            rsync_user: &cst.rsync_user,
            rsync_pass: &cst.rsync_pass,
            ssh_server: &cst.ssh_server,
            ssh_user: &cst.ssh_user,
            ssh_pass: &cst.ssh_pass,
            ssh_use_key: cst.ssh_use_key(),
        }
    }
}

impl<'a> From<&'a CruiseDataTransfer> for RemoteAuth<'a> {
    fn from(cdt: &'a CruiseDataTransfer) -> Self {
        Self {
            smb_server: &cdt.smb_server,
            smb_user: &cdt.smb_user,
            smb_pass: &cdt.smb_pass,
            smb_domain: &cdt.smb_domain,
            rsync_server: &cdt.rsync_server,
            rsync_user: &cdt.rsync_user,
            rsync_pass: &cdt.rsync_pass,
            ssh_server: &cdt.ssh_server,
            ssh_user: &cdt.ssh_user,
            ssh_pass: &cdt.ssh_pass,
            ssh_use_key: cdt.ssh_use_key(),
        }
    }
}

/// Scoped working directory for a transfer: holds the include file, the
/// rsync password file and the SMB mountpoint. Dropping it attempts an
/// unmount before the temp tree is removed.
pub struct TransferScratch {
    dir: TempDir,
}

impl TransferScratch {
    pub fn new() -> Result<Self> {
        let dir = TempDir::new().context("failed to create transfer scratch directory")?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn include_file(&self) -> PathBuf {
        self.dir.path().join("rsyncFileList.txt")
    }

    pub fn exclude_file(&self) -> PathBuf {
        self.dir.path().join("rsyncExcludeList.txt")
    }

    pub fn mountpoint(&self) -> PathBuf {
        self.dir.path().join("mntpoint")
    }

    /// Write the rsync daemon password file, mode 0600. Anonymous users get
    /// no file.
    pub fn write_password_file(&self, auth: &RemoteAuth) -> Result<Option<PathBuf>> {
        if auth.rsync_user == "anonymous" {
            return Ok(None);
        }
        let path = self.dir.path().join("passwordFile");
        fs::write(&path, auth.rsync_pass)
            .with_context(|| format!("unable to create rsync password file {}", path.display()))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
            .context("unable to restrict rsync password file permissions")?;
        Ok(Some(path))
    }
}

impl Drop for TransferScratch {
    fn drop(&mut self) {
        let mntpoint = self.mountpoint();
        if crate::fsutil::is_mount_point(&mntpoint) {
            let status = Command::new("umount")
                .arg(&mntpoint)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
            match status {
                Ok(s) if s.success() => info!("unmounted {}", mntpoint.display()),
                _ => warn!("failed to unmount {}", mntpoint.display()),
            }
        }
    }
}

fn redact(rendered: String, secret: &str) -> String {
    if secret.is_empty() {
        rendered
    } else {
        rendered.replace(secret, "****")
    }
}

/// Probe the SMB server dialect with `smbclient -L`. `Some("1.0")` when the
/// server identifies as Windows 5.1, `Some("2.1")` otherwise, `None` when
/// the server is unreachable.
pub fn detect_smb_version(auth: &RemoteAuth) -> Option<String> {
    let mut cmd = Command::new("smbclient");
    cmd.args(["-L", auth.smb_server, "-W", auth.smb_domain, "-m", "SMB2", "-g"]);
    if auth.smb_user == "guest" {
        cmd.arg("-N");
    } else {
        cmd.args(["-U", &format!("{}%{}", auth.smb_user, auth.smb_pass)]);
    }

    debug!(
        "detect_smb_version cmd: {}",
        redact(format!("{cmd:?}"), auth.smb_pass)
    );

    let output = match cmd.output() {
        Ok(output) => output,
        Err(err) => {
            warn!("SMB version detection failed: {err}");
            return None;
        }
    };

    let stderr = String::from_utf8_lossy(&output.stderr);
    if !output.status.success()
        || stderr.contains("NT_STATUS")
        || stderr.to_lowercase().contains("failed")
    {
        warn!("failed to connect to SMB server: {}", stderr.trim());
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    if stdout.lines().any(|l| l.starts_with("OS=[Windows 5.1]")) {
        Some("1.0".to_string())
    } else {
        Some("2.1".to_string())
    }
}

/// Mount the SMB share read-write when source files will be removed,
/// read-only otherwise. On failure attempts an unmount of the mountpoint
/// before reporting.
pub fn mount_smb_share(
    auth: &RemoteAuth,
    mntpoint: &Path,
    smb_version: &str,
    read_write: bool,
) -> bool {
    let mut opts = format!(
        "{},domain={},vers={smb_version}",
        if read_write { "rw" } else { "ro" },
        auth.smb_domain
    );
    if auth.smb_user == "guest" {
        opts.push_str(",guest");
    } else {
        opts.push_str(&format!(",username={},password={}", auth.smb_user, auth.smb_pass));
    }

    let mut cmd = Command::new("mount");
    cmd.args(["-t", "cifs", auth.smb_server])
        .arg(mntpoint)
        .arg("-o")
        .arg(&opts);

    debug!(
        "mount_smb_share cmd: {}",
        redact(format!("{cmd:?}"), auth.smb_pass)
    );

    match cmd.status() {
        Ok(status) if status.success() => {
            info!("mounted {} at {}", auth.smb_server, mntpoint.display());
            true
        }
        result => {
            warn!("failed to mount SMB share: {result:?}");
            let _ = Command::new("umount")
                .arg(mntpoint)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
            false
        }
    }
}

/// SSH the peer and run `uname -s`; Darwin peers reject `--protect-args`.
pub fn check_darwin(auth: &RemoteAuth) -> bool {
    let cmd = match build_ssh_command(
        &[],
        auth.ssh_user,
        auth.ssh_server,
        "uname -s",
        auth.ssh_pass,
        auth.ssh_use_key,
    ) {
        Ok(cmd) => cmd,
        Err(err) => {
            warn!("cannot build darwin probe command: {err}");
            return false;
        }
    };

    debug!(
        "check_darwin cmd: {}",
        redact(cmd.join(" "), auth.ssh_pass)
    );

    match Command::new(&cmd[0]).args(&cmd[1..]).output() {
        Ok(output) => String::from_utf8_lossy(&output.stdout)
            .lines()
            .any(|l| l.trim() == "Darwin"),
        Err(err) => {
            warn!("SSH command to check for Darwin failed: {err}");
            false
        }
    }
}

/// Transfer mode selector for the rsync option builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RsyncMode {
    DryRun,
    Real,
}

/// Behavior knobs feeding the rsync option builder.
#[derive(Debug, Clone, Copy, Default)]
pub struct RsyncBehavior {
    pub skip_empty_files: bool,
    pub skip_empty_dirs: bool,
    pub bandwidth_limit_kbps: u64,
    pub remove_source_files: bool,
    /// `--delete` on the real run (mirror-to-destination transfers).
    pub delete_extraneous: bool,
}

impl RsyncBehavior {
    pub fn from_cst(cst: &CollectionSystemTransfer) -> Self {
        Self {
            skip_empty_files: cst.skip_empty_files(),
            skip_empty_dirs: cst.skip_empty_dirs(),
            bandwidth_limit_kbps: cst.bandwidth_limit_kbps(),
            remove_source_files: cst.remove_source_files(),
            delete_extraneous: false,
        }
    }

    pub fn from_cdt(cdt: &CruiseDataTransfer) -> Self {
        Self {
            skip_empty_files: cdt.skip_empty_files(),
            skip_empty_dirs: cdt.skip_empty_dirs(),
            bandwidth_limit_kbps: cdt.bandwidth_limit_kbps(),
            remove_source_files: false,
            delete_extraneous: cdt.sync_to_dest(),
        }
    }
}

/// Baseline `-trinv --dry-run --stats` or `-triv --progress`, with the
/// conditional flags layered in.
pub fn build_rsync_options(
    kind: TransferKind,
    behavior: &RsyncBehavior,
    mode: RsyncMode,
    is_darwin: bool,
) -> Vec<String> {
    let mut flags: Vec<String> = match mode {
        RsyncMode::DryRun => vec!["-trinv".into()],
        RsyncMode::Real => vec!["-triv".into(), "--progress".into()],
    };

    if !is_darwin {
        flags.insert(1, "--protect-args".into());
    }
    if behavior.skip_empty_files {
        flags.insert(1, "--min-size=1".into());
    }
    if behavior.skip_empty_dirs {
        flags.insert(1, "-m".into());
    }

    match mode {
        RsyncMode::DryRun => {
            flags.push("--dry-run".into());
            flags.push("--stats".into());
        }
        RsyncMode::Real => {
            if kind == TransferKind::Rsync {
                flags.push("--no-motd".into());
            }
            if behavior.bandwidth_limit_kbps != 0 {
                flags.insert(1, format!("--bwlimit={}", behavior.bandwidth_limit_kbps));
            }
            if behavior.remove_source_files {
                flags.insert(2, "--remove-source-files".into());
            }
            if behavior.delete_extraneous {
                flags.insert(2, "--delete".into());
            }
        }
    }

    flags
}

/// `rsync <flags> <extra> [--files-from=<f>] <src> [<dst>]`.
pub fn build_rsync_command(
    flags: &[String],
    extra_args: &[String],
    source: &str,
    dest: Option<&str>,
    include_file: Option<&Path>,
) -> Vec<String> {
    let mut cmd: Vec<String> = vec!["rsync".into()];
    cmd.extend(flags.iter().cloned());
    cmd.extend(extra_args.iter().cloned());
    if let Some(include_file) = include_file {
        cmd.push(format!("--files-from={}", include_file.display()));
    }
    cmd.push(source.to_string());
    if let Some(dest) = dest {
        cmd.push(dest.to_string());
    }
    cmd
}

/// `ssh` (key auth) or `sshpass -p <pass> ssh -o PubkeyAuthentication=no`
/// (password auth), plus flags, `user@server` and the remote command.
pub fn build_ssh_command(
    flags: &[&str],
    user: &str,
    server: &str,
    remote_cmd: &str,
    passwd: &str,
    use_pubkey: bool,
) -> Result<Vec<String>> {
    if passwd.is_empty() && !use_pubkey {
        anyhow::bail!("must specify either a password or public-key auth");
    }

    let mut cmd: Vec<String> = if use_pubkey {
        vec!["ssh".into()]
    } else {
        vec![
            "sshpass".into(),
            "-p".into(),
            passwd.into(),
            "ssh".into(),
            "-o".into(),
            "PubkeyAuthentication=no".into(),
        ]
    };
    cmd.extend(flags.iter().map(|f| f.to_string()));
    cmd.push(format!("{user}@{server}"));
    cmd.push(remote_cmd.to_string());
    Ok(cmd)
}

/// Probe an rsync daemon URL. Exit codes 0 and 24 count as reachable.
pub fn test_rsync_connection(target: &str, user: &str, password_file: Option<&Path>) -> bool {
    let mut flags: Vec<String> = vec!["--no-motd".into(), "--contimeout=5".into()];
    if let Some(password_file) = password_file {
        flags.push(format!("--password-file={}", password_file.display()));
    }
    let cmd = build_rsync_command(&flags, &[], &format!("rsync://{user}@{target}"), None, None);

    debug!("test_rsync_connection cmd: {}", cmd.join(" "));
    match Command::new(&cmd[0]).args(&cmd[1..]).output() {
        Ok(output) => {
            let code = output.status.code().unwrap_or(-1);
            if code != 0 && code != RSYNC_VANISHED {
                warn!("rsync failed: {}", String::from_utf8_lossy(&output.stderr).trim());
                false
            } else {
                true
            }
        }
        Err(err) => {
            warn!("rsync connection test failed: {err}");
            false
        }
    }
}

/// Probe an SSH host by running `ls` on it.
pub fn test_ssh_connection(auth: &RemoteAuth) -> bool {
    let cmd = match build_ssh_command(
        &["-o", "StrictHostKeyChecking=no"],
        auth.ssh_user,
        auth.ssh_server,
        "ls",
        auth.ssh_pass,
        auth.ssh_use_key,
    ) {
        Ok(cmd) => cmd,
        Err(err) => {
            warn!("cannot build ssh probe command: {err}");
            return false;
        }
    };

    debug!(
        "test_ssh_connection cmd: {}",
        redact(cmd.join(" "), auth.ssh_pass)
    );
    match Command::new(&cmd[0]).args(&cmd[1..]).status() {
        Ok(status) => status.success(),
        Err(err) => {
            warn!("SSH connection test failed: {err}");
            false
        }
    }
}

fn part(name: &str, result: PartResult, reason: Option<String>) -> JobPart {
    JobPart {
        part_name: name.to_string(),
        result,
        reason,
    }
}

fn pass(name: &str) -> JobPart {
    part(name, PartResult::Pass, None)
}

fn fail(name: &str, reason: &str) -> JobPart {
    part(name, PartResult::Fail, Some(reason.to_string()))
}

/// Kind-dispatched connection test of a collection-system source. Returns
/// the accumulated part list; the final part is the verdict.
pub fn test_cst_source(cst: &CollectionSystemTransfer, source_dir: &str) -> Vec<JobPart> {
    let auth = RemoteAuth::from(cst);
    let Some(kind) = cst.kind() else {
        warn!("unknown transfer type");
        return vec![fail("Collection transfer type", "Unknown transfer type")];
    };

    let scratch = match TransferScratch::new() {
        Ok(scratch) => scratch,
        Err(err) => return vec![fail("Create temporary directory", &format!("{err:#}"))],
    };

    let mut results = Vec::new();
    match kind {
        TransferKind::Local => {
            let source = Path::new(source_dir);
            if !source.is_dir() {
                let reason =
                    format!("Unable to find source directory: {source_dir} on the Data Warehouse");
                results.push(fail("Source Directory", &reason));
                if cst.local_dir_is_mount_point() {
                    results.push(fail("Source Directory is a Mountpoint", &reason));
                }
                if cst.remove_source_files() {
                    results.push(fail("Write test", &reason));
                }
                return results;
            }
            results.push(pass("Source Directory"));

            if cst.local_dir_is_mount_point() {
                if !crate::fsutil::is_mount_point(source) {
                    let reason = format!(
                        "Source directory: {source_dir} is not a mountpoint on the Data Warehouse"
                    );
                    results.push(fail("Source Directory is a Mountpoint", &reason));
                    if cst.remove_source_files() {
                        results.push(fail("Write test", &reason));
                    }
                    return results;
                }
                results.push(pass("Source Directory is a Mountpoint"));
            }

            if cst.remove_source_files() {
                if !crate::fsutil::verify_write_access(source) {
                    let reason = format!("Unable to delete source files from: {source_dir}");
                    results.push(fail("Write test", &reason));
                    return results;
                }
                results.push(pass("Write test"));
            }
        }

        TransferKind::Smb => {
            let mntpoint = scratch.mountpoint();
            if fs::create_dir(&mntpoint).is_err() {
                results.push(fail("SMB Server", "Unable to create SMB mountpoint"));
                return results;
            }

            let Some(smb_version) = detect_smb_version(&auth) else {
                let reason = format!(
                    "Could not connect to SMB Server: {} as {}",
                    auth.smb_server, auth.smb_user
                );
                results.push(fail("SMB Server", &reason));
                results.push(fail("SMB Share", &reason));
                results.push(fail("Source Directory", &reason));
                if cst.remove_source_files() {
                    results.push(fail("Write test", &reason));
                }
                return results;
            };
            results.push(pass("SMB Server"));

            if !mount_smb_share(&auth, &mntpoint, &smb_version, cst.remove_source_files()) {
                let reason = format!(
                    "Could not connect to SMB Server: {} as {}",
                    auth.smb_server, auth.smb_user
                );
                results.push(fail("SMB Share", &reason));
                results.push(fail("Source Directory", &reason));
                if cst.remove_source_files() {
                    results.push(fail("Write test", &reason));
                }
                return results;
            }
            results.push(pass("SMB Share"));

            let smb_source = mntpoint.join(source_dir.trim_start_matches('/'));
            if !smb_source.is_dir() {
                let reason = format!("Unable to find source directory: {source_dir} on SMB share");
                results.push(fail("Source Directory", &reason));
                if cst.remove_source_files() {
                    results.push(fail("Write test", &reason));
                }
                return results;
            }
            results.push(pass("Source Directory"));

            if cst.remove_source_files() {
                if !crate::fsutil::verify_write_access(&smb_source) {
                    let reason =
                        format!("Unable to delete source files from: {source_dir} on SMB share");
                    results.push(fail("Write test", &reason));
                    return results;
                }
                results.push(pass("Write test"));
            }
        }

        TransferKind::Rsync => {
            let password_file = match scratch.write_password_file(&auth) {
                Ok(password_file) => password_file,
                Err(err) => {
                    let reason = format!("{err:#}");
                    results.push(fail("Writing temporary rsync password file", &reason));
                    results.push(fail("Rsync Connection", &reason));
                    results.push(fail("Source Directory", &reason));
                    return results;
                }
            };

            if !test_rsync_connection(auth.rsync_server, auth.rsync_user, password_file.as_deref()) {
                let reason = format!(
                    "Could not connect to Rsync Server: {} as {}",
                    auth.rsync_server, auth.rsync_user
                );
                results.push(fail("Rsync Connection", &reason));
                results.push(fail("Source Directory", &reason));
                return results;
            }
            results.push(pass("Rsync Connection"));

            let target = format!("{}{source_dir}", auth.rsync_server);
            if !test_rsync_connection(&target, auth.rsync_user, password_file.as_deref()) {
                let reason = format!(
                    "Unable to find source directory: {source_dir} on the Rsync Server: {}",
                    auth.rsync_server
                );
                results.push(fail("Source Directory", &reason));
                return results;
            }
            results.push(pass("Source Directory"));
        }

        TransferKind::Ssh => {
            if !test_ssh_connection(&auth) {
                let reason = format!(
                    "Unable to connect to ssh server: {} as {}",
                    auth.ssh_server, auth.ssh_user
                );
                results.push(fail("SSH Connection", &reason));
                results.push(fail("Source Directory", &reason));
                return results;
            }
            results.push(pass("SSH Connection"));

            let listing = build_ssh_command(
                &["-o", "StrictHostKeyChecking=no"],
                auth.ssh_user,
                auth.ssh_server,
                &format!("ls \"{source_dir}\""),
                auth.ssh_pass,
                auth.ssh_use_key,
            );
            let reachable = listing
                .and_then(|cmd| {
                    Command::new(&cmd[0])
                        .args(&cmd[1..])
                        .output()
                        .context("ssh listing failed")
                })
                .map(|output| output.status.success())
                .unwrap_or(false);

            if !reachable {
                let reason = format!(
                    "Unable to find source directory: {source_dir} on the SSH Server: {}",
                    auth.ssh_server
                );
                results.push(fail("Source Directory", &reason));
                return results;
            }
            results.push(pass("Source Directory"));
        }
    }

    results
}

/// Kind-dispatched connection test of a cruise-data destination, shaped
/// like the source probe.
pub fn test_cdt_destination(cdt: &CruiseDataTransfer) -> Vec<JobPart> {
    let auth = RemoteAuth::from(cdt);
    let Some(kind) = cdt.kind() else {
        warn!("unknown transfer type");
        return vec![fail("Cruise data transfer type", "Unknown transfer type")];
    };

    let scratch = match TransferScratch::new() {
        Ok(scratch) => scratch,
        Err(err) => return vec![fail("Create temporary directory", &format!("{err:#}"))],
    };

    let mut results = Vec::new();
    match kind {
        TransferKind::Local => {
            let dest = Path::new(&cdt.dest_dir);
            if !dest.is_dir() {
                results.push(fail(
                    "Destination Directory",
                    &format!("Unable to find destination directory: {}", cdt.dest_dir),
                ));
                return results;
            }
            results.push(pass("Destination Directory"));

            if !crate::fsutil::verify_write_access(dest) {
                results.push(fail(
                    "Write test",
                    &format!("Unable to write to destination directory: {}", cdt.dest_dir),
                ));
                return results;
            }
            results.push(pass("Write test"));
        }

        TransferKind::Smb => {
            let mntpoint = scratch.mountpoint();
            if fs::create_dir(&mntpoint).is_err() {
                results.push(fail("SMB Server", "Unable to create SMB mountpoint"));
                return results;
            }

            let Some(smb_version) = detect_smb_version(&auth) else {
                let reason = format!(
                    "Could not connect to SMB Server: {} as {}",
                    auth.smb_server, auth.smb_user
                );
                results.push(fail("SMB Server", &reason));
                results.push(fail("Destination Directory", &reason));
                return results;
            };
            results.push(pass("SMB Server"));

            if !mount_smb_share(&auth, &mntpoint, &smb_version, true) {
                let reason = format!(
                    "Could not connect to SMB Server: {} as {}",
                    auth.smb_server, auth.smb_user
                );
                results.push(fail("Destination Directory", &reason));
                return results;
            }

            let smb_dest = mntpoint.join(cdt.dest_dir.trim_start_matches('/'));
            if !smb_dest.is_dir() {
                results.push(fail(
                    "Destination Directory",
                    &format!("Unable to find destination directory: {} on SMB share", cdt.dest_dir),
                ));
                return results;
            }
            results.push(pass("Destination Directory"));
        }

        TransferKind::Rsync => {
            let password_file = match scratch.write_password_file(&auth) {
                Ok(password_file) => password_file,
                Err(err) => {
                    let reason = format!("{err:#}");
                    results.push(fail("Writing temporary rsync password file", &reason));
                    results.push(fail("Rsync Connection", &reason));
                    return results;
                }
            };

            if !test_rsync_connection(auth.rsync_server, auth.rsync_user, password_file.as_deref()) {
                let reason = format!(
                    "Could not connect to Rsync Server: {} as {}",
                    auth.rsync_server, auth.rsync_user
                );
                results.push(fail("Rsync Connection", &reason));
                results.push(fail("Destination Directory", &reason));
                return results;
            }
            results.push(pass("Rsync Connection"));

            let target = format!("{}{}", auth.rsync_server, cdt.dest_dir);
            if !test_rsync_connection(&target, auth.rsync_user, password_file.as_deref()) {
                results.push(fail(
                    "Destination Directory",
                    &format!(
                        "Unable to find destination directory: {} on the Rsync Server: {}",
                        cdt.dest_dir, auth.rsync_server
                    ),
                ));
                return results;
            }
            results.push(pass("Destination Directory"));
        }

        TransferKind::Ssh => {
            if !test_ssh_connection(&auth) {
                let reason = format!(
                    "Unable to connect to ssh server: {} as {}",
                    auth.ssh_server, auth.ssh_user
                );
                results.push(fail("SSH Connection", &reason));
                results.push(fail("Destination Directory", &reason));
                return results;
            }
            results.push(pass("SSH Connection"));

            let listing = build_ssh_command(
                &["-o", "StrictHostKeyChecking=no"],
                auth.ssh_user,
                auth.ssh_server,
                &format!("ls \"{}\"", cdt.dest_dir),
                auth.ssh_pass,
                auth.ssh_use_key,
            );
            let reachable = listing
                .and_then(|cmd| {
                    Command::new(&cmd[0])
                        .args(&cmd[1..])
                        .output()
                        .context("ssh listing failed")
                })
                .map(|output| output.status.success())
                .unwrap_or(false);

            if !reachable {
                results.push(fail(
                    "Destination Directory",
                    &format!(
                        "Unable to find destination directory: {} on the SSH Server: {}",
                        cdt.dest_dir, auth.ssh_server
                    ),
                ));
                return results;
            }
            results.push(pass("Destination Directory"));
        }
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;

    fn behavior() -> RsyncBehavior {
        RsyncBehavior::default()
    }

    #[test]
    fn dry_run_options_baseline() {
        let flags = build_rsync_options(TransferKind::Local, &behavior(), RsyncMode::DryRun, false);
        assert_eq!(flags[0], "-trinv");
        assert!(flags.contains(&"--protect-args".to_string()));
        assert!(flags.contains(&"--dry-run".to_string()));
        assert!(flags.contains(&"--stats".to_string()));
        assert!(!flags.contains(&"--progress".to_string()));
    }

    #[test]
    fn real_options_baseline() {
        let flags = build_rsync_options(TransferKind::Local, &behavior(), RsyncMode::Real, false);
        assert_eq!(flags[0], "-triv");
        assert!(flags.contains(&"--progress".to_string()));
        assert!(!flags.contains(&"--dry-run".to_string()));
    }

    #[test]
    fn darwin_drops_protect_args() {
        let flags = build_rsync_options(TransferKind::Ssh, &behavior(), RsyncMode::Real, true);
        assert!(!flags.contains(&"--protect-args".to_string()));
    }

    #[test]
    fn conditional_flags_appear_in_real_mode_only() {
        let behavior = RsyncBehavior {
            skip_empty_files: true,
            skip_empty_dirs: true,
            bandwidth_limit_kbps: 512,
            remove_source_files: true,
            delete_extraneous: true,
        };

        let real = build_rsync_options(TransferKind::Rsync, &behavior, RsyncMode::Real, false);
        assert!(real.contains(&"--min-size=1".to_string()));
        assert!(real.contains(&"-m".to_string()));
        assert!(real.contains(&"--bwlimit=512".to_string()));
        assert!(real.contains(&"--remove-source-files".to_string()));
        assert!(real.contains(&"--delete".to_string()));
        assert!(real.contains(&"--no-motd".to_string()));

        let dry = build_rsync_options(TransferKind::Rsync, &behavior, RsyncMode::DryRun, false);
        assert!(!dry.contains(&"--bwlimit=512".to_string()));
        assert!(!dry.contains(&"--remove-source-files".to_string()));
        assert!(!dry.contains(&"--delete".to_string()));
        assert!(!dry.contains(&"--no-motd".to_string()));
    }

    #[test]
    fn rsync_command_shape() {
        let cmd = build_rsync_command(
            &["-triv".to_string()],
            &["-e".to_string(), "ssh".to_string()],
            "user@host:/data/",
            Some("/cruise/SCS"),
            Some(Path::new("/tmp/list.txt")),
        );
        assert_eq!(
            cmd,
            vec![
                "rsync",
                "-triv",
                "-e",
                "ssh",
                "--files-from=/tmp/list.txt",
                "user@host:/data/",
                "/cruise/SCS"
            ]
        );
    }

    #[test]
    fn rsync_command_without_dest_or_includes() {
        let cmd = build_rsync_command(
            &["--no-motd".to_string()],
            &[],
            "rsync://anonymous@server",
            None,
            None,
        );
        assert_eq!(cmd, vec!["rsync", "--no-motd", "rsync://anonymous@server"]);
    }

    #[test]
    fn ssh_command_key_and_password_forms() {
        let keyed = build_ssh_command(&[], "survey", "192.168.1.5", "uname -s", "", true).unwrap();
        assert_eq!(keyed[0], "ssh");

        let password =
            build_ssh_command(&[], "survey", "192.168.1.5", "uname -s", "hunter2", false).unwrap();
        assert_eq!(password[0], "sshpass");
        assert!(password.contains(&"PubkeyAuthentication=no".to_string()));
        assert_eq!(password.last().unwrap(), "uname -s");
    }

    #[test]
    fn ssh_command_requires_some_auth() {
        assert!(build_ssh_command(&[], "survey", "host", "ls", "", false).is_err());
    }

    #[test]
    fn local_source_test_reports_missing_directory() {
        let cst = CollectionSystemTransfer {
            transfer_type: "1".into(),
            remove_source_files: "1".into(),
            ..CollectionSystemTransfer::default()
        };
        let parts = test_cst_source(&cst, "/definitely/not/here");
        assert_eq!(parts.last().unwrap().result, PartResult::Fail);
        // Source-dir failure fans out to the dependent checks.
        assert_eq!(parts.len(), 2);
    }

    #[test]
    fn local_source_test_passes_for_real_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let cst = CollectionSystemTransfer {
            transfer_type: "1".into(),
            ..CollectionSystemTransfer::default()
        };
        let parts = test_cst_source(&cst, &tmp.path().to_string_lossy());
        assert!(parts.iter().all(|p| p.result == PartResult::Pass));
    }

    #[test]
    fn unknown_kind_fails_immediately() {
        let cst = CollectionSystemTransfer {
            transfer_type: "9".into(),
            ..CollectionSystemTransfer::default()
        };
        let parts = test_cst_source(&cst, "/tmp");
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].result, PartResult::Fail);
    }

    #[test]
    fn local_destination_test_checks_writability() {
        let tmp = tempfile::tempdir().unwrap();
        let cdt = CruiseDataTransfer {
            transfer_type: "1".into(),
            dest_dir: tmp.path().to_string_lossy().to_string(),
            ..CruiseDataTransfer::default()
        };
        let parts = test_cdt_destination(&cdt);
        assert!(parts.iter().all(|p| p.result == PartResult::Pass));
        assert_eq!(parts.len(), 2);
    }
}
