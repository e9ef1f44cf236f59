//! Transfer executor: spawn the transfer subprocess, stream its merged
//! output line by line, classify created/updated files, translate progress
//! markers into job-status updates, and honor cooperative cancellation.

use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::LazyLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, bounded};
use regex::Regex;
use tracing::{debug, info};

static TO_CHK_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"to-chk=(\d+)/(\d+)").unwrap());
static RCLONE_PROGRESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Transferred:\s+[\d.]+\s*\w+\s*/\s*[\d.]+\s*\w+,\s*(\d+)%").unwrap());

/// Rsync exit code for vanished source files, tolerated as success.
pub const RSYNC_VANISHED: i32 = 24;

/// Classification of one itemized rsync output line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineClass {
    /// `>f+++++++++ path` / `<f+++++++++ path`: newly created file.
    New(String),
    /// `>f.…` / `<f.…`: updated file.
    Updated(String),
}

/// Classify an itemized-changes line; `None` for everything else.
pub fn classify_line(line: &str) -> Option<LineClass> {
    let path_of = |line: &str| line.split_once(' ').map(|(_, path)| path.to_string());

    if line.starts_with(">f+++++++++") || line.starts_with("<f+++++++++") {
        return path_of(line).map(LineClass::New);
    }
    if line.starts_with(">f.") || line.starts_with("<f.") {
        return path_of(line).map(LineClass::Updated);
    }
    None
}

/// Extract `(remaining, total)` from a `to-chk=a/b` progress line.
pub fn parse_to_chk(line: &str) -> Option<(u64, u64)> {
    let caps = TO_CHK_RE.captures(line)?;
    Some((caps[1].parse().ok()?, caps[2].parse().ok()?))
}

/// Percent complete from an rclone `Transferred: … nn%` line.
pub fn parse_rclone_percent(line: &str) -> Option<u8> {
    let caps = RCLONE_PROGRESS_RE.captures(line)?;
    caps[1].parse().ok()
}

/// Regular-file count from an rsync `--stats` dry run.
pub fn parse_stats_file_count(stdout: &str) -> Option<u64> {
    for line in stdout.lines() {
        if let Some(rest) = line.strip_prefix("Number of regular files transferred:") {
            return rest.trim().replace(',', "").parse().ok();
        }
    }
    None
}

/// Result of a transfer run.
#[derive(Debug, Default)]
pub struct TransferOutcome {
    pub new: Vec<String>,
    pub updated: Vec<String>,
    pub exit_code: Option<i32>,
    pub cancelled: bool,
}

impl TransferOutcome {
    /// Non-zero exit is a failure, except rsync's vanished-files code.
    pub fn succeeded(&self) -> bool {
        !self.cancelled && matches!(self.exit_code, None | Some(0) | Some(RSYNC_VANISHED))
    }
}

fn spawn_merged(cmd: &[String]) -> Result<(Child, Receiver<String>)> {
    let mut child = Command::new(&cmd[0])
        .args(&cmd[1..])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(Stdio::null())
        .spawn()
        .with_context(|| format!("failed to spawn transfer command {}", cmd[0]))?;

    let (tx, rx) = bounded::<String>(256);

    let stdout = child.stdout.take().context("transfer child has no stdout")?;
    let stderr = child.stderr.take().context("transfer child has no stderr")?;

    fn pump<R: Read + Send + 'static>(reader: R, tx: crossbeam_channel::Sender<String>) {
        thread::spawn(move || {
            for line in BufReader::new(reader).lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
    }

    pump(stdout, tx.clone());
    pump(stderr, tx);

    Ok((child, rx))
}

/// Run an rsync-style transfer. Classifies itemized lines into new/updated
/// file lists and reports integer percent changes from `to-chk=` markers via
/// `on_percent`. With `file_count == 0` nothing is spawned.
pub fn run_transfer_command(
    cmd: &[String],
    file_count: usize,
    cancel: &AtomicBool,
    mut on_percent: impl FnMut(u8),
) -> Result<TransferOutcome> {
    if file_count == 0 {
        info!("skipping transfer command: nothing to transfer");
        return Ok(TransferOutcome::default());
    }

    debug!("transfer command: {}", cmd.join(" "));

    let (mut child, lines) = spawn_merged(cmd)?;
    let mut outcome = TransferOutcome::default();
    let mut last_percent: i32 = -1;

    loop {
        if cancel.load(Ordering::SeqCst) {
            info!("stopping transfer");
            let _ = child.kill();
            outcome.cancelled = true;
            break;
        }

        match lines.recv_timeout(Duration::from_millis(250)) {
            Ok(line) => {
                let line = line.trim_end();
                if line.is_empty() {
                    continue;
                }

                match classify_line(line) {
                    Some(LineClass::New(path)) => outcome.new.push(path),
                    Some(LineClass::Updated(path)) => outcome.updated.push(path),
                    None => {}
                }

                if let Some((remaining, total)) = parse_to_chk(line)
                    && total > 0
                {
                    let percent = (100 * (total - remaining) / total) as i32;
                    if percent != last_percent {
                        info!("progress update: {percent}%");
                        on_percent(percent as u8);
                        last_percent = percent;
                    }
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                if let Some(status) = child.try_wait().ok().flatten() {
                    // Drain whatever arrived between the timeout and exit.
                    while let Ok(line) = lines.try_recv() {
                        match classify_line(line.trim_end()) {
                            Some(LineClass::New(path)) => outcome.new.push(path),
                            Some(LineClass::Updated(path)) => outcome.updated.push(path),
                            None => {}
                        }
                    }
                    outcome.exit_code = status.code();
                    return Ok(outcome);
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }

    let status = child.wait().context("failed to wait for transfer child")?;
    if !outcome.cancelled {
        outcome.exit_code = status.code();
    }
    Ok(outcome)
}

/// Run an `rclone copy` transfer, parsing `Transferred: … nn%` lines for
/// progress. Rclone does not itemize per-file changes, so the outcome's
/// file lists stay empty.
pub fn run_rclone_command(
    cmd: &[String],
    file_count: usize,
    cancel: &AtomicBool,
    mut on_percent: impl FnMut(u8),
) -> Result<TransferOutcome> {
    if file_count == 0 {
        info!("skipping transfer command: nothing to transfer");
        return Ok(TransferOutcome::default());
    }

    debug!("transfer command: {}", cmd.join(" "));

    let (mut child, lines) = spawn_merged(cmd)?;
    let mut outcome = TransferOutcome::default();
    let mut last_percent: i32 = -1;

    loop {
        if cancel.load(Ordering::SeqCst) {
            info!("stopping transfer");
            let _ = child.kill();
            outcome.cancelled = true;
            break;
        }

        match lines.recv_timeout(Duration::from_millis(250)) {
            Ok(line) => {
                debug!("rclone output: {line}");
                if let Some(percent) = parse_rclone_percent(&line) {
                    let percent = percent as i32;
                    if percent != last_percent {
                        info!("progress update: {percent}%");
                        on_percent(percent as u8);
                        last_percent = percent;
                    }
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                if let Some(status) = child.try_wait().ok().flatten() {
                    outcome.exit_code = status.code();
                    return Ok(outcome);
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }

    let status = child.wait().context("failed to wait for transfer child")?;
    if !outcome.cancelled {
        outcome.exit_code = status.code();
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_new_and_updated_lines() {
        assert_eq!(
            classify_line(">f+++++++++ path/to/new.bin"),
            Some(LineClass::New("path/to/new.bin".into()))
        );
        assert_eq!(
            classify_line("<f+++++++++ pulled/new.bin"),
            Some(LineClass::New("pulled/new.bin".into()))
        );
        assert_eq!(
            classify_line(">f.st...... path/to/upd.bin"),
            Some(LineClass::Updated("path/to/upd.bin".into()))
        );
        assert_eq!(classify_line("cd+++++++++ somedir/"), None);
        assert_eq!(classify_line("sent 1,234 bytes"), None);
    }

    #[test]
    fn to_chk_progress_scenario() {
        let line = "          32,768  45%    1.23MB/s    0:00:01 (xfr#3, to-chk=55/100)";
        let (remaining, total) = parse_to_chk(line).unwrap();
        assert_eq!((remaining, total), (55, 100));
        assert_eq!(100 * (total - remaining) / total, 45);
        assert_eq!(parse_to_chk("no progress here"), None);
    }

    #[test]
    fn rclone_progress_line() {
        let line = "Transferred:       1.234 GiB / 2.5 GiB, 49%, 1.2 MiB/s, ETA 1m2s";
        assert_eq!(parse_rclone_percent(line), Some(49));
        assert_eq!(parse_rclone_percent("Transferred: 12 / 30, 40% done"), None);
    }

    #[test]
    fn stats_file_count_parses_with_separators() {
        let stdout = "Number of files: 2,391\nNumber of regular files transferred: 1,204\n";
        assert_eq!(parse_stats_file_count(stdout), Some(1204));
        assert_eq!(parse_stats_file_count("no stats"), None);
    }

    #[test]
    fn zero_file_count_spawns_nothing() {
        let cancel = AtomicBool::new(false);
        let outcome = run_transfer_command(
            &["/definitely/not/a/binary".to_string()],
            0,
            &cancel,
            |_| {},
        )
        .unwrap();
        assert!(outcome.new.is_empty());
        assert!(outcome.succeeded());
    }

    #[test]
    fn collects_files_and_progress_from_scripted_output() {
        let script = r#"
            echo '>f+++++++++ SCS/new1.raw'
            echo '>f.st...... SCS/upd1.raw'
            echo '     1,000 10% 0.5MB/s 0:00:01 (xfr#1, to-chk=1/2)'
            echo '>f+++++++++ SCS/new2.raw'
            echo '     2,000 100% 0.5MB/s 0:00:02 (xfr#2, to-chk=0/2)'
        "#;
        let cmd = vec!["sh".to_string(), "-c".to_string(), script.to_string()];

        let cancel = AtomicBool::new(false);
        let mut percents = Vec::new();
        let outcome =
            run_transfer_command(&cmd, 3, &cancel, |p| percents.push(p)).unwrap();

        assert_eq!(outcome.new, vec!["SCS/new1.raw", "SCS/new2.raw"]);
        assert_eq!(outcome.updated, vec!["SCS/upd1.raw"]);
        assert_eq!(percents, vec![50, 100]);
        assert!(outcome.succeeded());
    }

    #[test]
    fn nonzero_exit_fails_except_vanished() {
        let cancel = AtomicBool::new(false);

        let failing = vec!["sh".to_string(), "-c".to_string(), "exit 12".to_string()];
        let outcome = run_transfer_command(&failing, 1, &cancel, |_| {}).unwrap();
        assert_eq!(outcome.exit_code, Some(12));
        assert!(!outcome.succeeded());

        let vanished = vec!["sh".to_string(), "-c".to_string(), "exit 24".to_string()];
        let outcome = run_transfer_command(&vanished, 1, &cancel, |_| {}).unwrap();
        assert!(outcome.succeeded());
    }

    #[test]
    fn cancellation_kills_long_running_child() {
        let cmd = vec!["sh".to_string(), "-c".to_string(), "sleep 30".to_string()];
        let cancel = AtomicBool::new(true);
        let outcome = run_transfer_command(&cmd, 1, &cancel, |_| {}).unwrap();
        assert!(outcome.cancelled);
        assert!(!outcome.succeeded());
    }

    #[test]
    fn rclone_runner_reports_percent_changes_only() {
        let script = r#"
            echo 'Transferred:       100 MiB / 400 MiB, 25%, 10 MiB/s, ETA 30s'
            echo 'Transferred:       100 MiB / 400 MiB, 25%, 10 MiB/s, ETA 30s'
            echo 'Transferred:       400 MiB / 400 MiB, 100%, 10 MiB/s, ETA 0s'
        "#;
        let cmd = vec!["sh".to_string(), "-c".to_string(), script.to_string()];

        let cancel = AtomicBool::new(false);
        let mut percents = Vec::new();
        let outcome = run_rclone_command(&cmd, 5, &cancel, |p| percents.push(p)).unwrap();

        assert_eq!(percents, vec![25, 100]);
        assert!(outcome.succeeded());
    }
}
