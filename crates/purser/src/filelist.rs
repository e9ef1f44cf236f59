//! File-list builder: enumerate a transfer source (directory walk or remote
//! rsync listing), classify every entry through the transfer's filters and
//! time window, and optionally re-verify staleness before the transfer runs.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::NaiveDateTime;
use crossbeam_channel::{bounded, unbounded};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::filters::{FilterOutcome, FilterSet, TokenContext, is_ascii, is_rsync_partial};
use crate::types::{CollectionSystemTransfer, TransferKind};

/// Batch size fed to the classification pool.
const BATCH_SIZE: usize = 500;
/// Classification worker count.
const MAX_WORKERS: usize = 16;

/// Epoch-seconds defaults for the transfer time window.
pub const EPOCH_START: &str = "1970/01/01 00:00";
pub const FAR_FUTURE_END: &str = "9999/12/31 23:59:59";

/// Parse a window start (`YYYY/mm/dd HH:MM`) into epoch seconds.
pub fn parse_window_start(s: &str) -> Result<i64> {
    NaiveDateTime::parse_from_str(s, "%Y/%m/%d %H:%M")
        .map(|dt| dt.and_utc().timestamp())
        .with_context(|| format!("bad window start: {s}"))
}

/// Parse a window end (`YYYY/mm/dd HH:MM:SS`) into epoch seconds.
pub fn parse_window_end(s: &str) -> Result<i64> {
    NaiveDateTime::parse_from_str(s, "%Y/%m/%d %H:%M:%S")
        .map(|dt| dt.and_utc().timestamp())
        .with_context(|| format!("bad window end: {s}"))
}

/// The classified file list, paths relative to the effective source root.
#[derive(Debug, Default)]
pub struct FileList {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    /// Sizes parallel to `include`, used by the staleness re-check.
    pub sizes: Vec<u64>,
}

/// Inputs for one build.
pub struct FileListRequest<'a> {
    pub cst: &'a CollectionSystemTransfer,
    /// Token-expanded source directory (no mount prefix applied).
    pub source_dir: &'a str,
    /// SMB mountpoint to prefix onto `source_dir`, when mounted.
    pub mount_prefix: Option<&'a Path>,
    pub password_file: Option<&'a Path>,
    pub is_darwin: bool,
    pub token_ctx: &'a TokenContext,
    /// Inclusive epoch-second bounds on file modification time.
    pub data_start: i64,
    pub data_end: i64,
}

impl FileListRequest<'_> {
    fn effective_source(&self) -> PathBuf {
        match self.mount_prefix {
            Some(prefix) => prefix.join(self.source_dir.trim_start_matches('/')),
            None => PathBuf::from(self.source_dir),
        }
    }
}

#[derive(Debug, Clone)]
enum Classified {
    Include { path: String, size: u64 },
    Exclude { path: String },
}

/// One enumerated candidate, before filtering.
#[derive(Debug, Clone)]
struct Candidate {
    /// Path as enumerated: absolute for walks, source-relative for remote
    /// listings.
    path: String,
    mtime: i64,
    size: u64,
}

fn classify(candidate: &Candidate, filters: &FilterSet, start: i64, end: i64) -> Option<Classified> {
    if candidate.mtime < start || candidate.mtime > end {
        return None;
    }
    if !is_ascii(&candidate.path) {
        return Some(Classified::Exclude {
            path: candidate.path.clone(),
        });
    }
    let name = candidate.path.rsplit('/').next().unwrap_or(&candidate.path);
    if is_rsync_partial(name) {
        warn!("ignoring {}, this is an rsync partial file", candidate.path);
        return None;
    }

    match filters.classify(&candidate.path) {
        FilterOutcome::Drop => None,
        FilterOutcome::Include => Some(Classified::Include {
            path: candidate.path.clone(),
            size: candidate.size,
        }),
        FilterOutcome::Exclude => Some(Classified::Exclude {
            path: candidate.path.clone(),
        }),
    }
}

/// Fan batches out to a bounded pool; ordering of results is not preserved.
fn classify_batches(
    candidates: Vec<Candidate>,
    filters: &FilterSet,
    start: i64,
    end: i64,
    cancel: &AtomicBool,
) -> Vec<Classified> {
    let (batch_tx, batch_rx) = bounded::<Vec<Candidate>>(MAX_WORKERS);
    // Every batch is queued before results are drained; the result side
    // must not apply backpressure.
    let (result_tx, result_rx) = unbounded::<Vec<Classified>>();

    thread::scope(|scope| {
        for _ in 0..MAX_WORKERS {
            let batch_rx = batch_rx.clone();
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                while let Ok(batch) = batch_rx.recv() {
                    let classified = batch
                        .iter()
                        .filter_map(|c| classify(c, filters, start, end))
                        .collect();
                    if result_tx.send(classified).is_err() {
                        break;
                    }
                }
            });
        }
        drop(batch_rx);
        drop(result_tx);

        let mut batches_sent = 0usize;
        let mut chunks = candidates.chunks(BATCH_SIZE);
        let mut collected = Vec::new();

        loop {
            if cancel.load(Ordering::SeqCst) {
                break;
            }
            match chunks.next() {
                Some(chunk) => {
                    if batch_tx.send(chunk.to_vec()).is_err() {
                        break;
                    }
                    batches_sent += 1;
                }
                None => break,
            }
        }
        drop(batch_tx);

        for _ in 0..batches_sent {
            match result_rx.recv() {
                Ok(mut classified) => collected.append(&mut classified),
                Err(_) => break,
            }
        }
        collected
    })
}

/// Walk a local or mounted source, skipping symlinks.
fn enumerate_walk(source: &Path) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    for entry in WalkDir::new(source).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() || entry.path_is_symlink() {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        candidates.push(Candidate {
            path: entry.path().to_string_lossy().to_string(),
            mtime,
            size: meta.len(),
        });
    }
    candidates
}

/// Build the `rsync -r` enumeration command for a remote source.
fn remote_list_command(req: &FileListRequest) -> Result<Vec<String>> {
    let cst = req.cst;
    let mut cmd: Vec<String> = vec!["rsync".into(), "-r".into()];

    match cst.kind() {
        Some(TransferKind::Rsync) => {
            if let Some(password_file) = req.password_file {
                cmd.push(format!("--password-file={}", password_file.display()));
            }
            cmd.push("--no-motd".into());
            cmd.push(format!(
                "rsync://{}@{}{}/",
                cst.rsync_user, cst.rsync_server, req.source_dir
            ));
        }
        Some(TransferKind::Ssh) => {
            if !req.is_darwin {
                cmd.insert(2, "--protect-args".into());
            }
            cmd.push("-e".into());
            cmd.push("ssh".into());
            cmd.push(format!(
                "{}@{}:{}/",
                cst.ssh_user, cst.ssh_server, req.source_dir
            ));
            if !cst.ssh_use_key() {
                let mut wrapped: Vec<String> =
                    vec!["sshpass".into(), "-p".into(), cst.ssh_pass.clone()];
                wrapped.extend(cmd);
                cmd = wrapped;
            }
        }
        _ => bail!("remote enumeration requested for a non-remote transfer"),
    }

    if cst.skip_empty_files() {
        cmd.insert(2, "--min-size=1".into());
    }
    if cst.skip_empty_dirs() {
        cmd.insert(2, "-m".into());
    }

    Ok(cmd)
}

/// Split on whitespace runs into at most `n` pieces; the final piece keeps
/// its internal spacing.
fn split_whitespace_n(s: &str, n: usize) -> Vec<&str> {
    let mut out = Vec::with_capacity(n);
    let mut rest = s.trim_start();
    while out.len() + 1 < n {
        match rest.find(char::is_whitespace) {
            Some(idx) => {
                out.push(&rest[..idx]);
                rest = rest[idx..].trim_start();
            }
            None => break,
        }
    }
    if !rest.is_empty() {
        out.push(rest);
    }
    out
}

/// Parse one `rsync -r` listing line into a candidate. Only regular files
/// (mode string starting `-`) qualify.
fn parse_listing_line(line: &str) -> Option<Candidate> {
    let parts = split_whitespace_n(line, 5);
    let [mode, size, date, time, path] = parts.as_slice() else {
        return None;
    };
    if !mode.starts_with('-') {
        return None;
    }
    let size = size.replace(',', "").parse().ok()?;

    let mtime = NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y/%m/%d %H:%M:%S")
        .map(|dt| dt.and_utc().timestamp())
        .ok()?;

    Some(Candidate {
        path: path.to_string(),
        mtime,
        size,
    })
}

fn enumerate_remote(req: &FileListRequest) -> Result<Vec<Candidate>> {
    let cmd = remote_list_command(req)?;
    debug!("file list command: {}", cmd.join(" "));

    let output = Command::new(&cmd[0])
        .args(&cmd[1..])
        .output()
        .context("failed to run remote enumeration")?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().filter_map(parse_listing_line).collect())
}

/// Build the include/exclude lists for a collection-system transfer.
///
/// Results are relative to the effective source root. With a staleness
/// window configured the builder sleeps that many seconds and drops any
/// include whose size changed, so files still being written are left for
/// the next run.
pub fn build(req: &FileListRequest, cancel: &AtomicBool) -> Result<FileList> {
    let cst = req.cst;
    let kind = cst.kind().context("unknown transfer type")?;
    let local_walk = matches!(kind, TransferKind::Local | TransferKind::Smb);
    let source = req.effective_source();

    let filters = FilterSet::from_transfer_filters(
        &cst.include_filter,
        &cst.exclude_filter,
        &cst.ignore_filter,
        req.token_ctx,
    )?;

    let candidates = if local_walk {
        enumerate_walk(&source)
    } else {
        enumerate_remote(req)?
    };
    debug!("discovered {} files", candidates.len());

    let classified = classify_batches(candidates, &filters, req.data_start, req.data_end, cancel);

    let mut list = FileList::default();
    for item in classified {
        match item {
            Classified::Include { path, size } => {
                list.include.push(path);
                list.sizes.push(size);
            }
            Classified::Exclude { path } => list.exclude.push(path),
        }
    }

    let staleness = cst.staleness_secs();
    if staleness > 0 && !cancel.load(Ordering::SeqCst) {
        debug!("checking staleness (wait {staleness}s)...");
        thread::sleep(Duration::from_secs(staleness));
        verify_staleness(req, &mut list, local_walk)?;
    }

    if local_walk {
        let base = source.to_string_lossy().to_string();
        let strip = |p: &String| {
            p.strip_prefix(&base)
                .map(|rest| rest.trim_start_matches('/').to_string())
                .unwrap_or_else(|| p.clone())
        };
        list.include = list.include.iter().map(strip).collect();
        list.exclude = list.exclude.iter().map(strip).collect();
    }

    Ok(list)
}

/// Drop includes whose size changed (or which vanished) during the wait.
fn verify_staleness(req: &FileListRequest, list: &mut FileList, local_walk: bool) -> Result<()> {
    let keep: Vec<bool> = if local_walk {
        list.include
            .iter()
            .zip(&list.sizes)
            .map(|(path, &size)| {
                fs::metadata(path).map(|m| m.len() == size).unwrap_or(false)
            })
            .collect()
    } else {
        let current: std::collections::HashMap<String, u64> = enumerate_remote(req)?
            .into_iter()
            .map(|c| (c.path, c.size))
            .collect();
        list.include
            .iter()
            .zip(&list.sizes)
            .map(|(path, &size)| current.get(path).map(|&s| s == size).unwrap_or(false))
            .collect()
    };

    let mut keep_iter = keep.iter();
    list.include.retain(|_| *keep_iter.next().unwrap_or(&false));
    let mut keep_iter = keep.iter();
    list.sizes.retain(|_| *keep_iter.next().unwrap_or(&false));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn cst_local(include: &str) -> CollectionSystemTransfer {
        CollectionSystemTransfer {
            transfer_type: "1".into(),
            include_filter: include.into(),
            staleness: "0".into(),
            ..CollectionSystemTransfer::default()
        }
    }

    fn ctx() -> TokenContext {
        TokenContext::new("FK250801", None, "Lowerings")
    }

    fn request<'a>(
        cst: &'a CollectionSystemTransfer,
        source: &'a str,
        token_ctx: &'a TokenContext,
    ) -> FileListRequest<'a> {
        FileListRequest {
            cst,
            source_dir: source,
            mount_prefix: None,
            password_file: None,
            is_darwin: false,
            token_ctx,
            data_start: 0,
            data_end: i64::MAX,
        }
    }

    #[test]
    fn window_parsers_accept_defaults() {
        assert_eq!(parse_window_start(EPOCH_START).unwrap(), 0);
        assert!(parse_window_end(FAR_FUTURE_END).unwrap() > 250_000_000_000);
        assert!(parse_window_start("31/12/2025 00:00").is_err());
    }

    #[test]
    fn walk_build_classifies_and_relativizes() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("nav")).unwrap();
        fs::write(tmp.path().join("nav/pos.txt"), b"data").unwrap();
        fs::write(tmp.path().join("nav/pos.bak"), b"data").unwrap();
        fs::write(tmp.path().join("readme.md"), b"data").unwrap();

        let mut cst = cst_local("*.txt");
        cst.ignore_filter = "*.bak".into();
        let token_ctx = ctx();
        let source = tmp.path().to_string_lossy().to_string();
        let req = request(&cst, &source, &token_ctx);

        let cancel = AtomicBool::new(false);
        let list = build(&req, &cancel).unwrap();

        assert_eq!(list.include, vec!["nav/pos.txt"]);
        assert_eq!(list.exclude, vec!["readme.md"]);
        assert_eq!(list.sizes, vec![4]);
    }

    #[test]
    fn symlinks_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("real.txt"), b"data").unwrap();
        std::os::unix::fs::symlink(tmp.path().join("real.txt"), tmp.path().join("link.txt"))
            .unwrap();

        let cst = cst_local("*");
        let token_ctx = ctx();
        let source = tmp.path().to_string_lossy().to_string();
        let req = request(&cst, &source, &token_ctx);

        let cancel = AtomicBool::new(false);
        let list = build(&req, &cancel).unwrap();
        assert_eq!(list.include, vec!["real.txt"]);
    }

    #[test]
    fn time_window_filters_by_mtime() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("now.txt"), b"data").unwrap();

        let cst = cst_local("*");
        let token_ctx = ctx();
        let source = tmp.path().to_string_lossy().to_string();
        let mut req = request(&cst, &source, &token_ctx);
        // Window that ended long ago: nothing qualifies.
        req.data_end = 1_000;

        let cancel = AtomicBool::new(false);
        let list = build(&req, &cancel).unwrap();
        assert!(list.include.is_empty());
        assert!(list.exclude.is_empty());
    }

    #[test]
    fn non_ascii_names_are_excluded_not_transferred() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("donn\u{e9}es.csv"), b"data").unwrap();
        fs::write(tmp.path().join("plain.csv"), b"data").unwrap();

        let cst = cst_local("*");
        let token_ctx = ctx();
        let source = tmp.path().to_string_lossy().to_string();
        let req = request(&cst, &source, &token_ctx);

        let cancel = AtomicBool::new(false);
        let list = build(&req, &cancel).unwrap();
        assert_eq!(list.include, vec!["plain.csv"]);
        assert_eq!(list.exclude.len(), 1);
    }

    #[test]
    fn rsync_partials_produce_no_record() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join(".gyro.log.Xy4_9a"), b"data").unwrap();

        let cst = cst_local("*");
        let token_ctx = ctx();
        let source = tmp.path().to_string_lossy().to_string();
        let req = request(&cst, &source, &token_ctx);

        let cancel = AtomicBool::new(false);
        let list = build(&req, &cancel).unwrap();
        assert!(list.include.is_empty());
        assert!(list.exclude.is_empty());
    }

    #[test]
    fn listing_line_parser_handles_rsync_output() {
        let c = parse_listing_line("-rw-r--r--      1,234 2025/08/01 12:30:00 nav/pos 01.txt")
            .unwrap();
        assert_eq!(c.path, "nav/pos 01.txt");
        assert_eq!(c.size, 1234);
        assert!(c.mtime > 1_700_000_000);

        assert!(parse_listing_line("drwxr-xr-x          4,096 2025/08/01 12:00:00 nav").is_none());
        assert!(parse_listing_line("garbage").is_none());
    }

    #[test]
    fn cancel_aborts_classification() {
        let tmp = tempfile::tempdir().unwrap();
        for i in 0..10 {
            fs::write(tmp.path().join(format!("f{i}.txt")), b"data").unwrap();
        }

        let cst = cst_local("*");
        let token_ctx = ctx();
        let source = tmp.path().to_string_lossy().to_string();
        let req = request(&cst, &source, &token_ctx);

        let cancel = AtomicBool::new(true);
        let list = build(&req, &cancel).unwrap();
        assert!(list.include.is_empty());
    }
}
