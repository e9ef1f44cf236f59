//! MD5 summary index: a sorted `<32-hex> <path>` stream describing the
//! cruise tree, with a sibling file holding the MD5 of the summary itself.
//!
//! MD5 is a content fingerprint here, not a security primitive.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use md5::{Digest, Md5};
use tracing::{debug, warn};

/// Placeholder recorded for files above the configured size limit.
pub const OVERSIZE_HASH: &str = "********************************";

/// One `hash filename` row of the summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashEntry {
    pub hash: String,
    pub filename: String,
}

/// Hex MD5 of a file's contents, streamed in 64 KiB chunks.
pub fn hash_file(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Md5::new();
    let mut buf = [0u8; 65_536];

    loop {
        let n = reader
            .read(&mut buf)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hash every file in `filelist` (paths relative to `cruise_dir`). Files
/// larger than `filesize_limit` bytes are recorded as [`OVERSIZE_HASH`];
/// unreadable files are logged and skipped. The loop honors the cancel flag
/// and reports coarse progress through `progress`.
pub fn build_hashes(
    cruise_dir: &Path,
    filelist: &[String],
    filesize_limit: Option<u64>,
    cancel: &AtomicBool,
    mut progress: impl FnMut(usize, usize),
) -> Vec<HashEntry> {
    let mut hashes = Vec::with_capacity(filelist.len());

    for (idx, filename) in filelist.iter().enumerate() {
        if cancel.load(Ordering::SeqCst) {
            debug!("stopping hash build");
            break;
        }

        let filepath = cruise_dir.join(filename);
        let over_limit = match filesize_limit {
            Some(limit) => filepath.metadata().map(|m| m.len() >= limit).unwrap_or(false),
            None => false,
        };

        let hash = if over_limit {
            Ok(OVERSIZE_HASH.to_string())
        } else {
            hash_file(&filepath)
        };

        match hash {
            Ok(hash) => hashes.push(HashEntry {
                hash,
                filename: filename.clone(),
            }),
            Err(err) => {
                warn!("could not generate md5 hash for {filename}: {err:#}");
            }
        }

        progress(idx + 1, filelist.len());
    }

    hashes
}

/// In-memory summary, merged and rewritten wholesale.
#[derive(Debug, Default)]
pub struct Md5Summary {
    entries: Vec<HashEntry>,
}

impl Md5Summary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an existing summary file. Rows without a space are skipped.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read MD5 summary {}", path.display()))?;

        let entries = content
            .lines()
            .filter_map(|line| {
                line.split_once(' ').map(|(hash, filename)| HashEntry {
                    hash: hash.to_string(),
                    filename: filename.to_string(),
                })
            })
            .collect();

        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[HashEntry] {
        &self.entries
    }

    /// Replace the hash of known filenames and append the rest. Returns
    /// (updated, added) counts.
    pub fn merge(&mut self, new_hashes: Vec<HashEntry>) -> (usize, usize) {
        let mut index: HashMap<String, usize> = self
            .entries
            .iter()
            .enumerate()
            .map(|(idx, e)| (e.filename.clone(), idx))
            .collect();

        let mut updated = 0;
        let mut added = 0;
        for new in new_hashes {
            match index.get(&new.filename) {
                Some(&idx) => {
                    self.entries[idx].hash = new.hash;
                    updated += 1;
                }
                None => {
                    index.insert(new.filename.clone(), self.entries.len());
                    self.entries.push(new);
                    added += 1;
                }
            }
        }
        (updated, added)
    }

    /// Drop rows for the given filenames. Returns the number removed.
    pub fn remove(&mut self, deleted: &[String]) -> usize {
        if deleted.is_empty() {
            return 0;
        }
        let before = self.entries.len();
        self.entries.retain(|e| !deleted.contains(&e.filename));
        before - self.entries.len()
    }

    /// Write the summary sorted by filename, atomically.
    pub fn write(&mut self, path: &Path) -> Result<()> {
        self.entries.sort_by(|a, b| a.filename.cmp(&b.filename));

        let mut body = String::new();
        for entry in &self.entries {
            body.push_str(&entry.hash);
            body.push(' ');
            body.push_str(&entry.filename);
            body.push('\n');
        }

        crate::fsutil::write_atomic(path, body.as_bytes())
            .with_context(|| format!("error updating MD5 summary file {}", path.display()))
    }
}

/// Write `{summary}.md5`: a single MD5 line covering the summary file.
pub fn write_summary_md5(summary_path: &Path, md5_path: &Path) -> Result<()> {
    let hash = hash_file(summary_path)?;
    crate::fsutil::write_atomic(md5_path, hash.as_bytes())
        .with_context(|| format!("error saving MD5 summary MD5 file {}", md5_path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn no_cancel() -> AtomicBool {
        AtomicBool::new(false)
    }

    #[test]
    fn hash_file_matches_known_digest() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("f.txt");
        fs::write(&path, b"hello world").unwrap();
        // md5("hello world")
        assert_eq!(hash_file(&path).unwrap(), "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[test]
    fn merge_updates_adds_and_removes() {
        let tmp = tempfile::tempdir().unwrap();
        let summary_path = tmp.path().join("MD5_Summary.txt");
        fs::write(
            &summary_path,
            "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa dir/a.txt\n\
             bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb dir/b.txt\n",
        )
        .unwrap();

        let mut summary = Md5Summary::load(&summary_path).unwrap();
        let (updated, added) = summary.merge(vec![
            HashEntry {
                hash: "cccccccccccccccccccccccccccccccc".into(),
                filename: "dir/a.txt".into(),
            },
            HashEntry {
                hash: "dddddddddddddddddddddddddddddddd".into(),
                filename: "dir/c.txt".into(),
            },
        ]);
        assert_eq!((updated, added), (1, 1));
        assert_eq!(summary.remove(&["dir/b.txt".to_string()]), 1);

        summary.write(&summary_path).unwrap();
        let content = fs::read_to_string(&summary_path).unwrap();
        assert_eq!(
            content,
            "cccccccccccccccccccccccccccccccc dir/a.txt\n\
             dddddddddddddddddddddddddddddddd dir/c.txt\n"
        );
    }

    #[test]
    fn write_sorts_by_filename() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("MD5_Summary.txt");

        let mut summary = Md5Summary::new();
        summary.merge(vec![
            HashEntry { hash: "2".repeat(32), filename: "z.txt".into() },
            HashEntry { hash: "1".repeat(32), filename: "a.txt".into() },
        ]);
        summary.write(&path).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let files: Vec<&str> = content
            .lines()
            .map(|l| l.split_once(' ').unwrap().1)
            .collect();
        assert_eq!(files, vec!["a.txt", "z.txt"]);
    }

    #[test]
    fn oversize_files_get_placeholder_hash() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("big.bin"), vec![0u8; 2048]).unwrap();
        fs::write(tmp.path().join("small.bin"), vec![0u8; 16]).unwrap();

        let hashes = build_hashes(
            tmp.path(),
            &["big.bin".to_string(), "small.bin".to_string()],
            Some(1024),
            &no_cancel(),
            |_, _| {},
        );

        assert_eq!(hashes[0].hash, OVERSIZE_HASH);
        assert_ne!(hashes[1].hash, OVERSIZE_HASH);
    }

    #[test]
    fn missing_files_are_skipped_not_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("there.bin"), b"x").unwrap();

        let hashes = build_hashes(
            tmp.path(),
            &["missing.bin".to_string(), "there.bin".to_string()],
            None,
            &no_cancel(),
            |_, _| {},
        );

        assert_eq!(hashes.len(), 1);
        assert_eq!(hashes[0].filename, "there.bin");
    }

    #[test]
    fn summary_md5_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let summary_path = tmp.path().join("MD5_Summary.txt");
        let md5_path = tmp.path().join("MD5_Summary.md5");

        let mut summary = Md5Summary::new();
        summary.merge(vec![HashEntry {
            hash: "e".repeat(32),
            filename: "a.txt".into(),
        }]);
        summary.write(&summary_path).unwrap();
        write_summary_md5(&summary_path, &md5_path).unwrap();

        let written = fs::read_to_string(&md5_path).unwrap();
        assert_eq!(written, hash_file(&summary_path).unwrap());
        assert_eq!(written.len(), 32);
    }
}
