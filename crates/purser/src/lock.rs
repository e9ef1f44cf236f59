//! Per-cruise index lock.
//!
//! The MD5 summary and dashboard manifest are rewritten wholesale, and two
//! transfers finishing at the same time would otherwise race on them. The
//! lock file lives inside the cruise directory and holds JSON metadata about
//! the holder (pid, hostname, acquisition time).

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const LOCK_FILE: &str = ".index.lock";

/// A lock older than this is presumed abandoned and taken over.
const STALE_AFTER: Duration = Duration::from_secs(600);

/// Information stored in the lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
}

/// Held lock; released on drop.
#[derive(Debug)]
pub struct IndexLock {
    path: PathBuf,
}

impl IndexLock {
    /// Try once to acquire the lock for `cruise_dir`.
    pub fn try_acquire(cruise_dir: &Path) -> Result<Self> {
        let lock_path = cruise_dir.join(LOCK_FILE);

        if lock_path.exists() {
            match Self::read_info(&lock_path) {
                Ok(info) => {
                    let age = Utc::now() - info.acquired_at;
                    if age.num_seconds().unsigned_abs() > STALE_AFTER.as_secs() {
                        fs::remove_file(&lock_path).with_context(|| {
                            format!("failed to remove stale lock {}", lock_path.display())
                        })?;
                    } else {
                        bail!(
                            "index lock already held by pid {} on {} since {}",
                            info.pid,
                            info.hostname,
                            info.acquired_at
                        );
                    }
                }
                // Corrupt lock file: take it over.
                Err(_) => {
                    fs::remove_file(&lock_path).with_context(|| {
                        format!("failed to remove corrupt lock {}", lock_path.display())
                    })?;
                }
            }
        }

        let info = LockInfo {
            pid: std::process::id(),
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            acquired_at: Utc::now(),
        };

        let json = serde_json::to_string_pretty(&info).context("failed to serialize lock info")?;
        let tmp_path = lock_path.with_extension("lock.tmp");
        {
            let mut file = File::create(&tmp_path)
                .with_context(|| format!("failed to create lock file {}", tmp_path.display()))?;
            file.write_all(json.as_bytes())
                .with_context(|| format!("failed to write lock file {}", tmp_path.display()))?;
            file.sync_all().context("failed to sync lock file")?;
        }
        fs::rename(&tmp_path, &lock_path)
            .with_context(|| format!("failed to rename lock into place {}", lock_path.display()))?;

        Ok(Self { path: lock_path })
    }

    /// Acquire with retries, polling until `timeout` elapses.
    pub fn acquire(cruise_dir: &Path, timeout: Duration) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        loop {
            match Self::try_acquire(cruise_dir) {
                Ok(lock) => return Ok(lock),
                Err(err) => {
                    if Instant::now() >= deadline {
                        return Err(err.context("timed out waiting for index lock"));
                    }
                    thread::sleep(Duration::from_millis(250));
                }
            }
        }
    }

    fn read_info(path: &Path) -> Result<LockInfo> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read lock file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse lock file {}", path.display()))
    }
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release() {
        let tmp = tempfile::tempdir().unwrap();
        let lock_path = tmp.path().join(LOCK_FILE);

        {
            let _lock = IndexLock::try_acquire(tmp.path()).unwrap();
            assert!(lock_path.exists());
            // A second holder is refused while the first is alive.
            assert!(IndexLock::try_acquire(tmp.path()).is_err());
        }
        assert!(!lock_path.exists());
    }

    #[test]
    fn stale_lock_is_taken_over() {
        let tmp = tempfile::tempdir().unwrap();
        let lock_path = tmp.path().join(LOCK_FILE);

        let stale = LockInfo {
            pid: 1,
            hostname: "old-host".into(),
            acquired_at: Utc::now() - chrono::Duration::hours(2),
        };
        fs::write(&lock_path, serde_json::to_string(&stale).unwrap()).unwrap();

        let _lock = IndexLock::try_acquire(tmp.path()).unwrap();
        let info = IndexLock::read_info(&lock_path).unwrap();
        assert_eq!(info.pid, std::process::id());
    }

    #[test]
    fn corrupt_lock_is_taken_over() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join(LOCK_FILE), "not json").unwrap();
        assert!(IndexLock::try_acquire(tmp.path()).is_ok());
    }

    #[test]
    fn acquire_with_timeout_gives_up() {
        let tmp = tempfile::tempdir().unwrap();
        let _held = IndexLock::try_acquire(tmp.path()).unwrap();
        let result = IndexLock::acquire(tmp.path(), Duration::from_millis(300));
        assert!(result.is_err());
    }
}
