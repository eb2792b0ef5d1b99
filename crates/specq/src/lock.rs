//! Single-instance run lock.
//!
//! Only one agent run may target a given repository at a time — two
//! concurrent runs would race on git state and the diff snapshot. The
//! lock file lives at `.specq/lock` and records enough to tell an
//! operator who is holding it.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const LOCK_FILE: &str = "lock";

/// Default age past which a lock is considered abandoned rather than
/// actively held — long enough to outlast any single pipeline cycle.
pub const STALE_AFTER: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
    pub change_id: Option<String>,
}

/// Held for the lifetime of a pipeline run; releases the lock file on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Acquire a lock in `state_dir`, removing it first if it is older
    /// than `STALE_AFTER` (the previous holder likely crashed).
    pub fn acquire(state_dir: &Path) -> Result<Self> {
        fs::create_dir_all(state_dir)
            .with_context(|| format!("failed to create {}", state_dir.display()))?;

        let path = state_dir.join(LOCK_FILE);
        if path.exists() {
            match read_info(&path) {
                Ok(info) => {
                    let age = Utc::now() - info.acquired_at;
                    if age.num_seconds().unsigned_abs() > STALE_AFTER.as_secs() {
                        fs::remove_file(&path)
                            .with_context(|| format!("failed to remove stale lock {}", path.display()))?;
                    } else {
                        bail!(
                            "another run holds the lock (pid {} on {}, held for {})",
                            info.pid,
                            info.hostname,
                            humantime::format_duration(Duration::from_secs(age.num_seconds().max(0) as u64)),
                        );
                    }
                }
                Err(_) => {
                    fs::remove_file(&path)
                        .with_context(|| format!("failed to remove corrupt lock {}", path.display()))?;
                }
            }
        }

        let info = LockInfo {
            pid: std::process::id(),
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            acquired_at: Utc::now(),
            change_id: None,
        };
        write_info(&path, &info)?;

        Ok(Self { path })
    }

    /// Record which change this run is currently driving, for operators
    /// inspecting a held lock from another shell.
    pub fn set_change(&self, change_id: &str) -> Result<()> {
        let mut info = read_info(&self.path)?;
        info.change_id = Some(change_id.to_string());
        write_info(&self.path, &info)
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn read_info(path: &Path) -> Result<LockInfo> {
    let raw = fs::read_to_string(path).with_context(|| format!("failed to read lock {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse lock {}", path.display()))
}

fn write_info(path: &Path, info: &LockInfo) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let json = serde_json::to_string_pretty(info).context("failed to serialize lock info")?;
    {
        let mut file = File::create(&tmp).with_context(|| format!("failed to create {}", tmp.display()))?;
        file.write_all(json.as_bytes())
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        file.sync_all().context("failed to sync lock file")?;
    }
    fs::rename(&tmp, path).with_context(|| format!("failed to rename lock into place at {}", path.display()))
}
