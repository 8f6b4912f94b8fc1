//! Coordination state persistence.
//!
//! [`StateStore`] is the seam between the coordinator and disk. The
//! coordinator keeps the state in memory behind a single async mutex and
//! saves after every mutation, so one process never interleaves writers.
//! [`StateLock`] extends that guarantee across processes with an advisory
//! lock file created via `O_CREAT | O_EXCL`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{DispatchError, Result};
use crate::state::CoordinationState;

/// Load/save interface for the coordination document.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Returns `None` when nothing has been saved yet.
    async fn load(&self) -> Result<Option<CoordinationState>>;

    async fn save(&self, state: &CoordinationState) -> Result<()>;
}

/// Single JSON file on local disk.
pub struct FsStateStore {
    path: PathBuf,
}

impl FsStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StateStore for FsStateStore {
    async fn load(&self) -> Result<Option<CoordinationState>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(DispatchError::Persistence(format!(
                    "failed to read {}: {e}",
                    self.path.display()
                )))
            }
        };
        let state = serde_json::from_slice(&bytes).map_err(|e| {
            DispatchError::Parse(format!("{} is not valid state: {e}", self.path.display()))
        })?;
        Ok(Some(state))
    }

    async fn save(&self, state: &CoordinationState) -> Result<()> {
        let json = serde_json::to_vec_pretty(state)?;
        let path = self.path.clone();

        // Atomic write: temp file in the same directory, then rename.
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let dir = match path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
                _ => PathBuf::from("."),
            };
            fs::create_dir_all(&dir)?;
            let mut tmp = NamedTempFile::new_in(&dir)?;
            tmp.write_all(&json)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| DispatchError::Persistence(format!("save task failed: {e}")))?
        .map_err(|e| {
            DispatchError::Persistence(format!("failed to write {}: {e}", self.path.display()))
        })
    }
}

/// In-memory store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<Option<CoordinationState>>,
    fail_saves: Mutex<bool>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: CoordinationState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
            fail_saves: Mutex::new(false),
        }
    }

    /// Make every subsequent `save` fail, to exercise persistence error paths.
    pub fn fail_saves(&self, fail: bool) {
        *self.fail_saves.lock().unwrap() = fail;
    }

    /// The last successfully saved state.
    pub fn saved(&self) -> Option<CoordinationState> {
        self.state.lock().unwrap().clone()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<Option<CoordinationState>> {
        Ok(self.state.lock().unwrap().clone())
    }

    async fn save(&self, state: &CoordinationState) -> Result<()> {
        if *self.fail_saves.lock().unwrap() {
            return Err(DispatchError::Persistence("simulated save failure".to_string()));
        }
        *self.state.lock().unwrap() = Some(state.clone());
        Ok(())
    }
}

/// Contents of the advisory lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

/// Cross-process advisory lock over the state directory.
///
/// A lock is reclaimed only when its holder is gone: the recorded pid is no
/// longer running. Where process liveness cannot be probed, a lock older
/// than `stale_after` counts as abandoned instead. Removed on drop, but only
/// while the file still names this holder.
#[derive(Debug)]
pub struct StateLock {
    path: PathBuf,
    info: LockInfo,
}

/// A lock file that cannot be parsed is a writer caught mid-write until it
/// is this old.
const UNREADABLE_GRACE: Duration = Duration::from_secs(2);

impl StateLock {
    /// Try once to take the lock.
    pub fn acquire(path: impl Into<PathBuf>, stale_after: Duration) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let info = LockInfo {
                        pid: std::process::id(),
                        acquired_at: Utc::now(),
                    };
                    file.write_all(&serde_json::to_vec(&info)?)?;
                    file.sync_all()?;
                    tracing::debug!(path = %path.display(), "state lock acquired");
                    return Ok(Self { path, info });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = Self::read(&path);
                    let stale = match &holder {
                        Some(info) => info.is_abandoned(stale_after),
                        None => file_age(&path).is_some_and(|age| age > UNREADABLE_GRACE),
                    };
                    if stale {
                        tracing::warn!(
                            path = %path.display(),
                            pid = holder.as_ref().map(|h| h.pid),
                            "removing stale state lock"
                        );
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    let info = holder.unwrap_or(LockInfo {
                        pid: 0,
                        acquired_at: Utc::now(),
                    });
                    return Err(DispatchError::Locked {
                        pid: info.pid,
                        since: info.acquired_at.to_rfc3339(),
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(DispatchError::Persistence(format!(
            "could not acquire lock {}",
            path.display()
        )))
    }

    /// Poll for the lock until `wait` elapses.
    pub async fn acquire_with_wait(
        path: impl Into<PathBuf>,
        stale_after: Duration,
        wait: Duration,
    ) -> Result<Self> {
        let path = path.into();
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            match Self::acquire(&path, stale_after) {
                Err(DispatchError::Locked { .. }) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                other => return other,
            }
        }
    }

    pub fn read(path: &Path) -> Option<LockInfo> {
        let bytes = fs::read(path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LockInfo {
    /// True when the holder can no longer be running.
    pub fn is_abandoned(&self, stale_after: Duration) -> bool {
        match pid_alive(self.pid) {
            Some(alive) => !alive,
            None => Utc::now()
                .signed_duration_since(self.acquired_at)
                .to_std()
                .is_ok_and(|age| age > stale_after),
        }
    }
}

fn file_age(path: &Path) -> Option<Duration> {
    fs::metadata(path).ok()?.modified().ok()?.elapsed().ok()
}

/// Whether a process with this pid exists; `None` where it cannot be probed.
#[cfg(unix)]
fn pid_alive(pid: u32) -> Option<bool> {
    let Ok(pid) = i32::try_from(pid) else {
        return Some(false);
    };
    if pid <= 0 {
        return Some(false);
    }
    // SAFETY: signal 0 only checks for existence, nothing is delivered.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return Some(true);
    }
    // EPERM: the process exists but belongs to another user.
    Some(std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM))
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> Option<bool> {
    None
}

impl Drop for StateLock {
    fn drop(&mut self) {
        // The file may have been reclaimed and re-created by another holder.
        if Self::read(&self.path).as_ref() != Some(&self.info) {
            tracing::warn!(path = %self.path.display(), "state lock no longer ours, leaving it");
            return;
        }
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release state lock");
        }
    }
}
