//! [`WatermarkStore`] backed by one JSON document per project.
//!
//! Layout under the state directory:
//!
//! ```text
//! <owner>__<repo>.json   watermark record, replaced atomically on write
//! <owner>__<repo>.lock   run lock, created exclusively, removed on unlock
//! ```

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use watcher::{ProjectId, RunId, StoreError, Timestamp, Watermark, WatermarkStore};

use crate::io::{atomic_write, read_optional};

/// Age after which a run lock is considered abandoned.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(15 * 60);

/// Persisted watermark document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatermarkRecord {
    /// Project the watermark belongs to.
    pub project: ProjectId,
    /// Last successful check; `None` after a reset to "never".
    pub last_checked: Option<Timestamp>,
    /// Run that wrote this record.
    pub written_by: RunId,
    /// Wall-clock time of the write.
    pub updated_at: Timestamp,
}

impl WatermarkRecord {
    /// Returns the recorded watermark.
    pub fn watermark(&self) -> Watermark {
        self.last_checked.into()
    }
}

/// Contents of a run lock file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Run holding the lock.
    pub run_id: RunId,
    /// When the lock was taken.
    pub acquired_at: Timestamp,
    /// Process id of the holder.
    pub pid: u32,
}

impl std::fmt::Display for LockRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "run {} (pid {}) since {}",
            self.run_id, self.pid, self.acquired_at
        )
    }
}

/// File-backed watermark store.
#[derive(Debug, Clone)]
pub struct FileWatermarkStore {
    dir: PathBuf,
    lock_ttl: Duration,
}

impl FileWatermarkStore {
    /// Creates a store rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock_ttl: DEFAULT_LOCK_TTL,
        }
    }

    /// Sets the age after which a run lock is broken.
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Returns the full persisted record for `project`, if any.
    pub async fn inspect(&self, project: &ProjectId) -> Result<Option<WatermarkRecord>, StoreError> {
        let this = self.clone();
        let project = project.clone();
        blocking(move || this.load(&project)).await
    }

    /// Returns the current lock holder for `project`, if the lock is held.
    pub async fn lock_holder(&self, project: &ProjectId) -> Result<Option<LockRecord>, StoreError> {
        let this = self.clone();
        let project = project.clone();
        blocking(move || this.read_lock(&this.lock_path(&project))).await
    }

    fn file_stem(project: &ProjectId) -> String {
        format!("{}__{}", project.owner(), project.name())
    }

    fn state_path(&self, project: &ProjectId) -> PathBuf {
        self.dir.join(format!("{}.json", Self::file_stem(project)))
    }

    fn lock_path(&self, project: &ProjectId) -> PathBuf {
        self.dir.join(format!("{}.lock", Self::file_stem(project)))
    }

    // -----------------------------------------------------------------------
    // Watermark document
    // -----------------------------------------------------------------------

    fn load(&self, project: &ProjectId) -> Result<Option<WatermarkRecord>, StoreError> {
        let path = self.state_path(project);
        let Some(text) = read_optional(&path).map_err(|e| unavailable(&path, e))? else {
            return Ok(None);
        };
        let record: WatermarkRecord = serde_json::from_str(&text).map_err(|e| StoreError::Corrupt {
            message: format!("{}: {e}", path.display()),
        })?;
        if &record.project != project {
            return Err(StoreError::Corrupt {
                message: format!(
                    "{} belongs to '{}', expected '{project}'",
                    path.display(),
                    record.project
                ),
            });
        }
        Ok(Some(record))
    }

    fn save(&self, project: &ProjectId, watermark: Watermark, run: RunId) -> Result<(), StoreError> {
        let path = self.state_path(project);
        let record = WatermarkRecord {
            project: project.clone(),
            last_checked: watermark.timestamp(),
            written_by: run,
            updated_at: Timestamp::now(),
        };
        let data = serde_json::to_vec_pretty(&record).map_err(|e| StoreError::Unavailable {
            message: format!("failed to encode watermark record: {e}"),
        })?;
        atomic_write(&path, &data).map_err(|e| unavailable(&path, e))?;
        debug!(path = %path.display(), %watermark, "watermark persisted");
        Ok(())
    }

    fn write_guarded(
        &self,
        project: &ProjectId,
        checked_at: Timestamp,
        run: RunId,
    ) -> Result<(), StoreError> {
        let stored = self
            .load(project)?
            .map_or(Watermark::Never, |r| r.watermark());
        let attempted = Watermark::CheckedAt(checked_at);
        if stored > attempted {
            return Err(StoreError::Regression { stored, attempted });
        }
        self.save(project, attempted, run)
    }

    // -----------------------------------------------------------------------
    // Run lock
    // -----------------------------------------------------------------------

    fn acquire(&self, project: &ProjectId, run: RunId) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| unavailable(&self.dir, e))?;
        let path = self.lock_path(project);
        let record = LockRecord {
            run_id: run,
            acquired_at: Timestamp::now(),
            pid: std::process::id(),
        };
        let payload = serde_json::to_vec(&record).map_err(|e| StoreError::Unavailable {
            message: format!("failed to encode lock record: {e}"),
        })?;

        // Second attempt only happens after a stale or vanished lock.
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    if let Err(e) = file.write_all(&payload).and_then(|_| file.sync_all()) {
                        let _ = std::fs::remove_file(&path);
                        return Err(unavailable(&path, e));
                    }
                    debug!(path = %path.display(), "run lock acquired");
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let Some(age) = lock_age(&path) else {
                        continue;
                    };
                    if age < self.lock_ttl {
                        return Err(StoreError::Locked {
                            project: project.clone(),
                            holder: self.describe_holder(&path),
                        });
                    }
                    warn!(
                        path = %path.display(),
                        holder = %self.describe_holder(&path),
                        age_secs = age.as_secs(),
                        "breaking stale run lock"
                    );
                    match std::fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => return Err(unavailable(&path, e)),
                    }
                }
                Err(e) => return Err(unavailable(&path, e)),
            }
        }

        Err(StoreError::Locked {
            project: project.clone(),
            holder: self.describe_holder(&path),
        })
    }

    fn release(&self, project: &ProjectId, run: RunId) -> Result<(), StoreError> {
        let path = self.lock_path(project);
        match self.read_lock(&path) {
            Ok(Some(holder)) if holder.run_id == run => match std::fs::remove_file(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), "run lock released");
                    Ok(())
                }
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(unavailable(&path, e)),
            },
            Ok(Some(holder)) => {
                warn!(%holder, "run lock is held by another run; leaving it in place");
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn read_lock(&self, path: &Path) -> Result<Option<LockRecord>, StoreError> {
        let Some(text) = read_optional(path).map_err(|e| unavailable(path, e))? else {
            return Ok(None);
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                message: format!("{}: {e}", path.display()),
            })
    }

    fn describe_holder(&self, path: &Path) -> String {
        match self.read_lock(path) {
            Ok(Some(record)) => record.to_string(),
            _ => format!("unknown holder ({})", path.display()),
        }
    }
}

/// Time since the lock file was last modified, or `None` if it is gone.
fn lock_age(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(modified.elapsed().unwrap_or(Duration::ZERO))
}

fn unavailable(path: &Path, err: std::io::Error) -> StoreError {
    StoreError::Unavailable {
        message: format!("{}: {err}", path.display()),
    }
}

async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Unavailable {
            message: format!("storage task failed: {e}"),
        })?
}

#[async_trait]
impl WatermarkStore for FileWatermarkStore {
    #[instrument(skip_all, fields(project = %project))]
    async fn read(&self, project: &ProjectId) -> Result<Watermark, StoreError> {
        let record = self.inspect(project).await?;
        Ok(record.map_or(Watermark::Never, |r| r.watermark()))
    }

    #[instrument(skip_all, fields(project = %project, %checked_at))]
    async fn write(
        &self,
        project: &ProjectId,
        checked_at: Timestamp,
        run: RunId,
    ) -> Result<(), StoreError> {
        let this = self.clone();
        let project = project.clone();
        blocking(move || this.write_guarded(&project, checked_at, run)).await
    }

    #[instrument(skip_all, fields(project = %project, %watermark))]
    async fn reset(
        &self,
        project: &ProjectId,
        watermark: Watermark,
        run: RunId,
    ) -> Result<(), StoreError> {
        let this = self.clone();
        let project = project.clone();
        blocking(move || this.save(&project, watermark, run)).await
    }

    async fn lock(&self, project: &ProjectId, run: RunId) -> Result<(), StoreError> {
        let this = self.clone();
        let project = project.clone();
        blocking(move || this.acquire(&project, run)).await
    }

    async fn unlock(&self, project: &ProjectId, run: RunId) -> Result<(), StoreError> {
        let this = self.clone();
        let project = project.clone();
        blocking(move || this.release(&project, run)).await
    }
}
