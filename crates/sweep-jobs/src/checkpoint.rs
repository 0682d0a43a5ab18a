//! Job progress checkpoints.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sweep_store::Cursor;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::JobError;

/// Progress of a job after its last fully-settled page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job: String,
    /// Records read so far.
    pub processed_count: u64,
    /// Continuation of the job's outer read; `None` before the first page.
    pub last_cursor: Option<Cursor>,
    pub dry_run: bool,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn start(job: impl Into<String>, dry_run: bool, now: DateTime<Utc>) -> Self {
        Self {
            job: job.into(),
            processed_count: 0,
            last_cursor: None,
            dry_run,
            updated_at: now,
        }
    }

    /// Ensure this checkpoint may seed a run of `job` in the given mode.
    pub fn check_compatible(&self, job: &str, dry_run: bool) -> Result<(), JobError> {
        if self.job != job {
            return Err(JobError::CheckpointMismatch(format!(
                "checkpoint belongs to job {}, not {}",
                self.job, job
            )));
        }
        if self.dry_run != dry_run {
            let mode = |dry: bool| if dry { "dry run" } else { "real run" };
            return Err(JobError::CheckpointMismatch(format!(
                "checkpoint was written by a {} and cannot resume a {}",
                mode(self.dry_run),
                mode(dry_run)
            )));
        }
        Ok(())
    }
}

/// Where checkpoints are persisted between runs.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self) -> Result<Option<Checkpoint>, JobError>;
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), JobError>;
    /// Remove the checkpoint after a clean completion.
    async fn clear(&self) -> Result<(), JobError>;
}

/// A checkpoint kept in a JSON file, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Default checkpoint file for a job inside `dir`.
    pub fn for_job(dir: impl AsRef<Path>, job: &str) -> Self {
        let file_name: String = job
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        Self::new(dir.as_ref().join(format!("{}.json", file_name)))
    }

    /// Default directory for checkpoint files.
    pub fn default_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sweep")
            .join("checkpoints")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self) -> Result<Option<Checkpoint>, JobError> {
        if !fs::try_exists(&self.path).await? {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path).await?;
        let checkpoint = serde_json::from_str(&content).map_err(|e| {
            JobError::Checkpoint(format!("{}: {}", self.path.display(), e))
        })?;
        Ok(Some(checkpoint))
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), JobError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(checkpoint)?;

        let temp_path = self.path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(content.as_bytes()).await?;
        file.sync_all().await?;
        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), JobError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process checkpoint store for tests.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    current: Mutex<Option<Checkpoint>>,
    history: Mutex<Vec<Checkpoint>>,
    saves: AtomicUsize,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> Option<Checkpoint> {
        self.current.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Every checkpoint saved, oldest first.
    pub fn history(&self) -> Vec<Checkpoint> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }
}

fn poisoned() -> JobError {
    JobError::Checkpoint("checkpoint lock poisoned".to_string())
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self) -> Result<Option<Checkpoint>, JobError> {
        Ok(self.current())
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), JobError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        *self.current.lock().map_err(|_| poisoned())? = Some(checkpoint.clone());
        self.history
            .lock()
            .map_err(|_| poisoned())?
            .push(checkpoint.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<(), JobError> {
        *self.current.lock().map_err(|_| poisoned())? = None;
        Ok(())
    }
}
