// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Checkpoints and their pluggable stores.
//!
//! A checkpoint is a persisted snapshot of long-running task state
//! sufficient to resume: phase, step, partial results, context, artifacts.
//! Sequences are dense and increasing per (task, worker), starting at 1;
//! after every save the store is pruned to the most recent
//! `max_checkpoints`.
//!
//! Two stores ship in-crate: [`MemoryCheckpointStore`] for tests and
//! short-lived work, and [`FileCheckpointStore`] writing bincode payloads
//! wrapped in a magic/version/CRC32/length header via atomic temp-file
//! renames, with a cross-process directory lock on writes. Corrupt files are
//! skipped with a warning during listing rather than failing recovery.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use dashmem::ScalarValue;

use crate::error::{ExecutorError, ExecutorResult};

/// Magic bytes identifying a DashMem checkpoint file.
const CHECKPOINT_MAGIC: &[u8; 4] = b"DMCP";

/// Current checkpoint file format version.
const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// Header size: magic(4) + version(4) + crc32(4) + length(8).
const CHECKPOINT_HEADER_SIZE: usize = 20;

/// Resumable task state captured at a step boundary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    /// Phase the task was in.
    pub phase: String,
    /// Completed steps within that phase.
    pub step: usize,
    /// Total steps across all phases.
    pub total_steps: usize,
    /// Ordered results of every completed step so far.
    pub partial_results: Vec<serde_json::Value>,
    /// Task-defined scalar context.
    pub context: HashMap<String, ScalarValue>,
    /// Ordered artifact references.
    pub artifacts: Vec<String>,
}

/// A persisted snapshot of task progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCheckpoint {
    /// Unique within (task_id, worker_id).
    pub id: String,
    /// Owning task.
    pub task_id: String,
    /// Worker that was executing the task.
    pub worker_id: String,
    /// Dense, monotonic per task; starts at 1.
    pub sequence: u64,
    /// Save timestamp (ms).
    pub timestamp: i64,
    /// Resumable state.
    pub state: CheckpointState,
    /// Completed fraction in [0, 1].
    pub progress: f64,
    /// User-defined metadata.
    pub metadata: HashMap<String, String>,
}

impl TaskCheckpoint {
    /// Build a checkpoint with the canonical id shape
    /// `{task_id}:{worker_id}:seq-{sequence}`.
    #[must_use]
    pub fn new(
        task_id: impl Into<String>,
        worker_id: impl Into<String>,
        sequence: u64,
        state: CheckpointState,
        progress: f64,
    ) -> Self {
        let task_id = task_id.into();
        let worker_id = worker_id.into();
        Self {
            id: format!("{task_id}:{worker_id}:seq-{sequence}"),
            task_id,
            worker_id,
            sequence,
            timestamp: dashmem::types::now_ms(),
            state,
            progress: progress.clamp(0.0, 1.0),
            metadata: HashMap::new(),
        }
    }
}

/// Pluggable checkpoint persistence.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a checkpoint; an existing id is overwritten.
    async fn save(&self, checkpoint: TaskCheckpoint) -> ExecutorResult<()>;

    /// Load by id.
    async fn load(&self, id: &str) -> ExecutorResult<Option<TaskCheckpoint>>;

    /// All checkpoints for a (task, worker) pair, ascending by sequence.
    async fn list(&self, task_id: &str, worker_id: &str) -> ExecutorResult<Vec<TaskCheckpoint>>;

    /// Highest-sequence checkpoint for the pair. Default: `list` and take
    /// the last; override when the backend can do better.
    async fn load_latest(
        &self,
        task_id: &str,
        worker_id: &str,
    ) -> ExecutorResult<Option<TaskCheckpoint>> {
        Ok(self.list(task_id, worker_id).await?.pop())
    }

    /// Delete by id. Idempotent.
    async fn delete(&self, id: &str) -> ExecutorResult<()>;

    /// Delete everything for a (task, worker) pair. Idempotent.
    async fn delete_all(&self, task_id: &str, worker_id: &str) -> ExecutorResult<()> {
        for checkpoint in self.list(task_id, worker_id).await? {
            self.delete(&checkpoint.id).await?;
        }
        Ok(())
    }

    /// Prune to the `max` most recent checkpoints. Returns how many were
    /// removed.
    async fn prune(&self, task_id: &str, worker_id: &str, max: usize) -> ExecutorResult<usize> {
        let checkpoints = self.list(task_id, worker_id).await?;
        if checkpoints.len() <= max {
            return Ok(0);
        }
        let excess = checkpoints.len() - max;
        for checkpoint in checkpoints.into_iter().take(excess) {
            self.delete(&checkpoint.id).await?;
        }
        Ok(excess)
    }
}

/// In-memory checkpoint storage. Does not persist across restarts.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<HashMap<String, TaskCheckpoint>>,
}

impl MemoryCheckpointStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored checkpoints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.checkpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// True when nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: TaskCheckpoint) -> ExecutorResult<()> {
        let mut checkpoints = self.checkpoints.lock().unwrap_or_else(|e| e.into_inner());
        checkpoints.insert(checkpoint.id.clone(), checkpoint);
        Ok(())
    }

    async fn load(&self, id: &str) -> ExecutorResult<Option<TaskCheckpoint>> {
        let checkpoints = self.checkpoints.lock().unwrap_or_else(|e| e.into_inner());
        Ok(checkpoints.get(id).cloned())
    }

    async fn list(&self, task_id: &str, worker_id: &str) -> ExecutorResult<Vec<TaskCheckpoint>> {
        let checkpoints = self.checkpoints.lock().unwrap_or_else(|e| e.into_inner());
        let mut matching: Vec<TaskCheckpoint> = checkpoints
            .values()
            .filter(|cp| cp.task_id == task_id && cp.worker_id == worker_id)
            .cloned()
            .collect();
        matching.sort_by_key(|cp| cp.sequence);
        Ok(matching)
    }

    async fn delete(&self, id: &str) -> ExecutorResult<()> {
        let mut checkpoints = self.checkpoints.lock().unwrap_or_else(|e| e.into_inner());
        checkpoints.remove(id);
        Ok(())
    }
}

/// Wrap payload bytes with the integrity header.
fn wrap(data: &[u8]) -> Vec<u8> {
    let checksum = crc32fast::hash(data);
    let mut out = Vec::with_capacity(CHECKPOINT_HEADER_SIZE + data.len());
    out.extend_from_slice(CHECKPOINT_MAGIC);
    out.extend_from_slice(&CHECKPOINT_FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&checksum.to_le_bytes());
    out.extend_from_slice(&(data.len() as u64).to_le_bytes());
    out.extend_from_slice(data);
    out
}

/// Verify the integrity header and return the payload slice.
fn unwrap(data: &[u8], source: &str) -> ExecutorResult<Vec<u8>> {
    let fail = |reason: String| ExecutorError::IntegrityCheckFailed {
        checkpoint_id: source.to_string(),
        reason,
    };
    if data.len() < CHECKPOINT_HEADER_SIZE {
        return Err(fail(format!("file too small: {} bytes", data.len())));
    }
    if &data[0..4] != CHECKPOINT_MAGIC {
        return Err(fail(format!("bad magic bytes {:?}", &data[0..4])));
    }
    let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    if version > CHECKPOINT_FORMAT_VERSION {
        return Err(fail(format!("unsupported format version {version}")));
    }
    let stored_checksum = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
    let declared_len = u64::from_le_bytes([
        data[12], data[13], data[14], data[15], data[16], data[17], data[18], data[19],
    ]);
    let payload = &data[CHECKPOINT_HEADER_SIZE..];
    if declared_len != payload.len() as u64 {
        return Err(fail(format!(
            "length mismatch: declared {declared_len}, actual {}",
            payload.len()
        )));
    }
    let computed = crc32fast::hash(payload);
    if stored_checksum != computed {
        return Err(fail(format!(
            "checksum mismatch: stored 0x{stored_checksum:08X}, computed 0x{computed:08X}"
        )));
    }
    Ok(payload.to_vec())
}

/// File-based checkpoint storage.
///
/// One bincode file per checkpoint, integrity-wrapped, written atomically
/// under a cross-process directory lock. Thread-safe and durable across
/// restarts.
pub struct FileCheckpointStore {
    directory: PathBuf,
}

impl FileCheckpointStore {
    /// Create the store, creating the directory if needed.
    pub fn new(directory: impl Into<PathBuf>) -> ExecutorResult<Self> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory)?;
        Ok(Self { directory })
    }

    fn sanitize(id: &str) -> String {
        id.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect()
    }

    fn checkpoint_path(&self, id: &str) -> PathBuf {
        self.directory.join(format!("{}.bin", Self::sanitize(id)))
    }

    fn lock_path(&self) -> PathBuf {
        self.directory.join(".checkpoint.lock")
    }

    /// Exclusive directory lock held for the duration of a write. Released
    /// when the returned file handle drops.
    fn acquire_lock(&self) -> std::io::Result<std::fs::File> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(self.lock_path())?;
        fs2::FileExt::lock_exclusive(&file)?;
        Ok(file)
    }

    fn write_file(&self, path: &Path, checkpoint: &TaskCheckpoint) -> ExecutorResult<()> {
        let serialized =
            bincode::serialize(checkpoint).map_err(|e| ExecutorError::Serialization {
                reason: format!("failed to serialize checkpoint '{}': {e}", checkpoint.id),
            })?;
        let data = wrap(&serialized);

        let _lock = self.acquire_lock()?;
        let temp_name = format!(
            ".{}.{}.tmp",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("checkpoint"),
            uuid::Uuid::new_v4()
        );
        let temp_path = path.with_file_name(&temp_name);
        let mut file = std::fs::File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }

    fn read_file(path: &Path) -> ExecutorResult<TaskCheckpoint> {
        let data = std::fs::read(path)?;
        let payload = unwrap(&data, &path.display().to_string())?;
        bincode::deserialize(&payload).map_err(|e| ExecutorError::Serialization {
            reason: format!("failed to deserialize checkpoint '{}': {e}", path.display()),
        })
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: TaskCheckpoint) -> ExecutorResult<()> {
        let path = self.checkpoint_path(&checkpoint.id);
        let store_dir = self.directory.clone();
        let this = Self { directory: store_dir };
        tokio::task::spawn_blocking(move || this.write_file(&path, &checkpoint))
            .await
            .map_err(|e| ExecutorError::Serialization {
                reason: format!("task join error saving checkpoint: {e}"),
            })?
    }

    async fn load(&self, id: &str) -> ExecutorResult<Option<TaskCheckpoint>> {
        let path = self.checkpoint_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let checkpoint = tokio::task::spawn_blocking(move || Self::read_file(&path))
            .await
            .map_err(|e| ExecutorError::Serialization {
                reason: format!("task join error loading checkpoint: {e}"),
            })??;
        Ok(Some(checkpoint))
    }

    async fn list(&self, task_id: &str, worker_id: &str) -> ExecutorResult<Vec<TaskCheckpoint>> {
        let directory = self.directory.clone();
        let task_id = task_id.to_string();
        let worker_id = worker_id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut matching = Vec::new();
            for dir_entry in std::fs::read_dir(&directory)? {
                let path = dir_entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("bin") {
                    continue;
                }
                match Self::read_file(&path) {
                    Ok(checkpoint) => {
                        if checkpoint.task_id == task_id && checkpoint.worker_id == worker_id {
                            matching.push(checkpoint);
                        }
                    }
                    Err(e) => {
                        // One bad file must not break recovery.
                        tracing::warn!(file = %path.display(), error = %e, "skipping corrupt checkpoint file");
                    }
                }
            }
            matching.sort_by_key(|cp| cp.sequence);
            Ok(matching)
        })
        .await
        .map_err(|e| ExecutorError::Serialization {
            reason: format!("task join error listing checkpoints: {e}"),
        })?
    }

    async fn delete(&self, id: &str) -> ExecutorResult<()> {
        let path = self.checkpoint_path(id);
        if path.exists() {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }
}
