//! Checkpoint persistence
//!
//! A checkpoint is the full registry state after one accepted mutation.
//! Each save supersedes the previous one; nothing is merged.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{Result, ServeError};
use crate::registry::Registries;

/// Current checkpoint format version
pub const CHECKPOINT_VERSION: u32 = 1;

/// Durable snapshot of the control-plane state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    /// Controller the checkpoint belongs to
    pub controller: String,
    /// Sequence number of the mutation that produced it
    pub seq: u64,
    pub written_at: DateTime<Utc>,
    pub registries: Registries,
}

impl Checkpoint {
    pub fn new(controller: impl Into<String>, seq: u64, registries: Registries) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            controller: controller.into(),
            seq,
            written_at: Utc::now(),
            registries,
        }
    }
}

/// Where checkpoints are kept
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Durably replace the stored checkpoint
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Read the stored checkpoint, if any
    async fn load(&self) -> Result<Option<Checkpoint>>;

    /// Delete the stored checkpoint
    async fn clear(&self) -> Result<()>;
}

/// JSON file store; writes go to a sibling temp file and are renamed into place
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let data = serde_json::to_vec_pretty(checkpoint)?;
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir).await.map_err(|e| {
                    ServeError::Checkpoint(format!(
                        "cannot create checkpoint directory {}: {}",
                        dir.display(),
                        e
                    ))
                })?;
            }
        }

        let tmp = self.temp_path();
        let write = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            tokio::io::AsyncWriteExt::write_all(&mut file, &data).await?;
            file.sync_all().await?;
            tokio::fs::rename(&tmp, &self.path).await
        };
        write.await.map_err(|e: std::io::Error| {
            ServeError::Checkpoint(format!(
                "failed to write checkpoint {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    async fn load(&self) -> Result<Option<Checkpoint>> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ServeError::Checkpoint(format!(
                    "failed to read checkpoint {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };
        let checkpoint: Checkpoint = serde_json::from_slice(&data).map_err(|e| {
            ServeError::Checkpoint(format!(
                "corrupt checkpoint {}: {}",
                self.path.display(),
                e
            ))
        })?;
        check_version(&checkpoint)?;
        Ok(Some(checkpoint))
    }

    async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ServeError::Checkpoint(format!(
                "failed to delete checkpoint {}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

/// In-memory store. Clones share storage, so a restarted controller can be
/// handed the same store its predecessor wrote to.
#[derive(Clone, Default)]
pub struct MemoryCheckpointStore {
    slot: Arc<Mutex<Option<Checkpoint>>>,
    fail_writes: Arc<std::sync::atomic::AtomicBool>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent saves fail (simulates a full or read-only disk)
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    /// The stored checkpoint
    pub fn current(&self) -> Option<Checkpoint> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(ServeError::Checkpoint(
                "checkpoint store rejected the write".to_string(),
            ));
        }
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(checkpoint.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Option<Checkpoint>> {
        match self.current() {
            Some(checkpoint) => {
                check_version(&checkpoint)?;
                Ok(Some(checkpoint))
            }
            None => Ok(None),
        }
    }

    async fn clear(&self) -> Result<()> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}

fn check_version(checkpoint: &Checkpoint) -> Result<()> {
    if checkpoint.version != CHECKPOINT_VERSION {
        return Err(ServeError::Checkpoint(format!(
            "unsupported checkpoint version {} (expected {})",
            checkpoint.version, CHECKPOINT_VERSION
        )));
    }
    Ok(())
}
