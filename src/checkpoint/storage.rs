//! Pluggable durable-storage backends for checkpoints
//!
//! The store is storage-agnostic: the host supplies anything that can read
//! and write checkpoints by `(context id, checkpoint id)`. Two backends ship
//! with the crate: [`InMemoryStorage`] for tests and defaults, and
//! [`FsStorage`] writing one JSON file per checkpoint.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::store::Checkpoint;

/// Error type for storage backends
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// I/O error from the underlying medium
    #[error("storage i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored record could not be (de)serialized
    #[error("storage serialization error: {0}")]
    Serialization(String),
}

/// Durable-storage contract for checkpoints
///
/// Implementations must be thread-safe. `put` must be idempotent: the drain
/// worker may write the same checkpoint more than once after a recovery.
#[async_trait]
pub trait CheckpointStorage: Send + Sync + 'static {
    /// Write a checkpoint (overwrite on duplicate id)
    async fn put(&self, checkpoint: &Checkpoint) -> Result<(), StorageError>;

    /// Read a checkpoint by id
    async fn get(
        &self,
        context_id: &str,
        checkpoint_id: &str,
    ) -> Result<Option<Checkpoint>, StorageError>;

    /// Delete a checkpoint; returns whether it existed
    async fn delete(&self, context_id: &str, checkpoint_id: &str) -> Result<bool, StorageError>;

    /// List checkpoint ids for a context
    async fn list(&self, context_id: &str) -> Result<Vec<String>, StorageError>;
}

/// In-memory storage backend
///
/// Primarily for testing. Provides the same semantics as a durable backend
/// minus the durability.
#[derive(Default)]
pub struct InMemoryStorage {
    checkpoints: RwLock<HashMap<(String, String), Checkpoint>>,
}

impl InMemoryStorage {
    /// Create a new in-memory backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored checkpoints (for testing)
    pub fn len(&self) -> usize {
        self.checkpoints.read().len()
    }

    /// Whether the backend is empty
    pub fn is_empty(&self) -> bool {
        self.checkpoints.read().is_empty()
    }
}

#[async_trait]
impl CheckpointStorage for InMemoryStorage {
    async fn put(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        let key = (checkpoint.context_id.clone(), checkpoint.id.clone());
        let mut stored = checkpoint.clone();
        stored.persisted = true;
        self.checkpoints.write().insert(key, stored);
        Ok(())
    }

    async fn get(
        &self,
        context_id: &str,
        checkpoint_id: &str,
    ) -> Result<Option<Checkpoint>, StorageError> {
        let key = (context_id.to_string(), checkpoint_id.to_string());
        Ok(self.checkpoints.read().get(&key).cloned())
    }

    async fn delete(&self, context_id: &str, checkpoint_id: &str) -> Result<bool, StorageError> {
        let key = (context_id.to_string(), checkpoint_id.to_string());
        Ok(self.checkpoints.write().remove(&key).is_some())
    }

    async fn list(&self, context_id: &str) -> Result<Vec<String>, StorageError> {
        let checkpoints = self.checkpoints.read();
        let mut ids: Vec<String> = checkpoints
            .keys()
            .filter(|(ctx, _)| ctx == context_id)
            .map(|(_, id)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

/// Filesystem storage backend
///
/// One JSON file per checkpoint, under `<root>/<context_id>/<id>.json`.
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    /// Create a backend rooted at the given directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn checkpoint_path(&self, context_id: &str, checkpoint_id: &str) -> PathBuf {
        self.root.join(context_id).join(format!("{checkpoint_id}.json"))
    }
}

#[async_trait]
impl CheckpointStorage for FsStorage {
    async fn put(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        let dir = self.root.join(&checkpoint.context_id);
        tokio::fs::create_dir_all(&dir).await?;

        let mut stored = checkpoint.clone();
        stored.persisted = true;
        let bytes = serde_json::to_vec_pretty(&stored)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let path = self.checkpoint_path(&checkpoint.context_id, &checkpoint.id);
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }

    async fn get(
        &self,
        context_id: &str,
        checkpoint_id: &str,
    ) -> Result<Option<Checkpoint>, StorageError> {
        let path = self.checkpoint_path(context_id, checkpoint_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let checkpoint: Checkpoint = serde_json::from_slice(&bytes)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        Ok(Some(checkpoint))
    }

    async fn delete(&self, context_id: &str, checkpoint_id: &str) -> Result<bool, StorageError> {
        let path = self.checkpoint_path(context_id, checkpoint_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, context_id: &str) -> Result<Vec<String>, StorageError> {
        let dir = self.root.join(context_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };

        let mut ids = vec![];
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}
