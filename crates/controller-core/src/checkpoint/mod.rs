//! Checkpoint Store (CS).
//!
//! Durable per-order progress snapshots, one JSON file per order under
//! `base_dir/<order_id>.json`. Every write goes through a
//! temp-file-then-rename so a crash mid-write can never leave a
//! half-written checkpoint behind; the same restrictive-permissions
//! pattern the rest of this codebase uses for sensitive on-disk state
//! applies here too, since checkpoint state may embed task output.

use std::path::{Path, PathBuf};

use controller_common::config::CheckpointConfig;
use controller_common::ids::OrderId;
use controller_common::types::Checkpoint;

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint for order {order_id} not found")]
    NotFound { order_id: OrderId },
    #[error("checkpoint file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
}

/// The Checkpoint Store. Stateless beyond `base_dir` — every call touches
/// the filesystem directly, so this type is `Clone`-free and shared via
/// `Arc` like the others.
pub struct CheckpointStore {
    base_dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(config: CheckpointConfig) -> Self {
        Self {
            base_dir: PathBuf::from(config.base_dir),
        }
    }

    fn path_for(&self, order_id: OrderId) -> PathBuf {
        self.base_dir.join(format!("{order_id}.json"))
    }

    /// Atomically persist `checkpoint`, keyed by its `order_id` alone.
    /// Creates `base_dir` if it doesn't exist yet.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let dir = self.base_dir.clone();
        let path = self.path_for(checkpoint.order_id);
        let json = serde_json::to_string_pretty(checkpoint)?;

        tokio::task::spawn_blocking(move || write_atomic(&dir, &path, &json))
            .await
            .expect("checkpoint write task panicked")?;

        tracing::debug!(
            order_id = %checkpoint.order_id,
            item_id = %checkpoint.item_id,
            step = ?checkpoint.step,
            "checkpoint saved"
        );
        Ok(())
    }

    pub async fn load(&self, order_id: OrderId) -> Result<Checkpoint, CheckpointError> {
        let path = self.path_for(order_id);
        let contents = tokio::task::spawn_blocking(move || std::fs::read_to_string(&path))
            .await
            .expect("checkpoint read task panicked")
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    CheckpointError::NotFound { order_id }
                } else {
                    CheckpointError::Io(e)
                }
            })?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn has(&self, order_id: OrderId) -> bool {
        self.path_for(order_id).exists()
    }

    pub fn delete(&self, order_id: OrderId) -> Result<(), CheckpointError> {
        let path = self.path_for(order_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CheckpointError::Io(e)),
        }
    }

    /// Delete every checkpoint whose `created_at_epoch` is older than
    /// `cutoff_epoch`. Returns the number removed.
    pub fn cleanup_older_than(&self, cutoff_epoch: i64) -> Result<usize, CheckpointError> {
        if !self.base_dir.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(contents) = std::fs::read_to_string(&path) else {
                continue;
            };
            let Ok(checkpoint) = serde_json::from_str::<Checkpoint>(&contents) else {
                continue;
            };
            if checkpoint.created_at_epoch < cutoff_epoch {
                std::fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn get_next_step(&self, checkpoint: &Checkpoint) -> controller_common::types::Step {
        checkpoint.step.next()
    }
}

fn write_atomic(dir: &Path, path: &Path, contents: &str) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let tmp_path = path.with_extension("tmp");
    write_file_restricted(&tmp_path, contents)?;
    std::fs::rename(&tmp_path, path)
}

fn write_file_restricted(path: &Path, contents: &str) -> std::io::Result<()> {
    use std::io::Write;
    let mut opts = std::fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let mut f = opts.open(path)?;
    f.write_all(contents.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use controller_common::ids::ItemId;
    use controller_common::types::Step;

    fn checkpoint(order_id: OrderId, item_id: &str, created_at_epoch: i64) -> Checkpoint {
        Checkpoint::new(
            order_id,
            ItemId::from(item_id),
            Step::ContextAnalysis,
            1,
            serde_json::json!({}),
            created_at_epoch,
        )
    }

    #[tokio::test]
    async fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(CheckpointConfig {
            base_dir: dir.path().to_string_lossy().to_string(),
        });
        let order_id = OrderId::new();
        let cp = checkpoint(order_id, "item-1", 100);

        store.save(&cp).await.unwrap();
        assert!(store.has(order_id));

        let loaded = store.load(order_id).await.unwrap();
        assert_eq!(loaded.item_id, cp.item_id);
        assert_eq!(loaded.step, Step::ContextAnalysis);
    }

    #[tokio::test]
    async fn missing_checkpoint_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(CheckpointConfig {
            base_dir: dir.path().to_string_lossy().to_string(),
        });
        let err = store.load(OrderId::new()).await.unwrap_err();
        assert!(matches!(err, CheckpointError::NotFound { .. }));
    }

    #[tokio::test]
    async fn cleanup_removes_only_stale_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(CheckpointConfig {
            base_dir: dir.path().to_string_lossy().to_string(),
        });
        let old_order = OrderId::new();
        let new_order = OrderId::new();
        store.save(&checkpoint(old_order, "old", 10)).await.unwrap();
        store.save(&checkpoint(new_order, "new", 1000)).await.unwrap();

        let removed = store.cleanup_older_than(500).unwrap();
        assert_eq!(removed, 1);
        assert!(!store.has(old_order));
        assert!(store.has(new_order));
    }

    #[tokio::test]
    async fn delete_is_idempotent_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(CheckpointConfig {
            base_dir: dir.path().to_string_lossy().to_string(),
        });
        assert!(store.delete(OrderId::new()).is_ok());
    }
}
