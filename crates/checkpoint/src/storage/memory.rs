//! In-memory checkpoint storage.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tally_core::CheckpointError;

use super::CheckpointStorage;
use crate::Checkpoint;

/// Checkpoint storage kept in process memory.
///
/// Cloning shares the underlying map, so a test can hand one clone to a
/// consumer, stop it, and start a second consumer on the same checkpoints.
#[derive(Clone, Default)]
pub struct MemoryCheckpointStorage {
    checkpoints: Arc<Mutex<BTreeMap<u64, Checkpoint>>>,
}

impl MemoryCheckpointStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.checkpoints.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.lock().is_empty()
    }
}

#[async_trait::async_trait]
impl CheckpointStorage for MemoryCheckpointStorage {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        self.checkpoints
            .lock()
            .insert(checkpoint.flush_id, checkpoint.clone());
        Ok(())
    }

    async fn load(&self, flush_id: u64) -> Result<Checkpoint, CheckpointError> {
        self.checkpoints
            .lock()
            .get(&flush_id)
            .cloned()
            .ok_or_else(|| CheckpointError::Corrupt {
                path: PathBuf::from(format!("memory://chk-{flush_id}")),
                reason: "no such checkpoint".to_string(),
            })
    }

    async fn delete(&self, flush_id: u64) -> Result<(), CheckpointError> {
        self.checkpoints.lock().remove(&flush_id);
        Ok(())
    }

    async fn list_checkpoints(&self) -> Result<Vec<u64>, CheckpointError> {
        Ok(self.checkpoints.lock().keys().copied().collect())
    }
}
