//! Checkpoint storage abstraction and implementations.

mod fs;
mod memory;

pub use fs::FsCheckpointStorage;
pub use memory::MemoryCheckpointStorage;

use tally_core::CheckpointError;
use tracing::{debug, warn};

use crate::Checkpoint;

/// Abstraction for checkpoint storage locations.
///
/// Checkpoints are keyed by flush id. Writes must be atomic: a reader never
/// sees a partially written checkpoint.
#[async_trait::async_trait]
pub trait CheckpointStorage: Send + Sync {
    /// Persist a checkpoint.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    /// Read the checkpoint of a given flush.
    async fn load(&self, flush_id: u64) -> Result<Checkpoint, CheckpointError>;

    /// Delete a checkpoint.
    async fn delete(&self, flush_id: u64) -> Result<(), CheckpointError>;

    /// List all checkpoint ids, ascending.
    async fn list_checkpoints(&self) -> Result<Vec<u64>, CheckpointError>;

    /// The most recent readable checkpoint. Unreadable checkpoints are
    /// skipped in favor of older ones.
    async fn load_latest(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        for flush_id in self.list_checkpoints().await?.into_iter().rev() {
            match self.load(flush_id).await {
                Ok(checkpoint) => return Ok(Some(checkpoint)),
                Err(e) => warn!(flush_id, error = %e, "Skipping unreadable checkpoint"),
            }
        }
        Ok(None)
    }

    /// Delete all but the `keep` most recent checkpoints. Returns the
    /// deleted ids.
    async fn retain_latest(&self, keep: usize) -> Result<Vec<u64>, CheckpointError> {
        let ids = self.list_checkpoints().await?;
        let excess = ids.len().saturating_sub(keep);
        let mut removed = Vec::with_capacity(excess);
        for flush_id in ids.into_iter().take(excess) {
            self.delete(flush_id).await?;
            removed.push(flush_id);
        }
        if !removed.is_empty() {
            debug!(removed = ?removed, "Old checkpoints deleted");
        }
        Ok(removed)
    }
}
