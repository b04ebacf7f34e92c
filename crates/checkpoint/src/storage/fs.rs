//! File-system based checkpoint storage.

use std::io;
use std::path::{Path, PathBuf};
use tally_core::CheckpointError;
use tracing::info;

use super::CheckpointStorage;
use crate::Checkpoint;

const CHECKPOINT_FILE: &str = "checkpoint.bin";

/// File-system based checkpoint storage.
///
/// Stores checkpoints in a directory structure:
/// ```text
/// base_path/
///   chk-1/
///     checkpoint.bin
///   chk-2/
///     ...
/// ```
///
/// Each file is written to a temporary name and renamed into place.
pub struct FsCheckpointStorage {
    base_path: PathBuf,
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> CheckpointError + '_ {
    move |source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl FsCheckpointStorage {
    /// Open (creating if needed) a checkpoint directory.
    pub fn new(base_path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let base_path = base_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_path).map_err(io_error(&base_path))?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn checkpoint_path(&self, flush_id: u64) -> PathBuf {
        self.base_path.join(format!("chk-{}", flush_id))
    }
}

#[async_trait::async_trait]
impl CheckpointStorage for FsCheckpointStorage {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let data =
            bincode::serialize(checkpoint).map_err(|e| CheckpointError::Encode(e.to_string()))?;

        let dir = self.checkpoint_path(checkpoint.flush_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(io_error(&dir))?;

        let tmp_path = dir.join(format!("{CHECKPOINT_FILE}.tmp"));
        let file_path = dir.join(CHECKPOINT_FILE);
        tokio::fs::write(&tmp_path, &data)
            .await
            .map_err(io_error(&tmp_path))?;
        tokio::fs::rename(&tmp_path, &file_path)
            .await
            .map_err(io_error(&file_path))?;

        info!(
            flush_id = checkpoint.flush_id,
            path = %file_path.display(),
            size_bytes = data.len(),
            "Checkpoint saved"
        );
        Ok(())
    }

    async fn load(&self, flush_id: u64) -> Result<Checkpoint, CheckpointError> {
        let path = self.checkpoint_path(flush_id).join(CHECKPOINT_FILE);
        let data = tokio::fs::read(&path).await.map_err(io_error(&path))?;
        let checkpoint: Checkpoint =
            bincode::deserialize(&data).map_err(|e| CheckpointError::Corrupt {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        if checkpoint.flush_id != flush_id {
            return Err(CheckpointError::Corrupt {
                path,
                reason: format!("holds flush {} instead of {}", checkpoint.flush_id, flush_id),
            });
        }
        Ok(checkpoint)
    }

    async fn delete(&self, flush_id: u64) -> Result<(), CheckpointError> {
        let dir = self.checkpoint_path(flush_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&dir)(e)),
        }
    }

    async fn list_checkpoints(&self) -> Result<Vec<u64>, CheckpointError> {
        let mut checkpoints = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.base_path)
            .await
            .map_err(io_error(&self.base_path))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(io_error(&self.base_path))?
        {
            let name = entry.file_name();
            let name_str = name.to_string_lossy();
            if let Some(id) = name_str.strip_prefix("chk-") {
                if let Ok(id) = id.parse::<u64>() {
                    checkpoints.push(id);
                }
            }
        }

        checkpoints.sort_unstable();
        Ok(checkpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::{CountEntry, CountingMode, OffsetCheckpoint};

    fn checkpoint(flush_id: u64, offset: i64) -> Checkpoint {
        Checkpoint {
            flush_id,
            timestamp: 1_700_000_000_000,
            mode: CountingMode::Cumulative,
            offsets: vec![OffsetCheckpoint::new("lines", 0, offset)],
            counts: vec![CountEntry::new("the", 2), CountEntry::new("cat", 1)],
            malformed: 1,
        }
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsCheckpointStorage::new(dir.path()).unwrap();

        storage.save(&checkpoint(1, 5)).await.unwrap();
        let loaded = storage.load(1).await.unwrap();
        assert_eq!(loaded, checkpoint(1, 5));
        assert!(dir.path().join("chk-1").join("checkpoint.bin").exists());
        assert!(!dir.path().join("chk-1").join("checkpoint.bin.tmp").exists());
    }

    #[tokio::test]
    async fn test_load_latest_and_retention() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsCheckpointStorage::new(dir.path()).unwrap();
        assert!(storage.load_latest().await.unwrap().is_none());

        for id in 1..=5 {
            storage.save(&checkpoint(id, id as i64 * 10)).await.unwrap();
        }
        std::fs::create_dir_all(dir.path().join("not-a-checkpoint")).unwrap();

        assert_eq!(storage.list_checkpoints().await.unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(storage.retain_latest(2).await.unwrap(), vec![1, 2, 3]);
        assert_eq!(storage.list_checkpoints().await.unwrap(), vec![4, 5]);

        let latest = storage.load_latest().await.unwrap().unwrap();
        assert_eq!(latest.flush_id, 5);
        assert_eq!(latest.offsets[0].offset, 50);
    }

    #[tokio::test]
    async fn test_corrupt_latest_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsCheckpointStorage::new(dir.path()).unwrap();
        storage.save(&checkpoint(1, 5)).await.unwrap();

        let broken = dir.path().join("chk-2");
        std::fs::create_dir_all(&broken).unwrap();
        std::fs::write(broken.join("checkpoint.bin"), b"\x01").unwrap();

        assert!(matches!(
            storage.load(2).await,
            Err(CheckpointError::Corrupt { .. })
        ));
        assert_eq!(storage.load_latest().await.unwrap().unwrap().flush_id, 1);
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsCheckpointStorage::new(dir.path()).unwrap();
        storage.delete(42).await.unwrap();
    }
}
