//! Per-batch state checkpoints on disk

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::StateError;
use crate::experiment::ExperimentState;
use crate::hasher::StateHasher;
use crate::serialization::JsonSerializer;
use crate::types::StateHash;

/// State snapshot taken after a processing batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub batch_index: usize,
    /// Hex blake3 digest of `state`
    pub hash: String,
    pub created_at: DateTime<Utc>,
    pub state: ExperimentState,
}

/// Directory of `batch_NNN_state.json` files.
///
/// Writing checkpoints is an orchestration step: the replay engine never
/// touches the store itself.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    hasher: StateHasher,
}

impl CheckpointStore {
    /// Open a store, creating the directory if needed
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StateError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StateError::CheckpointError {
            reason: format!("cannot create {}: {}", dir.display(), e),
        })?;
        Ok(Self {
            dir,
            hasher: StateHasher::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, batch_index: usize) -> PathBuf {
        self.dir.join(format!("batch_{:03}_state.json", batch_index))
    }

    pub fn save(&self, batch_index: usize, state: &ExperimentState) -> Result<Checkpoint, StateError> {
        let hash = self.hasher.hash(state).map_err(checkpoint_error)?;
        let checkpoint = Checkpoint {
            batch_index,
            hash: hash.to_string(),
            created_at: Utc::now(),
            state: state.clone(),
        };

        let json = JsonSerializer::new_pretty()
            .to_string(&checkpoint)
            .map_err(checkpoint_error)?;
        let path = self.path_for(batch_index);
        fs::write(&path, json).map_err(|e| StateError::CheckpointError {
            reason: format!("cannot write {}: {}", path.display(), e),
        })?;

        tracing::info!(batch = batch_index, hash = %checkpoint.hash, "checkpoint saved");
        Ok(checkpoint)
    }

    /// Load and verify one checkpoint. Missing files are `Ok(None)`.
    pub fn load(&self, batch_index: usize) -> Result<Option<Checkpoint>, StateError> {
        let path = self.path_for(batch_index);
        if !path.exists() {
            return Ok(None);
        }

        let raw = fs::read_to_string(&path).map_err(|e| StateError::CheckpointError {
            reason: format!("cannot read {}: {}", path.display(), e),
        })?;
        let checkpoint: Checkpoint = serde_json::from_str(&raw).map_err(|e| StateError::CheckpointError {
            reason: format!("corrupt checkpoint {}: {}", path.display(), e),
        })?;

        self.verify(&checkpoint)?;
        Ok(Some(checkpoint))
    }

    /// Newest checkpoint with an index below `target`
    pub fn load_latest_before(&self, target: usize) -> Result<Option<Checkpoint>, StateError> {
        for index in (0..target).rev() {
            if let Some(checkpoint) = self.load(index)? {
                tracing::debug!(batch = index, target, "resuming from checkpoint");
                return Ok(Some(checkpoint));
            }
        }
        Ok(None)
    }

    /// Batch indices with a checkpoint file, ascending
    pub fn indices(&self) -> Result<Vec<usize>, StateError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| StateError::CheckpointError {
            reason: format!("cannot list {}: {}", self.dir.display(), e),
        })?;

        let mut indices: Vec<usize> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| parse_index(&entry.file_name().to_string_lossy()))
            .collect();
        indices.sort_unstable();
        Ok(indices)
    }

    fn verify(&self, checkpoint: &Checkpoint) -> Result<(), StateError> {
        let expected = StateHash::from_hex(&checkpoint.hash).map_err(|e| StateError::CheckpointError {
            reason: e.to_string(),
        })?;
        let actual = self.hasher.hash(&checkpoint.state).map_err(checkpoint_error)?;
        if actual != expected {
            return Err(StateError::CheckpointMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }
}

fn parse_index(file_name: &str) -> Option<usize> {
    file_name
        .strip_prefix("batch_")?
        .strip_suffix("_state.json")?
        .parse()
        .ok()
}

fn checkpoint_error(error: impl std::fmt::Display) -> StateError {
    StateError::CheckpointError {
        reason: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Reagent;
    use tempfile::TempDir;

    fn sample_state() -> ExperimentState {
        let mut state = ExperimentState::new("exp-1");
        state.pipette.volume_setting_ul = 50.0;
        state.pipette.last_reagent_aspirated = Some(Reagent::new("Buffer", 50.0));
        state.refresh_derived_default();
        state
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap();
        let state = sample_state();

        let saved = store.save(2, &state).unwrap();
        assert!(store.path_for(2).ends_with("batch_002_state.json"));

        let loaded = store.load(2).unwrap().unwrap();
        assert_eq!(loaded.state, state);
        assert_eq!(loaded.hash, saved.hash);
    }

    #[test]
    fn test_latest_before() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap();
        store.save(0, &sample_state()).unwrap();
        store.save(3, &sample_state()).unwrap();

        assert!(store.load_latest_before(0).unwrap().is_none());
        assert_eq!(store.load_latest_before(3).unwrap().unwrap().batch_index, 0);
        assert_eq!(store.load_latest_before(9).unwrap().unwrap().batch_index, 3);
        assert_eq!(store.indices().unwrap(), vec![0, 3]);
    }

    #[test]
    fn test_tampered_checkpoint_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap();
        store.save(1, &sample_state()).unwrap();

        let path = store.path_for(1);
        let raw = fs::read_to_string(&path).unwrap();
        fs::write(&path, raw.replace("exp-1", "exp-2")).unwrap();

        match store.load(1) {
            Err(StateError::CheckpointMismatch { .. }) => {}
            other => panic!("expected mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_index() {
        assert_eq!(parse_index("batch_012_state.json"), Some(12));
        assert_eq!(parse_index("batch_x_state.json"), None);
        assert_eq!(parse_index("notes.txt"), None);
    }
}
