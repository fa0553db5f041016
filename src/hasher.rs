//! Blake3 digests of experiment state

use blake3::Hasher as Blake3Hasher;
use serde::Serialize;

use crate::error::SerializationError;
use crate::experiment::ExperimentState;
use crate::types::StateHash;

/// Hashes the bincode encoding of a state with Blake3.
///
/// Every map in [`ExperimentState`] is ordered, so equal states always
/// encode to the same bytes and therefore the same digest.
#[derive(Debug, Clone, Default)]
pub struct StateHasher;

impl StateHasher {
    pub fn new() -> Self {
        Self
    }

    /// Digest of an experiment state
    pub fn hash(&self, state: &ExperimentState) -> Result<StateHash, SerializationError> {
        self.hash_value(state)
    }

    /// Digest of any serializable value, used for checkpoint envelopes
    pub fn hash_value<T: Serialize>(&self, value: &T) -> Result<StateHash, SerializationError> {
        let encoded = bincode::serialize(value).map_err(|e| SerializationError::SerializationFailed {
            reason: format!("bincode encoding for hashing failed: {}", e),
        })?;

        let mut hasher = Blake3Hasher::new();
        hasher.update(&encoded);
        Ok(StateHash(*hasher.finalize().as_bytes()))
    }

    /// Fold a sequence of digests into one, order-sensitive
    pub fn hash_chain(&self, hashes: &[StateHash]) -> StateHash {
        let mut hasher = Blake3Hasher::new();
        for hash in hashes {
            hasher.update(&hash.0);
        }
        StateHash(*hasher.finalize().as_bytes())
    }
}
