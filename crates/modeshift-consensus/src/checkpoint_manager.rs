// CHECKPOINT MANAGER
// Consistent {state_root, validator_set, mode} snapshots at finalized blocks
//
// SAFETY INVARIANTS:
// 1. Checkpoints are only created for blocks the active engine has finalized
// 2. Checkpoints are append-only and never mutated
// 3. Block numbers are strictly increasing across the retained set
// 4. The newest checkpoint of each mode survives pruning, so a rollback
//    target exists even after a rollback

use crate::mode::{BlockHeight, ConsensusMode, ValidatorId};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use thiserror::Error;

/// 32-byte commitment to ledger state.
pub type StateRoot = [u8; 32];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CheckpointError {
    #[error("block {requested} is not finalized (finalized height {finalized})")]
    NotFinalized { requested: BlockHeight, finalized: BlockHeight },

    #[error("block {requested} is older than the latest checkpoint at {latest}")]
    Stale { requested: BlockHeight, latest: BlockHeight },

    #[error("ledger has no state for finalized block {0}")]
    MissingState(BlockHeight),
}

/// Read-only view of the ledger that the checkpoint manager captures from.
///
/// Implemented by the storage engine; finality is whatever the currently
/// active consensus engine has committed.
pub trait LedgerView {
    fn finalized_height(&self) -> BlockHeight;

    fn state_root_at(&self, height: BlockHeight) -> Option<StateRoot>;

    fn validator_set_at(&self, height: BlockHeight) -> Option<Vec<ValidatorId>>;
}

/// Immutable snapshot used both to arm a switch and as a rollback target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub block_number: BlockHeight,
    pub state_root: StateRoot,
    pub validator_set_hash: [u8; 32],

    /// Mode that was active when the checkpoint was captured
    pub mode: ConsensusMode,
}

impl Checkpoint {
    /// Hex digest identifying this checkpoint.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.block_number.to_le_bytes());
        hasher.update(self.state_root);
        hasher.update(self.validator_set_hash);
        hasher.update(self.mode.as_str().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Order-independent hash of a validator set.
pub fn validator_set_hash(validators: &[ValidatorId]) -> [u8; 32] {
    let mut sorted: Vec<&ValidatorId> = validators.iter().collect();
    sorted.sort();
    sorted.dedup();

    let mut hasher = Sha256::new();
    hasher.update((sorted.len() as u64).to_le_bytes());
    for id in sorted {
        hasher.update((id.len() as u64).to_le_bytes());
        hasher.update(id.as_bytes());
    }
    hasher.finalize().into()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointManager {
    checkpoints: VecDeque<Checkpoint>,
    retained: usize,
}

impl CheckpointManager {
    pub fn new(retained: usize) -> Self {
        CheckpointManager {
            checkpoints: VecDeque::new(),
            retained: retained.max(2),
        }
    }

    /// Capture a checkpoint at `at_block`, which must be finalized.
    ///
    /// Capturing the current latest height again in the same mode returns the
    /// existing checkpoint unchanged.
    pub fn capture<L: LedgerView + ?Sized>(
        &mut self,
        ledger: &L,
        at_block: BlockHeight,
        mode: ConsensusMode,
    ) -> Result<Checkpoint, CheckpointError> {
        let finalized = ledger.finalized_height();
        if at_block > finalized {
            return Err(CheckpointError::NotFinalized {
                requested: at_block,
                finalized,
            });
        }

        if let Some(latest) = self.checkpoints.back() {
            if at_block == latest.block_number && latest.mode == mode {
                return Ok(latest.clone());
            }
            if at_block <= latest.block_number {
                return Err(CheckpointError::Stale {
                    requested: at_block,
                    latest: latest.block_number,
                });
            }
        }

        let state_root = ledger
            .state_root_at(at_block)
            .ok_or(CheckpointError::MissingState(at_block))?;
        let validators = ledger
            .validator_set_at(at_block)
            .ok_or(CheckpointError::MissingState(at_block))?;

        let checkpoint = Checkpoint {
            block_number: at_block,
            state_root,
            validator_set_hash: validator_set_hash(&validators),
            mode,
        };

        self.checkpoints.push_back(checkpoint.clone());
        self.prune();

        info!(
            "Checkpoint captured at block {} in {} mode ({})",
            at_block,
            mode,
            checkpoint.digest()
        );
        Ok(checkpoint)
    }

    /// Most recent checkpoint; the default rollback target.
    pub fn latest(&self) -> Option<&Checkpoint> {
        self.checkpoints.back()
    }

    pub fn latest_for_mode(&self, mode: ConsensusMode) -> Option<&Checkpoint> {
        self.checkpoints.iter().rev().find(|c| c.mode == mode)
    }

    pub fn get(&self, block_number: BlockHeight) -> Option<&Checkpoint> {
        self.checkpoints.iter().find(|c| c.block_number == block_number)
    }

    /// The last `n` checkpoints, oldest first.
    pub fn recent(&self, n: usize) -> Vec<Checkpoint> {
        let skip = self.checkpoints.len().saturating_sub(n);
        self.checkpoints.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    /// Drop the oldest checkpoints beyond the retention limit, keeping the
    /// newest checkpoint of every mode.
    fn prune(&mut self) {
        while self.checkpoints.len() > self.retained {
            let protected: Vec<BlockHeight> = [ConsensusMode::Pos, ConsensusMode::Bft]
                .iter()
                .filter_map(|m| self.latest_for_mode(*m).map(|c| c.block_number))
                .collect();

            let victim = self
                .checkpoints
                .iter()
                .position(|c| !protected.contains(&c.block_number));

            match victim {
                Some(index) => {
                    if let Some(removed) = self.checkpoints.remove(index) {
                        debug!("Pruned checkpoint at block {}", removed.block_number);
                    }
                }
                None => break,
            }
        }
    }
}
