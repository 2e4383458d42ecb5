// PROOF-OF-STAKE ENGINE ADAPTER
// Lifecycle adapter for the stake-weighted engine
//
// SAFETY INVARIANTS:
// 1. Startup only succeeds if the checkpoint's validator set matches ours
// 2. Startup requires non-zero active stake
// 3. Startup failures are reported through health(), never by panicking
//
// Block production itself lives in the external PoS engine; this adapter owns
// the start/stop/health contract the switch coordinator drives.

use crate::checkpoint_manager::{validator_set_hash, Checkpoint};
use crate::engine::{ConsensusEngine, EngineError, EngineHealth};
use crate::mode::{BlockHeight, ConsensusMode, ValidatorId};
use async_trait::async_trait;
use log::{info, warn};

/// Validator stake information.
#[derive(Debug, Clone)]
pub struct ValidatorStake {
    /// Public key identifier
    pub id: ValidatorId,

    /// Current stake amount
    pub stake: u64,

    /// Whether this validator is currently active
    pub active: bool,

    /// Number of slashing events
    pub slashing_count: u32,
}

impl ValidatorStake {
    pub fn new(id: impl Into<ValidatorId>, stake: u64) -> Self {
        ValidatorStake {
            id: id.into(),
            stake,
            active: true,
            slashing_count: 0,
        }
    }

    /// Check if this validator can participate in consensus.
    pub fn can_participate(&self) -> bool {
        self.active && self.slashing_count == 0
    }
}

/// Observable lifecycle of an engine adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineLifecycle {
    Stopped,
    Running { from_block: BlockHeight },
    Failed(String),
}

pub struct PosEngine {
    validators: Vec<ValidatorStake>,
    lifecycle: EngineLifecycle,
    starts: u32,
}

impl PosEngine {
    pub fn new(validators: Vec<ValidatorStake>) -> Self {
        PosEngine {
            validators,
            lifecycle: EngineLifecycle::Stopped,
            starts: 0,
        }
    }

    /// Total stake of validators allowed to participate.
    pub fn active_stake(&self) -> u64 {
        self.validators
            .iter()
            .filter(|v| v.can_participate())
            .map(|v| v.stake)
            .sum()
    }

    pub fn validators_mut(&mut self) -> &mut Vec<ValidatorStake> {
        &mut self.validators
    }

    pub fn lifecycle(&self) -> &EngineLifecycle {
        &self.lifecycle
    }

    /// Number of times `start` has been called.
    pub fn start_count(&self) -> u32 {
        self.starts
    }

    fn validator_ids(&self) -> Vec<ValidatorId> {
        self.validators.iter().map(|v| v.id.clone()).collect()
    }
}

#[async_trait]
impl ConsensusEngine for PosEngine {
    fn mode(&self) -> ConsensusMode {
        ConsensusMode::Pos
    }

    async fn start(&mut self, checkpoint: &Checkpoint) -> Result<(), EngineError> {
        if matches!(self.lifecycle, EngineLifecycle::Running { .. }) {
            return Err(EngineError::StartFailed {
                mode: ConsensusMode::Pos,
                reason: "engine is already running".to_string(),
            });
        }
        self.starts += 1;

        if validator_set_hash(&self.validator_ids()) != checkpoint.validator_set_hash {
            warn!("PoS start rejected: validator set differs from checkpoint {}", checkpoint.block_number);
            self.lifecycle = EngineLifecycle::Failed("validator set mismatch".to_string());
            return Ok(());
        }

        if self.active_stake() == 0 {
            warn!("PoS start rejected: no active stake");
            self.lifecycle = EngineLifecycle::Failed("no active stake".to_string());
            return Ok(());
        }

        self.lifecycle = EngineLifecycle::Running {
            from_block: checkpoint.block_number,
        };
        info!("PoS engine started from checkpoint at block {}", checkpoint.block_number);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), EngineError> {
        if self.lifecycle != EngineLifecycle::Stopped {
            info!("PoS engine stopped");
        }
        self.lifecycle = EngineLifecycle::Stopped;
        Ok(())
    }

    fn health(&self) -> EngineHealth {
        match &self.lifecycle {
            EngineLifecycle::Running { from_block } => {
                EngineHealth::ok(format!("producing from block {}", from_block))
            }
            EngineLifecycle::Failed(reason) => EngineHealth::failed(reason.clone()),
            EngineLifecycle::Stopped => EngineHealth::pending("stopped"),
        }
    }
}
