// BFT COMMITTEE ENGINE ADAPTER
// Lifecycle adapter for the byzantine-fault-tolerant committee engine
//
// SAFETY CONSTRAINTS:
// 1. The committee must tolerate at least one fault (n >= 3f + 1 with f >= 1)
// 2. Quorum is 2/3 + 1 of the committee
// 3. The committee must match the checkpoint's validator set

use crate::checkpoint_manager::{validator_set_hash, Checkpoint};
use crate::engine::{ConsensusEngine, EngineError, EngineHealth};
use crate::mode::{ConsensusMode, ValidatorId};
use crate::pos_engine::EngineLifecycle;
use async_trait::async_trait;
use log::{info, warn};

/// Smallest committee that tolerates one byzantine member.
pub const MIN_COMMITTEE_SIZE: usize = 4;

pub struct BftEngine {
    committee: Vec<ValidatorId>,

    /// Quorum size: 2/3 + 1 of the committee
    quorum_size: usize,

    lifecycle: EngineLifecycle,

    /// View number, advanced on every (re)start
    current_view: u64,
}

impl BftEngine {
    pub fn new(committee: Vec<ValidatorId>) -> Self {
        let quorum_size = (committee.len() * 2) / 3 + 1;
        BftEngine {
            committee,
            quorum_size,
            lifecycle: EngineLifecycle::Stopped,
            current_view: 0,
        }
    }

    pub fn quorum_size(&self) -> usize {
        self.quorum_size
    }

    /// Byzantine members the committee can tolerate.
    pub fn fault_tolerance(&self) -> usize {
        self.committee.len().saturating_sub(1) / 3
    }

    pub fn current_view(&self) -> u64 {
        self.current_view
    }

    pub fn lifecycle(&self) -> &EngineLifecycle {
        &self.lifecycle
    }
}

#[async_trait]
impl ConsensusEngine for BftEngine {
    fn mode(&self) -> ConsensusMode {
        ConsensusMode::Bft
    }

    async fn start(&mut self, checkpoint: &Checkpoint) -> Result<(), EngineError> {
        if matches!(self.lifecycle, EngineLifecycle::Running { .. }) {
            return Err(EngineError::StartFailed {
                mode: ConsensusMode::Bft,
                reason: "engine is already running".to_string(),
            });
        }
        self.current_view += 1;

        if self.committee.len() < MIN_COMMITTEE_SIZE {
            warn!(
                "BFT start rejected: committee of {} cannot tolerate a fault",
                self.committee.len()
            );
            self.lifecycle = EngineLifecycle::Failed(format!(
                "committee of {} is below the minimum of {}",
                self.committee.len(),
                MIN_COMMITTEE_SIZE
            ));
            return Ok(());
        }

        if validator_set_hash(&self.committee) != checkpoint.validator_set_hash {
            warn!("BFT start rejected: committee differs from checkpoint {}", checkpoint.block_number);
            self.lifecycle = EngineLifecycle::Failed("committee mismatch".to_string());
            return Ok(());
        }

        self.lifecycle = EngineLifecycle::Running {
            from_block: checkpoint.block_number,
        };
        info!(
            "BFT engine started in view {} from block {} (quorum {}/{})",
            self.current_view,
            checkpoint.block_number,
            self.quorum_size,
            self.committee.len()
        );
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), EngineError> {
        if self.lifecycle != EngineLifecycle::Stopped {
            info!("BFT engine stopped in view {}", self.current_view);
        }
        self.lifecycle = EngineLifecycle::Stopped;
        Ok(())
    }

    fn health(&self) -> EngineHealth {
        match &self.lifecycle {
            EngineLifecycle::Running { from_block } => EngineHealth::ok(format!(
                "view {} finalizing from block {}",
                self.current_view, from_block
            )),
            EngineLifecycle::Failed(reason) => EngineHealth::failed(reason.clone()),
            EngineLifecycle::Stopped => EngineHealth::pending("stopped"),
        }
    }
}
