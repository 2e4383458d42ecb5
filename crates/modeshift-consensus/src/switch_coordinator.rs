// SWITCH COORDINATOR
// Executes a committed switch at its activation block
//
// SAFETY INVARIANTS:
// 1. At most one activation is scheduled at a time
// 2. The outgoing engine reaches a terminal stopped state before the incoming
//    engine starts (never two live engines)
// 3. The incoming engine loads state only from the committed checkpoint
// 4. A failed start rolls back to the exact {mode, checkpoint} the switch was
//    armed from
// 5. Failure to stop an engine, or to restore the previous one, is fatal
//
// Activation is a deterministic block-height trigger; no coordination
// message is exchanged beyond the shared ledger state.

use crate::checkpoint_manager::{Checkpoint, CheckpointError, CheckpointManager};
use crate::config::ActivationConfig;
use crate::engine::{ConsensusEngine, EngineError, EngineSet, EngineSlot};
use crate::health_fence::{FenceVerdict, HealthFence};
use crate::mode::{BlockHeight, ConsensusMode};
use crate::proposal_manager::{ProposalError, ProposalId, SwitchProposal};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SwitchError {
    #[error("{mode} engine did not stop: {detail}")]
    EngineStopTimeout { mode: ConsensusMode, detail: String },

    #[error("rollback to {mode} failed: {reason}")]
    RollbackFailed { mode: ConsensusMode, reason: String },

    #[error("activation for proposal {0} is already scheduled")]
    AlreadyScheduled(ProposalId),

    #[error("checkpoint at block {0} is not held by the checkpoint manager")]
    UnknownCheckpoint(BlockHeight),

    #[error("activation block {activation} is behind current block {current}")]
    ActivationPassed { activation: BlockHeight, current: BlockHeight },

    #[error("switching is halted: {0}")]
    Halted(String),

    #[error("expected block {expected}, got {got}")]
    HeightOutOfOrder { expected: BlockHeight, got: BlockHeight },

    #[error(transparent)]
    Proposal(#[from] ProposalError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl SwitchError {
    /// Fatal errors halt the controller until an operator intervenes.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SwitchError::EngineStopTimeout { .. } | SwitchError::RollbackFailed { .. }
        )
    }
}

/// Everything needed to execute one switch, fixed at commit time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationPlan {
    pub proposal_id: ProposalId,
    pub source_mode: ConsensusMode,
    pub target_mode: ConsensusMode,
    pub activation_block: BlockHeight,

    /// Checkpoint the target starts from and the rollback target. Set to the
    /// arming checkpoint at commit, then advanced to the last finalized block
    /// at or below `activation_block` just before activation.
    pub checkpoint: Checkpoint,
}

impl ActivationPlan {
    pub fn from_committed(proposal: &SwitchProposal, checkpoint: Checkpoint) -> Self {
        ActivationPlan {
            proposal_id: proposal.id,
            source_mode: proposal.source_mode,
            target_mode: proposal.target_mode,
            activation_block: proposal.activation_block,
            checkpoint,
        }
    }
}

/// The single armed activation, persisted with the rest of the switch state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationSchedule {
    plan: Option<ActivationPlan>,
}

impl ActivationSchedule {
    pub fn arm(
        &mut self,
        plan: ActivationPlan,
        checkpoints: &CheckpointManager,
        current_block: BlockHeight,
    ) -> Result<(), SwitchError> {
        if let Some(existing) = &self.plan {
            return Err(SwitchError::AlreadyScheduled(existing.proposal_id));
        }
        if checkpoints.get(plan.checkpoint.block_number) != Some(&plan.checkpoint) {
            return Err(SwitchError::UnknownCheckpoint(plan.checkpoint.block_number));
        }
        if plan.activation_block < current_block {
            return Err(SwitchError::ActivationPassed {
                activation: plan.activation_block,
                current: current_block,
            });
        }

        info!(
            "Activation of proposal {} scheduled at block {} ({} -> {})",
            plan.proposal_id, plan.activation_block, plan.source_mode, plan.target_mode
        );
        self.plan = Some(plan);
        Ok(())
    }

    /// Remove and return the plan if it activates at `height`.
    pub fn take_due(&mut self, height: BlockHeight) -> Option<ActivationPlan> {
        let due = self
            .plan
            .as_ref()
            .map_or(false, |plan| plan.activation_block == height);
        if due {
            self.plan.take()
        } else {
            None
        }
    }

    pub fn scheduled(&self) -> Option<&ActivationPlan> {
        self.plan.as_ref()
    }

    pub fn clear(&mut self) -> Option<ActivationPlan> {
        self.plan.take()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivationOutcome {
    Switched {
        proposal_id: ProposalId,
        block: BlockHeight,
        from: ConsensusMode,
        to: ConsensusMode,
    },
    RolledBack {
        proposal_id: ProposalId,
        block: BlockHeight,
        attempted: ConsensusMode,
        restored: ConsensusMode,
        checkpoint_block: BlockHeight,
        reason: String,
    },
}

impl ActivationOutcome {
    /// Mode running after the activation finished.
    pub fn active_mode(&self) -> ConsensusMode {
        match self {
            ActivationOutcome::Switched { to, .. } => *to,
            ActivationOutcome::RolledBack { restored, .. } => *restored,
        }
    }

    pub fn proposal_id(&self) -> ProposalId {
        match self {
            ActivationOutcome::Switched { proposal_id, .. }
            | ActivationOutcome::RolledBack { proposal_id, .. } => *proposal_id,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SwitchCoordinator {
    stop_timeout: Duration,
    fence: HealthFence,
}

impl SwitchCoordinator {
    pub fn new(stop_timeout: Duration, fence: HealthFence) -> Self {
        SwitchCoordinator { stop_timeout, fence }
    }

    pub fn from_config(config: &ActivationConfig) -> Self {
        SwitchCoordinator::new(config.stop_timeout(), HealthFence::from_config(config))
    }

    pub fn fence(&self) -> &HealthFence {
        &self.fence
    }

    /// Execute `plan`: stop the source engine, start the target from the
    /// armed checkpoint, fence it, and roll back on failure.
    pub async fn execute<P, B>(
        &self,
        plan: &ActivationPlan,
        engines: &mut EngineSet<P, B>,
        checkpoints: &CheckpointManager,
    ) -> Result<ActivationOutcome, SwitchError>
    where
        P: ConsensusEngine,
        B: ConsensusEngine,
    {
        if checkpoints.get(plan.checkpoint.block_number) != Some(&plan.checkpoint) {
            return Err(SwitchError::UnknownCheckpoint(plan.checkpoint.block_number));
        }

        info!(
            "Activating proposal {} at block {}: {} -> {}",
            plan.proposal_id, plan.activation_block, plan.source_mode, plan.target_mode
        );

        self.stop_engine(engines.slot(plan.source_mode)).await?;

        let started = engines.slot(plan.target_mode).start(&plan.checkpoint).await;
        let verdict = match started {
            Ok(()) => self.fence.observe(|| engines.health(plan.target_mode)).await,
            Err(e) => FenceVerdict::Failed { detail: e.to_string() },
        };

        if verdict.is_healthy() {
            info!(
                "{} engine healthy; mode changed at block {}",
                plan.target_mode, plan.activation_block
            );
            return Ok(ActivationOutcome::Switched {
                proposal_id: plan.proposal_id,
                block: plan.activation_block,
                from: plan.source_mode,
                to: plan.target_mode,
            });
        }

        let reason = verdict.reason();
        warn!(
            "{} engine failed health fence ({}); rolling back to {} at checkpoint {}",
            plan.target_mode, reason, plan.source_mode, plan.checkpoint.block_number
        );
        self.rollback(plan, engines).await?;

        Ok(ActivationOutcome::RolledBack {
            proposal_id: plan.proposal_id,
            block: plan.activation_block,
            attempted: plan.target_mode,
            restored: plan.source_mode,
            checkpoint_block: plan.checkpoint.block_number,
            reason,
        })
    }

    async fn rollback<P, B>(
        &self,
        plan: &ActivationPlan,
        engines: &mut EngineSet<P, B>,
    ) -> Result<(), SwitchError>
    where
        P: ConsensusEngine,
        B: ConsensusEngine,
    {
        self.stop_engine(engines.slot(plan.target_mode)).await?;

        let restarted = engines.slot(plan.source_mode).start(&plan.checkpoint).await;
        if let Err(e) = restarted {
            error!("Rollback restart of {} failed: {}", plan.source_mode, e);
            return Err(SwitchError::RollbackFailed {
                mode: plan.source_mode,
                reason: e.to_string(),
            });
        }

        let verdict = self.fence.observe(|| engines.health(plan.source_mode)).await;
        if !verdict.is_healthy() {
            error!("Rollback engine {} unhealthy: {}", plan.source_mode, verdict.reason());
            return Err(SwitchError::RollbackFailed {
                mode: plan.source_mode,
                reason: verdict.reason(),
            });
        }

        info!(
            "Rolled back to {} from checkpoint {}",
            plan.source_mode, plan.checkpoint.block_number
        );
        Ok(())
    }

    /// Stop `slot`, bounded by the stop timeout.
    pub(crate) async fn stop_engine<P, B>(&self, mut slot: EngineSlot<'_, P, B>) -> Result<(), SwitchError>
    where
        P: ConsensusEngine,
        B: ConsensusEngine,
    {
        let mode = slot.mode();
        match tokio::time::timeout(self.stop_timeout, slot.stop()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!("{} engine failed to stop: {}", mode, e);
                Err(SwitchError::EngineStopTimeout {
                    mode,
                    detail: e.to_string(),
                })
            }
            Err(_) => {
                error!("{} engine did not stop within {:?}", mode, self.stop_timeout);
                Err(SwitchError::EngineStopTimeout {
                    mode,
                    detail: format!("no terminal state within {:?}", self.stop_timeout),
                })
            }
        }
    }
}
