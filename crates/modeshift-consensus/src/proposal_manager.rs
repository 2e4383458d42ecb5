// SWITCH PROPOSAL MANAGER
// Deterministic FSM that creates, votes on, commits and expires mode switches
//
// SAFETY INVARIANTS:
// 1. At most one proposal is in flight at any time
// 2. A proposal commits only with >= quorum_needed DISTINCT validator votes
// 3. Activation is never scheduled earlier than current_block + guard_window
// 4. No activation is scheduled within cooldown_min blocks of the last switch
// 5. Only committing a proposal consumes the cooldown; expiry does not
// 6. Committed and Expired proposals are immutable
//
// Hysteresis: PoS -> BFT needs a level of at least HIGH, while BFT -> PoS
// needs T consecutive evaluations at ELEVATED or below.
//
// Every transition is a pure function of (threat level, block height, votes),
// so all honest nodes that process the same ordered log agree on the phase.

use crate::checkpoint_manager::Checkpoint;
use crate::config::ProposalConfig;
use crate::events::SwitchEvent;
use crate::mode::{BlockHeight, ConsensusMode, ValidatorId};
use crate::threat_oracle::ThreatLevel;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use thiserror::Error;

pub type ProposalId = u64;

/// Terminal proposals retained for inspection.
const MAX_HISTORY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalStatus {
    Pending,
    Committed,
    Expired,
}

/// One entry of the ordered vote audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
    pub validator: ValidatorId,
    pub block: BlockHeight,

    /// Global arrival order across all proposals
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchProposal {
    pub id: ProposalId,
    pub source_mode: ConsensusMode,
    pub target_mode: ConsensusMode,
    pub created_at_block: BlockHeight,
    pub activation_block: BlockHeight,
    pub quorum_needed: usize,

    /// Distinct voters; insertion is idempotent
    pub votes: BTreeSet<ValidatorId>,

    /// Accepted votes in arrival order
    pub vote_log: Vec<VoteRecord>,

    pub status: ProposalStatus,

    /// Block at which quorum was met (the commit point)
    pub quorum_reached_at: Option<BlockHeight>,

    /// Block of the checkpoint that armed the switch
    pub checkpoint_block: Option<BlockHeight>,
}

impl SwitchProposal {
    pub fn vote_count(&self) -> usize {
        self.votes.len()
    }

    pub fn has_quorum(&self) -> bool {
        self.votes.len() >= self.quorum_needed
    }
}

/// Phase of the switch FSM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwitchPhase {
    Stable(ConsensusMode),
    ProposalPending(SwitchProposal),

    /// Quorum met; waiting for a finalized checkpoint to arm the switch
    QuorumReached(SwitchProposal),

    Committed {
        proposal: SwitchProposal,
        checkpoint: Checkpoint,
    },

    /// The proposal expired during the last evaluation
    Expired(SwitchProposal),
}

impl SwitchPhase {
    pub fn name(&self) -> &'static str {
        match self {
            SwitchPhase::Stable(_) => "Stable",
            SwitchPhase::ProposalPending(_) => "ProposalPending",
            SwitchPhase::QuorumReached(_) => "QuorumReached",
            SwitchPhase::Committed { .. } => "Committed",
            SwitchPhase::Expired(_) => "Expired",
        }
    }

    pub fn proposal(&self) -> Option<&SwitchProposal> {
        match self {
            SwitchPhase::Stable(_) => None,
            SwitchPhase::ProposalPending(p)
            | SwitchPhase::QuorumReached(p)
            | SwitchPhase::Expired(p) => Some(p),
            SwitchPhase::Committed { proposal, .. } => Some(proposal),
        }
    }

    /// A proposal that still blocks new proposals.
    pub fn in_flight(&self) -> Option<&SwitchProposal> {
        match self {
            SwitchPhase::Stable(_) | SwitchPhase::Expired(_) => None,
            other => other.proposal(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownState {
    /// Activation block of the last committed switch
    pub last_switch: Option<BlockHeight>,
    pub min_gap: u64,
}

impl CooldownState {
    pub fn new(min_gap: u64) -> Self {
        CooldownState {
            last_switch: None,
            min_gap,
        }
    }

    /// Earliest activation block the cooldown allows.
    pub fn earliest_activation(&self) -> BlockHeight {
        self.last_switch
            .map(|last| last.saturating_add(self.min_gap))
            .unwrap_or(0)
    }

    pub fn permits(&self, activation_block: BlockHeight) -> bool {
        activation_block >= self.earliest_activation()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProposalError {
    #[error("proposal {0} is already in flight")]
    InFlight(ProposalId),

    #[error("chain is already running {0}")]
    AlreadyInMode(ConsensusMode),

    #[error("activation block {activation} is inside the guard window (earliest {earliest})")]
    GuardWindow { activation: BlockHeight, earliest: BlockHeight },

    #[error("cooldown active: activation {activation} is before block {until}")]
    Cooldown { activation: BlockHeight, until: BlockHeight },

    #[error("no proposal is waiting for a checkpoint")]
    NotAwaitingCheckpoint,

    #[error("checkpoint at block {block} is outside the arming window [{from}, {to}]")]
    CheckpointOutOfRange { block: BlockHeight, from: BlockHeight, to: BlockHeight },

    #[error("checkpoint was captured in {got}, expected {expected}")]
    CheckpointModeMismatch { expected: ConsensusMode, got: ConsensusMode },

    #[error("no committed proposal {0} to complete")]
    NothingToComplete(ProposalId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteRejection {
    UnknownValidator,
    UnknownProposal,
    ProposalClosed,
    Halted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteOutcome {
    Counted { votes: usize, needed: usize },
    QuorumReached { votes: usize },
    Duplicate,
    Rejected(VoteRejection),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalManager {
    validators: BTreeSet<ValidatorId>,
    guard_window: u64,
    revert_calm_evaluations: u32,
    quorum_needed: usize,

    current_mode: ConsensusMode,
    phase: SwitchPhase,
    cooldown: CooldownState,

    next_id: ProposalId,
    vote_sequence: u64,

    /// Consecutive evaluations at ELEVATED or below
    calm_streak: u32,

    history: VecDeque<SwitchProposal>,

    #[serde(skip)]
    outbox: Vec<SwitchEvent>,
}

impl ProposalManager {
    pub fn new(config: &ProposalConfig, initial_mode: ConsensusMode) -> Self {
        ProposalManager {
            validators: config.validators.iter().cloned().collect(),
            guard_window: config.guard_window,
            revert_calm_evaluations: config.revert_calm_evaluations,
            quorum_needed: config.quorum_needed(),
            current_mode: initial_mode,
            phase: SwitchPhase::Stable(initial_mode),
            cooldown: CooldownState::new(config.cooldown_min),
            next_id: 1,
            vote_sequence: 0,
            calm_streak: 0,
            history: VecDeque::new(),
            outbox: Vec::new(),
        }
    }

    pub fn current_mode(&self) -> ConsensusMode {
        self.current_mode
    }

    pub fn phase(&self) -> &SwitchPhase {
        &self.phase
    }

    pub fn cooldown(&self) -> &CooldownState {
        &self.cooldown
    }

    pub fn quorum_needed(&self) -> usize {
        self.quorum_needed
    }

    pub fn calm_streak(&self) -> u32 {
        self.calm_streak
    }

    pub fn in_flight(&self) -> Option<&SwitchProposal> {
        self.phase.in_flight()
    }

    /// Terminal proposals, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &SwitchProposal> {
        self.history.iter()
    }

    pub fn is_validator(&self, id: &str) -> bool {
        self.validators.contains(id)
    }

    pub fn drain_events(&mut self) -> Vec<SwitchEvent> {
        std::mem::take(&mut self.outbox)
    }

    /// Advance the FSM for one block given the current threat level.
    ///
    /// Handles expiry first; a proposal that expires here does not make room
    /// for a new one until the next evaluation.
    pub fn evaluate(&mut self, level: ThreatLevel, current_block: BlockHeight) {
        if let SwitchPhase::Expired(_) = self.phase {
            self.phase = SwitchPhase::Stable(self.current_mode);
        }

        if level <= ThreatLevel::Elevated {
            self.calm_streak = self.calm_streak.saturating_add(1);
        } else {
            self.calm_streak = 0;
        }

        if self.expire_if_overdue(current_block) {
            return;
        }

        let target = match self.current_mode {
            ConsensusMode::Pos if level >= ThreatLevel::High => Some(ConsensusMode::Bft),
            ConsensusMode::Bft if self.calm_streak >= self.revert_calm_evaluations => {
                Some(ConsensusMode::Pos)
            }
            _ => None,
        };
        let Some(target) = target else {
            return;
        };

        if let Some(in_flight) = self.phase.in_flight() {
            debug!(
                "Threat-triggered switch to {} suppressed: proposal {} in flight",
                target, in_flight.id
            );
            return;
        }

        let activation_block = current_block + self.guard_window;
        if !self.cooldown.permits(activation_block) {
            debug!(
                "Threat-triggered switch to {} suppressed by cooldown until block {}",
                target,
                self.cooldown.earliest_activation()
            );
            return;
        }

        info!("Threat level {} triggers switch proposal to {}", level, target);
        self.create(target, activation_block, current_block);
    }

    /// Explicitly propose a switch.
    ///
    /// Conflicting requests are rejected, never queued: the earliest created
    /// proposal wins.
    pub fn propose_switch(
        &mut self,
        target_mode: ConsensusMode,
        activation_block: BlockHeight,
        current_block: BlockHeight,
    ) -> Result<ProposalId, ProposalError> {
        if let Some(in_flight) = self.phase.in_flight() {
            return Err(ProposalError::InFlight(in_flight.id));
        }
        if target_mode == self.current_mode {
            return Err(ProposalError::AlreadyInMode(target_mode));
        }
        let earliest = current_block + self.guard_window;
        if activation_block < earliest {
            return Err(ProposalError::GuardWindow {
                activation: activation_block,
                earliest,
            });
        }
        if !self.cooldown.permits(activation_block) {
            return Err(ProposalError::Cooldown {
                activation: activation_block,
                until: self.cooldown.earliest_activation(),
            });
        }

        Ok(self.create(target_mode, activation_block, current_block))
    }

    /// Record a vote. Only configured validators may vote, once per proposal.
    pub fn vote_switch(
        &mut self,
        proposal_id: ProposalId,
        validator: &str,
        current_block: BlockHeight,
    ) -> VoteOutcome {
        if !self.validators.contains(validator) {
            warn!("Rejecting vote from unknown validator '{}'", validator);
            return VoteOutcome::Rejected(VoteRejection::UnknownValidator);
        }

        let outcome = match &mut self.phase {
            SwitchPhase::ProposalPending(p) | SwitchPhase::QuorumReached(p)
                if p.id == proposal_id =>
            {
                if !p.votes.insert(validator.to_string()) {
                    return VoteOutcome::Duplicate;
                }
                self.vote_sequence += 1;
                p.vote_log.push(VoteRecord {
                    validator: validator.to_string(),
                    block: current_block,
                    sequence: self.vote_sequence,
                });

                if p.has_quorum() && p.quorum_reached_at.is_none() {
                    VoteOutcome::QuorumReached { votes: p.vote_count() }
                } else {
                    VoteOutcome::Counted {
                        votes: p.vote_count(),
                        needed: p.quorum_needed,
                    }
                }
            }
            phase => {
                return match phase.proposal() {
                    Some(p) if p.id == proposal_id && p.votes.contains(validator) => {
                        VoteOutcome::Duplicate
                    }
                    Some(p) if p.id == proposal_id => {
                        VoteOutcome::Rejected(VoteRejection::ProposalClosed)
                    }
                    _ if proposal_id > 0 && proposal_id < self.next_id => {
                        VoteOutcome::Rejected(VoteRejection::ProposalClosed)
                    }
                    _ => VoteOutcome::Rejected(VoteRejection::UnknownProposal),
                };
            }
        };

        if let VoteOutcome::QuorumReached { votes } = outcome {
            self.promote_to_quorum(current_block);
            info!(
                "Proposal {} reached quorum with {}/{} votes at block {}",
                proposal_id, votes, self.quorum_needed, current_block
            );
        }
        outcome
    }

    /// Range of blocks a checkpoint must fall in to arm the quorum proposal.
    pub fn checkpoint_window(&self) -> Option<(BlockHeight, BlockHeight)> {
        match &self.phase {
            SwitchPhase::QuorumReached(p) => Some((
                p.quorum_reached_at.unwrap_or(p.created_at_block),
                p.activation_block,
            )),
            _ => None,
        }
    }

    /// Arm the quorum proposal with `checkpoint`, committing it.
    ///
    /// Committing sets the cooldown from the activation block.
    pub fn attach_checkpoint(
        &mut self,
        checkpoint: Checkpoint,
        current_block: BlockHeight,
    ) -> Result<SwitchProposal, ProposalError> {
        let (from, to) = self
            .checkpoint_window()
            .ok_or(ProposalError::NotAwaitingCheckpoint)?;
        if checkpoint.block_number < from || checkpoint.block_number > to {
            return Err(ProposalError::CheckpointOutOfRange {
                block: checkpoint.block_number,
                from,
                to,
            });
        }
        if checkpoint.mode != self.current_mode {
            return Err(ProposalError::CheckpointModeMismatch {
                expected: self.current_mode,
                got: checkpoint.mode,
            });
        }

        let mut proposal =
            match std::mem::replace(&mut self.phase, SwitchPhase::Stable(self.current_mode)) {
                SwitchPhase::QuorumReached(p) => p,
                other => {
                    self.phase = other;
                    return Err(ProposalError::NotAwaitingCheckpoint);
                }
            };

        proposal.status = ProposalStatus::Committed;
        proposal.checkpoint_block = Some(checkpoint.block_number);
        self.cooldown.last_switch = Some(proposal.activation_block);

        info!(
            "Proposal {} committed: {} -> {} at block {} (checkpoint {})",
            proposal.id,
            proposal.source_mode,
            proposal.target_mode,
            proposal.activation_block,
            checkpoint.block_number
        );
        self.outbox.push(SwitchEvent::ProposalCommitted {
            block: current_block,
            proposal_id: proposal.id,
            checkpoint_block: checkpoint.block_number,
            activation_block: proposal.activation_block,
        });

        self.phase = SwitchPhase::Committed {
            proposal: proposal.clone(),
            checkpoint,
        };
        Ok(proposal)
    }

    /// Return to `Stable(active_mode)` once the coordinator has finished the
    /// committed proposal, whether it switched or rolled back.
    pub fn complete_switch(
        &mut self,
        proposal_id: ProposalId,
        active_mode: ConsensusMode,
    ) -> Result<(), ProposalError> {
        match &self.phase {
            SwitchPhase::Committed { proposal, .. } if proposal.id == proposal_id => {}
            _ => return Err(ProposalError::NothingToComplete(proposal_id)),
        }

        let phase = std::mem::replace(&mut self.phase, SwitchPhase::Stable(active_mode));
        if let SwitchPhase::Committed { proposal, .. } = phase {
            self.archive(proposal);
        }
        if active_mode != self.current_mode {
            self.calm_streak = 0;
        }
        self.current_mode = active_mode;
        Ok(())
    }

    /// Operator override after a halt: settle in `mode`, archiving any
    /// proposal that was in flight.
    pub fn force_stable(&mut self, mode: ConsensusMode) {
        let phase = std::mem::replace(&mut self.phase, SwitchPhase::Stable(mode));
        match phase {
            SwitchPhase::ProposalPending(mut p) | SwitchPhase::QuorumReached(mut p) => {
                p.status = ProposalStatus::Expired;
                self.archive(p);
            }
            SwitchPhase::Committed { proposal, .. } => self.archive(proposal),
            SwitchPhase::Stable(_) | SwitchPhase::Expired(_) => {}
        }
        warn!("Proposal manager forced to Stable({})", mode);
        self.current_mode = mode;
        self.calm_streak = 0;
    }

    fn create(
        &mut self,
        target_mode: ConsensusMode,
        activation_block: BlockHeight,
        current_block: BlockHeight,
    ) -> ProposalId {
        let id = self.next_id;
        self.next_id += 1;

        let proposal = SwitchProposal {
            id,
            source_mode: self.current_mode,
            target_mode,
            created_at_block: current_block,
            activation_block,
            quorum_needed: self.quorum_needed,
            votes: BTreeSet::new(),
            vote_log: Vec::new(),
            status: ProposalStatus::Pending,
            quorum_reached_at: None,
            checkpoint_block: None,
        };

        info!(
            "Proposal {} created: {} -> {} at block {} (needs {} votes)",
            id, self.current_mode, target_mode, activation_block, self.quorum_needed
        );
        self.outbox.push(SwitchEvent::ProposalCreated {
            block: current_block,
            proposal_id: id,
            target_mode,
            activation_block,
            quorum_needed: self.quorum_needed,
        });
        self.phase = SwitchPhase::ProposalPending(proposal);
        id
    }

    fn promote_to_quorum(&mut self, current_block: BlockHeight) {
        let phase = std::mem::replace(&mut self.phase, SwitchPhase::Stable(self.current_mode));
        self.phase = match phase {
            SwitchPhase::ProposalPending(mut p) => {
                p.quorum_reached_at = Some(current_block);
                SwitchPhase::QuorumReached(p)
            }
            other => other,
        };
    }

    /// Expire a pending or unarmed proposal whose activation block has passed.
    fn expire_if_overdue(&mut self, current_block: BlockHeight) -> bool {
        let overdue = match &self.phase {
            SwitchPhase::ProposalPending(p) | SwitchPhase::QuorumReached(p) => {
                current_block > p.activation_block
            }
            _ => false,
        };
        if !overdue {
            return false;
        }

        let phase = std::mem::replace(&mut self.phase, SwitchPhase::Stable(self.current_mode));
        if let SwitchPhase::ProposalPending(mut p) | SwitchPhase::QuorumReached(mut p) = phase {
            p.status = ProposalStatus::Expired;
            warn!(
                "Proposal {} expired at block {} with {}/{} votes",
                p.id,
                current_block,
                p.vote_count(),
                p.quorum_needed
            );
            self.outbox.push(SwitchEvent::ProposalExpired {
                block: current_block,
                proposal_id: p.id,
                votes: p.vote_count(),
                quorum_needed: p.quorum_needed,
            });
            self.archive(p.clone());
            self.phase = SwitchPhase::Expired(p);
        }
        true
    }

    fn archive(&mut self, proposal: SwitchProposal) {
        self.history.push_back(proposal);
        while self.history.len() > MAX_HISTORY {
            self.history.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ProposalConfig {
        ProposalConfig {
            validators: (0..4).map(|i| format!("v{}", i)).collect(),
            guard_window: 10,
            cooldown_min: 100,
            revert_calm_evaluations: 3,
            ..ProposalConfig::default()
        }
    }

    fn checkpoint(block: BlockHeight, mode: ConsensusMode) -> Checkpoint {
        Checkpoint {
            block_number: block,
            state_root: [0u8; 32],
            validator_set_hash: [0u8; 32],
            mode,
        }
    }

    fn vote_all(manager: &mut ProposalManager, id: ProposalId, block: BlockHeight) {
        for v in 0..3 {
            manager.vote_switch(id, &format!("v{}", v), block);
        }
    }

    #[test]
    fn test_high_threat_creates_proposal() {
        let mut manager = ProposalManager::new(&config(), ConsensusMode::Pos);
        manager.evaluate(ThreatLevel::Elevated, 1);
        assert!(manager.in_flight().is_none());

        manager.evaluate(ThreatLevel::High, 2);
        let proposal = manager.in_flight().unwrap();
        assert_eq!(proposal.target_mode, ConsensusMode::Bft);
        assert_eq!(proposal.activation_block, 12);
        assert_eq!(proposal.quorum_needed, 3);

        let events = manager.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), "ProposalCreated");
    }

    #[test]
    fn test_second_proposal_suppressed_while_in_flight() {
        let mut manager = ProposalManager::new(&config(), ConsensusMode::Pos);
        manager.evaluate(ThreatLevel::Critical, 1);
        manager.evaluate(ThreatLevel::Critical, 2);
        assert_eq!(manager.in_flight().unwrap().id, 1);
        assert_eq!(
            manager.propose_switch(ConsensusMode::Bft, 50, 2),
            Err(ProposalError::InFlight(1))
        );
    }

    #[test]
    fn test_votes_are_idempotent_and_restricted() {
        let mut manager = ProposalManager::new(&config(), ConsensusMode::Pos);
        let id = manager.propose_switch(ConsensusMode::Bft, 20, 1).unwrap();

        assert_eq!(manager.vote_switch(id, "v0", 2), VoteOutcome::Counted { votes: 1, needed: 3 });
        assert_eq!(manager.vote_switch(id, "v0", 3), VoteOutcome::Duplicate);
        assert_eq!(
            manager.vote_switch(id, "mallory", 3),
            VoteOutcome::Rejected(VoteRejection::UnknownValidator)
        );
        assert_eq!(
            manager.vote_switch(99, "v1", 3),
            VoteOutcome::Rejected(VoteRejection::UnknownProposal)
        );
        assert_eq!(manager.vote_switch(id, "v1", 4), VoteOutcome::Counted { votes: 2, needed: 3 });
        assert_eq!(manager.vote_switch(id, "v2", 5), VoteOutcome::QuorumReached { votes: 3 });

        assert_eq!(manager.phase().name(), "QuorumReached");
        assert_eq!(manager.checkpoint_window(), Some((5, 20)));
        let p = manager.in_flight().unwrap();
        let order: Vec<u64> = p.vote_log.iter().map(|r| r.sequence).collect();
        assert_eq!(order, vec![1, 2, 3]);

        // Late votes are recorded but do not move the commit point
        assert_eq!(manager.vote_switch(id, "v3", 6), VoteOutcome::Counted { votes: 4, needed: 3 });
        assert_eq!(manager.vote_switch(id, "v2", 6), VoteOutcome::Duplicate);
        assert_eq!(manager.checkpoint_window(), Some((5, 20)));

        manager.attach_checkpoint(checkpoint(7, ConsensusMode::Pos), 7).unwrap();
        assert_eq!(manager.vote_switch(id, "v3", 8), VoteOutcome::Duplicate);
        assert_eq!(manager.history().count(), 0);
    }

    #[test]
    fn test_expiry_without_quorum_keeps_cooldown() {
        let mut manager = ProposalManager::new(&config(), ConsensusMode::Pos);
        let id = manager.propose_switch(ConsensusMode::Bft, 20, 1).unwrap();
        manager.vote_switch(id, "v0", 2);

        manager.evaluate(ThreatLevel::Low, 20);
        assert_eq!(manager.phase().name(), "ProposalPending");

        manager.evaluate(ThreatLevel::Low, 21);
        assert_eq!(manager.phase().name(), "Expired");
        assert_eq!(manager.cooldown().last_switch, None);
        assert!(manager
            .drain_events()
            .iter()
            .any(|e| matches!(e, SwitchEvent::ProposalExpired { proposal_id: 1, votes: 1, .. })));

        // Expired proposals are closed, and a new one may be created
        assert_eq!(
            manager.vote_switch(id, "v1", 22),
            VoteOutcome::Rejected(VoteRejection::ProposalClosed)
        );
        assert_eq!(manager.propose_switch(ConsensusMode::Bft, 40, 22), Ok(2));
    }

    #[test]
    fn test_quorum_without_checkpoint_expires() {
        let mut manager = ProposalManager::new(&config(), ConsensusMode::Pos);
        let id = manager.propose_switch(ConsensusMode::Bft, 20, 1).unwrap();
        vote_all(&mut manager, id, 5);
        manager.evaluate(ThreatLevel::Low, 21);
        assert_eq!(manager.phase().name(), "Expired");
        assert_eq!(manager.history().last().unwrap().status, ProposalStatus::Expired);
    }

    #[test]
    fn test_checkpoint_window_is_enforced() {
        let mut manager = ProposalManager::new(&config(), ConsensusMode::Pos);
        let id = manager.propose_switch(ConsensusMode::Bft, 20, 1).unwrap();
        assert_eq!(
            manager.attach_checkpoint(checkpoint(5, ConsensusMode::Pos), 2),
            Err(ProposalError::NotAwaitingCheckpoint)
        );

        vote_all(&mut manager, id, 5);
        assert_eq!(
            manager.attach_checkpoint(checkpoint(4, ConsensusMode::Pos), 6),
            Err(ProposalError::CheckpointOutOfRange { block: 4, from: 5, to: 20 })
        );
        assert!(matches!(
            manager.attach_checkpoint(checkpoint(6, ConsensusMode::Bft), 6),
            Err(ProposalError::CheckpointModeMismatch { .. })
        ));

        let committed = manager.attach_checkpoint(checkpoint(6, ConsensusMode::Pos), 7).unwrap();
        assert_eq!(committed.status, ProposalStatus::Committed);
        assert_eq!(committed.checkpoint_block, Some(6));
        assert_eq!(manager.cooldown().last_switch, Some(20));
        assert_eq!(manager.phase().name(), "Committed");
    }

    #[test]
    fn test_cooldown_blocks_next_switch() {
        let mut manager = ProposalManager::new(&config(), ConsensusMode::Pos);
        let id = manager.propose_switch(ConsensusMode::Bft, 20, 1).unwrap();
        vote_all(&mut manager, id, 5);
        manager.attach_checkpoint(checkpoint(6, ConsensusMode::Pos), 7).unwrap();
        manager.complete_switch(id, ConsensusMode::Bft).unwrap();
        assert_eq!(manager.phase(), &SwitchPhase::Stable(ConsensusMode::Bft));

        assert_eq!(
            manager.propose_switch(ConsensusMode::Pos, 119, 21),
            Err(ProposalError::Cooldown { activation: 119, until: 120 })
        );
        assert!(manager.propose_switch(ConsensusMode::Pos, 120, 21).is_ok());
    }

    #[test]
    fn test_propose_switch_rejections() {
        let mut manager = ProposalManager::new(&config(), ConsensusMode::Pos);
        assert_eq!(
            manager.propose_switch(ConsensusMode::Pos, 50, 1),
            Err(ProposalError::AlreadyInMode(ConsensusMode::Pos))
        );
        assert_eq!(
            manager.propose_switch(ConsensusMode::Bft, 10, 1),
            Err(ProposalError::GuardWindow { activation: 10, earliest: 11 })
        );
    }

    #[test]
    fn test_revert_requires_consecutive_calm_evaluations() {
        let mut manager = ProposalManager::new(&config(), ConsensusMode::Bft);
        manager.evaluate(ThreatLevel::Low, 1);
        manager.evaluate(ThreatLevel::Elevated, 2);
        manager.evaluate(ThreatLevel::High, 3);
        manager.evaluate(ThreatLevel::Low, 4);
        manager.evaluate(ThreatLevel::Low, 5);
        assert!(manager.in_flight().is_none());

        manager.evaluate(ThreatLevel::Elevated, 6);
        let proposal = manager.in_flight().unwrap();
        assert_eq!(proposal.target_mode, ConsensusMode::Pos);
        assert_eq!(proposal.activation_block, 16);
    }

    #[test]
    fn test_elevated_never_triggers_pos_to_bft() {
        let mut manager = ProposalManager::new(&config(), ConsensusMode::Pos);
        for block in 1..50 {
            manager.evaluate(ThreatLevel::Elevated, block);
        }
        assert!(manager.in_flight().is_none());
    }

    #[test]
    fn test_force_stable_archives_in_flight_proposal() {
        let mut manager = ProposalManager::new(&config(), ConsensusMode::Pos);
        manager.propose_switch(ConsensusMode::Bft, 20, 1).unwrap();
        manager.force_stable(ConsensusMode::Pos);
        assert_eq!(manager.phase(), &SwitchPhase::Stable(ConsensusMode::Pos));
        assert_eq!(manager.history().count(), 1);
    }
}
