// SWITCH STATE STORE
// Explicit, versioned container for all on-chain switch state
//
// SAFETY INVARIANTS:
// 1. Every block's state transition ends in exactly one commit (version + 1)
// 2. The encoding is canonical: equal states produce equal bytes and digests
// 3. Nodes that processed the same block log hold identical digests

use crate::checkpoint_manager::{Checkpoint, CheckpointManager};
use crate::config::SwitchConfig;
use crate::mode::{BlockHeight, ConsensusMode};
use crate::proposal_manager::{CooldownState, ProposalManager, SwitchProposal};
use crate::switch_coordinator::ActivationSchedule;
use crate::threat_oracle::ThreatLevel;
use log::debug;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Bumped whenever the persisted layout changes.
pub const STATE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StateStoreError {
    #[error("failed to encode switch state: {0}")]
    Encode(String),

    #[error("failed to decode switch state: {0}")]
    Decode(String),

    #[error("unsupported state format {found} (expected {expected})")]
    Format { found: u32, expected: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchState {
    pub format: u32,

    /// Number of committed block transitions
    pub version: u64,

    pub last_block: Option<BlockHeight>,
    pub threat_level: ThreatLevel,
    pub proposals: ProposalManager,
    pub checkpoints: CheckpointManager,
    pub schedule: ActivationSchedule,

    /// Set by a fatal activation error; cleared only by an operator
    pub halted: Option<String>,
}

impl SwitchState {
    pub fn genesis(config: &SwitchConfig) -> Self {
        SwitchState {
            format: STATE_FORMAT_VERSION,
            version: 0,
            last_block: None,
            threat_level: ThreatLevel::Low,
            proposals: ProposalManager::new(&config.proposal, config.initial_mode),
            checkpoints: CheckpointManager::new(config.checkpoint.retained),
            schedule: ActivationSchedule::default(),
            halted: None,
        }
    }
}

/// Read-only observer snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateView {
    pub version: u64,
    pub last_block: Option<BlockHeight>,
    pub current_mode: ConsensusMode,
    pub threat_level: ThreatLevel,
    pub phase: String,
    pub pending_proposal: Option<SwitchProposal>,

    /// Up to two most recent checkpoints, oldest first
    pub last_checkpoints: Vec<Checkpoint>,

    pub scheduled_activation: Option<BlockHeight>,
    pub cooldown: CooldownState,
    pub halted: Option<String>,
}

pub struct SwitchStateStore {
    state: SwitchState,
}

impl SwitchStateStore {
    pub fn new(state: SwitchState) -> Self {
        SwitchStateStore { state }
    }

    pub fn genesis(config: &SwitchConfig) -> Self {
        SwitchStateStore::new(SwitchState::genesis(config))
    }

    pub fn state(&self) -> &SwitchState {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut SwitchState {
        &mut self.state
    }

    /// Seal the current transition; returns the new version.
    pub fn commit(&mut self) -> u64 {
        self.state.version += 1;
        debug!(
            "Switch state committed at version {} (block {:?})",
            self.state.version, self.state.last_block
        );
        self.state.version
    }

    pub fn view(&self) -> StateView {
        let s = &self.state;
        StateView {
            version: s.version,
            last_block: s.last_block,
            current_mode: s.proposals.current_mode(),
            threat_level: s.threat_level,
            phase: s.proposals.phase().name().to_string(),
            pending_proposal: s.proposals.in_flight().cloned(),
            last_checkpoints: s.checkpoints.recent(2),
            scheduled_activation: s.schedule.scheduled().map(|p| p.activation_block),
            cooldown: *s.proposals.cooldown(),
            halted: s.halted.clone(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, StateStoreError> {
        bincode::serialize(&self.state).map_err(|e| StateStoreError::Encode(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StateStoreError> {
        let state: SwitchState =
            bincode::deserialize(bytes).map_err(|e| StateStoreError::Decode(e.to_string()))?;
        if state.format != STATE_FORMAT_VERSION {
            return Err(StateStoreError::Format {
                found: state.format,
                expected: STATE_FORMAT_VERSION,
            });
        }
        Ok(SwitchStateStore::new(state))
    }

    pub fn to_json(&self) -> Result<String, StateStoreError> {
        serde_json::to_string_pretty(&self.state).map_err(|e| StateStoreError::Encode(e.to_string()))
    }

    /// SHA-256 over the canonical encoding, for cross-node comparison.
    pub fn digest(&self) -> Result<String, StateStoreError> {
        let bytes = self.to_bytes()?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(hex::encode(hasher.finalize()))
    }
}
