// SWITCH EVENTS
// Externally visible record of every threat, proposal and activation transition
//
// Events are appended in block order and never rewritten; they form the audit
// trail observers use to follow a switch end to end.

use crate::mode::{BlockHeight, ConsensusMode};
use crate::proposal_manager::ProposalId;
use crate::threat_oracle::ThreatLevel;
use log::info;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SwitchEvent {
    ThreatLevelChanged {
        block: BlockHeight,
        from: ThreatLevel,
        to: ThreatLevel,
        score: Option<f64>,
    },

    ProposalCreated {
        block: BlockHeight,
        proposal_id: ProposalId,
        target_mode: ConsensusMode,
        activation_block: BlockHeight,
        quorum_needed: usize,
    },

    ProposalCommitted {
        block: BlockHeight,
        proposal_id: ProposalId,
        checkpoint_block: BlockHeight,
        activation_block: BlockHeight,
    },

    ModeChanged {
        block: BlockHeight,
        proposal_id: ProposalId,
        from: ConsensusMode,
        to: ConsensusMode,
    },

    RollbackOccurred {
        block: BlockHeight,
        proposal_id: ProposalId,
        attempted: ConsensusMode,
        restored: ConsensusMode,
        checkpoint_block: BlockHeight,
        reason: String,
    },

    ProposalExpired {
        block: BlockHeight,
        proposal_id: ProposalId,
        votes: usize,
        quorum_needed: usize,
    },
}

impl SwitchEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SwitchEvent::ThreatLevelChanged { .. } => "ThreatLevelChanged",
            SwitchEvent::ProposalCreated { .. } => "ProposalCreated",
            SwitchEvent::ProposalCommitted { .. } => "ProposalCommitted",
            SwitchEvent::ModeChanged { .. } => "ModeChanged",
            SwitchEvent::RollbackOccurred { .. } => "RollbackOccurred",
            SwitchEvent::ProposalExpired { .. } => "ProposalExpired",
        }
    }

    /// Block at which the event was emitted.
    pub fn block(&self) -> BlockHeight {
        match self {
            SwitchEvent::ThreatLevelChanged { block, .. }
            | SwitchEvent::ProposalCreated { block, .. }
            | SwitchEvent::ProposalCommitted { block, .. }
            | SwitchEvent::ModeChanged { block, .. }
            | SwitchEvent::RollbackOccurred { block, .. }
            | SwitchEvent::ProposalExpired { block, .. } => *block,
        }
    }
}

/// In-memory event sink. Every pushed event is also logged.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<SwitchEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        EventLog::default()
    }

    pub fn push(&mut self, event: SwitchEvent) {
        info!("[{}] {} {:?}", event.block(), event.name(), event);
        self.events.push(event);
    }

    pub fn extend(&mut self, events: impl IntoIterator<Item = SwitchEvent>) {
        for event in events {
            self.push(event);
        }
    }

    /// Take all events accumulated since the last drain.
    pub fn drain(&mut self) -> Vec<SwitchEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SwitchEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_name_and_block() {
        let event = SwitchEvent::ModeChanged {
            block: 120,
            proposal_id: 1,
            from: ConsensusMode::Pos,
            to: ConsensusMode::Bft,
        };
        assert_eq!(event.name(), "ModeChanged");
        assert_eq!(event.block(), 120);
    }

    #[test]
    fn test_drain_empties_log() {
        let mut log = EventLog::new();
        log.push(SwitchEvent::ProposalExpired {
            block: 9,
            proposal_id: 3,
            votes: 1,
            quorum_needed: 3,
        });
        assert_eq!(log.len(), 1);
        assert_eq!(log.drain().len(), 1);
        assert!(log.is_empty());
    }
}
