// CONSENSUS MODES
// The two engines a node may run, and the identifiers shared by every component.
//
// SAFETY INVARIANTS:
// 1. Exactly two modes exist; every switch goes from one to the other
// 2. Mode names are stable (they appear in checkpoints and persisted state)

use serde::{Deserialize, Serialize};
use std::fmt;

/// Block height on the replicated ledger.
pub type BlockHeight = u64;

/// Validator identity (public key identifier).
pub type ValidatorId = String;

/// Consensus modes the ledger can switch between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConsensusMode {
    /// Stake-weighted voting
    Pos,

    /// Byzantine-fault-tolerant committee voting
    Bft,
}

impl ConsensusMode {
    /// Return a human-readable name for logging and diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsensusMode::Pos => "POS",
            ConsensusMode::Bft => "BFT",
        }
    }

    /// The mode a switch out of `self` would land in.
    pub fn counterpart(&self) -> ConsensusMode {
        match self {
            ConsensusMode::Pos => ConsensusMode::Bft,
            ConsensusMode::Bft => ConsensusMode::Pos,
        }
    }
}

impl Default for ConsensusMode {
    fn default() -> Self {
        ConsensusMode::Pos
    }
}

impl fmt::Display for ConsensusMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counterpart_is_involution() {
        assert_eq!(ConsensusMode::Pos.counterpart(), ConsensusMode::Bft);
        assert_eq!(ConsensusMode::Bft.counterpart().counterpart(), ConsensusMode::Bft);
    }

    #[test]
    fn test_mode_serializes_by_name() {
        let json = serde_json::to_string(&ConsensusMode::Bft).unwrap();
        assert_eq!(json, "\"Bft\"");
        assert_eq!(ConsensusMode::Pos.to_string(), "POS");
    }
}
