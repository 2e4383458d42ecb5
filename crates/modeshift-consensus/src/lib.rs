pub mod mode;
pub mod config;
pub mod threat_oracle;
pub mod checkpoint_manager;
pub mod engine;
pub mod pos_engine;
pub mod bft_engine;
pub mod health_fence;
pub mod events;
pub mod proposal_manager;
pub mod switch_coordinator;
pub mod state_store;
pub mod controller;
pub mod safety_invariants;

pub use mode::{BlockHeight, ConsensusMode, ValidatorId};
pub use config::{ActivationConfig, CheckpointConfig, ConfigError, OracleConfig, ProposalConfig, SwitchConfig};
pub use threat_oracle::{ReportChannel, ThreatLevel, ThreatOracle, ThreatReport};
pub use checkpoint_manager::{Checkpoint, CheckpointError, CheckpointManager, LedgerView, StateRoot};
pub use engine::{ConsensusEngine, EngineError, EngineHealth, EngineSet, StartupStatus};
pub use pos_engine::{PosEngine, ValidatorStake};
pub use bft_engine::BftEngine;
pub use health_fence::{FenceVerdict, HealthFence};
pub use events::SwitchEvent;
pub use proposal_manager::{ProposalId, ProposalManager, SwitchPhase, SwitchProposal, VoteOutcome};
pub use switch_coordinator::{ActivationOutcome, ActivationPlan, SwitchCoordinator, SwitchError};
pub use state_store::{StateView, SwitchStateStore};
pub use controller::{BlockContext, BlockReport, SwitchController};
