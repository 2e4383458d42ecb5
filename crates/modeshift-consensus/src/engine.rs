// CONSENSUS ENGINE CONTRACT
// Fixed lifecycle interface every consensus engine implements
//
// SAFETY: The switch coordinator relies on this contract to guarantee that at
// most one engine produces blocks at any time:
// 1. stop() returns only once the engine has reached a terminal stopped state
// 2. start() loads state exclusively from the supplied checkpoint
// 3. health() is side-effect free and may be polled at any frequency
//
// Exactly two engines exist, so they are held in an `EngineSet` and selected
// through the tagged `EngineSlot` enum rather than through trait objects.

use crate::checkpoint_manager::Checkpoint;
use crate::mode::ConsensusMode;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Startup state reported by a freshly started engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartupStatus {
    Ok,
    Failed,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineHealth {
    pub startup: StartupStatus,
    pub detail: String,
}

impl EngineHealth {
    pub fn ok(detail: impl Into<String>) -> Self {
        EngineHealth {
            startup: StartupStatus::Ok,
            detail: detail.into(),
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        EngineHealth {
            startup: StartupStatus::Failed,
            detail: detail.into(),
        }
    }

    pub fn pending(detail: impl Into<String>) -> Self {
        EngineHealth {
            startup: StartupStatus::Pending,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("{mode} engine failed to start: {reason}")]
    StartFailed { mode: ConsensusMode, reason: String },

    #[error("{mode} engine failed to stop: {reason}")]
    StopFailed { mode: ConsensusMode, reason: String },
}

/// Lifecycle contract implemented by each external consensus engine.
#[async_trait]
pub trait ConsensusEngine: Send + Sync {
    /// The mode this engine implements.
    fn mode(&self) -> ConsensusMode;

    /// Start producing/finalizing blocks from `checkpoint`.
    async fn start(&mut self, checkpoint: &Checkpoint) -> Result<(), EngineError>;

    /// Stop and reach a terminal state. Stopping a stopped engine succeeds.
    async fn stop(&mut self) -> Result<(), EngineError>;

    fn health(&self) -> EngineHealth;
}

/// The pair of engines a node can switch between.
pub struct EngineSet<P, B> {
    pos: P,
    bft: B,
}

impl<P: ConsensusEngine, B: ConsensusEngine> EngineSet<P, B> {
    pub fn new(pos: P, bft: B) -> Self {
        EngineSet { pos, bft }
    }

    /// Select the engine for `mode`.
    pub fn slot(&mut self, mode: ConsensusMode) -> EngineSlot<'_, P, B> {
        match mode {
            ConsensusMode::Pos => EngineSlot::Pos(&mut self.pos),
            ConsensusMode::Bft => EngineSlot::Bft(&mut self.bft),
        }
    }

    pub fn health(&self, mode: ConsensusMode) -> EngineHealth {
        match mode {
            ConsensusMode::Pos => self.pos.health(),
            ConsensusMode::Bft => self.bft.health(),
        }
    }

    pub fn pos(&self) -> &P {
        &self.pos
    }

    pub fn bft(&self) -> &B {
        &self.bft
    }

    pub fn pos_mut(&mut self) -> &mut P {
        &mut self.pos
    }

    pub fn bft_mut(&mut self) -> &mut B {
        &mut self.bft
    }
}

/// Mutable handle on one of the two engines, tagged by mode.
pub enum EngineSlot<'a, P, B> {
    Pos(&'a mut P),
    Bft(&'a mut B),
}

impl<'a, P: ConsensusEngine, B: ConsensusEngine> EngineSlot<'a, P, B> {
    pub fn mode(&self) -> ConsensusMode {
        match self {
            EngineSlot::Pos(_) => ConsensusMode::Pos,
            EngineSlot::Bft(_) => ConsensusMode::Bft,
        }
    }

    pub async fn start(&mut self, checkpoint: &Checkpoint) -> Result<(), EngineError> {
        match self {
            EngineSlot::Pos(engine) => engine.start(checkpoint).await,
            EngineSlot::Bft(engine) => engine.start(checkpoint).await,
        }
    }

    pub async fn stop(&mut self) -> Result<(), EngineError> {
        match self {
            EngineSlot::Pos(engine) => engine.stop().await,
            EngineSlot::Bft(engine) => engine.stop().await,
        }
    }

    pub fn health(&self) -> EngineHealth {
        match self {
            EngineSlot::Pos(engine) => engine.health(),
            EngineSlot::Bft(engine) => engine.health(),
        }
    }
}
