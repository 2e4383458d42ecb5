// Shared harness for switch integration tests: scripted engines, an in-memory
// ledger and config builders.
#![allow(dead_code)]

use async_trait::async_trait;
use modeshift_consensus::{
    BlockContext, BlockHeight, Checkpoint, ConsensusEngine, ConsensusMode, EngineError,
    EngineHealth, EngineSet, LedgerView, StateRoot, SwitchConfig, SwitchController, ThreatReport,
    ValidatorId,
};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Behaviour of one engine start.
#[derive(Debug, Clone, Copy)]
pub enum Script {
    HealthyAfter(Duration),
    FailAfter(Duration),
    StartError,
}

pub struct ScriptedEngine {
    mode: ConsensusMode,
    scripts: VecDeque<Script>,
    running: Option<(Script, Instant)>,
    pub stop_hangs: bool,
    pub started_from: Vec<BlockHeight>,
    pub stops: u32,
}

impl ScriptedEngine {
    pub fn new(mode: ConsensusMode) -> Self {
        ScriptedEngine {
            mode,
            scripts: VecDeque::new(),
            running: None,
            stop_hangs: false,
            started_from: Vec::new(),
            stops: 0,
        }
    }

    /// Queue behaviours for upcoming starts; unscripted starts are healthy.
    pub fn with_scripts(mut self, scripts: Vec<Script>) -> Self {
        self.scripts = scripts.into();
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }
}

#[async_trait]
impl ConsensusEngine for ScriptedEngine {
    fn mode(&self) -> ConsensusMode {
        self.mode
    }

    async fn start(&mut self, checkpoint: &Checkpoint) -> Result<(), EngineError> {
        let script = self
            .scripts
            .pop_front()
            .unwrap_or(Script::HealthyAfter(Duration::ZERO));
        self.started_from.push(checkpoint.block_number);
        if let Script::StartError = script {
            return Err(EngineError::StartFailed {
                mode: self.mode,
                reason: "scripted start error".to_string(),
            });
        }
        self.running = Some((script, Instant::now()));
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), EngineError> {
        if self.stop_hangs {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
        }
        self.stops += 1;
        self.running = None;
        Ok(())
    }

    fn health(&self) -> EngineHealth {
        match self.running {
            None => EngineHealth::pending("stopped"),
            Some((Script::HealthyAfter(d), t)) if t.elapsed() >= d => EngineHealth::ok("producing"),
            Some((Script::FailAfter(d), t)) if t.elapsed() >= d => EngineHealth::failed("crashed"),
            Some(_) => EngineHealth::pending("starting"),
        }
    }
}

/// Ledger whose finality trails the processed height by one block.
pub struct MemoryLedger {
    pub finalized: BlockHeight,
    pub validators: Vec<ValidatorId>,
}

impl LedgerView for MemoryLedger {
    fn finalized_height(&self) -> BlockHeight {
        self.finalized
    }

    fn state_root_at(&self, height: BlockHeight) -> Option<StateRoot> {
        if height > self.finalized {
            return None;
        }
        let mut root = [0u8; 32];
        root[..8].copy_from_slice(&height.to_le_bytes());
        Some(root)
    }

    fn validator_set_at(&self, height: BlockHeight) -> Option<Vec<ValidatorId>> {
        (height <= self.finalized).then(|| self.validators.clone())
    }
}

pub type TestController = SwitchController<ScriptedEngine, ScriptedEngine, MemoryLedger>;

pub fn validators(n: usize) -> Vec<ValidatorId> {
    (0..n).map(|i| format!("val-{:02}", i)).collect()
}

/// 30 validators (quorum 20), Δ = 10, cooldown 100, T = 5, M = 5s.
pub fn switch_config() -> SwitchConfig {
    let mut config = SwitchConfig::default();
    config.proposal.validators = validators(30);
    config.proposal.guard_window = 10;
    config.proposal.cooldown_min = 100;
    config.proposal.revert_calm_evaluations = 5;
    config.oracle.window_ms = 5_000;
    config.checkpoint.checkpoint_interval = 0;
    config.activation.stop_timeout_ms = 10_000;
    config.activation.health_window_ms = 5_000;
    config.activation.health_poll_interval_ms = 250;
    config
}

pub async fn controller_with(config: SwitchConfig, pos: ScriptedEngine, bft: ScriptedEngine) -> TestController {
    let ledger = MemoryLedger {
        finalized: 0,
        validators: config.proposal.validators.clone(),
    };
    let mut controller = SwitchController::new(config, EngineSet::new(pos, bft), ledger).unwrap();
    controller.bootstrap().await.unwrap();
    controller
}

pub async fn controller(bft_scripts: Vec<Script>) -> TestController {
    controller_with(
        switch_config(),
        ScriptedEngine::new(ConsensusMode::Pos),
        ScriptedEngine::new(ConsensusMode::Bft).with_scripts(bft_scripts),
    )
    .await
}

pub fn block(height: BlockHeight) -> BlockContext {
    BlockContext::new(height, height * 1_000)
}

/// Process `height` with finality one block behind.
pub async fn advance(controller: &mut TestController, height: BlockHeight) {
    controller.ledger_mut().finalized = height.saturating_sub(1);
    controller.on_block(block(height)).await.unwrap();
}

/// Reports whose normalized signals are all 0.9 (score 90).
pub fn submit_critical(controller: &TestController, height: BlockHeight, reporters: usize) {
    for i in 0..reporters {
        controller.submit_threat_report(ThreatReport::new(
            format!("node-{}", i),
            height * 1_000,
            1_800,
            0.9,
            18,
            900,
        ));
    }
}

pub fn submit_calm(controller: &TestController, height: BlockHeight, reporters: usize) {
    for i in 0..reporters {
        controller.submit_threat_report(ThreatReport::new(
            format!("node-{}", i),
            height * 1_000,
            20,
            0.0,
            0,
            5,
        ));
    }
}

/// Cast votes from the first `count` validators.
pub fn vote(controller: &mut TestController, proposal_id: u64, count: usize) {
    for validator in validators(count) {
        controller.vote_switch(proposal_id, &validator);
    }
}
