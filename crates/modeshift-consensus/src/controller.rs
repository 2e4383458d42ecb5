// SWITCH CONTROLLER
// Per-block orchestration of oracle, proposal FSM, checkpoints and activation
//
// SAFETY INVARIANTS:
// 1. Blocks are processed at strictly consecutive heights
// 2. Each block is one state transition, sealed by a single store commit
// 3. Activation happens only inside on_block at the scheduled height
// 4. A fatal activation error halts all further transitions until
//    operator_resume is called
//
// Order of work inside a block:
//   oracle -> proposal FSM -> checkpoint arming -> periodic checkpoint
//   -> activation -> commit

use crate::checkpoint_manager::{Checkpoint, LedgerView};
use crate::config::{ConfigError, SwitchConfig};
use crate::engine::{ConsensusEngine, EngineError, EngineSet};
use crate::events::{EventLog, SwitchEvent};
use crate::mode::{BlockHeight, ConsensusMode};
use crate::proposal_manager::{ProposalId, VoteOutcome, VoteRejection};
use crate::state_store::{StateView, SwitchStateStore};
use crate::switch_coordinator::{ActivationOutcome, ActivationPlan, SwitchCoordinator, SwitchError};
use crate::threat_oracle::{ReportChannel, ThreatLevel, ThreatOracle, ThreatReport};
use log::{debug, error, info, warn};

/// Block being applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockContext {
    pub height: BlockHeight,

    /// Block timestamp in milliseconds; drives the oracle window
    pub timestamp_ms: u64,
}

impl BlockContext {
    pub fn new(height: BlockHeight, timestamp_ms: u64) -> Self {
        BlockContext { height, timestamp_ms }
    }
}

/// Summary of one processed block.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockReport {
    pub height: BlockHeight,
    pub version: u64,
    pub threat_level: ThreatLevel,
    pub active_mode: ConsensusMode,
    pub activation: Option<ActivationOutcome>,
}

pub struct SwitchController<P, B, L> {
    config: SwitchConfig,
    oracle: ThreatOracle,
    coordinator: SwitchCoordinator,
    engines: EngineSet<P, B>,
    ledger: L,
    store: SwitchStateStore,
    events: EventLog,
}

impl<P, B, L> SwitchController<P, B, L>
where
    P: ConsensusEngine,
    B: ConsensusEngine,
    L: LedgerView,
{
    pub fn new(config: SwitchConfig, engines: EngineSet<P, B>, ledger: L) -> Result<Self, ConfigError> {
        let store = SwitchStateStore::genesis(&config);
        SwitchController::restore(config, engines, ledger, store)
    }

    /// Resume from persisted switch state.
    pub fn restore(
        config: SwitchConfig,
        engines: EngineSet<P, B>,
        ledger: L,
        store: SwitchStateStore,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let oracle = ThreatOracle::new(config.oracle.clone()).with_level(store.state().threat_level);
        let coordinator = SwitchCoordinator::from_config(&config.activation);
        Ok(SwitchController {
            config,
            oracle,
            coordinator,
            engines,
            ledger,
            store,
            events: EventLog::new(),
        })
    }

    /// Start the engine for the current mode from its latest checkpoint,
    /// capturing one at the finalized height if none exists yet.
    pub async fn bootstrap(&mut self) -> Result<Checkpoint, SwitchError> {
        self.ensure_running()?;
        let mode = self.current_mode();

        let existing = self.store.state().checkpoints.latest_for_mode(mode).cloned();
        let checkpoint = match existing {
            Some(checkpoint) => checkpoint,
            None => {
                let finalized = self.ledger.finalized_height();
                self.store
                    .state_mut()
                    .checkpoints
                    .capture(&self.ledger, finalized, mode)?
            }
        };

        let started = self.engines.slot(mode).start(&checkpoint).await;
        started?;

        let verdict = self.coordinator.fence().observe(|| self.engines.health(mode)).await;
        if !verdict.is_healthy() {
            error!("{} engine failed to bootstrap: {}", mode, verdict.reason());
            self.coordinator.stop_engine(self.engines.slot(mode)).await?;
            return Err(SwitchError::Engine(EngineError::StartFailed {
                mode,
                reason: verdict.reason(),
            }));
        }

        info!("{} engine bootstrapped from checkpoint {}", mode, checkpoint.block_number);
        Ok(checkpoint)
    }

    pub fn config(&self) -> &SwitchConfig {
        &self.config
    }

    /// Handle for report producers; may be cloned across threads.
    pub fn report_channel(&self) -> ReportChannel {
        self.oracle.channel()
    }

    /// Malformed reports, and reports past a node's inbox share, are dropped silently.
    pub fn submit_threat_report(&self, report: ThreatReport) -> bool {
        self.oracle.channel().submit(report)
    }

    pub fn propose_switch(
        &mut self,
        target_mode: ConsensusMode,
        activation_block: BlockHeight,
    ) -> Result<ProposalId, SwitchError> {
        self.ensure_running()?;
        let current = self.current_block();
        let id = self
            .store
            .state_mut()
            .proposals
            .propose_switch(target_mode, activation_block, current)?;
        self.flush_proposal_events();
        Ok(id)
    }

    pub fn vote_switch(&mut self, proposal_id: ProposalId, validator: &str) -> VoteOutcome {
        if self.store.state().halted.is_some() {
            return VoteOutcome::Rejected(VoteRejection::Halted);
        }
        let current = self.current_block();
        self.store
            .state_mut()
            .proposals
            .vote_switch(proposal_id, validator, current)
    }

    /// Apply one block: the only place switch state advances.
    pub async fn on_block(&mut self, block: BlockContext) -> Result<BlockReport, SwitchError> {
        self.ensure_running()?;
        if let Some(last) = self.store.state().last_block {
            let expected = last + 1;
            if block.height != expected {
                return Err(SwitchError::HeightOutOfOrder {
                    expected,
                    got: block.height,
                });
            }
        }

        let height = block.height;
        let assessment = self.oracle.evaluate(block.timestamp_ms);
        let previous = self.store.state().threat_level;
        if assessment.level != previous {
            self.events.push(SwitchEvent::ThreatLevelChanged {
                block: height,
                from: previous,
                to: assessment.level,
                score: assessment.score,
            });
            self.store.state_mut().threat_level = assessment.level;
        }

        self.store.state_mut().proposals.evaluate(assessment.level, height);
        self.flush_proposal_events();

        self.arm_checkpoint(height);
        self.flush_proposal_events();
        self.periodic_checkpoint();

        let due = self.store.state_mut().schedule.take_due(height);
        let activation = match due {
            Some(mut plan) => match self.activate(&mut plan).await {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    error!("Halting mode switching at block {}: {}", height, e);
                    let state = self.store.state_mut();
                    state.halted = Some(e.to_string());
                    state.last_block = Some(height);
                    self.store.commit();
                    return Err(e);
                }
            },
            None => None,
        };

        self.store.state_mut().last_block = Some(height);
        let version = self.store.commit();

        Ok(BlockReport {
            height,
            version,
            threat_level: assessment.level,
            active_mode: self.current_mode(),
            activation,
        })
    }

    /// Clear a halt after the operator has brought `mode`'s engine back.
    pub fn operator_resume(&mut self, mode: ConsensusMode) {
        let state = self.store.state_mut();
        let Some(reason) = state.halted.take() else {
            debug!("operator_resume called while not halted");
            return;
        };

        if let Some(plan) = state.schedule.clear() {
            warn!("Discarding activation plan for proposal {}", plan.proposal_id);
        }
        state.proposals.force_stable(mode);
        warn!("Operator resumed switching in {} mode (halt reason: {})", mode, reason);
        self.store.commit();
    }

    pub fn view(&self) -> StateView {
        self.store.view()
    }

    pub fn current_mode(&self) -> ConsensusMode {
        self.store.state().proposals.current_mode()
    }

    pub fn threat_level(&self) -> ThreatLevel {
        self.store.state().threat_level
    }

    pub fn is_halted(&self) -> bool {
        self.store.state().halted.is_some()
    }

    pub fn drain_events(&mut self) -> Vec<SwitchEvent> {
        self.flush_proposal_events();
        self.events.drain()
    }

    pub fn store(&self) -> &SwitchStateStore {
        &self.store
    }

    pub fn engines(&self) -> &EngineSet<P, B> {
        &self.engines
    }

    pub fn engines_mut(&mut self) -> &mut EngineSet<P, B> {
        &mut self.engines
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut L {
        &mut self.ledger
    }

    fn ensure_running(&self) -> Result<(), SwitchError> {
        match &self.store.state().halted {
            Some(reason) => Err(SwitchError::Halted(reason.clone())),
            None => Ok(()),
        }
    }

    fn current_block(&self) -> BlockHeight {
        self.store.state().last_block.unwrap_or(0)
    }

    fn flush_proposal_events(&mut self) {
        let events = self.store.state_mut().proposals.drain_events();
        self.events.extend(events);
    }

    /// Capture the arming checkpoint once a finalized block inside the
    /// window exists; until then the proposal keeps waiting.
    fn arm_checkpoint(&mut self, height: BlockHeight) {
        let state = self.store.state_mut();
        let Some((from, to)) = state.proposals.checkpoint_window() else {
            return;
        };

        let at = self.ledger.finalized_height().min(to);
        if at < from {
            debug!("Waiting for finality at block {} to arm switch (finalized {})", from, at);
            return;
        }

        let mode = state.proposals.current_mode();
        let checkpoint = match state.checkpoints.capture(&self.ledger, at, mode) {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                warn!("Arming checkpoint at block {} not captured: {}", at, e);
                return;
            }
        };

        let proposal = match state.proposals.attach_checkpoint(checkpoint.clone(), height) {
            Ok(proposal) => proposal,
            Err(e) => {
                warn!("Checkpoint {} rejected for arming: {}", checkpoint.block_number, e);
                return;
            }
        };

        let plan = ActivationPlan::from_committed(&proposal, checkpoint);
        if let Err(e) = state.schedule.arm(plan, &state.checkpoints, height) {
            error!("Committed proposal {} could not be scheduled: {}", proposal.id, e);
            state.halted = Some(e.to_string());
        }
    }

    /// Keep a fresh rollback target while no switch is in flight.
    fn periodic_checkpoint(&mut self) {
        let interval = self.config.checkpoint.checkpoint_interval;
        if interval == 0 {
            return;
        }

        let state = self.store.state_mut();
        if state.halted.is_some()
            || state.proposals.in_flight().is_some()
            || state.schedule.scheduled().is_some()
        {
            return;
        }

        let finalized = self.ledger.finalized_height();
        let due = match state.checkpoints.latest() {
            Some(latest) => finalized >= latest.block_number + interval,
            None => true,
        };
        if !due {
            return;
        }

        let mode = state.proposals.current_mode();
        if let Err(e) = state.checkpoints.capture(&self.ledger, finalized, mode) {
            debug!("Periodic checkpoint at block {} skipped: {}", finalized, e);
        }
    }

    /// Move the plan's checkpoint up to the last finalized block at or below
    /// activation, so the target starts from (and a rollback restores) the
    /// newest committed state. The arming checkpoint stays the fallback.
    fn refresh_checkpoint(&mut self, plan: &mut ActivationPlan) {
        let at = self.ledger.finalized_height().min(plan.activation_block);
        if at <= plan.checkpoint.block_number {
            return;
        }

        let state = self.store.state_mut();
        match state.checkpoints.capture(&self.ledger, at, plan.source_mode) {
            Ok(checkpoint) => {
                debug!(
                    "Activation checkpoint for proposal {} moved from block {} to {}",
                    plan.proposal_id, plan.checkpoint.block_number, checkpoint.block_number
                );
                plan.checkpoint = checkpoint;
            }
            Err(e) => warn!(
                "Activation checkpoint at block {} not captured ({}); using armed checkpoint {}",
                at, e, plan.checkpoint.block_number
            ),
        }
    }

    /// Run the coordinator for `plan` and fold the outcome back into the FSM.
    async fn activate(&mut self, plan: &mut ActivationPlan) -> Result<ActivationOutcome, SwitchError> {
        self.refresh_checkpoint(plan);
        let plan = &*plan;
        let result = self
            .coordinator
            .execute(plan, &mut self.engines, &self.store.state().checkpoints)
            .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                // Nothing was stopped; the source engine keeps running
                warn!("Activation of proposal {} abandoned: {}", plan.proposal_id, e);
                ActivationOutcome::RolledBack {
                    proposal_id: plan.proposal_id,
                    block: plan.activation_block,
                    attempted: plan.target_mode,
                    restored: plan.source_mode,
                    checkpoint_block: plan.checkpoint.block_number,
                    reason: e.to_string(),
                }
            }
        };

        self.store
            .state_mut()
            .proposals
            .complete_switch(plan.proposal_id, outcome.active_mode())?;

        let event = match &outcome {
            ActivationOutcome::Switched { proposal_id, block, from, to } => SwitchEvent::ModeChanged {
                block: *block,
                proposal_id: *proposal_id,
                from: *from,
                to: *to,
            },
            ActivationOutcome::RolledBack {
                proposal_id,
                block,
                attempted,
                restored,
                checkpoint_block,
                reason,
            } => SwitchEvent::RollbackOccurred {
                block: *block,
                proposal_id: *proposal_id,
                attempted: *attempted,
                restored: *restored,
                checkpoint_block: *checkpoint_block,
                reason: reason.clone(),
            },
        };
        self.events.push(event);
        Ok(outcome)
    }
}
