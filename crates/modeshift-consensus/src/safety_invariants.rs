// MODE SWITCHING - SAFETY INVARIANTS
//
// This module documents the safety guarantees of adaptive consensus mode
// switching. All claims are enforced by code and verified by tests.

//! # Safety Invariants for Consensus Mode Switching
//!
//! ## 1. SINGLE PROPOSAL IN FLIGHT
//!
//! **Invariant**: At most one switch proposal is pending, quorum-reached or
//! committed at any time.
//!
//! **Implementation**:
//! - `SwitchPhase::in_flight()` gates both threat-triggered and explicit proposals
//! - `ProposalManager::propose_switch()` rejects with `ProposalError::InFlight`
//!   instead of queueing, so the earliest created proposal always wins
//!
//! **Verification**:
//! - Test: `test_second_proposal_suppressed_while_in_flight`
//! - Property: `prop_single_proposal_in_flight`
//!
//! ---
//!
//! ## 2. QUORUM CORRECTNESS
//!
//! **Invariant**: A proposal commits iff it holds at least ⌈2/3·N⌉ distinct
//! votes from the configured validator set.
//!
//! **Implementation**:
//! - Votes are a `BTreeSet` keyed by validator id; re-votes are `Duplicate`
//! - Votes from identities outside the set are rejected
//! - The ordered `vote_log` is audit only and never counted
//!
//! **Verification**:
//! - Test: `test_votes_are_idempotent_and_restricted`
//! - Property: `prop_commit_iff_distinct_quorum`
//!
//! ---
//!
//! ## 3. COOLDOWN AND HYSTERESIS
//!
//! **Invariant**: No activation is scheduled less than `cooldown_min` blocks
//! after the previous switch. PoS → BFT needs HIGH or above; BFT → PoS needs
//! ELEVATED or below for T consecutive evaluations.
//!
//! **Implementation**:
//! - Committing sets `CooldownState::last_switch` to the activation block,
//!   whether the activation later succeeds or rolls back
//! - Expiry never touches the cooldown
//! - A falling threat level never retracts an in-flight proposal; it commits
//!   or expires on its own votes
//!
//! **Verification**:
//! - Test: `test_cooldown_blocks_next_switch`
//! - Test: `test_falling_threat_keeps_committed_proposal`
//! - Test: `test_falling_threat_leaves_pending_proposal_to_expire`
//! - Test: `test_revert_requires_consecutive_calm_evaluations`
//! - Test: `test_cooldown_suppresses_immediate_revert`
//!
//! ---
//!
//! ## 4. CHECKPOINT MONOTONICITY
//!
//! **Invariant**: Checkpoints exist only for finalized blocks, never move
//! backwards, and the newest checkpoint of each mode is always retained.
//!
//! **Verification**:
//! - Test: `test_capture_rejects_unfinalized_block`
//! - Test: `test_retention_keeps_latest_of_each_mode`
//!
//! ---
//!
//! ## 5. ROLLBACK SAFETY
//!
//! **Invariant**: If the target engine reports FAILED, errors on start, or is
//! not OK within the health window M, the node returns to the source mode at
//! the activation checkpoint: the last finalized block at or below the
//! activation block. The target started from that same checkpoint.
//!
//! **Implementation**:
//! - `SwitchController::activate()` captures the activation checkpoint just
//!   before handing the plan over; the arming checkpoint is the fallback
//! - `SwitchCoordinator::execute()` stops the target, restarts the source from
//!   `ActivationPlan::checkpoint`, and fences the restored engine
//! - Block heights are strictly consecutive, so no height is skipped or
//!   processed twice across a rollback
//!
//! **Verification**:
//! - Test: `test_failed_health_rolls_back_to_checkpoint`
//! - Test: `test_health_timeout_rolls_back`
//! - Test: `test_failed_bft_start_rolls_back_to_pos`
//! - Test: `test_unhealthy_window_rolls_back_to_pos`
//! - Test: `test_activation_starts_from_last_finalized_block`
//! - Test: `test_activation_never_checkpoints_past_activation_block`
//!
//! ---
//!
//! ## 6. HALT ON UNSAFE ENGINE STATE
//!
//! **Invariant**: The node never runs two engines, and never silently runs none.
//!
//! **Implementation**:
//! - Stop is bounded by `stop_timeout`; overrun is `EngineStopTimeout`
//! - A failed restore during rollback is `RollbackFailed`
//! - Both are fatal: the controller halts until `operator_resume`
//! - An engine that fails its bootstrap fence is stopped before the error returns
//!
//! **Verification**:
//! - Test: `test_stop_timeout_is_fatal`
//! - Test: `test_stop_timeout_halts_until_operator_resume`
//! - Test: `test_unhealthy_bootstrap_stops_engine`
//!
//! ---
//!
//! ## 7. ORACLE ROBUSTNESS
//!
//! **Invariant**: A minority of reporters cannot move the threat level, and
//! missing input never resets it.
//!
//! **Verification**:
//! - Test: `test_median_resists_minority_outliers`
//! - Test: `test_empty_window_holds_previous_level`
