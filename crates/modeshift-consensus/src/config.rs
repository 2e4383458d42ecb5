// SWITCH CONFIGURATION
// Read-only parameters shared by every node. Quorum, guard window and cooldown
// are not re-derivable from state, so all nodes must load identical values.

use crate::mode::{ConsensusMode, ValidatorId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Tolerance used when checking that score weights sum to one.
const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid oracle config: {0}")]
    Oracle(String),

    #[error("invalid proposal config: {0}")]
    Proposal(String),

    #[error("invalid checkpoint config: {0}")]
    Checkpoint(String),

    #[error("invalid activation config: {0}")]
    Activation(String),

    #[error("failed to load configuration: {0}")]
    Load(String),
}

/// Fixed min/max bounds used to normalize a raw signal into [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormBounds {
    pub min: f64,
    pub max: f64,
}

impl NormBounds {
    pub const fn new(min: f64, max: f64) -> Self {
        NormBounds { min, max }
    }

    /// Map `value` into [0, 1], clamping anything outside the bounds.
    pub fn normalize(&self, value: f64) -> f64 {
        if self.max <= self.min {
            return 0.0;
        }
        ((value - self.min) / (self.max - self.min)).clamp(0.0, 1.0)
    }

    fn check(&self, name: &str) -> Result<(), ConfigError> {
        if !self.min.is_finite() || !self.max.is_finite() || self.max <= self.min {
            return Err(ConfigError::Oracle(format!(
                "{} bounds must be finite with max > min (got [{}, {}])",
                name, self.min, self.max
            )));
        }
        Ok(())
    }
}

/// Weights `w1..w4` of the threat score. Must sum to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub latency: f64,
    pub fork_rate: f64,
    pub missed_blocks: f64,
    pub anomaly: f64,
}

impl ScoreWeights {
    pub fn sum(&self) -> f64 {
        self.latency + self.fork_rate + self.missed_blocks + self.anomaly
    }
}

impl Default for ScoreWeights {
    fn default() -> Self {
        ScoreWeights {
            latency: 0.25,
            fork_rate: 0.25,
            missed_blocks: 0.25,
            anomaly: 0.25,
        }
    }
}

/// Ascending score thresholds `τ1 < τ2 < τ3` on the 0-100 scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LevelThresholds {
    /// Scores at or above this are ELEVATED
    pub elevated: f64,

    /// Scores at or above this are HIGH
    pub high: f64,

    /// Scores at or above this are CRITICAL
    pub critical: f64,
}

impl Default for LevelThresholds {
    fn default() -> Self {
        LevelThresholds {
            elevated: 30.0,
            high: 60.0,
            critical: 85.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    /// Reports older than this (relative to the evaluation time) are discarded
    pub window_ms: u64,

    /// Per-node cap on reports retained in one window (rate limit)
    pub max_reports_per_node: usize,

    pub latency_bounds: NormBounds,
    pub fork_rate_bounds: NormBounds,
    pub missed_blocks_bounds: NormBounds,
    pub anomaly_bounds: NormBounds,

    pub weights: ScoreWeights,
    pub thresholds: LevelThresholds,
}

impl Default for OracleConfig {
    fn default() -> Self {
        OracleConfig {
            window_ms: 60_000,
            max_reports_per_node: 4,
            latency_bounds: NormBounds::new(0.0, 2_000.0),
            fork_rate_bounds: NormBounds::new(0.0, 1.0),
            missed_blocks_bounds: NormBounds::new(0.0, 20.0),
            anomaly_bounds: NormBounds::new(0.0, 1_000.0),
            weights: ScoreWeights::default(),
            thresholds: LevelThresholds::default(),
        }
    }
}

impl OracleConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_ms == 0 {
            return Err(ConfigError::Oracle("window_ms must be > 0".to_string()));
        }
        if self.max_reports_per_node == 0 {
            return Err(ConfigError::Oracle("max_reports_per_node must be > 0".to_string()));
        }

        self.latency_bounds.check("latency")?;
        self.fork_rate_bounds.check("fork_rate")?;
        self.missed_blocks_bounds.check("missed_blocks")?;
        self.anomaly_bounds.check("anomaly")?;

        let w = &self.weights;
        if [w.latency, w.fork_rate, w.missed_blocks, w.anomaly]
            .iter()
            .any(|v| !v.is_finite() || *v < 0.0)
        {
            return Err(ConfigError::Oracle("weights must be finite and non-negative".to_string()));
        }
        if (w.sum() - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(ConfigError::Oracle(format!("weights must sum to 1 (got {})", w.sum())));
        }

        let t = &self.thresholds;
        if !(0.0 < t.elevated && t.elevated < t.high && t.high < t.critical && t.critical <= 100.0) {
            return Err(ConfigError::Oracle(format!(
                "thresholds must satisfy 0 < τ1 < τ2 < τ3 <= 100 (got {}, {}, {})",
                t.elevated, t.high, t.critical
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProposalConfig {
    /// Validator set eligible to vote on switch proposals
    pub validators: Vec<ValidatorId>,

    /// Guard window Δ: activation is scheduled at least this many blocks ahead
    pub guard_window: u64,

    /// Minimum block gap between successive switches
    pub cooldown_min: u64,

    /// T: consecutive calm evaluations required before reverting BFT → PoS
    pub revert_calm_evaluations: u32,

    /// Quorum fraction (default 2/3, rounded up)
    pub quorum_numerator: u64,
    pub quorum_denominator: u64,
}

impl Default for ProposalConfig {
    fn default() -> Self {
        ProposalConfig {
            validators: Vec::new(),
            guard_window: 10,
            cooldown_min: 100,
            revert_calm_evaluations: 5,
            quorum_numerator: 2,
            quorum_denominator: 3,
        }
    }
}

impl ProposalConfig {
    /// ⌈numerator/denominator · N⌉ distinct votes.
    pub fn quorum_needed(&self) -> usize {
        let n = self.validators.len() as u64;
        if self.quorum_denominator == 0 {
            return self.validators.len().max(1);
        }
        let needed = (n * self.quorum_numerator + self.quorum_denominator - 1) / self.quorum_denominator;
        (needed as usize).max(1)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.validators.is_empty() {
            return Err(ConfigError::Proposal("validator set must not be empty".to_string()));
        }
        let unique: BTreeSet<&ValidatorId> = self.validators.iter().collect();
        if unique.len() != self.validators.len() {
            return Err(ConfigError::Proposal("validator set contains duplicates".to_string()));
        }
        if self.validators.iter().any(|v| v.is_empty()) {
            return Err(ConfigError::Proposal("validator ids must not be empty".to_string()));
        }
        if self.guard_window == 0 {
            return Err(ConfigError::Proposal("guard_window must be > 0".to_string()));
        }
        if self.revert_calm_evaluations == 0 {
            return Err(ConfigError::Proposal("revert_calm_evaluations must be > 0".to_string()));
        }
        if self.quorum_numerator == 0
            || self.quorum_denominator == 0
            || self.quorum_numerator > self.quorum_denominator
        {
            return Err(ConfigError::Proposal(format!(
                "quorum fraction {}/{} must be in (0, 1]",
                self.quorum_numerator, self.quorum_denominator
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Checkpoints kept for rollback; never fewer than two
    pub retained: usize,

    /// Take a periodic checkpoint every N finalized blocks (0 disables)
    pub checkpoint_interval: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        CheckpointConfig {
            retained: 4,
            checkpoint_interval: 50,
        }
    }
}

impl CheckpointConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retained < 2 {
            return Err(ConfigError::Checkpoint(format!(
                "retained must be >= 2 to support rollback after rollback (got {})",
                self.retained
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivationConfig {
    /// Bound on how long the outgoing engine may take to stop
    pub stop_timeout_ms: u64,

    /// Health fencing window M
    pub health_window_ms: u64,

    pub health_poll_interval_ms: u64,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        ActivationConfig {
            stop_timeout_ms: 10_000,
            health_window_ms: 5_000,
            health_poll_interval_ms: 250,
        }
    }
}

impl ActivationConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn health_window(&self) -> Duration {
        Duration::from_millis(self.health_window_ms)
    }

    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_millis(self.health_poll_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stop_timeout_ms == 0 || self.health_window_ms == 0 || self.health_poll_interval_ms == 0 {
            return Err(ConfigError::Activation("timeouts and intervals must be > 0".to_string()));
        }
        if self.health_poll_interval_ms > self.health_window_ms {
            return Err(ConfigError::Activation(format!(
                "health_poll_interval_ms ({}) exceeds health_window_ms ({})",
                self.health_poll_interval_ms, self.health_window_ms
            )));
        }
        Ok(())
    }
}

/// Complete configuration for a switch controller.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchConfig {
    /// Mode the chain runs at genesis
    pub initial_mode: ConsensusMode,
    pub oracle: OracleConfig,
    pub proposal: ProposalConfig,
    pub checkpoint: CheckpointConfig,
    pub activation: ActivationConfig,
}

impl SwitchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.oracle.validate()?;
        self.proposal.validate()?;
        self.checkpoint.validate()?;
        self.activation.validate()
    }

    /// Load from a TOML/JSON/YAML file, with `MODESHIFT__SECTION__KEY`
    /// environment overrides applied on top. The result is validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("MODESHIFT").separator("__"))
            .build()
            .map_err(|e| ConfigError::Load(e.to_string()))?;

        let loaded: SwitchConfig = settings
            .try_deserialize()
            .map_err(|e| ConfigError::Load(e.to_string()))?;
        loaded.validate()?;
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn validators(n: usize) -> Vec<ValidatorId> {
        (0..n).map(|i| format!("val-{}", i)).collect()
    }

    #[test]
    fn test_quorum_is_two_thirds_rounded_up() {
        let mut cfg = ProposalConfig::default();
        cfg.validators = validators(30);
        assert_eq!(cfg.quorum_needed(), 20);

        cfg.validators = validators(4);
        assert_eq!(cfg.quorum_needed(), 3);

        cfg.validators = validators(10);
        assert_eq!(cfg.quorum_needed(), 7);
    }

    #[test]
    fn test_normalize_clamps() {
        let bounds = NormBounds::new(0.0, 2000.0);
        assert_eq!(bounds.normalize(1000.0), 0.5);
        assert_eq!(bounds.normalize(-5.0), 0.0);
        assert_eq!(bounds.normalize(9000.0), 1.0);
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let mut cfg = OracleConfig::default();
        assert!(cfg.validate().is_ok());
        cfg.weights.anomaly = 0.5;
        assert!(matches!(cfg.validate(), Err(ConfigError::Oracle(_))));
    }

    #[test]
    fn test_thresholds_must_ascend() {
        let mut cfg = OracleConfig::default();
        cfg.thresholds.high = 20.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_default_config_requires_validators() {
        let mut cfg = SwitchConfig::default();
        assert!(matches!(cfg.validate(), Err(ConfigError::Proposal(_))));
        cfg.proposal.validators = validators(4);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_duplicate_validators_rejected() {
        let mut cfg = ProposalConfig::default();
        cfg.validators = vec!["a".to_string(), "a".to_string()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_retention_below_two_rejected() {
        let cfg = CheckpointConfig { retained: 1, checkpoint_interval: 0 };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_poll_interval_bounded_by_window() {
        let cfg = ActivationConfig {
            stop_timeout_ms: 100,
            health_window_ms: 50,
            health_poll_interval_ms: 100,
        };
        assert!(cfg.validate().is_err());
    }

    // Environment overrides are process-wide; loads that read them take this lock
    static ENV_LOCK: parking_lot::Mutex<()> = parking_lot::const_mutex(());

    const SAMPLE_TOML: &str = r#"
initial_mode = "Pos"

[proposal]
validators = ["v1", "v2", "v3", "v4"]
guard_window = 5
cooldown_min = 20

[activation]
health_window_ms = 4000
"#;

    fn sample_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(SAMPLE_TOML.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_from_toml_file() {
        let _env = ENV_LOCK.lock();
        let file = sample_file();
        let cfg = SwitchConfig::load(file.path()).unwrap();

        assert_eq!(cfg.proposal.guard_window, 5);
        assert_eq!(cfg.proposal.quorum_needed(), 3);
        assert_eq!(cfg.activation.health_window_ms, 4000);
        // Untouched sections fall back to defaults
        assert_eq!(cfg.oracle, OracleConfig::default());
    }

    #[test]
    fn test_env_overrides_file_values() {
        let _env = ENV_LOCK.lock();
        let file = sample_file();

        std::env::set_var("MODESHIFT__PROPOSAL__GUARD_WINDOW", "12");
        std::env::set_var("MODESHIFT__ACTIVATION__STOP_TIMEOUT_MS", "7000");
        let loaded = SwitchConfig::load(file.path());
        std::env::remove_var("MODESHIFT__PROPOSAL__GUARD_WINDOW");
        std::env::remove_var("MODESHIFT__ACTIVATION__STOP_TIMEOUT_MS");

        let cfg = loaded.unwrap();
        assert_eq!(cfg.proposal.guard_window, 12);
        assert_eq!(cfg.activation.stop_timeout_ms, 7000);
        // Keys without an override keep the file value
        assert_eq!(cfg.proposal.cooldown_min, 20);
        assert_eq!(cfg.activation.health_window_ms, 4000);
    }

    #[test]
    fn test_env_override_is_validated() {
        let _env = ENV_LOCK.lock();
        let file = sample_file();

        std::env::set_var("MODESHIFT__PROPOSAL__GUARD_WINDOW", "0");
        let loaded = SwitchConfig::load(file.path());
        std::env::remove_var("MODESHIFT__PROPOSAL__GUARD_WINDOW");

        assert!(loaded.is_err());
    }
}
