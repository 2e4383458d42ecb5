// THREAT ORACLE
// Median-aggregated threat signals mapped onto a rolling ThreatLevel
//
// SAFETY CONSTRAINTS:
// 1. The oracle is ADVISORY ONLY - it never creates proposals itself
// 2. Reports are BOUNDED (out-of-range fields are dropped at ingestion)
// 3. Aggregation uses MEDIAN so a minority of reporters cannot move the score
// 4. Each node is RATE LIMITED within a window and in the inbox between evaluations
// 5. Missing input never crashes the pipeline; the previous level is held

use crate::config::{LevelThresholds, OracleConfig};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Upper bound of `ThreatReport::anomaly_score`.
pub const MAX_ANOMALY_SCORE: u16 = 1_000;

/// Classified threat level. Totally ordered: LOW < ELEVATED < HIGH < CRITICAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ThreatLevel {
    Low,
    Elevated,
    High,
    Critical,
}

impl ThreatLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatLevel::Low => "LOW",
            ThreatLevel::Elevated => "ELEVATED",
            ThreatLevel::High => "HIGH",
            ThreatLevel::Critical => "CRITICAL",
        }
    }

    /// Classify a 0-100 score against the ascending thresholds.
    pub fn from_score(score: f64, thresholds: &LevelThresholds) -> Self {
        if score >= thresholds.critical {
            ThreatLevel::Critical
        } else if score >= thresholds.high {
            ThreatLevel::High
        } else if score >= thresholds.elevated {
            ThreatLevel::Elevated
        } else {
            ThreatLevel::Low
        }
    }
}

impl Default for ThreatLevel {
    fn default() -> Self {
        ThreatLevel::Low
    }
}

impl fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum OracleError {
    #[error("threat report has an empty node id")]
    MissingNodeId,

    #[error("fork_rate {0} is outside [0, 1]")]
    ForkRateOutOfRange(f64),

    #[error("anomaly_score {0} exceeds 1000")]
    AnomalyOutOfRange(u16),

    #[error("no threat reports in the aggregation window")]
    InputMissing,
}

/// One signal sample produced by a node's local monitoring agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatReport {
    pub node_id: String,

    /// Milliseconds since the Unix epoch
    pub timestamp: u64,

    pub net_latency_ms: u64,

    /// Observed fork rate in [0, 1]
    pub fork_rate: f64,

    pub missed_blocks: u64,

    /// Anomaly score in [0, 1000]
    pub anomaly_score: u16,
}

impl ThreatReport {
    pub fn new(
        node_id: impl Into<String>,
        timestamp: u64,
        net_latency_ms: u64,
        fork_rate: f64,
        missed_blocks: u64,
        anomaly_score: u16,
    ) -> Self {
        ThreatReport {
            node_id: node_id.into(),
            timestamp,
            net_latency_ms,
            fork_rate,
            missed_blocks,
            anomaly_score,
        }
    }

    pub fn validate(&self) -> Result<(), OracleError> {
        if self.node_id.is_empty() {
            return Err(OracleError::MissingNodeId);
        }
        if !self.fork_rate.is_finite() || !(0.0..=1.0).contains(&self.fork_rate) {
            return Err(OracleError::ForkRateOutOfRange(self.fork_rate));
        }
        if self.anomaly_score > MAX_ANOMALY_SCORE {
            return Err(OracleError::AnomalyOutOfRange(self.anomaly_score));
        }
        Ok(())
    }
}

/// Ingestion handle shared by report producers.
///
/// Cloning is cheap; every clone feeds the same oracle. Malformed reports are
/// dropped at the door and never reach the aggregation window. Between two
/// evaluations each node may queue at most `per_node_cap` reports.
#[derive(Debug, Clone)]
pub struct ReportChannel {
    inbox: Arc<Mutex<Inbox>>,
    per_node_cap: usize,
}

#[derive(Debug, Default)]
struct Inbox {
    reports: Vec<ThreatReport>,
    per_node: HashMap<String, usize>,
    dropped: u64,
}

impl ReportChannel {
    pub fn new(per_node_cap: usize) -> Self {
        ReportChannel {
            inbox: Arc::new(Mutex::new(Inbox::default())),
            per_node_cap,
        }
    }

    /// Accept a report. Returns `false` if it was malformed or its node
    /// already has `per_node_cap` reports queued.
    pub fn submit(&self, report: ThreatReport) -> bool {
        if let Err(e) = report.validate() {
            debug!("Dropping threat report from '{}': {}", report.node_id, e);
            return false;
        }
        let mut inbox = self.inbox.lock();
        let queued = inbox.per_node.get(&report.node_id).copied().unwrap_or(0);
        if queued >= self.per_node_cap {
            inbox.dropped += 1;
            debug!("Inbox full for '{}'; dropping threat report", report.node_id);
            return false;
        }
        inbox.per_node.insert(report.node_id.clone(), queued + 1);
        inbox.reports.push(report);
        true
    }

    /// Number of reports waiting to be aggregated.
    pub fn pending(&self) -> usize {
        self.inbox.lock().reports.len()
    }

    /// Reports refused because their node's inbox share was full.
    pub fn dropped(&self) -> u64 {
        self.inbox.lock().dropped
    }

    fn drain(&self) -> Vec<ThreatReport> {
        let mut inbox = self.inbox.lock();
        inbox.per_node.clear();
        std::mem::take(&mut inbox.reports)
    }
}

/// Result of one oracle evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreatAssessment {
    pub level: ThreatLevel,

    /// Weighted score in [0, 100]; `None` when the window was empty
    pub score: Option<f64>,

    pub report_count: usize,

    /// Level was held because the window had no reports
    pub degraded: bool,
}

/// Aggregates the report window into a `ThreatLevel`, once per block.
pub struct ThreatOracle {
    config: OracleConfig,
    channel: ReportChannel,
    window: VecDeque<ThreatReport>,
    level: ThreatLevel,
    last_score: Option<f64>,
    rate_limited: u64,
}

impl ThreatOracle {
    pub fn new(config: OracleConfig) -> Self {
        ThreatOracle {
            channel: ReportChannel::new(config.max_reports_per_node),
            config,
            window: VecDeque::new(),
            level: ThreatLevel::Low,
            last_score: None,
            rate_limited: 0,
        }
    }

    /// Resume with a previously published level (e.g. after restart).
    pub fn with_level(mut self, level: ThreatLevel) -> Self {
        self.level = level;
        self
    }

    pub fn channel(&self) -> ReportChannel {
        self.channel.clone()
    }

    pub fn level(&self) -> ThreatLevel {
        self.level
    }

    pub fn last_score(&self) -> Option<f64> {
        self.last_score
    }

    /// Reports dropped by the per-node rate limit so far, at the inbox or
    /// against the window.
    pub fn rate_limited(&self) -> u64 {
        self.rate_limited + self.channel.dropped()
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// Recompute the level from the window ending at `now_ms`.
    pub fn evaluate(&mut self, now_ms: u64) -> ThreatAssessment {
        let horizon = now_ms.saturating_sub(self.config.window_ms);
        self.window.retain(|r| r.timestamp >= horizon);
        self.ingest(horizon);

        match self.score_window() {
            Ok(score) => {
                let level = ThreatLevel::from_score(score, &self.config.thresholds);
                if level != self.level {
                    info!(
                        "Threat level {} -> {} (score {:.1} over {} reports)",
                        self.level,
                        level,
                        score,
                        self.window.len()
                    );
                }
                self.level = level;
                self.last_score = Some(score);
                ThreatAssessment {
                    level,
                    score: Some(score),
                    report_count: self.window.len(),
                    degraded: false,
                }
            }
            Err(e) => {
                warn!("Oracle input degraded ({}); holding level {}", e, self.level);
                ThreatAssessment {
                    level: self.level,
                    score: None,
                    report_count: 0,
                    degraded: true,
                }
            }
        }
    }

    /// Weighted score of the current window in [0, 100].
    pub fn score_window(&self) -> Result<f64, OracleError> {
        if self.window.is_empty() {
            return Err(OracleError::InputMissing);
        }

        let lat = median(self.window.iter().map(|r| r.net_latency_ms as f64).collect())
            .ok_or(OracleError::InputMissing)?;
        let fork = median(self.window.iter().map(|r| r.fork_rate).collect())
            .ok_or(OracleError::InputMissing)?;
        let miss = median(self.window.iter().map(|r| r.missed_blocks as f64).collect())
            .ok_or(OracleError::InputMissing)?;
        let anom = median(self.window.iter().map(|r| r.anomaly_score as f64).collect())
            .ok_or(OracleError::InputMissing)?;

        let w = &self.config.weights;
        let weighted = w.latency * self.config.latency_bounds.normalize(lat)
            + w.fork_rate * self.config.fork_rate_bounds.normalize(fork)
            + w.missed_blocks * self.config.missed_blocks_bounds.normalize(miss)
            + w.anomaly * self.config.anomaly_bounds.normalize(anom);

        Ok((weighted * 100.0).clamp(0.0, 100.0))
    }

    fn ingest(&mut self, horizon: u64) {
        let mut per_node: HashMap<String, usize> = HashMap::new();
        for report in &self.window {
            *per_node.entry(report.node_id.clone()).or_insert(0) += 1;
        }

        for report in self.channel.drain() {
            if report.timestamp < horizon {
                continue;
            }
            let count = per_node.entry(report.node_id.clone()).or_insert(0);
            if *count >= self.config.max_reports_per_node {
                self.rate_limited += 1;
                debug!("Rate limiting threat reports from '{}'", report.node_id);
                continue;
            }
            *count += 1;
            self.window.push_back(report);
        }
    }
}

/// Median of `values`; even-sized inputs average the two middle values.
fn median(mut values: Vec<f64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(node: &str, ts: u64, latency: u64, fork: f64, missed: u64, anomaly: u16) -> ThreatReport {
        ThreatReport::new(node, ts, latency, fork, missed, anomaly)
    }

    #[test]
    fn test_level_ordering() {
        assert!(ThreatLevel::Low < ThreatLevel::Elevated);
        assert!(ThreatLevel::High < ThreatLevel::Critical);
    }

    #[test]
    fn test_from_score_thresholds() {
        let t = LevelThresholds::default();
        assert_eq!(ThreatLevel::from_score(10.0, &t), ThreatLevel::Low);
        assert_eq!(ThreatLevel::from_score(30.0, &t), ThreatLevel::Elevated);
        assert_eq!(ThreatLevel::from_score(60.0, &t), ThreatLevel::High);
        assert_eq!(ThreatLevel::from_score(90.0, &t), ThreatLevel::Critical);
    }

    #[test]
    fn test_median_odd_and_even() {
        assert_eq!(median(vec![10.0, 50.0, 20.0, 90.0, 80.0]), Some(50.0));
        assert_eq!(median(vec![10.0, 20.0, 80.0, 90.0]), Some(50.0));
        assert_eq!(median(vec![]), None);
    }

    #[test]
    fn test_malformed_reports_rejected_silently() {
        let channel = ReportChannel::new(10);
        assert!(!channel.submit(report("", 0, 10, 0.1, 0, 0)));
        assert!(!channel.submit(report("n1", 0, 10, 1.5, 0, 0)));
        assert!(!channel.submit(report("n1", 0, 10, f64::NAN, 0, 0)));
        assert!(!channel.submit(report("n1", 0, 10, 0.1, 0, 1001)));
        assert!(channel.submit(report("n1", 0, 10, 0.1, 0, 1000)));
        assert_eq!(channel.pending(), 1);
    }

    #[test]
    fn test_empty_window_holds_previous_level() {
        let mut oracle = ThreatOracle::new(OracleConfig::default()).with_level(ThreatLevel::High);
        let assessment = oracle.evaluate(1_000);
        assert!(assessment.degraded);
        assert_eq!(assessment.level, ThreatLevel::High);
        assert_eq!(oracle.level(), ThreatLevel::High);
    }

    #[test]
    fn test_score_of_saturated_signals_is_critical() {
        let mut oracle = ThreatOracle::new(OracleConfig::default());
        let channel = oracle.channel();
        for i in 0..5 {
            channel.submit(report(&format!("n{}", i), 1_000, 2_000, 1.0, 20, 1_000));
        }
        let assessment = oracle.evaluate(1_000);
        assert_eq!(assessment.score, Some(100.0));
        assert_eq!(assessment.level, ThreatLevel::Critical);
    }

    #[test]
    fn test_median_resists_minority_outliers() {
        let mut oracle = ThreatOracle::new(OracleConfig::default());
        let channel = oracle.channel();
        // Three honest calm reporters, two lying about an attack
        for i in 0..3 {
            channel.submit(report(&format!("honest-{}", i), 500, 0, 0.0, 0, 0));
        }
        for i in 0..2 {
            channel.submit(report(&format!("liar-{}", i), 500, 2_000, 1.0, 20, 1_000));
        }
        let assessment = oracle.evaluate(500);
        assert_eq!(assessment.level, ThreatLevel::Low);
    }

    #[test]
    fn test_rate_limit_per_node() {
        let mut config = OracleConfig::default();
        config.max_reports_per_node = 2;
        let mut oracle = ThreatOracle::new(config);
        let channel = oracle.channel();
        let accepted = (0..5)
            .filter(|_| channel.submit(report("chatty", 100, 2_000, 1.0, 20, 1_000)))
            .count();
        assert_eq!(accepted, 2);
        oracle.evaluate(100);
        assert_eq!(oracle.window_len(), 2);
        assert_eq!(oracle.rate_limited(), 3);

        // Window is still full for this node; queued reports are dropped at ingestion
        assert!(channel.submit(report("chatty", 200, 2_000, 1.0, 20, 1_000)));
        oracle.evaluate(200);
        assert_eq!(oracle.window_len(), 2);
        assert_eq!(oracle.rate_limited(), 4);
    }

    #[test]
    fn test_inbox_capped_per_node_between_evaluations() {
        let mut config = OracleConfig::default();
        config.max_reports_per_node = 3;
        let mut oracle = ThreatOracle::new(config);
        let channel = oracle.channel();

        for i in 0..10_000u64 {
            channel.submit(report("flood", i, 2_000, 1.0, 20, 1_000));
        }
        assert!(channel.submit(report("quiet", 0, 0, 0.0, 0, 0)));
        assert_eq!(channel.pending(), 4);
        assert_eq!(channel.dropped(), 9_997);

        // Draining resets the per-node share
        oracle.evaluate(100);
        assert_eq!(channel.pending(), 0);
        assert!(channel.submit(report("quiet", 50, 0, 0.0, 0, 0)));
        assert_eq!(channel.pending(), 1);
    }

    #[test]
    fn test_window_prunes_old_reports() {
        let mut config = OracleConfig::default();
        config.window_ms = 1_000;
        let mut oracle = ThreatOracle::new(config);
        let channel = oracle.channel();
        channel.submit(report("n1", 0, 2_000, 1.0, 20, 1_000));
        let first = oracle.evaluate(500);
        assert_eq!(first.level, ThreatLevel::Critical);

        // The only report ages out; level is held rather than reset
        let later = oracle.evaluate(5_000);
        assert!(later.degraded);
        assert_eq!(oracle.window_len(), 0);
        assert_eq!(later.level, ThreatLevel::Critical);
    }

    #[test]
    fn test_weighted_score_mid_range() {
        let mut oracle = ThreatOracle::new(OracleConfig::default());
        let channel = oracle.channel();
        // latency 1000/2000 = 0.5, fork 0.5, missed 10/20 = 0.5, anomaly 500/1000 = 0.5
        channel.submit(report("n1", 0, 1_000, 0.5, 10, 500));
        let assessment = oracle.evaluate(0);
        assert_eq!(assessment.score, Some(50.0));
        assert_eq!(assessment.level, ThreatLevel::Elevated);
    }
}
