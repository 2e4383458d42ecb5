// ENGINE HEALTH FENCE
// Bounded observation of a freshly started engine
//
// SAFETY INVARIANTS:
// 1. Observation never exceeds the configured window M
// 2. FAILED ends observation immediately
// 3. PENDING at the deadline is a failure (timeout), never a success
//
// This is the only component that depends on local wall-clock time. Its
// verdict decides between ModeChanged and rollback on each node.

use crate::config::ActivationConfig;
use crate::engine::{EngineHealth, StartupStatus};
use log::debug;
use std::time::Duration;
use tokio::time::Instant;

/// Outcome of fencing an engine start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FenceVerdict {
    Healthy { polls: u32, detail: String },
    Failed { detail: String },
    TimedOut { last: EngineHealth },
}

impl FenceVerdict {
    pub fn is_healthy(&self) -> bool {
        matches!(self, FenceVerdict::Healthy { .. })
    }

    /// Human-readable reason for a non-healthy verdict.
    pub fn reason(&self) -> String {
        match self {
            FenceVerdict::Healthy { detail, .. } => detail.clone(),
            FenceVerdict::Failed { detail } => format!("engine reported FAILED: {}", detail),
            FenceVerdict::TimedOut { last } => {
                format!("engine not healthy within window (last: {})", last.detail)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthFence {
    window: Duration,
    poll_interval: Duration,
}

impl HealthFence {
    pub fn new(window: Duration, poll_interval: Duration) -> Self {
        HealthFence {
            window,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    pub fn from_config(config: &ActivationConfig) -> Self {
        HealthFence::new(config.health_window(), config.health_poll_interval())
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Poll `probe` until it reports OK or FAILED, or the window elapses.
    ///
    /// An OK observed exactly at the deadline still counts.
    pub async fn observe<F>(&self, mut probe: F) -> FenceVerdict
    where
        F: FnMut() -> EngineHealth,
    {
        let deadline = Instant::now() + self.window;
        let mut polls = 0u32;

        loop {
            let health = probe();
            polls += 1;

            match health.startup {
                StartupStatus::Ok => {
                    debug!("Health fence passed after {} polls", polls);
                    return FenceVerdict::Healthy {
                        polls,
                        detail: health.detail,
                    };
                }
                StartupStatus::Failed => {
                    return FenceVerdict::Failed { detail: health.detail };
                }
                StartupStatus::Pending => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return FenceVerdict::TimedOut { last: health };
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fence() -> HealthFence {
        HealthFence::new(Duration::from_secs(5), Duration::from_millis(250))
    }

    /// Health that turns to `status` once `after` has elapsed from `start`.
    fn scripted(start: Instant, after: Duration, status: StartupStatus) -> impl FnMut() -> EngineHealth {
        move || {
            if Instant::now().duration_since(start) >= after {
                EngineHealth { startup: status, detail: "scripted".to_string() }
            } else {
                EngineHealth::pending("warming up")
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_within_window() {
        let start = Instant::now();
        let verdict = fence()
            .observe(scripted(start, Duration::from_secs(2), StartupStatus::Ok))
            .await;
        assert!(verdict.is_healthy());
        assert!(start.elapsed() <= Duration::from_secs(2) + Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_stops_observation_early() {
        let start = Instant::now();
        let verdict = fence()
            .observe(scripted(start, Duration::from_secs(4), StartupStatus::Failed))
            .await;
        assert_eq!(verdict, FenceVerdict::Failed { detail: "scripted".to_string() });
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_past_window_times_out() {
        let start = Instant::now();
        let verdict = fence().observe(|| EngineHealth::pending("syncing")).await;
        assert!(matches!(verdict, FenceVerdict::TimedOut { .. }));
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_millis(5_250));
        assert!(verdict.reason().contains("syncing"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ok_exactly_at_deadline_counts() {
        let start = Instant::now();
        let verdict = fence()
            .observe(scripted(start, Duration::from_secs(5), StartupStatus::Ok))
            .await;
        assert!(verdict.is_healthy());
    }
}
