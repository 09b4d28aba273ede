// Restart policy
// Crash-loop circuit breaker: a restart budget per time window with exponential backoff

use crate::config::HealthSection;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Restart budget and spacing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Restarts allowed inside one window
    pub max_restarts: u32,

    pub window: Duration,

    /// Exponential backoff base
    pub min_backoff: Duration,

    /// Exponential backoff cap
    pub max_backoff: Duration,
}

/// Restart timestamps of one worker
#[derive(Debug, Default)]
pub struct RestartHistory {
    recent: VecDeque<Instant>,
}

/// Whether a dead worker may be restarted now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartVerdict {
    Allowed,
    Backoff { remaining: Duration },
    Exhausted { restarts: u32 },
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::from(&HealthSection::default())
    }
}

impl From<&HealthSection> for RestartPolicy {
    fn from(section: &HealthSection) -> Self {
        Self {
            max_restarts: section.max_restarts,
            window: Duration::from_secs(section.restart_window_secs),
            min_backoff: Duration::from_millis(section.min_backoff_ms),
            max_backoff: Duration::from_millis(section.max_backoff_ms),
        }
    }
}

impl RestartPolicy {
    pub fn evaluate(&self, history: &mut RestartHistory, now: Instant) -> RestartVerdict {
        history.prune(now, self.window);

        let restarts = history.recent.len() as u32;
        if restarts >= self.max_restarts {
            return RestartVerdict::Exhausted { restarts };
        }

        if let Some(last) = history.recent.back() {
            let delay = self.backoff(restarts);
            let elapsed = now.saturating_duration_since(*last);
            if elapsed < delay {
                return RestartVerdict::Backoff {
                    remaining: delay - elapsed,
                };
            }
        }

        RestartVerdict::Allowed
    }

    /// Exponential backoff delay after `restarts` recent restarts
    pub fn backoff(&self, restarts: u32) -> Duration {
        let factor = 2u32.saturating_pow(restarts.saturating_sub(1));
        self.min_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

impl RestartHistory {
    pub fn record(&mut self, now: Instant) {
        self.recent.push_back(now);
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(first) = self.recent.front() {
            if now.saturating_duration_since(*first) >= window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RestartPolicy {
        RestartPolicy {
            max_restarts: 3,
            window: Duration::from_secs(60),
            min_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(5000),
        }
    }

    #[test]
    fn test_backoff_calculation() {
        let policy = policy();
        assert_eq!(policy.backoff(1), Duration::from_millis(1000));
        assert_eq!(policy.backoff(2), Duration::from_millis(2000));
        assert_eq!(policy.backoff(3), Duration::from_millis(4000));
    }

    #[test]
    fn test_backoff_cap() {
        assert_eq!(policy().backoff(10), Duration::from_millis(5000));
    }

    #[test]
    fn test_first_restart_is_immediate() {
        let mut history = RestartHistory::default();
        assert_eq!(policy().evaluate(&mut history, Instant::now()), RestartVerdict::Allowed);
    }

    #[test]
    fn test_backoff_between_restarts() {
        let policy = policy();
        let start = Instant::now();
        let mut history = RestartHistory::default();
        history.record(start);

        let verdict = policy.evaluate(&mut history, start + Duration::from_millis(400));
        assert_eq!(
            verdict,
            RestartVerdict::Backoff {
                remaining: Duration::from_millis(600)
            }
        );
        assert_eq!(
            policy.evaluate(&mut history, start + Duration::from_millis(1000)),
            RestartVerdict::Allowed
        );
    }

    #[test]
    fn test_crash_loop_exhausts_budget() {
        let policy = policy();
        let start = Instant::now();
        let mut history = RestartHistory::default();
        for i in 0..3 {
            history.record(start + Duration::from_secs(i * 10));
        }

        assert_eq!(
            policy.evaluate(&mut history, start + Duration::from_secs(30)),
            RestartVerdict::Exhausted { restarts: 3 }
        );
    }

    #[test]
    fn test_window_expiry_restores_budget() {
        let policy = policy();
        let start = Instant::now();
        let mut history = RestartHistory::default();
        for i in 0..3 {
            history.record(start + Duration::from_secs(i));
        }

        assert_eq!(
            policy.evaluate(&mut history, start + Duration::from_secs(65)),
            RestartVerdict::Allowed
        );
    }
}
