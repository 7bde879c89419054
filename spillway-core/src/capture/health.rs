//! Restart-rate bookkeeping for the health policy.
//!
//! Restarts themselves are unconditional; this tracker is the ceiling on
//! top: too many restart attempts inside a sliding window and the session
//! is suspended instead of crash-looping forever.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::HealthConfig;

/// Decision for one restart attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Proceed,
    /// The window is saturated; the session must suspend.
    Suspend { restarts_in_window: u32 },
}

/// Sliding-window counter over restart attempts.
#[derive(Debug)]
pub struct RestartTracker {
    window: Duration,
    max_restarts: u32,
    attempts: VecDeque<Instant>,
}

impl RestartTracker {
    pub fn new(health: &HealthConfig) -> Self {
        Self {
            window: health.restart_window(),
            max_restarts: health.max_restarts_in_window,
            attempts: VecDeque::new(),
        }
    }

    /// Records a restart attempt at `now` and decides whether it may
    /// proceed. Manual and policy-triggered restarts count alike.
    pub fn record(&mut self, now: Instant) -> RestartDecision {
        while let Some(front) = self.attempts.front() {
            if now.duration_since(*front) > self.window {
                self.attempts.pop_front();
            } else {
                break;
            }
        }

        self.attempts.push_back(now);
        let in_window = self.attempts.len() as u32;
        if in_window > self.max_restarts {
            RestartDecision::Suspend {
                restarts_in_window: in_window,
            }
        } else {
            RestartDecision::Proceed
        }
    }

    /// Attempts currently inside the window.
    pub fn count_in_window(&self, now: Instant) -> u32 {
        self.attempts
            .iter()
            .filter(|at| now.duration_since(**at) <= self.window)
            .count() as u32
    }

    /// Forgets history, e.g. after an operator manually revives a
    /// suspended session.
    pub fn reset(&mut self) {
        self.attempts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(max: u32, window_secs: u64) -> RestartTracker {
        RestartTracker::new(&HealthConfig {
            max_restarts_in_window: max,
            restart_window_secs: window_secs,
            ..HealthConfig::default()
        })
    }

    #[test]
    fn restarts_below_the_ceiling_proceed() {
        let mut tracker = tracker(3, 600);
        let base = Instant::now();

        for i in 0..3 {
            let at = base + Duration::from_secs(i * 10);
            assert_eq!(tracker.record(at), RestartDecision::Proceed);
        }
        assert_eq!(tracker.count_in_window(base + Duration::from_secs(30)), 3);
    }

    #[test]
    fn saturated_window_suspends() {
        let mut tracker = tracker(2, 600);
        let base = Instant::now();

        assert_eq!(tracker.record(base), RestartDecision::Proceed);
        assert_eq!(tracker.record(base + Duration::from_secs(1)), RestartDecision::Proceed);
        assert_eq!(
            tracker.record(base + Duration::from_secs(2)),
            RestartDecision::Suspend { restarts_in_window: 3 }
        );
    }

    #[test]
    fn old_attempts_age_out_of_the_window() {
        let mut tracker = tracker(2, 60);
        let base = Instant::now();

        tracker.record(base);
        tracker.record(base + Duration::from_secs(1));
        // Both prior attempts are outside the 60s window by now.
        assert_eq!(
            tracker.record(base + Duration::from_secs(120)),
            RestartDecision::Proceed
        );
        assert_eq!(tracker.count_in_window(base + Duration::from_secs(120)), 1);
    }

    #[test]
    fn reset_clears_history() {
        let mut tracker = tracker(1, 600);
        let base = Instant::now();

        tracker.record(base);
        assert!(matches!(
            tracker.record(base + Duration::from_secs(1)),
            RestartDecision::Suspend { .. }
        ));

        tracker.reset();
        assert_eq!(
            tracker.record(base + Duration::from_secs(2)),
            RestartDecision::Proceed
        );
    }
}
