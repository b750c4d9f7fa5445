//! Fast-respawn circuit breaker.
//!
//! Each worker slot tracks how close together its workers die. An exit
//! within [`RespawnPolicy::window`] of the previous one extends the
//! fast-respawn streak; an exit after a quiet period starts a new streak of
//! one. Reaching [`RespawnPolicy::limit`] disables the slot for
//! [`RespawnPolicy::cooldown`].

use crate::config::SupervisorConfig;
use std::time::Duration;
use tokio::time::Instant;

/// Timing windows for the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RespawnPolicy {
    pub window: Duration,
    pub limit: u32,
    pub cooldown: Duration,
}

impl Default for RespawnPolicy {
    fn default() -> Self {
        Self {
            window: SupervisorConfig::FAST_RESPAWN_WINDOW,
            limit: SupervisorConfig::FAST_RESPAWN_LIMIT,
            cooldown: SupervisorConfig::RESPAWN_COOLDOWN,
        }
    }
}

impl RespawnPolicy {
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit.max(1);
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

/// What to do with a slot whose worker just exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RespawnDecision {
    Respawn,
    /// Leave the slot empty until the cooldown elapses.
    Disable,
}

/// Per-slot breaker state.
#[derive(Debug, Clone, Default)]
pub(crate) struct RespawnTracker {
    last_exit: Option<Instant>,
    streak: u32,
}

impl RespawnTracker {
    /// Classify an unexpected exit.
    pub(crate) fn on_exit(&mut self, now: Instant, policy: &RespawnPolicy) -> RespawnDecision {
        let fast = self
            .last_exit
            .is_some_and(|previous| now.saturating_duration_since(previous) < policy.window);
        self.last_exit = Some(now);

        if fast {
            self.streak += 1;
        } else {
            self.streak = 1;
        }

        if self.streak >= policy.limit {
            RespawnDecision::Disable
        } else {
            RespawnDecision::Respawn
        }
    }

    /// A disabled slot comes back with a clean streak.
    pub(crate) fn reset(&mut self) {
        self.last_exit = None;
        self.streak = 0;
    }

    #[cfg(test)]
    pub(crate) fn streak(&self) -> u32 {
        self.streak
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_third_fast_exit_disables() {
        let policy = RespawnPolicy::default();
        let mut tracker = RespawnTracker::default();
        let mut now = Instant::now();

        for expected in [RespawnDecision::Respawn, RespawnDecision::Respawn] {
            now += Duration::from_millis(100);
            assert_eq!(tracker.on_exit(now, &policy), expected);
        }
        now += Duration::from_millis(100);
        assert_eq!(tracker.on_exit(now, &policy), RespawnDecision::Disable);
        assert_eq!(tracker.streak(), 3);
    }

    #[test]
    fn test_long_lived_worker_killed_three_times_disables() {
        let policy = RespawnPolicy::default();
        let mut tracker = RespawnTracker::default();

        // the first exit comes long after the worker started
        let mut now = Instant::now() + policy.window * 10;
        assert_eq!(tracker.on_exit(now, &policy), RespawnDecision::Respawn);
        assert_eq!(tracker.streak(), 1);

        now += Duration::from_millis(40);
        assert_eq!(tracker.on_exit(now, &policy), RespawnDecision::Respawn);
        now += Duration::from_millis(40);
        assert_eq!(tracker.on_exit(now, &policy), RespawnDecision::Disable);
    }

    #[test]
    fn test_slow_exit_starts_new_streak() {
        let policy = RespawnPolicy::default();
        let mut tracker = RespawnTracker::default();
        let mut now = Instant::now();

        tracker.on_exit(now, &policy);
        now += Duration::from_millis(10);
        tracker.on_exit(now, &policy);
        assert_eq!(tracker.streak(), 2);

        now += policy.window + Duration::from_millis(1);
        assert_eq!(tracker.on_exit(now, &policy), RespawnDecision::Respawn);
        assert_eq!(tracker.streak(), 1);

        // the window is measured from the previous exit, not the first
        now += policy.window - Duration::from_millis(1);
        assert_eq!(tracker.on_exit(now, &policy), RespawnDecision::Respawn);
        assert_eq!(tracker.streak(), 2);
    }

    #[test]
    fn test_reset_after_cooldown() {
        let policy = RespawnPolicy::default().with_limit(1);
        let mut tracker = RespawnTracker::default();
        let now = Instant::now();

        assert_eq!(tracker.on_exit(now, &policy), RespawnDecision::Disable);
        tracker.reset();
        assert_eq!(tracker.streak(), 0);

        // a clean tracker does not link back to the exit before the cooldown
        let policy = RespawnPolicy::default();
        assert_eq!(
            tracker.on_exit(now + Duration::from_millis(1), &policy),
            RespawnDecision::Respawn
        );
        assert_eq!(tracker.streak(), 1);
    }

    #[test]
    fn test_policy_builders() {
        let policy = RespawnPolicy::default()
            .with_window(Duration::from_millis(500))
            .with_limit(0)
            .with_cooldown(Duration::from_millis(200));
        assert_eq!(policy.window, Duration::from_millis(500));
        assert_eq!(policy.limit, 1);
        assert_eq!(policy.cooldown, Duration::from_millis(200));
    }
}
