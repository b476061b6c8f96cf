//! Restart policy: exponential backoff plus a crash-rate circuit breaker.
//!
//! Decisions are pure functions of the crash history and an explicit `now`,
//! so the supervisor and the tests drive them the same way.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub const DEFAULT_BASE_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);
pub const DEFAULT_CRASH_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_CRASH_THRESHOLD: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Delay before the first restart.
    pub base_backoff: Duration,
    /// Upper bound for any delay.
    pub max_backoff: Duration,
    /// Trailing window the breaker counts crashes in.
    pub crash_window: Duration,
    /// Crashes already inside the window at which the next one is not restarted.
    pub crash_threshold: usize,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            base_backoff: DEFAULT_BASE_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            crash_window: DEFAULT_CRASH_WINDOW,
            crash_threshold: DEFAULT_CRASH_THRESHOLD,
        }
    }
}

impl RestartPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_backoff(mut self, base: Duration) -> Self {
        self.base_backoff = base;
        self
    }

    pub fn with_max_backoff(mut self, max: Duration) -> Self {
        self.max_backoff = max;
        self
    }

    pub fn with_crash_window(mut self, window: Duration) -> Self {
        self.crash_window = window;
        self
    }

    pub fn with_crash_threshold(mut self, threshold: usize) -> Self {
        self.crash_threshold = threshold;
        self
    }

    /// `min(max, base * 2^(restart_count - 1))`; restart 0 and 1 both get `base`.
    pub fn backoff(&self, restart_count: u32) -> Duration {
        let exp = restart_count.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_backoff.as_secs_f64() * 2f64.powi(exp);
        if !secs.is_finite() || secs > self.max_backoff.as_secs_f64() {
            self.max_backoff
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Restart once `due` is reached.
    Restart {
        attempt: u32,
        delay: Duration,
        due: Instant,
    },
    /// Too many crashes in the window; leave the worker down.
    CircuitOpen { recent_crashes: usize },
}

/// Crash bookkeeping for one worker slot.
#[derive(Debug, Clone, Default)]
pub struct CrashHistory {
    crashes: VecDeque<Instant>,
    restart_count: u32,
}

impl CrashHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    /// Crashes recorded within `window` of `now`.
    pub fn recent_crashes(&self, now: Instant, window: Duration) -> usize {
        self.crashes
            .iter()
            .filter(|t| now.saturating_duration_since(**t) <= window)
            .count()
    }

    /// Record a crash at `now` and decide what to do about it.
    ///
    /// The restart delay is measured from `last_start`, so a worker that ran
    /// for longer than its backoff is restarted right away.
    pub fn record_crash(
        &mut self,
        policy: &RestartPolicy,
        now: Instant,
        last_start: Instant,
    ) -> RestartDecision {
        while let Some(oldest) = self.crashes.front() {
            if now.saturating_duration_since(*oldest) > policy.crash_window {
                self.crashes.pop_front();
            } else {
                break;
            }
        }
        // A quiet window starts the backoff over.
        if self.crashes.is_empty() {
            self.restart_count = 0;
        }

        let prior = self.crashes.len();
        self.crashes.push_back(now);
        if prior >= policy.crash_threshold {
            return RestartDecision::CircuitOpen {
                recent_crashes: prior + 1,
            };
        }

        self.restart_count += 1;
        let delay = policy.backoff(self.restart_count);
        RestartDecision::Restart {
            attempt: self.restart_count,
            delay,
            due: last_start + delay,
        }
    }

    /// Forget all crashes. A manual start closes an open breaker this way.
    pub fn reset(&mut self) {
        self.crashes.clear();
        self.restart_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RestartPolicy {
        RestartPolicy::default()
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let p = policy();
        assert_eq!(p.backoff(0), Duration::from_secs(1));
        assert_eq!(p.backoff(1), Duration::from_secs(1));
        assert_eq!(p.backoff(2), Duration::from_secs(2));
        assert_eq!(p.backoff(3), Duration::from_secs(4));
        assert_eq!(p.backoff(7), Duration::from_secs(60));
        assert_eq!(p.backoff(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn backoff_is_non_decreasing_until_max_then_constant() {
        let p = policy()
            .with_base_backoff(Duration::from_millis(250))
            .with_max_backoff(Duration::from_secs(10));
        let delays: Vec<Duration> = (1..40).map(|n| p.backoff(n)).collect();
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        let first_max = delays.iter().position(|d| *d == p.max_backoff).unwrap();
        assert!(delays[first_max..].iter().all(|d| *d == p.max_backoff));
    }

    #[test]
    fn consecutive_crashes_back_off() {
        let p = policy().with_crash_threshold(100);
        let mut history = CrashHistory::new();
        let t0 = Instant::now();

        let mut previous = Duration::ZERO;
        for i in 0..10u64 {
            let now = t0 + Duration::from_secs(i);
            match history.record_crash(&p, now, now) {
                RestartDecision::Restart { delay, due, .. } => {
                    assert!(delay >= previous);
                    assert_eq!(due, now + delay);
                    previous = delay;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(previous, Duration::from_secs(60));
    }

    #[test]
    fn sixth_crash_in_window_opens_breaker() {
        let p = policy();
        let mut history = CrashHistory::new();
        let t0 = Instant::now();

        for i in 0..5u64 {
            let now = t0 + Duration::from_secs(i * 10);
            assert!(matches!(
                history.record_crash(&p, now, now),
                RestartDecision::Restart { .. }
            ));
        }
        let sixth = t0 + Duration::from_secs(55);
        assert_eq!(
            history.record_crash(&p, sixth, sixth),
            RestartDecision::CircuitOpen { recent_crashes: 6 }
        );
    }

    #[test]
    fn crashes_outside_window_are_forgotten() {
        let p = policy();
        let mut history = CrashHistory::new();
        let t0 = Instant::now();

        for i in 0..5u64 {
            let now = t0 + Duration::from_secs(i);
            history.record_crash(&p, now, now);
        }
        let much_later = t0 + Duration::from_secs(300);
        match history.record_crash(&p, much_later, much_later) {
            RestartDecision::Restart { attempt, delay, .. } => {
                assert_eq!(attempt, 1);
                assert_eq!(delay, p.base_backoff);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(history.recent_crashes(much_later, p.crash_window), 1);
    }

    #[test]
    fn delay_is_measured_from_last_start() {
        let p = policy();
        let mut history = CrashHistory::new();
        let started = Instant::now();
        let crashed = started + Duration::from_secs(30);
        match history.record_crash(&p, crashed, started) {
            RestartDecision::Restart { due, .. } => assert!(due < crashed),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn reset_closes_breaker() {
        let p = policy().with_crash_threshold(1);
        let mut history = CrashHistory::new();
        let now = Instant::now();
        history.record_crash(&p, now, now);
        assert!(matches!(
            history.record_crash(&p, now, now),
            RestartDecision::CircuitOpen { .. }
        ));
        history.reset();
        assert_eq!(history.restart_count(), 0);
        assert!(matches!(
            history.record_crash(&p, now, now),
            RestartDecision::Restart { attempt: 1, .. }
        ));
    }
}
