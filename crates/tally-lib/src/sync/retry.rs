//! Backoff between failing drains
//!
//! Failed amounts are always requeued, never dropped. After a drain with at
//! least one failed commit, timer and threshold drains pause for the current
//! backoff, which doubles up to `max_backoff` and resets on a clean drain.

use std::time::Duration;
use tokio::time::Instant;

/// Retry bookkeeping for the sync engine
#[derive(Debug, Clone)]
pub struct RetryState {
    initial_backoff: Duration,
    max_backoff: Duration,
    current_backoff: Duration,
    consecutive_failures: u32,
    not_before: Option<Instant>,
    last_error: Option<String>,
}

impl RetryState {
    pub fn new(initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            initial_backoff,
            max_backoff,
            current_backoff: initial_backoff,
            consecutive_failures: 0,
            not_before: None,
            last_error: None,
        }
    }

    /// Record a drain that had at least one failed commit
    pub fn record_failure(&mut self, now: Instant, error: impl Into<String>) {
        self.consecutive_failures += 1;
        self.not_before = Some(now + self.current_backoff);
        self.last_error = Some(error.into());
        self.current_backoff = std::cmp::min(self.current_backoff * 2, self.max_backoff);
    }

    /// Record a drain where every commit went through
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.current_backoff = self.initial_backoff;
        self.not_before = None;
        self.last_error = None;
    }

    pub fn is_backing_off(&self, now: Instant) -> bool {
        self.not_before.map(|t| now < t).unwrap_or(false)
    }

    /// Time left until drains resume, zero when not backing off
    pub fn remaining(&self, now: Instant) -> Duration {
        self.not_before
            .map(|t| t.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut state = RetryState::new(Duration::from_millis(100), Duration::from_millis(350));
        let now = Instant::now();

        state.record_failure(now, "first");
        assert!(state.is_backing_off(now));
        assert_eq!(state.remaining(now), Duration::from_millis(100));
        assert_eq!(state.current_backoff(), Duration::from_millis(200));

        state.record_failure(now, "second");
        assert_eq!(state.remaining(now), Duration::from_millis(200));
        assert_eq!(state.current_backoff(), Duration::from_millis(350));

        state.record_failure(now, "third");
        assert_eq!(state.current_backoff(), Duration::from_millis(350));
        assert_eq!(state.consecutive_failures(), 3);
        assert_eq!(state.last_error(), Some("third"));
    }

    #[test]
    fn test_backoff_expires() {
        let mut state = RetryState::new(Duration::from_millis(100), Duration::from_secs(1));
        let now = Instant::now();
        state.record_failure(now, "boom");

        assert!(!state.is_backing_off(now + Duration::from_millis(100)));
        assert_eq!(state.remaining(now + Duration::from_millis(150)), Duration::ZERO);
    }

    #[test]
    fn test_success_resets() {
        let mut state = RetryState::new(Duration::from_millis(100), Duration::from_secs(1));
        let now = Instant::now();
        state.record_failure(now, "boom");
        state.record_failure(now, "boom");

        state.record_success();
        assert!(!state.is_backing_off(now));
        assert_eq!(state.consecutive_failures(), 0);
        assert_eq!(state.current_backoff(), Duration::from_millis(100));
        assert!(state.last_error().is_none());
    }
}
