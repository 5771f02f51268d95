use std::time::{Duration, Instant};

/// Spaces out rediscovery attempts while the peripheral is absent.
#[derive(Debug)]
pub struct RediscoveryBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    next_attempt_at: Instant,
}

impl RediscoveryBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        Self {
            initial,
            max: max.max(initial),
            current: initial,
            next_attempt_at: Instant::now(),
        }
    }

    /// Record a failed discovery and push the next attempt out.
    pub fn mark_failure(&mut self, now: Instant) {
        self.next_attempt_at = now + self.current;
        self.current = (self.current * 2).min(self.max);
    }

    /// Reset after the device was found.
    pub fn mark_success(&mut self, now: Instant) {
        self.current = self.initial;
        self.next_attempt_at = now;
    }

    pub fn should_attempt(&self, now: Instant) -> bool {
        now >= self.next_attempt_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_up_to_max() {
        let t0 = Instant::now();
        let mut backoff = RediscoveryBackoff::new(Duration::from_secs(1), Duration::from_secs(3));
        assert!(backoff.should_attempt(t0));

        backoff.mark_failure(t0);
        assert!(!backoff.should_attempt(t0 + Duration::from_millis(999)));
        assert!(backoff.should_attempt(t0 + Duration::from_secs(1)));

        backoff.mark_failure(t0);
        assert!(!backoff.should_attempt(t0 + Duration::from_millis(1999)));

        backoff.mark_failure(t0);
        backoff.mark_failure(t0);
        assert!(backoff.should_attempt(t0 + Duration::from_secs(3)));
    }

    #[test]
    fn test_success_resets() {
        let t0 = Instant::now();
        let mut backoff = RediscoveryBackoff::new(Duration::from_secs(1), Duration::from_secs(30));
        backoff.mark_failure(t0);
        backoff.mark_failure(t0);
        backoff.mark_success(t0);
        assert!(backoff.should_attempt(t0));
        backoff.mark_failure(t0);
        assert!(backoff.should_attempt(t0 + Duration::from_secs(1)));
    }
}
