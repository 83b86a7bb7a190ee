//! Delay schedule for job status polling.
//!
//! While status requests succeed the poller waits the regular interval.
//! Every failed request doubles the wait, up to a ceiling, and the first
//! success afterwards drops straight back to the interval and clears the
//! failure count.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct PollBackoff {
    interval: Duration,
    ceiling: Duration,
    delay: Duration,
    failures: u32,
}

impl PollBackoff {
    /// A ceiling below `interval` is raised to `interval`.
    pub fn new(interval: Duration, ceiling: Duration) -> Self {
        Self {
            interval,
            ceiling: ceiling.max(interval),
            delay: interval,
            failures: 0,
        }
    }

    /// Wait before the next status request.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Failed requests since the last success.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.delay = self.interval;
    }

    /// Count a failure and return the new streak length. The first failure
    /// keeps the current delay; each further one doubles it.
    pub fn record_failure(&mut self) -> u32 {
        if self.failures > 0 {
            self.delay = self.delay.saturating_mul(2).min(self.ceiling);
        }
        self.failures += 1;
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn failures_double_up_to_ceiling() {
        let mut backoff = PollBackoff::new(secs(2), secs(30));
        let mut waits = vec![backoff.delay().as_secs()];
        for _ in 0..6 {
            backoff.record_failure();
            waits.push(backoff.delay().as_secs());
        }
        assert_eq!(waits, [2, 2, 4, 8, 16, 30, 30]);
        assert_eq!(backoff.failures(), 6);
    }

    #[test]
    fn success_resets_delay_and_streak() {
        let mut backoff = PollBackoff::new(secs(2), secs(30));
        backoff.record_failure();
        backoff.record_failure();
        assert_eq!(backoff.delay(), secs(4));

        backoff.record_success();
        assert_eq!(backoff.delay(), secs(2));
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.record_failure(), 1);
    }

    #[test]
    fn ceiling_never_below_interval() {
        let mut backoff = PollBackoff::new(secs(5), secs(1));
        backoff.record_failure();
        backoff.record_failure();
        assert_eq!(backoff.delay(), secs(5));
    }
}
