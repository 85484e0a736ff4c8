use std::time::Duration;

/// Backoff policy used by the feed resubscribe loop.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Delay before the given zero-based attempt, doubling each time and
    /// honoring a larger server-provided hint when present.
    pub fn delay_for_attempt(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let shift = attempt.min(20);
        let multiplier = 1_u64 << shift;
        let calculated = (self.base_delay.as_millis() as u64).saturating_mul(multiplier);
        let hinted = hint.map(|hint| hint.as_millis() as u64).unwrap_or(0);
        let bounded = calculated.max(hinted).min(self.max_delay.as_millis() as u64);
        Duration::from_millis(bounded)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}
