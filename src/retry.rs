use std::time::Duration;

/// Bounded retry budget with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Fixed delay between attempts.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay: delay,
            multiplier: 1.0,
            max_delay: delay,
        }
    }

    /// Delay doubling after each failure, capped at `max_delay`.
    pub fn exponential(max_retries: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            multiplier: 2.0,
            max_delay,
        }
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self::fixed(0, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    ///
    /// Never exceeds `max_delay`, including when the computed backoff
    /// overflows what a [`Duration`] can hold.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(30) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exp);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = RetryPolicy::exponential(5, Duration::from_secs(10), Duration::from_secs(60));
        assert_eq!(policy.delay_after(1), Duration::from_secs(10));
        assert_eq!(policy.delay_after(2), Duration::from_secs(20));
        assert_eq!(policy.delay_after(3), Duration::from_secs(40));
        assert_eq!(policy.delay_after(4), Duration::from_secs(60));
        assert_eq!(policy.delay_after(50), Duration::from_secs(60));
    }

    #[test]
    fn test_fixed_policy() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(30));
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(policy.delay_after(1), policy.delay_after(3));
        assert_eq!(RetryPolicy::none().max_attempts(), 1);
    }

    #[test]
    fn test_huge_delays_saturate_instead_of_panicking() {
        let huge = Duration::from_secs(u64::MAX);
        assert_eq!(RetryPolicy::fixed(3, huge).delay_after(1), huge);

        let policy = RetryPolicy::exponential(40, Duration::from_secs(u64::MAX / 2), huge);
        assert_eq!(policy.delay_after(2), huge);
        assert_eq!(policy.delay_after(40), huge);
    }
}
