//! Exponential backoff with optional jitter.

use rand::Rng;

use crate::config::schema::QueueConfig;

/// Backoff parameters for queue replays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter: bool,
}

impl From<&QueueConfig> for BackoffPolicy {
    fn from(config: &QueueConfig) -> Self {
        Self {
            base_ms: config.base_delay_ms,
            max_ms: config.max_delay_ms,
            jitter: config.jitter,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the retry that follows failed attempt number `attempt`
    /// (1-based): `base * 2^(attempt - 1)`, capped at `max_ms`.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        if attempt == 0 {
            return 0;
        }

        let factor = 2u64.saturating_pow(attempt - 1);
        let capped = self.base_ms.saturating_mul(factor).min(self.max_ms);

        if !self.jitter {
            return capped;
        }
        // Up to 10% extra so replays from many clients spread out.
        let jitter_range = capped / 10;
        if jitter_range == 0 {
            return capped;
        }
        capped + rand::thread_rng().gen_range(0..jitter_range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_without_jitter() {
        let policy = BackoffPolicy {
            base_ms: 100,
            max_ms: 2_000,
            jitter: false,
        };
        assert_eq!(policy.delay_ms(0), 0);
        assert_eq!(policy.delay_ms(1), 100);
        assert_eq!(policy.delay_ms(2), 200);
        assert_eq!(policy.delay_ms(3), 400);
        assert_eq!(policy.delay_ms(10), 2_000);
        assert_eq!(policy.delay_ms(200), 2_000);
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let policy = BackoffPolicy {
            base_ms: 1_000,
            max_ms: 60_000,
            jitter: true,
        };
        for _ in 0..50 {
            let delay = policy.delay_ms(2);
            assert!((2_000..2_200).contains(&delay), "delay {} out of range", delay);
        }
    }
}
