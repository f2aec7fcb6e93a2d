//! Retry policy for the execution step.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How many times to run the executor and how long to park between attempts.
///
/// The delay before retry `n` (1-based) is
/// `min(interval * backoff_rate^(n-1), max_delay)`. The default is a fixed
/// 10 second interval over 5 attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    #[serde(with = "secs")]
    pub interval: Duration,
    pub backoff_rate: f64,
    #[serde(default, with = "opt_secs")]
    pub max_delay: Option<Duration>,
}

impl RetryPolicy {
    /// Five attempts, ten seconds apart.
    pub const FIXED: Self = Self {
        max_attempts: 5,
        interval: Duration::from_secs(10),
        backoff_rate: 1.0,
        max_delay: None,
    };

    /// Single attempt.
    pub const NONE: Self = Self {
        max_attempts: 1,
        interval: Duration::ZERO,
        backoff_rate: 1.0,
        max_delay: None,
    };

    pub const fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
            backoff_rate: 1.0,
            max_delay: None,
        }
    }

    /// Whether another attempt may follow attempt `attempt` (1-based).
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }

    /// Delay before the retry that follows attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let rate = if self.backoff_rate.is_finite() && self.backoff_rate >= 1.0 {
            self.backoff_rate
        } else {
            1.0
        };
        let secs = self.interval.as_secs_f64() * rate.powi(exponent);
        let delay = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::FIXED
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

mod opt_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(d)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_five_attempts_ten_seconds_apart() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        for attempt in 1..=4 {
            assert!(policy.should_retry(attempt));
            assert_eq!(policy.delay_after(attempt), Duration::from_secs(10));
        }
        assert!(!policy.should_retry(5));
    }

    #[test]
    fn backoff_rate_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 6,
            interval: Duration::from_secs(1),
            backoff_rate: 2.0,
            max_delay: Some(Duration::from_secs(5)),
        };
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(4));
        assert_eq!(policy.delay_after(4), Duration::from_secs(5));
    }

    #[test]
    fn zero_attempts_still_runs_once() {
        let policy = RetryPolicy::fixed(0, Duration::from_secs(1));
        assert!(!policy.should_retry(1));
    }

    #[test]
    fn deserializes_from_seconds() {
        let policy: RetryPolicy =
            toml::from_str("max_attempts = 3\ninterval = 2.5\nbackoff_rate = 1.0").unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.interval, Duration::from_millis(2500));
        assert_eq!(policy.max_delay, None);
    }
}
