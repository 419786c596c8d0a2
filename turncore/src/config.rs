//! Validated configuration.
//!
//! Every tunable is a `nutype` newtype, so out-of-range values are rejected
//! when the configuration is built or deserialized rather than at use.
//! All structs implement `Serialize`/`Deserialize` for loading from the
//! embedding application's config format, and `Default` with the values
//! the engine has always shipped with.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounded wait for a lock ticket, in milliseconds.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 600_000),
    default = 5_000,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct LockTimeoutMs(u64);

impl LockTimeoutMs {
    /// Convert to Duration for use with tokio timers.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into())
    }
}

/// Number of attempts the conflict retry wrapper makes before giving up.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1_000),
    default = 5,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct MaxConflictAttempts(u32);

/// Delay before the first conflict retry, in milliseconds.
#[nutype(
    validate(less_or_equal = 10_000),
    default = 50,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct RetryBaseDelayMs(u64);

impl RetryBaseDelayMs {
    /// Convert to Duration for use with tokio::time::sleep.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into())
    }
}

/// Upper bound on any single backoff delay, in milliseconds.
#[nutype(
    validate(less_or_equal = 300_000),
    default = 1_000,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct RetryMaxDelayMs(u64);

impl RetryMaxDelayMs {
    /// Convert to Duration for use with tokio::time::sleep.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into())
    }
}

/// Exponential backoff growth factor.
#[nutype(
    validate(finite, greater_or_equal = 1.0, less_or_equal = 10.0),
    default = 2.0,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        PartialOrd,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct BackoffMultiplier(f64);

/// Number of published events the notification bus remembers.
#[nutype(
    validate(less_or_equal = 100_000),
    default = 100,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct HistoryCapacity(usize);

/// Settings for the command executors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Default bounded wait for a lock ticket.
    #[serde(default)]
    pub lock_timeout: LockTimeoutMs,
}

impl ExecutorConfig {
    /// Overrides the lock timeout.
    #[must_use]
    pub const fn with_lock_timeout(mut self, lock_timeout: LockTimeoutMs) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }
}

/// Settings for the conflict retry wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictRetryConfig {
    /// Attempts before `ContentionExhausted` is reported.
    pub max_attempts: MaxConflictAttempts,
    /// Delay before the first retry.
    pub base_delay: RetryBaseDelayMs,
    /// Cap on any single delay.
    pub max_delay: RetryMaxDelayMs,
    /// Growth factor per attempt.
    pub backoff_multiplier: BackoffMultiplier,
    /// Randomize each delay by up to ±25%.
    pub jitter: bool,
}

impl Default for ConflictRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: MaxConflictAttempts::default(),
            base_delay: RetryBaseDelayMs::default(),
            max_delay: RetryMaxDelayMs::default(),
            backoff_multiplier: BackoffMultiplier::default(),
            jitter: true,
        }
    }
}

impl ConflictRetryConfig {
    /// No delay between attempts; useful in tests and for in-memory stores.
    pub fn immediate(max_attempts: MaxConflictAttempts) -> Self {
        Self::default()
            .with_max_attempts(max_attempts)
            .without_delay()
    }

    /// Many quick attempts, for hot entities under heavy contention.
    pub fn patient() -> Self {
        let mut config = Self::default();
        if let (Ok(max_attempts), Ok(base), Ok(max), Ok(multiplier)) = (
            MaxConflictAttempts::try_new(20),
            RetryBaseDelayMs::try_new(10),
            RetryMaxDelayMs::try_new(500),
            BackoffMultiplier::try_new(1.5),
        ) {
            config.max_attempts = max_attempts;
            config.base_delay = base;
            config.max_delay = max;
            config.backoff_multiplier = multiplier;
        }
        config
    }

    /// Replaces the attempt budget.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: MaxConflictAttempts) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Zeroes every delay.
    #[must_use]
    pub fn without_delay(mut self) -> Self {
        if let (Ok(base), Ok(max)) = (RetryBaseDelayMs::try_new(0), RetryMaxDelayMs::try_new(0)) {
            self.base_delay = base;
            self.max_delay = max;
        }
        self.jitter = false;
        self
    }

    /// Delay before retry number `attempt` (1-based), without jitter.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.into_inner() as f64;
        let cap_ms = self.max_delay.into_inner() as f64;
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay_ms = base_ms * self.backoff_multiplier.into_inner().powi(exponent);
        Duration::from_millis(delay_ms.min(cap_ms).max(0.0) as u64)
    }
}

/// Settings for the notification bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// How many published events to keep for inspection.
    #[serde(default)]
    pub history_capacity: HistoryCapacity,
}

/// When the persistent entity store writes to its repository.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushPolicy {
    /// Every committed transaction is persisted before it becomes visible.
    #[default]
    WriteThrough,
    /// Commits mark entities dirty; `flush` persists them in one pass.
    Deferred,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn defaults_match_shipped_values() {
        assert_eq!(
            ExecutorConfig::default().lock_timeout.as_duration(),
            Duration::from_secs(5)
        );
        let retry = ConflictRetryConfig::default();
        assert_eq!(retry.max_attempts.into_inner(), 5);
        assert_eq!(retry.base_delay.as_duration(), Duration::from_millis(50));
        assert_eq!(BusConfig::default().history_capacity.into_inner(), 100);
        assert_eq!(FlushPolicy::default(), FlushPolicy::WriteThrough);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        assert!(LockTimeoutMs::try_new(0).is_err());
        assert!(MaxConflictAttempts::try_new(0).is_err());
        assert!(BackoffMultiplier::try_new(0.5).is_err());
        assert!(BackoffMultiplier::try_new(f64::NAN).is_err());
        assert!(HistoryCapacity::try_new(100_001).is_err());
    }

    #[test]
    fn configs_deserialize_with_missing_fields_defaulted() {
        let config: ConflictRetryConfig = serde_json::from_str(r#"{"max_attempts": 9}"#).unwrap();
        assert_eq!(config.max_attempts.into_inner(), 9);
        assert_eq!(config.backoff_multiplier.into_inner(), 2.0);

        let config: ExecutorConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, ExecutorConfig::default());

        let policy: FlushPolicy = serde_json::from_str(r#""deferred""#).unwrap();
        assert_eq!(policy, FlushPolicy::Deferred);
    }

    #[test]
    fn invalid_values_fail_deserialization() {
        assert!(serde_json::from_str::<ExecutorConfig>(r#"{"lock_timeout": 0}"#).is_err());
    }

    #[test]
    fn immediate_config_never_sleeps() {
        let config = ConflictRetryConfig::immediate(MaxConflictAttempts::try_new(3).unwrap());
        for attempt in 1..=3 {
            assert_eq!(config.backoff(attempt), Duration::ZERO);
        }
        assert!(!config.jitter);
    }

    #[test]
    fn backoff_grows_exponentially_from_base() {
        let config = ConflictRetryConfig::default();
        assert_eq!(config.backoff(1), Duration::from_millis(50));
        assert_eq!(config.backoff(2), Duration::from_millis(100));
        assert_eq!(config.backoff(3), Duration::from_millis(200));
    }

    #[test]
    fn patient_preset_allows_many_short_retries() {
        let config = ConflictRetryConfig::patient();
        assert_eq!(config.max_attempts.into_inner(), 20);
        assert_eq!(config.backoff(1), Duration::from_millis(10));
        assert_eq!(config.backoff(2), Duration::from_millis(15));
        assert_eq!(config.max_delay.as_duration(), Duration::from_millis(500));
        assert!(config.jitter);
    }

    proptest! {
        #[test]
        fn backoff_never_exceeds_max_delay(attempt in 1u32..200) {
            let config = ConflictRetryConfig::patient();
            prop_assert!(config.backoff(attempt) <= config.max_delay.as_duration());
        }
    }
}
