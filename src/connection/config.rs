//! Client configuration types.

use std::time::{Duration, SystemTime};

use rand::Rng;

use crate::recovery::RecoveryPolicy;
use crate::types::{CBS_ADDRESS, MANAGEMENT_ADDRESS};

/// Retry settings for operations run through the link registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOptions {
    /// Maximum number of retries after the first attempt. Negative means
    /// retry until cancelled; `0` means a single attempt.
    pub max_retries: i32,
    /// Base delay between attempts.
    pub retry_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_retry_delay: Duration,
    /// Fixed delay used after a link-scoped failure instead of the normal
    /// backoff. `None` falls back to the backoff.
    pub link_recovery_delay: Option<Duration>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(4),
            max_retry_delay: Duration::from_secs(120),
            link_recovery_delay: None,
        }
    }
}

impl RetryOptions {
    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Retry until cancelled.
    pub fn unlimited() -> Self {
        Self {
            max_retries: -1,
            ..Default::default()
        }
    }

    /// Set the maximum number of retries.
    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the base delay.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set the maximum delay.
    pub fn with_max_retry_delay(mut self, delay: Duration) -> Self {
        self.max_retry_delay = delay;
        self
    }

    /// Set the delay applied after link recovery.
    pub fn with_link_recovery_delay(mut self, delay: Duration) -> Self {
        self.link_recovery_delay = Some(delay);
        self
    }

    /// Check if attempt number `attempt` (0-indexed, the first retry is 1)
    /// is still within budget.
    pub fn should_retry(&self, attempt: u32) -> bool {
        match u32::try_from(self.max_retries) {
            Ok(max) => attempt <= max,
            Err(_) => true,
        }
    }

    /// Backoff before attempt `attempt`, without jitter.
    ///
    /// `retry_delay * 2^(attempt - 1)`, capped at `max_retry_delay`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow((attempt - 1).min(31));
        self.retry_delay
            .checked_mul(factor)
            .unwrap_or(self.max_retry_delay)
            .min(self.max_retry_delay)
    }

    /// Backoff before attempt `attempt` with 0.8-1.3x jitter, capped at
    /// `max_retry_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if base.is_zero() {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0.8..1.3);
        base.mul_f64(jitter).min(self.max_retry_delay)
    }
}

/// Bounds on how often a claim is renewed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRefreshBounds {
    /// Shortest interval between renewals.
    pub min: Duration,
    /// Longest interval between renewals.
    pub max: Duration,
    /// How long before expiry the renewal happens.
    pub clock_skew: Duration,
}

impl Default for ClaimRefreshBounds {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(2 * 60),
            // largest timer interval some runtimes support
            max: Duration::from_secs(49 * 24 * 60 * 60),
            clock_skew: Duration::from_secs(10 * 60),
        }
    }
}

impl ClaimRefreshBounds {
    /// How long to wait before renewing a claim expiring at `expires_on`.
    ///
    /// Always strictly before `expires_on` unless that is closer than
    /// `min`, in which case `min` wins. If `min` exceeds `max`, `max` wins.
    pub fn next_refresh(&self, expires_on: SystemTime, now: SystemTime) -> Duration {
        let until_expiry = expires_on.duration_since(now).unwrap_or(Duration::ZERO);
        until_expiry
            .saturating_sub(self.clock_skew)
            .max(self.min)
            .min(self.max)
    }
}

/// Options for a [`Namespace`](super::Namespace) and the registries built on it.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Host name of the namespace, e.g. `my-ns.servicebus.windows.net`.
    pub fully_qualified_namespace: String,
    /// Default retry settings.
    pub retry: RetryOptions,
    /// Time limit for each close during cleanup.
    pub close_timeout: Duration,
    /// Claim renewal cadence.
    pub claim_refresh: ClaimRefreshBounds,
    /// Address of the claims-based security node.
    pub cbs_address: String,
    /// Address of the management node, relative to the hub.
    pub management_address: String,
    /// Error classification table.
    pub recovery_policy: RecoveryPolicy,
}

impl ClientOptions {
    /// Options for a namespace with every other setting at its default.
    pub fn new(fully_qualified_namespace: impl Into<String>) -> Self {
        Self {
            fully_qualified_namespace: fully_qualified_namespace.into(),
            retry: RetryOptions::default(),
            close_timeout: Duration::from_secs(60),
            claim_refresh: ClaimRefreshBounds::default(),
            cbs_address: CBS_ADDRESS.to_owned(),
            management_address: MANAGEMENT_ADDRESS.to_owned(),
            recovery_policy: RecoveryPolicy::default(),
        }
    }

    /// Set the retry options.
    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    /// Set the close timeout.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Set the claim renewal bounds.
    pub fn with_claim_refresh(mut self, bounds: ClaimRefreshBounds) -> Self {
        self.claim_refresh = bounds;
        self
    }

    /// Set the claims node address.
    pub fn with_cbs_address(mut self, address: impl Into<String>) -> Self {
        self.cbs_address = address.into();
        self
    }

    /// Set the management node address.
    pub fn with_management_address(mut self, address: impl Into<String>) -> Self {
        self.management_address = address.into();
        self
    }

    /// Set the recovery policy.
    pub fn with_recovery_policy(mut self, policy: RecoveryPolicy) -> Self {
        self.recovery_policy = policy;
        self
    }

    /// Claim audience for an entity path.
    pub fn audience(&self, entity_path: &str) -> String {
        format!("amqp://{}/{}", self.fully_qualified_namespace, entity_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_defaults() {
        let options = RetryOptions::default();
        assert_eq!(options.max_retries, 3);
        assert_eq!(options.retry_delay, Duration::from_secs(4));
        assert_eq!(options.max_retry_delay, Duration::from_secs(120));
        assert_eq!(options.link_recovery_delay, None);
    }

    #[test]
    fn test_retry_budget() {
        let options = RetryOptions::default();
        assert!(options.should_retry(0));
        assert!(options.should_retry(3));
        assert!(!options.should_retry(4));

        let single = RetryOptions::no_retry();
        assert!(single.should_retry(0));
        assert!(!single.should_retry(1));

        assert!(RetryOptions::unlimited().should_retry(10_000));
    }

    #[test]
    fn test_backoff_exponential() {
        let options = RetryOptions::default()
            .with_retry_delay(Duration::from_millis(100))
            .with_max_retry_delay(Duration::from_secs(1));
        assert_eq!(options.base_delay(0), Duration::ZERO);
        assert_eq!(options.base_delay(1), Duration::from_millis(100));
        assert_eq!(options.base_delay(2), Duration::from_millis(200));
        assert_eq!(options.base_delay(3), Duration::from_millis(400));
        assert_eq!(options.base_delay(10), Duration::from_secs(1)); // capped
        assert_eq!(options.base_delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_jitter_range() {
        let options = RetryOptions::default().with_retry_delay(Duration::from_millis(1000));
        for _ in 0..100 {
            let delay = options.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(800));
            assert!(delay <= Duration::from_millis(1300));
        }
    }

    #[test]
    fn test_next_refresh_before_expiry() {
        let bounds = ClaimRefreshBounds::default();
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);

        let in_an_hour = now + Duration::from_secs(3600);
        assert_eq!(bounds.next_refresh(in_an_hour, now), Duration::from_secs(50 * 60));
    }

    #[test]
    fn test_next_refresh_clamped() {
        let bounds = ClaimRefreshBounds::default();
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);

        // already expired, or inside the skew window
        assert_eq!(bounds.next_refresh(now, now), bounds.min);
        assert_eq!(
            bounds.next_refresh(now + Duration::from_secs(300), now),
            bounds.min
        );
        // far future
        let far = now + Duration::from_secs(365 * 24 * 60 * 60);
        assert_eq!(bounds.next_refresh(far, now), bounds.max);
    }

    #[test]
    fn test_next_refresh_inverted_bounds() {
        let bounds = ClaimRefreshBounds {
            min: Duration::from_secs(600),
            max: Duration::from_secs(60),
            clock_skew: Duration::from_secs(600),
        };
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);

        assert_eq!(bounds.next_refresh(now + Duration::from_secs(3600), now), bounds.max);
        assert_eq!(bounds.next_refresh(now, now), bounds.max);
    }

    #[test]
    fn test_client_options_builder() {
        let options = ClientOptions::new("ns.example")
            .with_close_timeout(Duration::from_secs(5))
            .with_retry(RetryOptions::no_retry())
            .with_management_address("$mgmt");

        assert_eq!(options.close_timeout, Duration::from_secs(5));
        assert_eq!(options.retry.max_retries, 0);
        assert_eq!(options.cbs_address, "$cbs");
        assert_eq!(options.management_address, "$mgmt");
        assert_eq!(
            options.audience("hub/Partitions/0"),
            "amqp://ns.example/hub/Partitions/0"
        );
    }
}
