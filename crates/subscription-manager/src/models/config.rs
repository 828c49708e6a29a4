use std::env;
use std::time::Duration;

use dotenvy::dotenv;

/// Timing knobs for the reconciliation loop.
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Base period of the reconciliation tick.
    pub reconcile_interval: Duration,
    /// Deadline for a single subscribe attempt before the subscription
    /// error callback fires (once), after which reconciliation continues.
    pub subscription_timeout: Duration,
    /// Grace window for a track the resolver has never seen before the
    /// subscription is marked undesired.
    pub not_found_timeout: Duration,
    /// Base delay for retrying transient resolver/media failures; doubles
    /// per attempt, capped at `reconcile_interval`.
    pub retry_backoff: Duration,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(3),
            subscription_timeout: Duration::from_secs(10),
            not_found_timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(100),
        }
    }
}

impl SubscriptionConfig {
    pub fn from_env() -> Self {
        dotenv().ok();

        let defaults = Self::default();

        Self {
            reconcile_interval: Self::get_env_ms(
                "SUBSCRIPTION_RECONCILE_INTERVAL_MS",
                defaults.reconcile_interval,
            ),
            subscription_timeout: Self::get_env_ms(
                "SUBSCRIPTION_TIMEOUT_MS",
                defaults.subscription_timeout,
            ),
            not_found_timeout: Self::get_env_ms(
                "SUBSCRIPTION_NOT_FOUND_TIMEOUT_MS",
                defaults.not_found_timeout,
            ),
            retry_backoff: Self::get_env_ms(
                "SUBSCRIPTION_RETRY_BACKOFF_MS",
                defaults.retry_backoff,
            ),
        }
    }

    #[inline]
    fn get_env_ms(var: &str, default: Duration) -> Duration {
        env::var(var)
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(default)
    }
}
