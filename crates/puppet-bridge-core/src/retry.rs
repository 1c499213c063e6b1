//! Backoff for the network calls made before a session exists.
//!
//! Only endpoint discovery goes through here; an established session never
//! retries on its own (the owner restarts it instead).

use crate::config::DiscoveryConfig;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Backoff parameters.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Scale each delay by a random factor in `0.5..1.5`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DiscoveryConfig::MAX_ATTEMPTS,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay after the failed attempt `attempt` (0-indexed): doubles each
    /// time, capped at `max_delay`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let doubled = self.base_delay.as_secs_f64() * 2f64.powi(attempt as i32);
        let capped = doubled.min(self.max_delay.as_secs_f64());

        let secs = if self.jitter {
            let factor = rand::rng().random_range(0.5..1.5);
            (capped * factor).min(self.max_delay.as_secs_f64())
        } else {
            capped
        };
        Duration::from_secs_f64(secs)
    }
}

/// What a retried operation went through.
#[derive(Debug, Clone, Default)]
pub struct RetryStats {
    pub attempts: u32,
    pub total_delay: Duration,
    pub last_error: Option<String>,
}

/// Run `operation` until it succeeds, fails with an error `should_retry`
/// rejects, or the attempts run out.
pub async fn retry_async<F, Fut, T, E>(
    config: &RetryConfig,
    mut operation: F,
    should_retry: impl Fn(&E) -> bool,
) -> (Result<T, E>, RetryStats)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut stats = RetryStats::default();
    let max_attempts = config.max_attempts.max(1);

    loop {
        let attempt = stats.attempts;
        stats.attempts += 1;

        let err = match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!("Succeeded on attempt {}", stats.attempts);
                }
                return (Ok(value), stats);
            }
            Err(e) => e,
        };
        stats.last_error = Some(err.to_string());

        if !should_retry(&err) {
            debug!("Not retrying: {}", err);
            return (Err(err), stats);
        }
        if stats.attempts >= max_attempts {
            warn!("Giving up after {} attempts: {}", stats.attempts, err);
            return (Err(err), stats);
        }

        let delay = config.delay_after(attempt);
        stats.total_delay += delay;
        warn!(
            "Attempt {}/{} failed: {}. Retrying in {:?}",
            stats.attempts, max_attempts, err, delay
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_delay_doubles_and_caps() {
        let config = RetryConfig::new()
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_jitter(false);

        assert_eq!(config.delay_after(0), Duration::from_secs(1));
        assert_eq!(config.delay_after(1), Duration::from_secs(2));
        assert_eq!(config.delay_after(2), Duration::from_secs(4));
        assert_eq!(config.delay_after(3), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let config = RetryConfig::new()
            .with_base_delay(Duration::from_secs(2))
            .with_max_delay(Duration::from_secs(60));

        for _ in 0..20 {
            let delay = config.delay_after(0);
            assert!(
                delay >= Duration::from_secs(1) && delay <= Duration::from_secs(3),
                "Delay {:?} should be between 1s and 3s",
                delay
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let config = RetryConfig::new().with_max_attempts(4).with_jitter(false);
        let calls = Arc::new(AtomicU32::new(0));

        let (result, stats) = retry_async(
            &config,
            || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("connection refused".to_string())
                    } else {
                        Ok("10.0.0.1:8788")
                    }
                }
            },
            |_: &String| true,
        )
        .await;

        assert_eq!(result.unwrap(), "10.0.0.1:8788");
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.total_delay, Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_keeps_last_error() {
        let config = RetryConfig::new().with_max_attempts(2).with_jitter(false);

        let (result, stats) = retry_async(
            &config,
            || async { Err::<(), _>("timeout".to_string()) },
            |_: &String| true,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(stats.attempts, 2);
        assert_eq!(stats.last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let config = RetryConfig::new().with_max_attempts(5);

        let (result, stats) = retry_async(
            &config,
            || async { Err::<(), _>("bad token".to_string()) },
            |e: &String| !e.contains("bad token"),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(stats.attempts, 1);
        assert_eq!(stats.total_delay, Duration::ZERO);
    }
}
