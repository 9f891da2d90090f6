//! Retry policy for provider calls.
//!
//! Retries live here and nowhere else; stages never retry provider calls
//! directly. Only transient failures (network, 5xx, rate limit, timeout) are
//! retried, with exponential backoff, a hard cap, and jitter.

use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use crate::error::Result;

use super::client::ProviderClient;
use super::types::{NormalizedResponse, ProviderQuery};

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    /// Ceiling for any single delay.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            backoff_factor: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryConfig {
    /// Delay before the given retry attempt (0-based), with jitter applied.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.max(1.0).powi(attempt as i32);
        let base = (self.base_delay_ms as f64 * factor).round() as u64;
        let capped = base.min(self.max_delay_ms);
        // Full jitter keeps concurrent retries from synchronizing.
        let jittered = rand::thread_rng().gen_range(capped / 2..=capped.max(1));
        Duration::from_millis(jittered)
    }
}

/// Execute a query with bounded retries over transient failures.
///
/// Rate-limited responses sleep the server-hinted duration when present,
/// bounded by the configured delay ceiling.
pub async fn query_with_retry(
    client: &dyn ProviderClient,
    query: ProviderQuery,
    config: &RetryConfig,
) -> Result<NormalizedResponse> {
    let mut attempt = 0;
    loop {
        match client.query(query.clone()).await {
            Ok(response) => return Ok(response),
            Err(error) => {
                if !error.is_transient() || attempt >= config.max_retries {
                    return Err(error);
                }

                let delay = match error.retry_after_ms() {
                    Some(hint) => Duration::from_millis(hint.min(config.max_delay_ms)),
                    None => config.delay_for_attempt(attempt),
                };
                warn!(
                    provider = client.name(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "transient provider failure, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ProviderErrorKind};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FlakyProvider {
        fail_until: usize,
        kind: ProviderErrorKind,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ProviderClient for FlakyProvider {
        async fn query(&self, _query: ProviderQuery) -> Result<NormalizedResponse> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_until {
                return Err(Error::provider("flaky", self.kind, "induced failure"));
            }
            Ok(NormalizedResponse {
                provider: "flaky".into(),
                model: "mock".into(),
                text: "ok".into(),
                cited_urls: vec![],
                input_tokens: 10,
                output_tokens: 5,
                latency_ms: 1,
                cost: 0.0,
                timestamp: Utc::now(),
            })
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay_ms: 1,
            backoff_factor: 2.0,
            max_delay_ms: 4,
        }
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let client = FlakyProvider {
            fail_until: 2,
            kind: ProviderErrorKind::ServerError,
            calls: Arc::clone(&calls),
        };

        let result = query_with_retry(&client, ProviderQuery::new("q"), &fast_config(3)).await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stops_after_bounded_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let client = FlakyProvider {
            fail_until: usize::MAX,
            kind: ProviderErrorKind::NetworkError,
            calls: Arc::clone(&calls),
        };

        let result = query_with_retry(&client, ProviderQuery::new("q"), &fast_config(2)).await;
        assert!(result.is_err());
        // 1 initial + 2 retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_errors_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let client = FlakyProvider {
            fail_until: usize::MAX,
            kind: ProviderErrorKind::AuthError,
            calls: Arc::clone(&calls),
        };

        let result = query_with_retry(&client, ProviderQuery::new("q"), &fast_config(3)).await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delay_capped() {
        let config = RetryConfig {
            max_retries: 10,
            base_delay_ms: 1_000,
            backoff_factor: 10.0,
            max_delay_ms: 5_000,
        };
        for attempt in 0..8 {
            assert!(config.delay_for_attempt(attempt) <= Duration::from_millis(5_000));
        }
    }
}
