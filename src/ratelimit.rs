//! Request rate limiting.
//!
//! One interface, two backends: the shared SQLite counter table with atomic
//! check-and-consume, and a per-process in-memory window used as the fallback
//! when the shared store is unreachable. Both enforce the same configured
//! ceilings.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::Result;
use crate::store::Store;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// Limited, with the suggested wait before retrying.
    Limited { retry_after_ms: u64 },
}

/// A limiter able to atomically check and consume one slot for a bucket.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn check_and_consume(&self, bucket: &str) -> Result<RateDecision>;
}

/// In-process sliding-window limiter.
pub struct InMemoryRateLimiter {
    limit: u32,
    window: Duration,
    state: Mutex<HashMap<String, WindowState>>,
}

#[derive(Debug, Clone, Copy)]
struct WindowState {
    window_start: Instant,
    used: u32,
}

impl InMemoryRateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            state: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn check_and_consume(&self, bucket: &str) -> Result<RateDecision> {
        if self.limit == 0 {
            return Ok(RateDecision::Allowed);
        }
        let mut state = self.state.lock().await;
        let entry = state.entry(bucket.to_string()).or_insert(WindowState {
            window_start: Instant::now(),
            used: 0,
        });

        let elapsed = entry.window_start.elapsed();
        if elapsed >= self.window {
            entry.window_start = Instant::now();
            entry.used = 0;
        }

        if entry.used < self.limit {
            entry.used += 1;
            Ok(RateDecision::Allowed)
        } else {
            let remaining = self.window.saturating_sub(entry.window_start.elapsed());
            Ok(RateDecision::Limited {
                retry_after_ms: remaining.as_millis() as u64,
            })
        }
    }
}

/// Shared limiter backed by the store's atomic counter table, with an
/// in-memory fallback when the store is unreachable.
pub struct SharedRateLimiter {
    store: Arc<Store>,
    limit: u32,
    window_s: u64,
    fallback: InMemoryRateLimiter,
}

impl SharedRateLimiter {
    pub fn new(store: Arc<Store>, limit: u32, window_s: u64) -> Self {
        Self {
            store,
            limit,
            window_s,
            fallback: InMemoryRateLimiter::new(limit, Duration::from_secs(window_s)),
        }
    }
}

#[async_trait]
impl RateLimiter for SharedRateLimiter {
    async fn check_and_consume(&self, bucket: &str) -> Result<RateDecision> {
        if self.limit == 0 {
            return Ok(RateDecision::Allowed);
        }
        match self
            .store
            .check_and_consume(bucket, self.limit, self.window_s, Utc::now().timestamp())
        {
            Ok(true) => Ok(RateDecision::Allowed),
            Ok(false) => Ok(RateDecision::Limited {
                retry_after_ms: self.window_s * 1000,
            }),
            Err(e) => {
                warn!(error = %e, "shared rate-limit store unreachable, using in-memory fallback");
                self.fallback.check_and_consume(bucket).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_window_enforced() {
        let limiter = InMemoryRateLimiter::new(2, Duration::from_millis(50));
        assert_eq!(
            limiter.check_and_consume("client").await.unwrap(),
            RateDecision::Allowed
        );
        assert_eq!(
            limiter.check_and_consume("client").await.unwrap(),
            RateDecision::Allowed
        );
        match limiter.check_and_consume("client").await.unwrap() {
            RateDecision::Limited { retry_after_ms } => assert!(retry_after_ms <= 50),
            RateDecision::Allowed => panic!("third request should be limited"),
        }

        // Buckets are independent.
        assert_eq!(
            limiter.check_and_consume("other").await.unwrap(),
            RateDecision::Allowed
        );

        // Window roll-over resets the counter.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(
            limiter.check_and_consume("client").await.unwrap(),
            RateDecision::Allowed
        );
    }

    #[tokio::test]
    async fn test_zero_limit_disables_enforcement() {
        let limiter = InMemoryRateLimiter::new(0, Duration::from_secs(60));
        for _ in 0..100 {
            assert_eq!(
                limiter.check_and_consume("client").await.unwrap(),
                RateDecision::Allowed
            );
        }
    }

    #[tokio::test]
    async fn test_shared_limiter_uses_store() {
        let store = Arc::new(Store::in_memory().unwrap());
        let limiter = SharedRateLimiter::new(store, 1, 60);

        assert_eq!(
            limiter.check_and_consume("client").await.unwrap(),
            RateDecision::Allowed
        );
        assert!(matches!(
            limiter.check_and_consume("client").await.unwrap(),
            RateDecision::Limited { .. }
        ));
    }
}
