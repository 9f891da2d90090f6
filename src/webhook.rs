//! Webhook delivery of composed final outputs.
//!
//! Delivery is at-least-once: up to the configured retries on 5xx and
//! network errors with exponential backoff. 4xx responses are not retried.

use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::{Error, ProviderErrorKind, Result};

/// Webhook sender with bounded retries.
pub struct WebhookNotifier {
    http: Client,
    max_retries: u32,
    base_delay: Duration,
}

impl WebhookNotifier {
    pub fn new(max_retries: u32) -> Self {
        Self {
            http: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            max_retries,
            base_delay: Duration::from_millis(500),
        }
    }

    #[cfg(test)]
    fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// POST the final output JSON to the callback URL.
    pub async fn deliver(&self, callback_url: &str, payload: &Value) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.post_once(callback_url, payload).await {
                Ok(()) => {
                    info!(url = callback_url, attempt, "webhook delivered");
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let delay = self.base_delay * 2u32.pow(attempt);
                    warn!(url = callback_url, attempt, error = %e, "webhook delivery failed, retrying");
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn post_once(&self, callback_url: &str, payload: &Value) -> Result<()> {
        let response = self
            .http
            .post(callback_url)
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                Error::provider("webhook", ProviderErrorKind::NetworkError, e.to_string())
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.is_server_error() {
            Err(Error::provider(
                "webhook",
                ProviderErrorKind::ServerError,
                format!("callback returned {}", status),
            ))
        } else {
            Err(Error::provider(
                "webhook",
                ProviderErrorKind::BadRequest,
                format!("callback returned {}", status),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_unreachable_callback_exhausts_retries() {
        let notifier = WebhookNotifier::new(2).with_base_delay(Duration::from_millis(1));
        // A closed local port refuses the connection promptly.
        let err = notifier
            .deliver("http://127.0.0.1:9/hook", &json!({"ok": true}))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
