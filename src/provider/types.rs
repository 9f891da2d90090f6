//! Provider request and response records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// One prompt sent to one external provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderQuery {
    pub prompt: String,
    /// System prompt, where the wire family supports one.
    pub system: Option<String>,
    /// Clamped to the provider's supported range; dropped for providers that
    /// do not accept temperature.
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    /// Extra provider-specific fields forwarded into the request envelope.
    pub extra: HashMap<String, Value>,
}

impl ProviderQuery {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            temperature: None,
            max_tokens: None,
            extra: HashMap::new(),
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// Uniform record returned by every adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedResponse {
    pub provider: String,
    pub model: String,
    pub text: String,
    /// Cited source URLs; empty for pure chat LLMs.
    pub cited_urls: Vec<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub latency_ms: u64,
    /// Monetary cost derived from token counts and configured per-token cost.
    pub cost: f64,
    pub timestamp: DateTime<Utc>,
}

impl NormalizedResponse {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_builder() {
        let q = ProviderQuery::new("What is the market size?")
            .with_system("You are a pharma analyst")
            .with_temperature(0.2)
            .with_max_tokens(800)
            .with_extra("search_depth", "advanced");

        assert_eq!(q.prompt, "What is the market size?");
        assert_eq!(q.temperature, Some(0.2));
        assert_eq!(q.max_tokens, Some(800));
        assert_eq!(q.extra.get("search_depth").and_then(|v| v.as_str()), Some("advanced"));
    }

    #[test]
    fn test_total_tokens() {
        let r = NormalizedResponse {
            provider: "openai".into(),
            model: "gpt-4o".into(),
            text: "ok".into(),
            cited_urls: vec![],
            input_tokens: 100,
            output_tokens: 40,
            latency_ms: 310,
            cost: 0.001,
            timestamp: Utc::now(),
        };
        assert_eq!(r.total_tokens(), 140);
    }
}
