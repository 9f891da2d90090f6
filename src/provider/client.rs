//! Provider trait and the configuration-driven HTTP adapter.
//!
//! One adapter implementation covers every supported wire family; per-provider
//! differences (endpoint, auth shape, model, costs) are configuration data.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::config::{ProviderConfig, WireFamily};
use crate::error::{Error, ProviderErrorKind, Result};

use super::types::{NormalizedResponse, ProviderQuery};

/// A client able to execute one prompt against one external endpoint.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Execute a query and normalize the reply.
    async fn query(&self, query: ProviderQuery) -> Result<NormalizedResponse>;

    /// Stable provider tag used for weighting and persistence.
    fn name(&self) -> &str;
}

/// HTTP adapter dispatching on the configured wire family.
pub struct HttpProvider {
    config: ProviderConfig,
    http: Client,
}

impl HttpProvider {
    pub fn new(config: ProviderConfig) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self { config, http }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Temperature for the outgoing request: clamped, or dropped entirely
    /// when the provider does not accept it.
    fn effective_temperature(&self, query: &ProviderQuery) -> Option<f64> {
        if !self.config.supports_temperature {
            return None;
        }
        Some(
            query
                .temperature
                .unwrap_or(self.config.default_temperature)
                .clamp(0.0, 1.0),
        )
    }

    async fn send(&self, url: &str, body: serde_json::Value, auth: AuthShape) -> Result<String> {
        let mut req = self.http.post(url).header("content-type", "application/json");
        req = match auth {
            AuthShape::Bearer => req.header(
                "Authorization",
                format!("Bearer {}", self.config.api_key),
            ),
            AuthShape::XApiKey => req
                .header("x-api-key", &self.config.api_key)
                .header("anthropic-version", "2023-06-01"),
            // Search providers carry the key inside the JSON body.
            AuthShape::None => req,
        };

        let response = req.json(&body).send().await.map_err(|e| {
            if e.is_timeout() {
                Error::timeout(self.config.timeout_secs * 1000)
            } else {
                Error::provider(&self.config.name, ProviderErrorKind::NetworkError, e.to_string())
            }
        })?;

        let status = response.status();
        let retry_after_ms = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|secs| secs * 1000);

        let text = response.text().await.map_err(|e| {
            Error::provider(&self.config.name, ProviderErrorKind::NetworkError, e.to_string())
        })?;

        if status.is_success() {
            return Ok(text);
        }

        let message = extract_error_message(&text).unwrap_or_else(|| status.to_string());
        Err(match status.as_u16() {
            401 | 403 => Error::provider(&self.config.name, ProviderErrorKind::AuthError, message),
            429 => Error::rate_limited(&self.config.name, message, retry_after_ms),
            400..=499 => {
                Error::provider(&self.config.name, ProviderErrorKind::BadRequest, message)
            }
            _ => Error::provider(&self.config.name, ProviderErrorKind::ServerError, message),
        })
    }

    async fn query_anthropic(&self, query: ProviderQuery) -> Result<NormalizedResponse> {
        let started = Instant::now();
        let request = AnthropicRequest {
            model: self.config.model.clone(),
            messages: vec![WireMessage {
                role: "user".to_string(),
                content: query.prompt.clone(),
            }],
            max_tokens: query.max_tokens.unwrap_or(self.config.max_tokens),
            system: query.system.clone(),
            temperature: self.effective_temperature(&query),
        };
        let url = format!("{}/v1/messages", self.config.base_url);
        let body = self
            .send(&url, serde_json::to_value(&request)?, AuthShape::XApiKey)
            .await?;

        let parsed: AnthropicResponse = serde_json::from_str(&body).map_err(|e| {
            Error::provider(&self.config.name, ProviderErrorKind::DecodeError, e.to_string())
        })?;

        let text = parsed
            .content
            .iter()
            .filter_map(|c| c.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        Ok(self.normalize(
            parsed.model,
            text,
            Vec::new(),
            parsed.usage.input_tokens,
            parsed.usage.output_tokens,
            started,
        ))
    }

    async fn query_chat(&self, query: ProviderQuery) -> Result<NormalizedResponse> {
        let started = Instant::now();
        let mut messages = Vec::new();
        if let Some(system) = &query.system {
            messages.push(WireMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        messages.push(WireMessage {
            role: "user".to_string(),
            content: query.prompt.clone(),
        });

        let request = ChatRequest {
            model: self.config.model.clone(),
            messages,
            max_tokens: Some(query.max_tokens.unwrap_or(self.config.max_tokens)),
            temperature: self.effective_temperature(&query),
            return_citations: matches!(self.config.family, WireFamily::CitationSearch)
                .then_some(true),
        };
        let url = format!("{}/v1/chat/completions", self.config.base_url);
        let body = self
            .send(&url, serde_json::to_value(&request)?, AuthShape::Bearer)
            .await?;

        let parsed: ChatResponse = serde_json::from_str(&body).map_err(|e| {
            Error::provider(&self.config.name, ProviderErrorKind::DecodeError, e.to_string())
        })?;

        let choice = parsed.choices.into_iter().next().ok_or_else(|| {
            Error::provider(
                &self.config.name,
                ProviderErrorKind::DecodeError,
                "no choices in response",
            )
        })?;

        Ok(self.normalize(
            parsed.model,
            choice.message.content,
            parsed.citations.unwrap_or_default(),
            parsed.usage.prompt_tokens,
            parsed.usage.completion_tokens,
            started,
        ))
    }

    async fn query_search(&self, query: ProviderQuery) -> Result<NormalizedResponse> {
        let started = Instant::now();
        let max_results = query
            .extra
            .get("max_results")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32)
            .unwrap_or(self.config.max_results);

        let request = SearchRequest {
            api_key: self.config.api_key.clone(),
            query: query.prompt.clone(),
            search_depth: "advanced".to_string(),
            max_results,
        };
        let url = format!("{}/search", self.config.base_url);
        let body = self
            .send(&url, serde_json::to_value(&request)?, AuthShape::None)
            .await?;

        let parsed: SearchResponse = serde_json::from_str(&body).map_err(|e| {
            Error::provider(&self.config.name, ProviderErrorKind::DecodeError, e.to_string())
        })?;

        let mut cited_urls = Vec::new();
        let mut sections = Vec::new();
        if let Some(answer) = &parsed.answer {
            sections.push(answer.clone());
        }
        for result in &parsed.results {
            cited_urls.push(result.url.clone());
            sections.push(format!("{}\n{}", result.title, result.content));
        }

        // Search responses have no token accounting; latency is the only
        // usage signal.
        Ok(self.normalize(
            "search".to_string(),
            sections.join("\n\n"),
            cited_urls,
            0,
            0,
            started,
        ))
    }

    fn normalize(
        &self,
        model: String,
        text: String,
        cited_urls: Vec<String>,
        input_tokens: u64,
        output_tokens: u64,
        started: Instant,
    ) -> NormalizedResponse {
        NormalizedResponse {
            provider: self.config.name.clone(),
            model,
            text,
            cited_urls,
            input_tokens,
            output_tokens,
            latency_ms: started.elapsed().as_millis() as u64,
            cost: self.config.calculate_cost(input_tokens, output_tokens),
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
impl ProviderClient for HttpProvider {
    async fn query(&self, query: ProviderQuery) -> Result<NormalizedResponse> {
        match self.config.family {
            WireFamily::AnthropicMessages => self.query_anthropic(query).await,
            WireFamily::ChatCompletions | WireFamily::CitationSearch => {
                self.query_chat(query).await
            }
            WireFamily::WebSearch => self.query_search(query).await,
        }
    }

    fn name(&self) -> &str {
        &self.config.name
    }
}

enum AuthShape {
    Bearer,
    XApiKey,
    None,
}

fn extract_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .pointer("/error/message")
        .or_else(|| value.pointer("/error"))
        .or_else(|| value.pointer("/detail"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

// Wire types

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<WireMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    model: String,
    content: Vec<AnthropicContent>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    return_citations: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    model: String,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: ChatUsage,
    #[serde(default)]
    citations: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: WireMessage,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ChatUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Debug, Serialize)]
struct SearchRequest {
    api_key: String,
    query: String,
    search_depth: String,
    max_results: u32,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(default)]
    title: String,
    url: String,
    #[serde(default)]
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WireFamily;

    fn provider(family: WireFamily, supports_temperature: bool) -> HttpProvider {
        let mut config = ProviderConfig::new("test", family, "key");
        config.supports_temperature = supports_temperature;
        config.default_temperature = 0.7;
        HttpProvider::new(config)
    }

    #[test]
    fn test_temperature_clamped() {
        let p = provider(WireFamily::ChatCompletions, true);
        let q = ProviderQuery::new("hi").with_temperature(3.5);
        assert_eq!(p.effective_temperature(&q), Some(1.0));

        let q = ProviderQuery::new("hi").with_temperature(-0.2);
        assert_eq!(p.effective_temperature(&q), Some(0.0));
    }

    #[test]
    fn test_temperature_dropped_when_unsupported() {
        let p = provider(WireFamily::WebSearch, false);
        let q = ProviderQuery::new("hi").with_temperature(0.5);
        assert_eq!(p.effective_temperature(&q), None);
    }

    #[test]
    fn test_default_temperature_applied() {
        let p = provider(WireFamily::ChatCompletions, true);
        let q = ProviderQuery::new("hi");
        assert_eq!(p.effective_temperature(&q), Some(0.7));
    }

    #[test]
    fn test_error_message_extraction() {
        let openai = r#"{"error": {"message": "Rate limit reached", "type": "rate_limit_error"}}"#;
        assert_eq!(
            extract_error_message(openai).as_deref(),
            Some("Rate limit reached")
        );

        let flat = r#"{"detail": "invalid request"}"#;
        assert_eq!(extract_error_message(flat).as_deref(), Some("invalid request"));

        assert_eq!(extract_error_message("not json"), None);
    }

    #[test]
    fn test_chat_response_with_citations_parses() {
        let body = r#"{
            "model": "sonar-pro",
            "choices": [{"message": {"role": "assistant", "content": "answer text"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 40},
            "citations": ["https://fda.gov/label", "https://pubmed.gov/1"]
        }"#;
        let parsed: ChatResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.citations.unwrap().len(), 2);
        assert_eq!(parsed.usage.prompt_tokens, 12);
    }

    #[test]
    fn test_search_response_parses_without_answer() {
        let body = r#"{
            "results": [
                {"title": "Apixaban", "url": "https://go.drugbank.com/drugs/DB06605", "content": "MW 459.5"}
            ]
        }"#;
        let parsed: SearchResponse = serde_json::from_str(body).unwrap();
        assert!(parsed.answer.is_none());
        assert_eq!(parsed.results.len(), 1);
    }
}
