//! Engine configuration.
//!
//! Everything the engine needs is carried in one explicit [`EngineConfig`]
//! constructed at process start and passed through the engine context; no
//! module-level globals.

use serde::{Deserialize, Serialize};
use std::env;

use crate::error::{Error, Result};

/// Wire-format family a provider speaks.
///
/// Per-provider differences beyond the family (base URL, model, auth key,
/// costs) are configuration data, not code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFamily {
    /// Anthropic-style messages API.
    AnthropicMessages,
    /// OpenAI-style chat completions (also used by grok-style endpoints).
    ChatCompletions,
    /// Chat completions that return a `citations` list of source URLs.
    CitationSearch,
    /// Web-search endpoint; `temperature` is ignored, `max_results` maps to
    /// the page-size field.
    WebSearch,
}

/// Configuration for a single external provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Stable provider tag (e.g. "anthropic", "perplexity", "tavily").
    pub name: String,
    pub family: WireFamily,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub default_temperature: f64,
    pub max_tokens: u32,
    /// Input cost per million tokens (USD).
    pub input_cost_per_m: f64,
    /// Output cost per million tokens (USD).
    pub output_cost_per_m: f64,
    pub timeout_secs: u64,
    pub max_retries: u32,
    /// Providers that reject temperature have it silently dropped.
    pub supports_temperature: bool,
    /// Search providers only: page size.
    pub max_results: u32,
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, family: WireFamily, api_key: impl Into<String>) -> Self {
        let name = name.into();
        let base_url = match family {
            WireFamily::AnthropicMessages => "https://api.anthropic.com".to_string(),
            WireFamily::ChatCompletions => "https://api.openai.com".to_string(),
            WireFamily::CitationSearch => "https://api.perplexity.ai".to_string(),
            WireFamily::WebSearch => "https://api.tavily.com".to_string(),
        };
        Self {
            name,
            family,
            base_url,
            api_key: api_key.into(),
            model: String::new(),
            default_temperature: 0.7,
            max_tokens: 4096,
            input_cost_per_m: 0.0,
            output_cost_per_m: 0.0,
            timeout_secs: 120,
            max_retries: 3,
            supports_temperature: !matches!(family, WireFamily::WebSearch),
            max_results: 5,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_costs(mut self, input_per_m: f64, output_per_m: f64) -> Self {
        self.input_cost_per_m = input_per_m;
        self.output_cost_per_m = output_per_m;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Cost for the given token usage.
    pub fn calculate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        let input_cost = (input_tokens as f64 / 1_000_000.0) * self.input_cost_per_m;
        let output_cost = (output_tokens as f64 / 1_000_000.0) * self.output_cost_per_m;
        input_cost + output_cost
    }
}

/// Per-stage enable toggles for the four-stage category pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StageToggles {
    pub collect: bool,
    pub verify: bool,
    pub merge: bool,
    pub summarize: bool,
}

impl Default for StageToggles {
    fn default() -> Self {
        Self {
            collect: true,
            verify: true,
            merge: true,
            summarize: true,
        }
    }
}

/// Mean stage durations in minutes, used for completion estimates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StageMeanMinutes {
    pub collecting: f64,
    pub verifying: f64,
    pub merging: f64,
    pub summarizing: f64,
}

impl Default for StageMeanMinutes {
    fn default() -> Self {
        Self {
            collecting: 2.0,
            verifying: 1.0,
            merging: 0.5,
            summarizing: 0.5,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub providers: Vec<ProviderConfig>,
    /// Provider used for merge, summary, scoring, and report LLM calls.
    pub analysis_provider: String,
    pub stages: StageToggles,
    /// Phase-1 fan-out ceiling; effective bound is `min(n_categories, this)`.
    pub p1_max_parallel: usize,
    pub rate_limit_max_rpm: u32,
    pub rate_limit_window_s: u64,
    /// Per-provider-call timeout ceiling, seconds.
    pub provider_timeout_secs: u64,
    /// Overall deadline for one stage of one category, seconds.
    pub stage_timeout_secs: u64,
    pub database_path: String,
    pub audit_retention_years: i64,
    pub stage_mean_minutes: StageMeanMinutes,
    pub webhook_max_retries: u32,
    pub bind_addr: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            analysis_provider: "openai".to_string(),
            stages: StageToggles::default(),
            p1_max_parallel: 8,
            rate_limit_max_rpm: 60,
            rate_limit_window_s: 60,
            provider_timeout_secs: 120,
            stage_timeout_secs: 600,
            database_path: "pharmintel.db".to_string(),
            audit_retention_years: 7,
            stage_mean_minutes: StageMeanMinutes::default(),
            webhook_max_retries: 3,
            bind_addr: "0.0.0.0:8000".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// A provider is enabled when its `*_API_KEY` variable is present. At
    /// least one chat-style provider is required.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(key) = env::var("ANTHROPIC_API_KEY") {
            config.providers.push(
                ProviderConfig::new("anthropic", WireFamily::AnthropicMessages, key)
                    .with_model(env_or("ANTHROPIC_MODEL", "claude-3-5-sonnet-20241022"))
                    .with_costs(3.0, 15.0),
            );
        }
        if let Ok(key) = env::var("OPENAI_API_KEY") {
            config.providers.push(
                ProviderConfig::new("openai", WireFamily::ChatCompletions, key)
                    .with_model(env_or("OPENAI_MODEL", "gpt-4o"))
                    .with_costs(2.5, 10.0),
            );
        }
        if let Ok(key) = env::var("GROK_API_KEY") {
            config.providers.push(
                ProviderConfig::new("grok", WireFamily::ChatCompletions, key)
                    .with_base_url("https://api.x.ai")
                    .with_model(env_or("GROK_MODEL", "grok-2-latest"))
                    .with_costs(2.0, 10.0),
            );
        }
        if let Ok(key) = env::var("PERPLEXITY_API_KEY") {
            config.providers.push(
                ProviderConfig::new("perplexity", WireFamily::CitationSearch, key)
                    .with_model(env_or("PERPLEXITY_MODEL", "sonar-pro"))
                    .with_costs(3.0, 15.0),
            );
        }
        if let Ok(key) = env::var("TAVILY_API_KEY") {
            config
                .providers
                .push(ProviderConfig::new("tavily", WireFamily::WebSearch, key));
        }

        if config.providers.is_empty() {
            return Err(Error::Config(
                "no provider credentials configured; set at least one *_API_KEY".to_string(),
            ));
        }

        config.analysis_provider = env_or("ANALYSIS_PROVIDER", {
            // Prefer a chat provider for analysis calls.
            config
                .providers
                .iter()
                .find(|p| {
                    matches!(
                        p.family,
                        WireFamily::ChatCompletions | WireFamily::AnthropicMessages
                    )
                })
                .map(|p| p.name.as_str())
                .unwrap_or("openai")
        });

        config.stages = StageToggles {
            collect: env_flag("STAGE_COLLECT_ENABLED", true),
            verify: env_flag("STAGE_VERIFY_ENABLED", true),
            merge: env_flag("STAGE_MERGE_ENABLED", true),
            summarize: env_flag("STAGE_SUMMARIZE_ENABLED", true),
        };

        if let Ok(v) = env::var("P1_MAX_PARALLEL") {
            config.p1_max_parallel = v
                .parse()
                .map_err(|_| Error::Config(format!("invalid P1_MAX_PARALLEL: {}", v)))?;
        }
        if let Ok(v) = env::var("RATE_LIMIT_MAX_RPM") {
            config.rate_limit_max_rpm = v
                .parse()
                .map_err(|_| Error::Config(format!("invalid RATE_LIMIT_MAX_RPM: {}", v)))?;
        }
        if let Ok(v) = env::var("RATE_LIMIT_WINDOW_S") {
            config.rate_limit_window_s = v
                .parse()
                .map_err(|_| Error::Config(format!("invalid RATE_LIMIT_WINDOW_S: {}", v)))?;
        }
        if let Ok(v) = env::var("AUDIT_RETENTION_YEARS") {
            config.audit_retention_years = v
                .parse()
                .map_err(|_| Error::Config(format!("invalid AUDIT_RETENTION_YEARS: {}", v)))?;
        }
        if let Ok(v) = env::var("DATABASE_PATH") {
            config.database_path = v;
        }
        if let Ok(v) = env::var("BIND_ADDR") {
            config.bind_addr = v;
        }

        Ok(config)
    }

    /// Look up a provider configuration by name.
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }

    /// Chat-capable providers used for the collect fan-out.
    pub fn collect_providers(&self) -> Vec<&ProviderConfig> {
        self.providers
            .iter()
            .filter(|p| !matches!(p.family, WireFamily::WebSearch))
            .collect()
    }

    /// The configured web-search provider, if any.
    pub fn search_provider(&self) -> Option<&ProviderConfig> {
        self.providers
            .iter()
            .find(|p| matches!(p.family, WireFamily::WebSearch))
    }
}

fn env_or(key: &str, default: impl Into<String>) -> String {
    env::var(key).unwrap_or_else(|_| default.into())
}

fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_config_builder() {
        let p = ProviderConfig::new("openai", WireFamily::ChatCompletions, "sk-test")
            .with_model("gpt-4o")
            .with_costs(2.5, 10.0)
            .with_timeout(60);

        assert_eq!(p.name, "openai");
        assert_eq!(p.model, "gpt-4o");
        assert_eq!(p.timeout_secs, 60);
        assert!(p.supports_temperature);
    }

    #[test]
    fn test_search_provider_drops_temperature() {
        let p = ProviderConfig::new("tavily", WireFamily::WebSearch, "tvly-test");
        assert!(!p.supports_temperature);
        assert_eq!(p.max_results, 5);
    }

    #[test]
    fn test_cost_calculation() {
        let p = ProviderConfig::new("openai", WireFamily::ChatCompletions, "sk-test")
            .with_costs(2.5, 10.0);
        // 1M input + 500k output = $2.5 + $5.0
        let cost = p.calculate_cost(1_000_000, 500_000);
        assert!((cost - 7.5).abs() < 1e-9);
    }

    #[test]
    fn test_default_toggles_all_enabled() {
        let t = StageToggles::default();
        assert!(t.collect && t.verify && t.merge && t.summarize);
    }
}
