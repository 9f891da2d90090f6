//! Per-category summary generation.
//!
//! Summaries are produced from merged narratives using a configured style
//! (system prompt, user template, length). Every generation attempt appends a
//! summary_history row, including failures. When upstream stages are disabled
//! the generator degrades to deterministic formatting with no LLM call.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;
use uuid::Uuid;

use crate::model::SummaryHistory;
use crate::provider::{ProviderClient, ProviderQuery};
use crate::weighting::WeightedResponse;

/// Target summary length class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LengthType {
    Compact,
    Standard,
    Deep,
}

impl std::fmt::Display for LengthType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Compact => "compact",
            Self::Standard => "standard",
            Self::Deep => "deep",
        };
        write!(f, "{}", s)
    }
}

/// A configured summary style.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryStyle {
    pub style_name: String,
    pub system_prompt: String,
    /// Template with `{category}`, `{drug_name}`, `{content}`, and
    /// `{target_words}` placeholders.
    pub user_template: String,
    pub length_type: LengthType,
    pub target_words: u32,
}

impl SummaryStyle {
    pub fn render(&self, category: &str, drug_name: &str, content: &str) -> String {
        self.user_template
            .replace("{category}", category)
            .replace("{drug_name}", drug_name)
            .replace("{content}", content)
            .replace("{target_words}", &self.target_words.to_string())
    }
}

/// The default style set seeded into `summary_styles`.
pub fn default_styles() -> Vec<SummaryStyle> {
    vec![
        SummaryStyle {
            style_name: "default".into(),
            system_prompt: "You are a pharmaceutical intelligence analyst. Write precise, \
                            sourced, decision-ready prose."
                .into(),
            user_template: "Summarize the {category} findings for {drug_name} in about \
                            {target_words} words. Keep concrete figures and regulatory facts.\n\n\
                            {content}"
                .into(),
            length_type: LengthType::Standard,
            target_words: 300,
        },
        SummaryStyle {
            style_name: "compact".into(),
            system_prompt: "You are a pharmaceutical intelligence analyst. Be terse.".into(),
            user_template: "Summarize the {category} findings for {drug_name} in at most \
                            {target_words} words.\n\n{content}"
                .into(),
            length_type: LengthType::Compact,
            target_words: 120,
        },
        SummaryStyle {
            style_name: "deep".into(),
            system_prompt: "You are a pharmaceutical intelligence analyst. Produce a thorough \
                            section-by-section analysis."
                .into(),
            user_template: "Write a detailed {category} analysis for {drug_name} of about \
                            {target_words} words, preserving all quantitative data.\n\n{content}"
                .into(),
            length_type: LengthType::Deep,
            target_words: 700,
        },
    ]
}

/// Result of one summary generation attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryOutcome {
    pub summary: String,
    pub style_name: String,
    pub provider: String,
    pub model: String,
    pub generation_time_ms: i64,
    pub tokens_used: i64,
    pub cost_estimate: f64,
    pub error_message: Option<String>,
}

impl SummaryOutcome {
    /// Build the history row for this attempt.
    pub fn to_history(&self, request_id: &str, category_name: &str) -> SummaryHistory {
        SummaryHistory {
            id: format!("sum_{}", Uuid::new_v4().simple()),
            request_id: request_id.to_string(),
            category_name: category_name.to_string(),
            style_name: self.style_name.clone(),
            provider: self.provider.clone(),
            model: self.model.clone(),
            generated_summary: self.summary.clone(),
            generation_time_ms: self.generation_time_ms,
            tokens_used: self.tokens_used,
            cost_estimate: self.cost_estimate,
            error_message: self.error_message.clone(),
            created_at: Utc::now(),
        }
    }
}

/// Style-driven summary generator.
pub struct SummaryGenerator {
    analysis: Arc<dyn ProviderClient>,
    style: SummaryStyle,
}

impl SummaryGenerator {
    pub fn new(analysis: Arc<dyn ProviderClient>) -> Self {
        Self {
            analysis,
            style: default_styles().into_iter().next().expect("seeded styles"),
        }
    }

    pub fn with_style(mut self, style: SummaryStyle) -> Self {
        self.style = style;
        self
    }

    /// Generate a summary; failures produce an outcome with an empty summary
    /// and the error recorded, never an `Err`.
    pub async fn generate(
        &self,
        category_name: &str,
        drug_name: &str,
        content: &str,
    ) -> SummaryOutcome {
        let started = Instant::now();
        let prompt = self.style.render(category_name, drug_name, content);
        let query = ProviderQuery::new(prompt)
            .with_system(self.style.system_prompt.clone())
            .with_temperature(0.4)
            .with_max_tokens(self.style.target_words * 4);

        match self.analysis.query(query).await {
            Ok(response) => SummaryOutcome {
                summary: response.text.trim().to_string(),
                style_name: self.style.style_name.clone(),
                provider: response.provider,
                model: response.model,
                generation_time_ms: started.elapsed().as_millis() as i64,
                tokens_used: response.input_tokens as i64 + response.output_tokens as i64,
                cost_estimate: response.cost,
                error_message: None,
            },
            Err(e) => {
                warn!(category = category_name, error = %e, "summary generation failed");
                SummaryOutcome {
                    summary: String::new(),
                    style_name: self.style.style_name.clone(),
                    provider: self.analysis.name().to_string(),
                    model: String::new(),
                    generation_time_ms: started.elapsed().as_millis() as i64,
                    tokens_used: 0,
                    cost_estimate: 0.0,
                    error_message: Some(e.to_string()),
                }
            }
        }
    }
}

/// Deterministic summary used when every LLM-backed stage downstream of
/// collect is disabled.
pub fn basic_summary(
    category_name: &str,
    drug_name: &str,
    responses: &[WeightedResponse],
) -> String {
    let mut lines = vec![
        format!("# {} for {}", category_name, drug_name),
        String::new(),
        format!(
            "Collected {} responses from multiple API providers.",
            responses.len()
        ),
        String::new(),
        "## Responses Summary".to_string(),
    ];

    if responses.is_empty() {
        lines.push("No responses collected".to_string());
    } else {
        for (index, r) in responses.iter().take(5).enumerate() {
            let excerpt: String = r.response.text.chars().take(150).collect();
            lines.push(format!(
                "{}. **{}** (Authority: {}/10): {}...",
                index + 1,
                r.response.provider,
                r.weight,
                excerpt
            ));
        }
    }

    lines.join("\n")
}
