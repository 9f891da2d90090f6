//! LLM-assisted merge of weighted provider responses.
//!
//! The merge prompt tags every response with its authority weight and
//! credibility and requires a machine-parseable JSON reply. When the LLM call
//! or parse fails the merger falls back to deterministic weighted
//! concatenation. A secondary extraction call populates category-shaped
//! structured data when the merge did not.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use crate::category::Category;
use crate::error::Result;
use crate::model::{MergeMethod, SourceReference};
use crate::provider::{ProviderClient, ProviderQuery};
use crate::scoring::parse_json_object;
use crate::weighting::WeightedResponse;

/// A conflict the merge resolved between sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedConflict {
    pub field: String,
    pub sources: Vec<String>,
    pub chosen: String,
    pub reason: String,
}

/// Canonical merged artifact for one category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub merged_text: String,
    pub structured_data: serde_json::Map<String, Value>,
    pub confidence_score: f64,
    pub data_quality_score: f64,
    pub conflicts_resolved: Vec<ResolvedConflict>,
    pub key_findings: Vec<String>,
    pub merge_method: MergeMethod,
    pub source_references: Vec<SourceReference>,
}

impl MergeOutcome {
    /// Empty artifact for a category with no responses.
    pub fn empty() -> Self {
        Self {
            merged_text: String::new(),
            structured_data: Default::default(),
            confidence_score: 0.0,
            data_quality_score: 0.0,
            conflicts_resolved: Vec::new(),
            key_findings: Vec::new(),
            merge_method: MergeMethod::None,
            source_references: Vec::new(),
        }
    }
}

/// How many top-weighted sources the fallback concatenation keeps.
const FALLBACK_TOP_K: usize = 5;

/// Merger backed by the configured analysis provider.
pub struct LlmMerger {
    analysis: Arc<dyn ProviderClient>,
}

impl LlmMerger {
    pub fn new(analysis: Arc<dyn ProviderClient>) -> Self {
        Self { analysis }
    }

    /// Merge weighted responses into one canonical artifact.
    pub async fn merge(
        &self,
        category: &Category,
        drug_name: &str,
        responses: &[WeightedResponse],
    ) -> Result<MergeOutcome> {
        if responses.is_empty() {
            return Ok(MergeOutcome::empty());
        }

        let mut ordered: Vec<&WeightedResponse> = responses.iter().collect();
        // Documented tie-breaking: authority, then content length, then
        // provider id.
        ordered.sort_by(|a, b| {
            b.weight
                .cmp(&a.weight)
                .then(b.response.text.len().cmp(&a.response.text.len()))
                .then(a.response.provider.cmp(&b.response.provider))
        });

        let references: Vec<SourceReference> = ordered
            .iter()
            .map(|r| SourceReference {
                provider: r.response.provider.clone(),
                model: r.response.model.clone(),
                weight: r.weight,
                authority_score: r.authority_score,
            })
            .collect();

        let mut outcome = match self.merge_with_llm(category, drug_name, &ordered).await {
            Some(outcome) => outcome,
            None => fallback_weighted_merge(category, drug_name, &ordered),
        };

        if outcome.structured_data.is_empty() && !category.expected_keys.is_empty() {
            if let Some(extracted) = self
                .extract_structured(&outcome.merged_text, category)
                .await
            {
                outcome.structured_data = extracted;
            }
        }

        outcome.source_references = references;
        Ok(outcome)
    }

    async fn merge_with_llm(
        &self,
        category: &Category,
        drug_name: &str,
        ordered: &[&WeightedResponse],
    ) -> Option<MergeOutcome> {
        let mut sources = String::new();
        for (index, r) in ordered.iter().enumerate() {
            sources.push_str(&format!(
                "### Source {} — provider={} authority={}/10 credibility={:.2}\n{}\n\n",
                index + 1,
                r.response.provider,
                r.weight,
                r.credibility,
                r.response.text
            ));
        }

        let prompt = format!(
            "Merge the following source responses about {} for the category \"{}\" into one \
             consistent markdown narrative.\n\
             Rules: prefer higher-authority sources when claims disagree; within the same \
             authority, prefer the longer response; remaining ties resolve alphabetically by \
             provider id. Enumerate every conflict you resolve.\n\n\
             Return ONLY a JSON object:\n\
             {{\"merged_text\": \"...\", \"confidence_score\": 0.0-1.0, \
             \"data_quality_score\": 0.0-1.0, \
             \"conflicts\": [{{\"field\": \"...\", \"sources\": [\"...\"], \"chosen\": \"...\", \
             \"reason\": \"...\"}}], \"key_findings\": [\"...\"]}}\n\n{}",
            drug_name, category.name, sources
        );
        let query = ProviderQuery::new(prompt)
            .with_temperature(0.1)
            .with_max_tokens(4000);

        let response = match self.analysis.query(query).await {
            Ok(r) => r,
            Err(e) => {
                warn!(category = %category.name, error = %e, "merge LLM call failed");
                return None;
            }
        };

        let json = parse_json_object(&response.text)?;
        let merged_text = json.get("merged_text")?.as_str()?.to_string();
        if merged_text.trim().is_empty() {
            return None;
        }

        let conflicts = json
            .get("conflicts")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        Some(ResolvedConflict {
                            field: item.get("field")?.as_str()?.to_string(),
                            sources: item
                                .get("sources")
                                .and_then(|s| s.as_array())
                                .map(|s| {
                                    s.iter()
                                        .filter_map(|v| v.as_str().map(String::from))
                                        .collect()
                                })
                                .unwrap_or_default(),
                            chosen: item
                                .get("chosen")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            reason: item
                                .get("reason")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let key_findings = json
            .get("key_findings")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        info!(category = %category.name, "merge completed via llm");
        Some(MergeOutcome {
            merged_text,
            structured_data: json
                .get("structured_data")
                .and_then(|v| v.as_object().cloned())
                .unwrap_or_default(),
            confidence_score: json
                .get("confidence_score")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.8)
                .clamp(0.0, 1.0),
            data_quality_score: json
                .get("data_quality_score")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.7)
                .clamp(0.0, 1.0),
            conflicts_resolved: conflicts,
            key_findings,
            merge_method: MergeMethod::LlmAssisted,
            source_references: Vec::new(),
        })
    }

    /// Secondary extraction: populate the category's expected structured
    /// keys from merged text.
    pub async fn extract_structured(
        &self,
        merged_text: &str,
        category: &Category,
    ) -> Option<serde_json::Map<String, Value>> {
        if merged_text.trim().is_empty() {
            return None;
        }
        let prompt = format!(
            "Extract structured data for the category \"{}\" from the text below. Return ONLY \
             a JSON object with these keys where present: {}. Use null for missing values.\n\n{}",
            category.name,
            category.expected_keys.join(", "),
            merged_text
        );
        let query = ProviderQuery::new(prompt)
            .with_temperature(0.0)
            .with_max_tokens(1500);

        match self.analysis.query(query).await {
            Ok(response) => parse_json_object(&response.text),
            Err(e) => {
                warn!(category = %category.name, error = %e, "structured extraction failed");
                None
            }
        }
    }
}

/// Deterministic fallback: weight-sorted concatenation of the top sources.
///
/// Confidence is `Σ(weight · credibility) / Σ weight`.
pub fn fallback_weighted_merge(
    category: &Category,
    drug_name: &str,
    ordered: &[&WeightedResponse],
) -> MergeOutcome {
    let contributing: Vec<&&WeightedResponse> = ordered
        .iter()
        .filter(|r| r.weight > 0 && !r.response.text.is_empty())
        .take(FALLBACK_TOP_K)
        .collect();

    let total_weight: f64 = contributing.iter().map(|r| r.weight as f64).sum();
    let confidence = if total_weight > 0.0 {
        contributing
            .iter()
            .map(|r| r.weight as f64 * r.credibility)
            .sum::<f64>()
            / total_weight
    } else {
        0.0
    };

    let mut merged_text = format!("# {} for {}\n\n", category.name, drug_name);
    for r in &contributing {
        merged_text.push_str(&format!(
            "## {} (Authority: {}/10)\n{}\n\n",
            r.response.provider, r.weight, r.response.text
        ));
    }

    MergeOutcome {
        merged_text,
        structured_data: Default::default(),
        confidence_score: confidence,
        data_quality_score: confidence,
        conflicts_resolved: Vec::new(),
        key_findings: Vec::new(),
        merge_method: MergeMethod::FallbackWeighted,
        source_references: Vec::new(),
    }
}
