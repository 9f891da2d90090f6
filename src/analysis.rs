//! Phase-2 narrative analysis categories.
//!
//! Each Phase-2 category other than the scorer is a single LLM-driven
//! analysis over a read-only view of the Phase-1 results (and the scorer's
//! totals once available).

use std::sync::Arc;
use tracing::warn;

use crate::category::Category;
use crate::error::{Error, Result};
use crate::model::CategoryResult;
use crate::provider::{ProviderClient, ProviderQuery};
use crate::scoring::ScoringOutcome;

/// Read-only Phase-1 view handed to every Phase-2 category.
#[derive(Debug, Clone, Default)]
pub struct Phase1View {
    /// `(category name, summary)` for completed Phase-1 categories.
    pub summaries: Vec<(String, String)>,
}

impl Phase1View {
    pub fn from_results(results: &[CategoryResult]) -> Self {
        Self {
            summaries: results
                .iter()
                .filter(|r| !r.summary.is_empty())
                .map(|r| (r.category_name.clone(), r.summary.clone()))
                .collect(),
        }
    }

    /// Concatenated context block for prompts.
    pub fn context(&self) -> String {
        self.summaries
            .iter()
            .map(|(name, summary)| format!("## {}\n{}", name, summary))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn is_empty(&self) -> bool {
        self.summaries.is_empty()
    }
}

/// Runner for narrative Phase-2 categories.
pub struct Phase2Analyzer {
    analysis: Arc<dyn ProviderClient>,
}

/// Outcome of one Phase-2 narrative analysis.
#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub summary: String,
    pub tokens_used: i64,
    pub cost: f64,
}

impl Phase2Analyzer {
    pub fn new(analysis: Arc<dyn ProviderClient>) -> Self {
        Self { analysis }
    }

    /// Run one category's analysis over the Phase-1 view and scoring totals.
    pub async fn analyze(
        &self,
        category: &Category,
        drug_name: &str,
        phase1: &Phase1View,
        scoring: Option<&ScoringOutcome>,
    ) -> Result<AnalysisOutcome> {
        let mut prompt = category.render_prompt(drug_name);

        if let Some(scores) = scoring {
            prompt.push_str(&format!(
                "\n\nParameter-based suitability scores:\n\
                 - Transdermal: {:.1}/9 ({})\n- Transmucosal: {:.1}/9 ({})",
                scores.transdermal.total,
                scores.transdermal.verdict,
                scores.transmucosal.total,
                scores.transmucosal.verdict,
            ));
        }

        if !phase1.is_empty() {
            prompt.push_str("\n\nPhase 1 research summaries:\n");
            prompt.push_str(&phase1.context());
        }

        let query = ProviderQuery::new(prompt)
            .with_temperature(0.4)
            .with_max_tokens(2000);

        let response = self.analysis.query(query).await.map_err(|e| {
            warn!(category = %category.name, error = %e, "phase2 analysis failed");
            e
        })?;

        if response.text.trim().is_empty() {
            return Err(Error::Internal(format!(
                "empty analysis reply for {}",
                category.name
            )));
        }

        Ok(AnalysisOutcome {
            summary: response.text.trim().to_string(),
            tokens_used: response.total_tokens() as i64,
            cost: response.cost,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::default_categories;
    use crate::model::CategoryStatus;
    use crate::provider::NormalizedResponse;
    use async_trait::async_trait;
    use chrono::Utc;

    struct EchoAnalysis;

    #[async_trait]
    impl ProviderClient for EchoAnalysis {
        async fn query(&self, query: ProviderQuery) -> Result<NormalizedResponse> {
            Ok(NormalizedResponse {
                provider: "analysis".into(),
                model: "m".into(),
                text: format!("analysis over {} chars", query.prompt.len()),
                cited_urls: vec![],
                input_tokens: 50,
                output_tokens: 25,
                latency_ms: 1,
                cost: 0.001,
                timestamp: Utc::now(),
            })
        }

        fn name(&self) -> &str {
            "analysis"
        }
    }

    fn completed_result(name: &str, summary: &str) -> CategoryResult {
        let mut r = CategoryResult::new("req_1", 1, name);
        r.status = CategoryStatus::Completed;
        r.summary = summary.into();
        r
    }

    #[test]
    fn test_phase1_view_skips_empty_summaries() {
        let results = vec![
            completed_result("Market Overview", "market facts"),
            completed_result("Pharmacokinetics", ""),
        ];
        let view = Phase1View::from_results(&results);
        assert_eq!(view.summaries.len(), 1);
        assert!(view.context().contains("## Market Overview"));
    }

    #[tokio::test]
    async fn test_analyze_includes_phase1_and_scores() {
        let analyzer = Phase2Analyzer::new(Arc::new(EchoAnalysis));
        let category = default_categories()
            .into_iter()
            .find(|c| c.key == "risk_assessment")
            .unwrap();
        let view = Phase1View {
            summaries: vec![("Market Overview".into(), "facts".into())],
        };

        let outcome = analyzer
            .analyze(&category, "Apixaban", &view, None)
            .await
            .unwrap();
        assert!(outcome.summary.starts_with("analysis over"));
        assert_eq!(outcome.tokens_used, 75);
    }
}
