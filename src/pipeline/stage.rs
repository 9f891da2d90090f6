//! Stage executor: runs the four-stage pipeline for one (request, category)
//! pair.
//!
//! The executor is the sole writer of the CategoryResult for its pair. Each
//! stage is individually toggled; disabled stages forward their input
//! unchanged and record a skipped stage event. Persisted state is idempotent
//! keyed by `(request_id, category_id, stage_name)`.

use chrono::Utc;
use futures::future::join_all;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditEventType};
use crate::category::Category;
use crate::config::StageToggles;
use crate::error::{Error, Result};
use crate::merge::{LlmMerger, MergeOutcome};
use crate::model::{
    CategoryResult, CategoryStatus, MergedData, PipelineStageEvent, ProviderResponseRecord,
    Request, SourceConflict,
};
use crate::provider::{query_with_retry, NormalizedResponse, ProviderClient, ProviderQuery, RetryConfig};
use crate::store::Store;
use crate::summary::{basic_summary, SummaryGenerator};
use crate::validation::{CategoryValidator, ValidationOutcome};
use crate::weighting::{average_authority, weigh, WeightedResponse};

/// Fixed stage order for the category pipeline.
pub const STAGE_ORDER: [&str; 4] = ["collect", "verify", "merge", "summarize"];

/// Executor for one category's pipeline.
pub struct StageExecutor {
    store: Arc<Store>,
    collect_providers: Vec<Arc<dyn ProviderClient>>,
    merger: Arc<LlmMerger>,
    summarizer: Arc<SummaryGenerator>,
    toggles: StageToggles,
    retry: RetryConfig,
    stage_timeout: Duration,
}

/// Working state threaded through the stages.
#[derive(Default)]
struct StageData {
    collected: Vec<NormalizedResponse>,
    weighted: Vec<WeightedResponse>,
    validation: Option<ValidationOutcome>,
    merged: Option<MergeOutcome>,
    summary_confidence: Option<f64>,
}

impl StageExecutor {
    pub fn new(
        store: Arc<Store>,
        collect_providers: Vec<Arc<dyn ProviderClient>>,
        merger: Arc<LlmMerger>,
        summarizer: Arc<SummaryGenerator>,
        toggles: StageToggles,
        retry: RetryConfig,
        stage_timeout: Duration,
    ) -> Self {
        Self {
            store,
            collect_providers,
            merger,
            summarizer,
            toggles,
            retry,
            stage_timeout,
        }
    }

    /// Run the pipeline for one (request, category) pair.
    ///
    /// Never panics or propagates: the returned CategoryResult carries the
    /// terminal status, and persisted state always matches it.
    pub async fn run(
        &self,
        request: &Request,
        category: &Category,
        cancel: &Arc<AtomicBool>,
    ) -> CategoryResult {
        let mut result = self
            .store
            .get_category_result(&request.id, category.id)
            .ok()
            .flatten()
            .unwrap_or_else(|| CategoryResult::new(&request.id, category.id, &category.name));

        result.status = CategoryStatus::Processing;
        result.started_at.get_or_insert_with(Utc::now);
        if let Err(e) = self.store.upsert_category_result(&result) {
            error!(category = %category.name, error = %e, "failed to persist category start");
        }
        self.audit_process(request, category, AuditEventType::ProcessStart, None);

        let started = Instant::now();
        let mut attempt = 0;
        loop {
            match self.run_stages(request, category, &mut result, cancel).await {
                Ok(()) => {
                    result.status = CategoryStatus::Completed;
                    result.error_message = None;
                    self.audit_process(request, category, AuditEventType::ProcessComplete, None);
                    break;
                }
                Err(Error::Cancelled) => {
                    result.status = CategoryStatus::Skipped;
                    result.error_message = Some("cancelled".to_string());
                    break;
                }
                Err(e) if e.is_transient() && attempt == 0 => {
                    attempt += 1;
                    result.retry_count += 1;
                    warn!(category = %category.name, error = %e, "transient category failure, retrying once");
                    continue;
                }
                Err(e) => {
                    result.status = CategoryStatus::Failed;
                    result.error_message = Some(e.to_string());
                    self.audit_process(
                        request,
                        category,
                        AuditEventType::ProcessError,
                        Some(e.tag()),
                    );
                    break;
                }
            }
        }

        result.processing_time_ms = started.elapsed().as_millis() as i64;
        result.completed_at = Some(Utc::now());
        if let Err(e) = self.store.upsert_category_result(&result) {
            error!(category = %category.name, error = %e, "failed to persist category result");
        }
        result
    }

    async fn run_stages(
        &self,
        request: &Request,
        category: &Category,
        result: &mut CategoryResult,
        cancel: &Arc<AtomicBool>,
    ) -> Result<()> {
        let mut data = StageData::default();

        self.collect_stage(request, category, result, cancel, &mut data)
            .await?;
        self.verify_stage(request, category, cancel, &mut data).await?;
        self.merge_stage(request, category, result, cancel, &mut data)
            .await?;
        self.summarize_stage(request, category, result, cancel, &mut data)
            .await?;

        // Confidence: merge confidence corrected by the validation penalty.
        let base_confidence = data
            .merged
            .as_ref()
            .map(|m| m.confidence_score)
            .or(data.summary_confidence)
            .unwrap_or(0.5);
        result.confidence_score = match &data.validation {
            Some(v) => v.apply_penalty(base_confidence),
            None => base_confidence,
        };
        result.data_quality_score = quality_score(&data);
        Ok(())
    }

    async fn collect_stage(
        &self,
        request: &Request,
        category: &Category,
        result: &mut CategoryResult,
        cancel: &Arc<AtomicBool>,
        data: &mut StageData,
    ) -> Result<()> {
        if !self.toggles.collect {
            self.record_skip(request, category, "collect", 1)?;
            return Ok(());
        }
        check_cancelled(cancel)?;

        let prompt = category.render_prompt(&request.drug_name);
        let input_digest = digest(&prompt);
        let started = Instant::now();

        let calls = self.collect_providers.iter().map(|provider| {
            let provider = Arc::clone(provider);
            let query = ProviderQuery::new(prompt.clone());
            let retry = self.retry.clone();
            async move { query_with_retry(provider.as_ref(), query, &retry).await }
        });
        let outcomes = timeout(self.stage_timeout, join_all(calls))
            .await
            .map_err(|_| Error::timeout(self.stage_timeout.as_millis() as u64))?;

        result.api_calls_made += self.collect_providers.len() as i64;
        let mut last_transient: Option<Error> = None;
        for outcome in outcomes {
            match outcome {
                Ok(response) => {
                    result.token_count += response.total_tokens() as i64;
                    result.cost_estimate += response.cost;
                    self.persist_response(result, &response, &input_digest)?;
                    if !response.text.trim().is_empty() {
                        data.collected.push(response);
                    }
                }
                Err(e) => {
                    warn!(category = %category.name, error = %e, "provider call failed during collect");
                    if e.is_transient() {
                        last_transient = Some(e);
                    }
                }
            }
        }

        if data.collected.is_empty() {
            // Prefer surfacing a transient classification so the category
            // retry can apply.
            return Err(last_transient.unwrap_or_else(|| {
                Error::Internal(format!(
                    "no provider responses collected for {}",
                    category.name
                ))
            }));
        }

        let output_digest = digest(
            &data
                .collected
                .iter()
                .map(|r| r.text.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        );
        self.record_stage(
            request,
            category,
            "collect",
            1,
            Some(input_digest),
            Some(output_digest),
            started.elapsed(),
        )?;
        info!(
            category = %category.name,
            responses = data.collected.len(),
            "collect stage complete"
        );
        Ok(())
    }

    async fn verify_stage(
        &self,
        request: &Request,
        category: &Category,
        cancel: &Arc<AtomicBool>,
        data: &mut StageData,
    ) -> Result<()> {
        // Weighting is part of the data shape and always applied; the stage
        // toggle governs validation and its events.
        data.weighted = data.collected.drain(..).map(weigh).collect();

        if !self.toggles.verify {
            self.record_skip(request, category, "verify", 2)?;
            return Ok(());
        }
        check_cancelled(cancel)?;

        let started = Instant::now();
        let combined: String = data
            .weighted
            .iter()
            .map(|r| r.response.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let input_digest = digest(&combined);

        let validator = CategoryValidator::new(category.verification_rules.clone());
        let outcome = validator.validate(&combined);
        let source_validations = validator.validate_sources(&data.weighted);

        self.store.insert_audit_event(
            &AuditEvent::new(AuditEventType::SourceVerification, "category_result", &format!(
                "{}:{}",
                request.id, category.id
            ))
            .with_request(&request.id)
            .with_correlation(&request.correlation_id)
            .with_images(
                None,
                Some(json!({
                    "sources": data.weighted.len(),
                    "avg_authority": average_authority(&data.weighted),
                    "validation_passed": outcome.passed,
                    "confidence_penalty": outcome.confidence_penalty,
                    "source_pass_rates": source_validations
                        .iter()
                        .map(|s| json!({"provider": s.provider, "pass_rate": s.pass_rate}))
                        .collect::<Vec<_>>(),
                })),
            ),
        )?;

        let output_digest = digest(&format!("{:?}", outcome.failed_rules));
        data.validation = Some(outcome);
        self.record_stage(
            request,
            category,
            "verify",
            2,
            Some(input_digest),
            Some(output_digest),
            started.elapsed(),
        )?;
        Ok(())
    }

    async fn merge_stage(
        &self,
        request: &Request,
        category: &Category,
        result: &mut CategoryResult,
        cancel: &Arc<AtomicBool>,
        data: &mut StageData,
    ) -> Result<()> {
        if !self.toggles.merge {
            self.record_skip(request, category, "merge", 3)?;
            return Ok(());
        }
        check_cancelled(cancel)?;

        let started = Instant::now();
        let input_digest = digest(
            &data
                .weighted
                .iter()
                .map(|r| r.response.text.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        );

        let outcome = timeout(
            self.stage_timeout,
            self.merger.merge(category, &request.drug_name, &data.weighted),
        )
        .await
        .map_err(|_| Error::timeout(self.stage_timeout.as_millis() as u64))??;

        let merged = MergedData {
            id: format!("merged_{}", Uuid::new_v4().simple()),
            category_result_id: result.id.clone(),
            merged_text: outcome.merged_text.clone(),
            structured_data: outcome.structured_data.clone(),
            confidence: outcome.confidence_score,
            data_quality_score: outcome.data_quality_score,
            source_references: outcome.source_references.clone(),
            merge_method: outcome.merge_method,
            created_at: Utc::now(),
        };
        self.store.upsert_merged_data(&merged)?;

        if !outcome.conflicts_resolved.is_empty() {
            let conflicts: Vec<SourceConflict> = outcome
                .conflicts_resolved
                .iter()
                .map(|c| SourceConflict {
                    id: format!("conf_{}", Uuid::new_v4().simple()),
                    category_result_id: result.id.clone(),
                    conflict_type: "data_disagreement".to_string(),
                    description: format!("{}: {}", c.field, c.reason),
                    conflicting_source_ids: c.sources.clone(),
                    resolution_strategy: "authority_weighted".to_string(),
                    resolved_at: Some(Utc::now()),
                    confidence_impact: 0.0,
                    is_critical: false,
                })
                .collect();
            self.store.insert_conflicts(&conflicts)?;
        }

        let output_digest = digest(&outcome.merged_text);
        data.merged = Some(outcome);
        self.record_stage(
            request,
            category,
            "merge",
            3,
            Some(input_digest),
            Some(output_digest),
            started.elapsed(),
        )?;
        Ok(())
    }

    async fn summarize_stage(
        &self,
        request: &Request,
        category: &Category,
        result: &mut CategoryResult,
        cancel: &Arc<AtomicBool>,
        data: &mut StageData,
    ) -> Result<()> {
        if !self.toggles.summarize {
            self.record_skip(request, category, "summarize", 4)?;
            // Forward the previous enabled stage's output.
            result.summary = match &data.merged {
                Some(m) => m.merged_text.clone(),
                None => basic_summary(&category.name, &request.drug_name, &data.weighted),
            };
            return Ok(());
        }
        check_cancelled(cancel)?;

        let started = Instant::now();

        // With merge and verify both disabled, the summary is a deterministic
        // formatted concatenation with no LLM call.
        if data.merged.is_none() && !self.toggles.merge && !self.toggles.verify {
            result.summary = basic_summary(&category.name, &request.drug_name, &data.weighted);
            data.summary_confidence = Some(0.5);
            self.record_stage(
                request,
                category,
                "summarize",
                4,
                None,
                Some(digest(&result.summary)),
                started.elapsed(),
            )?;
            return Ok(());
        }

        let input = match &data.merged {
            Some(m) => m.merged_text.clone(),
            // Merge disabled: raw concatenation from the previous enabled
            // stage.
            None => data
                .weighted
                .iter()
                .map(|r| r.response.text.as_str())
                .collect::<Vec<_>>()
                .join("\n\n"),
        };
        let input_digest = digest(&input);

        let outcome = timeout(
            self.stage_timeout,
            self.summarizer
                .generate(&category.name, &request.drug_name, &input),
        )
        .await
        .map_err(|_| Error::timeout(self.stage_timeout.as_millis() as u64))?;

        self.store
            .append_summary_history(&outcome.to_history(&request.id, &category.name))?;

        result.token_count += outcome.tokens_used;
        result.cost_estimate += outcome.cost_estimate;
        result.api_calls_made += 1;
        result.summary = outcome.summary.clone();
        data.summary_confidence = if outcome.error_message.is_none() {
            Some(0.7)
        } else {
            None
        };

        self.record_stage(
            request,
            category,
            "summarize",
            4,
            Some(input_digest),
            Some(digest(&result.summary)),
            started.elapsed(),
        )?;
        Ok(())
    }

    fn persist_response(
        &self,
        result: &CategoryResult,
        response: &NormalizedResponse,
        prompt_digest: &str,
    ) -> Result<()> {
        let created_at = Utc::now();
        self.store.insert_provider_response(&ProviderResponseRecord {
            id: format!("resp_{}", Uuid::new_v4().simple()),
            category_result_id: result.id.clone(),
            provider: response.provider.clone(),
            model: response.model.clone(),
            temperature: None,
            query_parameters: json!({ "prompt_digest": prompt_digest }),
            raw_text: response.text.clone(),
            latency_ms: response.latency_ms as i64,
            token_count: response.total_tokens() as i64,
            cost: response.cost,
            checksum: digest(&response.text),
            created_at,
            retention_expires_at: ProviderResponseRecord::default_retention(created_at),
        })
    }

    fn record_stage(
        &self,
        request: &Request,
        category: &Category,
        stage_name: &str,
        stage_order: i64,
        input_digest: Option<String>,
        output_digest: Option<String>,
        duration: Duration,
    ) -> Result<()> {
        self.store.record_stage_event(&PipelineStageEvent {
            id: format!("stage_{}", Uuid::new_v4().simple()),
            request_id: request.id.clone(),
            category_id: category.id,
            stage_name: stage_name.to_string(),
            stage_order,
            executed: true,
            skipped: false,
            input_digest,
            output_digest,
            duration_ms: duration.as_millis() as i64,
            created_at: Utc::now(),
        })
    }

    fn record_skip(
        &self,
        request: &Request,
        category: &Category,
        stage_name: &str,
        stage_order: i64,
    ) -> Result<()> {
        self.store.record_stage_event(&PipelineStageEvent {
            id: format!("stage_{}", Uuid::new_v4().simple()),
            request_id: request.id.clone(),
            category_id: category.id,
            stage_name: stage_name.to_string(),
            stage_order,
            executed: false,
            skipped: true,
            input_digest: None,
            output_digest: None,
            duration_ms: 0,
            created_at: Utc::now(),
        })
    }

    fn audit_process(
        &self,
        request: &Request,
        category: &Category,
        event_type: AuditEventType,
        error_tag: Option<&str>,
    ) {
        let mut event = AuditEvent::new(event_type, "category_result", format!(
            "{}:{}",
            request.id, category.id
        ))
        .with_request(&request.id)
        .with_correlation(&request.correlation_id);
        if let Some(tag) = error_tag {
            event = event.with_images(
                None,
                Some(json!({"error": tag, "category": category.name})),
            );
        }
        if let Err(e) = self.store.insert_audit_event(&event) {
            error!(category = %category.name, error = %e, "audit write failed for process event");
        }
    }
}

fn check_cancelled(cancel: &Arc<AtomicBool>) -> Result<()> {
    if cancel.load(Ordering::SeqCst) {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

/// SHA-256 hex digest.
pub fn digest(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Overall quality score: mean of the available stage signals.
fn quality_score(data: &StageData) -> f64 {
    let mut scores = Vec::new();
    let response_count = data.weighted.len();
    if response_count > 0 {
        scores.push((response_count as f64 / 10.0).min(1.0));
        scores.push((average_authority(&data.weighted) / 100.0).min(1.0));
    }
    if let Some(merged) = &data.merged {
        scores.push(merged.confidence_score);
    }
    if let Some(confidence) = data.summary_confidence {
        scores.push(confidence);
    }
    if scores.is_empty() {
        0.5
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::default_categories;
    use crate::model::DeliveryMethod;
    use crate::provider::ProviderQuery;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Scripted provider: per-call replies, optional failures.
    pub(crate) struct ScriptedProvider {
        pub name: String,
        pub reply: String,
        pub fail: bool,
        pub calls: AtomicUsize,
    }

    impl ScriptedProvider {
        pub fn ok(name: &str, reply: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                reply: reply.into(),
                fail: false,
                calls: AtomicUsize::new(0),
            })
        }

        pub fn failing(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                reply: String::new(),
                fail: true,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ProviderClient for ScriptedProvider {
        async fn query(&self, _query: ProviderQuery) -> Result<NormalizedResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::provider(
                    &self.name,
                    crate::error::ProviderErrorKind::BadRequest,
                    "scripted failure",
                ));
            }
            Ok(NormalizedResponse {
                provider: self.name.clone(),
                model: "mock".into(),
                text: self.reply.clone(),
                cited_urls: vec![],
                input_tokens: 100,
                output_tokens: 50,
                latency_ms: 1,
                cost: 0.001,
                timestamp: Utc::now(),
            })
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    fn executor(
        store: Arc<Store>,
        providers: Vec<Arc<dyn ProviderClient>>,
        analysis: Arc<dyn ProviderClient>,
        toggles: StageToggles,
    ) -> StageExecutor {
        StageExecutor::new(
            store,
            providers,
            Arc::new(LlmMerger::new(Arc::clone(&analysis))),
            Arc::new(SummaryGenerator::new(analysis)),
            toggles,
            RetryConfig {
                max_retries: 0,
                base_delay_ms: 1,
                backoff_factor: 1.0,
                max_delay_ms: 2,
            },
            Duration::from_secs(30),
        )
    }

    fn setup() -> (Arc<Store>, Request, Category) {
        let store = Arc::new(Store::in_memory().unwrap());
        let request = Request::new("Apixaban", DeliveryMethod::Transdermal);
        store.insert_request(&request).unwrap();
        let category = default_categories().into_iter().next().unwrap();
        (store, request, category)
    }

    fn rich_reply() -> String {
        "## Market Size\nGlobal market size is 5.1 billion USD with 12% growth.\n\n\
         ## Regional\nUS leads with 48% share."
            .to_string()
    }

    #[tokio::test]
    async fn test_happy_path_runs_all_four_stages() {
        let (store, request, category) = setup();
        let analysis = ScriptedProvider::ok("analysis", &rich_reply());
        let providers: Vec<Arc<dyn ProviderClient>> = vec![
            ScriptedProvider::ok("openai", &rich_reply()),
            ScriptedProvider::ok("perplexity", &rich_reply()),
        ];
        let exec = executor(
            Arc::clone(&store),
            providers,
            analysis,
            StageToggles::default(),
        );

        let cancel = Arc::new(AtomicBool::new(false));
        let result = exec.run(&request, &category, &cancel).await;

        assert_eq!(result.status, CategoryStatus::Completed);
        assert!(!result.summary.is_empty());
        assert!(result.confidence_score > 0.0);
        assert!(result.completed_at.unwrap() >= result.started_at.unwrap());

        let events = store.list_stage_events(&request.id).unwrap();
        assert_eq!(events.len(), 4);
        assert!(events.iter().all(|e| e.executed && !e.skipped));

        // Raw responses persisted with checksums.
        let responses = store.list_provider_responses(&result.id).unwrap();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].checksum, digest(&responses[0].raw_text));

        // Merged artifact persisted.
        assert!(store.get_merged_data(&result.id).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_all_providers_empty_fails_category() {
        let (store, request, category) = setup();
        let analysis = ScriptedProvider::ok("analysis", "whatever");
        let providers: Vec<Arc<dyn ProviderClient>> =
            vec![ScriptedProvider::ok("openai", ""), ScriptedProvider::ok("grok", "")];
        let exec = executor(
            Arc::clone(&store),
            providers,
            analysis,
            StageToggles::default(),
        );

        let cancel = Arc::new(AtomicBool::new(false));
        let result = exec.run(&request, &category, &cancel).await;

        assert_eq!(result.status, CategoryStatus::Failed);
        assert!(result.error_message.is_some());

        // A process_error audit event references the failure.
        let audits = store.list_audit_events(&request.id).unwrap();
        assert!(audits
            .iter()
            .any(|a| a.event_type == AuditEventType::ProcessError));
    }

    #[tokio::test]
    async fn test_disabled_stages_record_skip_events() {
        let (store, request, category) = setup();
        let analysis = ScriptedProvider::ok("analysis", &rich_reply());
        let providers: Vec<Arc<dyn ProviderClient>> =
            vec![ScriptedProvider::ok("openai", &rich_reply())];
        let toggles = StageToggles {
            collect: true,
            verify: false,
            merge: false,
            summarize: false,
        };
        let exec = executor(Arc::clone(&store), providers, analysis, toggles);

        let cancel = Arc::new(AtomicBool::new(false));
        let result = exec.run(&request, &category, &cancel).await;

        assert_eq!(result.status, CategoryStatus::Completed);
        // Deterministic concatenation fallback.
        assert!(result.summary.contains("# Market Overview for Apixaban"));

        let events = store.list_stage_events(&request.id).unwrap();
        let skipped: Vec<_> = events.iter().filter(|e| e.skipped).collect();
        assert_eq!(skipped.len(), 3);
        assert!(skipped.iter().all(|e| !e.executed));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_marks_skipped() {
        let (store, request, category) = setup();
        let analysis = ScriptedProvider::ok("analysis", &rich_reply());
        let providers: Vec<Arc<dyn ProviderClient>> =
            vec![ScriptedProvider::ok("openai", &rich_reply())];
        let exec = executor(
            Arc::clone(&store),
            providers,
            analysis,
            StageToggles::default(),
        );

        let cancel = Arc::new(AtomicBool::new(true));
        let result = exec.run(&request, &category, &cancel).await;

        assert_eq!(result.status, CategoryStatus::Skipped);
        assert_eq!(result.error_message.as_deref(), Some("cancelled"));
        // No stage executed.
        let events = store.list_stage_events(&request.id).unwrap();
        assert!(events.iter().all(|e| !e.executed));
    }

    #[tokio::test]
    async fn test_stage_rerun_is_idempotent() {
        let (store, request, category) = setup();
        let analysis = ScriptedProvider::ok("analysis", &rich_reply());
        let make_providers = || -> Vec<Arc<dyn ProviderClient>> {
            vec![ScriptedProvider::ok("openai", &rich_reply())]
        };
        let cancel = Arc::new(AtomicBool::new(false));

        let exec = executor(
            Arc::clone(&store),
            make_providers(),
            Arc::clone(&analysis) as Arc<dyn ProviderClient>,
            StageToggles::default(),
        );
        let first = exec.run(&request, &category, &cancel).await;
        let second = exec.run(&request, &category, &cancel).await;

        // Same persisted identity and equal outputs, ignoring timestamps.
        assert_eq!(first.id, second.id);
        assert_eq!(first.summary, second.summary);
        assert_eq!(first.status, second.status);

        // Stage events stay keyed by (request, category, stage).
        let events = store.list_stage_events(&request.id).unwrap();
        assert_eq!(events.len(), 4);
    }

    #[test]
    fn test_digest_stability() {
        assert_eq!(digest("abc"), digest("abc"));
        assert_ne!(digest("abc"), digest("abd"));
        assert_eq!(digest("abc").len(), 64);
    }
}
