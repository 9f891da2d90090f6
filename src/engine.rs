//! Engine context and request lifecycle.
//!
//! One `Engine` owns the store, providers, limiter, and configuration, and
//! is passed explicitly wherever needed; nothing is constructed at import
//! time. Each request is processed end-to-end by one task; requests are
//! independent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

use crate::analysis::Phase2Analyzer;
use crate::audit::{AuditEvent, AuditEventType};
use crate::category::{default_categories, default_dependencies};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::merge::LlmMerger;
use crate::model::{DeliveryMethod, Priority, Request, RequestFinalOutput};
use crate::pipeline::scheduler::CategoryScheduler;
use crate::pipeline::stage::StageExecutor;
use crate::provider::{HttpProvider, ProviderClient, RetryConfig};
use crate::ratelimit::{RateLimiter, SharedRateLimiter};
use crate::report::ReportComposer;
use crate::retention::RetentionManager;
use crate::scoring::{default_rubric, ParameterScorer};
use crate::status::{ProcessingStatus, StageHistoryEntry};
use crate::store::Store;
use crate::summary::SummaryGenerator;
use crate::tracker::StatusTracker;
use crate::webhook::WebhookNotifier;

/// A validated submission.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmissionRequest {
    pub drug_names: Vec<String>,
    #[serde(default)]
    pub delivery_method: Option<String>,
    /// Optional subset of category keys to run; omitted means all active.
    #[serde(default)]
    pub categories: Option<Vec<String>>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub callback_url: Option<String>,
}

/// Acknowledgement returned on submission.
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionAck {
    pub request_id: String,
    pub correlation_id: String,
    pub status: String,
    pub message: String,
    pub drug_count: usize,
    pub category_count: usize,
    pub estimated_completion_time_ms: i64,
    pub results_url: String,
}

/// Status snapshot returned by the status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessStatus {
    pub request_id: String,
    pub status: String,
    pub progress_percent: u8,
    pub categories_total: i64,
    pub categories_completed: i64,
    pub estimated_completion_at: Option<DateTime<Utc>>,
    pub error_details: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Bulk status partitions.
#[derive(Debug, Clone, Serialize)]
pub struct BulkStatus {
    pub found: Vec<String>,
    pub not_found: Vec<String>,
    pub statuses: Vec<ProcessStatus>,
}

/// The engine context.
pub struct Engine {
    config: EngineConfig,
    store: Arc<Store>,
    tracker: Arc<StatusTracker>,
    scheduler: Arc<CategoryScheduler>,
    composer: Arc<ReportComposer>,
    webhook: Arc<WebhookNotifier>,
    limiter: Arc<dyn RateLimiter>,
    retention: Arc<RetentionManager>,
    cancel_flags: Mutex<HashMap<String, Arc<AtomicBool>>>,
    category_count: usize,
}

impl Engine {
    /// Build the engine from configuration, constructing HTTP providers.
    pub fn from_config(config: EngineConfig) -> Result<Arc<Self>> {
        let collect: Vec<Arc<dyn ProviderClient>> = config
            .collect_providers()
            .into_iter()
            .map(|p| Arc::new(HttpProvider::new(p.clone())) as Arc<dyn ProviderClient>)
            .collect();
        let analysis_config = config
            .provider(&config.analysis_provider)
            .ok_or_else(|| {
                Error::Config(format!(
                    "analysis provider {} not configured",
                    config.analysis_provider
                ))
            })?
            .clone();
        let analysis: Arc<dyn ProviderClient> = Arc::new(HttpProvider::new(analysis_config));
        let search: Option<Arc<dyn ProviderClient>> = config
            .search_provider()
            .map(|p| Arc::new(HttpProvider::new(p.clone())) as Arc<dyn ProviderClient>);

        let store = Arc::new(Store::open(&config.database_path)?);
        Self::assemble(config, store, collect, analysis, search)
    }

    /// Assemble from explicit components; used directly by tests.
    pub fn assemble(
        config: EngineConfig,
        store: Arc<Store>,
        collect: Vec<Arc<dyn ProviderClient>>,
        analysis: Arc<dyn ProviderClient>,
        search: Option<Arc<dyn ProviderClient>>,
    ) -> Result<Arc<Self>> {
        let categories = default_categories();
        store.seed_reference_data(&categories, &default_dependencies(), &default_rubric())?;
        let active = store.load_categories()?;
        let category_count = active.iter().filter(|c| c.is_active).count();
        let rubric = store.load_rubric()?;

        let tracker = Arc::new(StatusTracker::new(
            Arc::clone(&store),
            config.stage_mean_minutes,
        ));
        let mut summarizer = SummaryGenerator::new(Arc::clone(&analysis));
        if let Some(style) = store
            .load_summary_styles()?
            .into_iter()
            .find(|s| s.style_name == "default")
        {
            summarizer = summarizer.with_style(style);
        }
        let executor = Arc::new(StageExecutor::new(
            Arc::clone(&store),
            collect,
            Arc::new(LlmMerger::new(Arc::clone(&analysis))),
            Arc::new(summarizer),
            config.stages,
            RetryConfig::default(),
            Duration::from_secs(config.stage_timeout_secs),
        ));
        let scorer = Arc::new(ParameterScorer::new(
            Arc::clone(&analysis),
            search,
            rubric.clone(),
        ));
        let analyzer = Arc::new(Phase2Analyzer::new(Arc::clone(&analysis)));
        let scheduler = Arc::new(CategoryScheduler::new(
            Arc::clone(&store),
            executor,
            Arc::clone(&tracker),
            scorer,
            analyzer,
            config.p1_max_parallel,
        ));
        let composer = Arc::new(ReportComposer::new(
            Arc::clone(&store),
            analysis,
            rubric,
        ));
        let limiter: Arc<dyn RateLimiter> = Arc::new(SharedRateLimiter::new(
            Arc::clone(&store),
            config.rate_limit_max_rpm,
            config.rate_limit_window_s,
        ));
        let retention = Arc::new(RetentionManager::new(
            Arc::clone(&store),
            config.audit_retention_years,
        ));

        Ok(Arc::new(Self {
            webhook: Arc::new(WebhookNotifier::new(config.webhook_max_retries)),
            config,
            store,
            tracker,
            scheduler,
            composer,
            limiter,
            retention,
            cancel_flags: Mutex::new(HashMap::new()),
            category_count,
        }))
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn limiter(&self) -> &Arc<dyn RateLimiter> {
        &self.limiter
    }

    pub fn retention(&self) -> &Arc<RetentionManager> {
        &self.retention
    }

    /// Validate and accept a submission; one request per drug, all spawned
    /// onto independent tasks.
    pub fn submit(self: &Arc<Self>, submission: SubmissionRequest) -> Result<SubmissionAck> {
        if submission.drug_names.is_empty() || submission.drug_names.len() > 10 {
            return Err(Error::Config(
                "drug_names must contain between 1 and 10 entries".to_string(),
            ));
        }
        for name in &submission.drug_names {
            let trimmed = name.trim();
            if trimmed.is_empty() || trimmed.len() > 200 {
                return Err(Error::Config(format!("invalid drug name: {:?}", name)));
            }
        }
        let delivery_method = match &submission.delivery_method {
            Some(s) => s.parse::<DeliveryMethod>()?,
            None => DeliveryMethod::default(),
        };
        let priority = match submission.priority.as_deref() {
            Some("low") => Priority::Low,
            Some("high") => Priority::High,
            Some("urgent") => Priority::Urgent,
            Some("normal") | None => Priority::Normal,
            Some(other) => {
                return Err(Error::Config(format!("invalid priority: {}", other)));
            }
        };
        if let Some(url) = &submission.callback_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(Error::Config(
                    "callback_url must be an absolute http(s) URL".to_string(),
                ));
            }
        }

        let selection: Option<HashSet<String>> = match &submission.categories {
            Some(keys) if !keys.is_empty() => {
                let known: HashSet<String> = self
                    .store
                    .load_categories()?
                    .into_iter()
                    .map(|c| c.key)
                    .collect();
                for key in keys {
                    if !known.contains(key) {
                        return Err(Error::Config(format!("unknown category key: {}", key)));
                    }
                }
                Some(keys.iter().cloned().collect())
            }
            _ => None,
        };
        let request_category_count = match &selection {
            Some(keys) => keys.len(),
            None => self.category_count,
        };

        let correlation_id = submission
            .correlation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let drug_count = submission.drug_names.len();

        let mut accepted = Vec::with_capacity(drug_count);
        for drug_name in &submission.drug_names {
            let mut request = Request::new(drug_name.trim(), delivery_method);
            request.priority = priority;
            request.callback_url = submission.callback_url.clone();
            request.correlation_id = correlation_id.clone();
            self.store.insert_request(&request)?;

            let tracking = self.tracker.create(
                &request.id,
                request_category_count as i64,
                drug_count as i64,
            )?;
            accepted.push((request, tracking));
        }

        for (request, _) in &accepted {
            let engine = Arc::clone(self);
            let spawned = request.clone();
            let selection = selection.clone();
            tokio::spawn(async move {
                engine.process_request(spawned, selection).await;
            });
        }

        let (primary, tracking) = &accepted[0];
        let estimated_ms = tracking
            .estimated_completion_at
            .map(|at| (at - Utc::now()).num_milliseconds().max(0))
            .unwrap_or(0);
        let ack = SubmissionAck {
            request_id: primary.id.clone(),
            correlation_id: correlation_id.clone(),
            status: ProcessingStatus::Submitted.to_string(),
            message: format!(
                "Analysis accepted for {} drug(s) across {} categories",
                drug_count, request_category_count
            ),
            drug_count,
            category_count: request_category_count,
            estimated_completion_time_ms: estimated_ms,
            results_url: format!("/api/v1/results/{}", primary.id),
        };
        info!(request_id = %ack.request_id, correlation_id = %correlation_id, "submission accepted");
        Ok(ack)
    }

    fn cancel_flag(&self, request_id: &str) -> Arc<AtomicBool> {
        let mut flags = self.cancel_flags.lock().expect("cancel flag lock");
        Arc::clone(
            flags
                .entry(request_id.to_string())
                .or_insert_with(|| Arc::new(AtomicBool::new(false))),
        )
    }

    /// Drive one request end-to-end. Never propagates: terminal state is
    /// always persisted.
    pub async fn process_request(
        self: &Arc<Self>,
        request: Request,
        selection: Option<HashSet<String>>,
    ) {
        let cancel = self.cancel_flag(&request.id);
        let result = self
            .run_lifecycle(&request, selection.as_ref(), &cancel)
            .await;

        if let Err(e) = result {
            match e {
                Error::Cancelled => {}
                e => {
                    error!(request_id = %request.id, error = %e, "request failed");
                    let _ = self.tracker.fail(&request.id, e.to_string());
                    let _ = self.store.insert_audit_event(
                        &AuditEvent::new(AuditEventType::ProcessError, "request", &request.id)
                            .with_request(&request.id)
                            .with_correlation(&request.correlation_id)
                            .with_images(
                                None,
                                Some(serde_json::json!({"error": e.tag()})),
                            ),
                    );
                }
            }
        }

        self.cancel_flags
            .lock()
            .expect("cancel flag lock")
            .remove(&request.id);
    }

    async fn run_lifecycle(
        self: &Arc<Self>,
        request: &Request,
        selection: Option<&HashSet<String>>,
        cancel: &Arc<AtomicBool>,
    ) -> Result<()> {
        self.store.insert_audit_event(
            &AuditEvent::new(AuditEventType::ProcessStart, "request", &request.id)
                .with_request(&request.id)
                .with_correlation(&request.correlation_id),
        )?;

        let report = self
            .scheduler
            .run(request, selection, Arc::clone(cancel))
            .await?;
        if report.cancelled {
            // The cancel endpoint already flipped status; nothing more to do.
            return Ok(());
        }

        self.tracker
            .transition(&request.id, ProcessingStatus::Summarizing)?;

        let output = self
            .composer
            .compose(request, report.scoring.as_ref())
            .await?;

        self.tracker
            .transition(&request.id, ProcessingStatus::Completed)?;
        self.store.mark_request_completed(&request.id, Utc::now())?;

        if let Some(callback_url) = &request.callback_url {
            if let Err(e) = self.webhook.deliver(callback_url, &output.output).await {
                error!(request_id = %request.id, error = %e, "webhook delivery failed");
            }
        }

        info!(
            request_id = %request.id,
            td_score = output.td_score,
            tm_score = output.tm_score,
            decision = %output.go_decision,
            "request completed"
        );
        Ok(())
    }

    /// Cancel a request; invalid once terminal.
    pub fn cancel(&self, request_id: &str) -> Result<()> {
        // Flag first so executors stop at their next suspension point.
        self.cancel_flag(request_id).store(true, Ordering::SeqCst);
        match self.tracker.cancel(request_id) {
            Ok(_) => Ok(()),
            Err(e) => {
                // Terminal requests keep their state; undo the flag.
                self.cancel_flag(request_id).store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    pub fn get_status(&self, request_id: &str) -> Result<ProcessStatus> {
        let tracking = self.tracker.get(request_id)?;
        Ok(ProcessStatus {
            request_id: tracking.request_id.clone(),
            status: tracking.status.to_string(),
            progress_percent: tracking.progress_percent,
            categories_total: tracking.categories_total,
            categories_completed: tracking.categories_completed,
            estimated_completion_at: tracking.estimated_completion_at,
            error_details: tracking.error_details.clone(),
            updated_at: tracking.updated_at,
        })
    }

    /// Bulk status for up to 100 ids.
    pub fn bulk_status(&self, request_ids: &[String]) -> Result<BulkStatus> {
        if request_ids.len() > 100 {
            return Err(Error::Config(
                "bulk status accepts at most 100 request ids".to_string(),
            ));
        }
        let mut found = Vec::new();
        let mut not_found = Vec::new();
        let mut statuses = Vec::new();
        for id in request_ids {
            match self.get_status(id) {
                Ok(status) => {
                    found.push(id.clone());
                    statuses.push(status);
                }
                Err(Error::NotFound { .. }) => not_found.push(id.clone()),
                Err(e) => return Err(e),
            }
        }
        Ok(BulkStatus {
            found,
            not_found,
            statuses,
        })
    }

    pub fn get_history(&self, request_id: &str) -> Result<Vec<StageHistoryEntry>> {
        self.tracker.history(request_id)
    }

    /// Final output, or `None` while still processing.
    pub fn get_results(&self, request_id: &str) -> Result<Option<RequestFinalOutput>> {
        if self.store.get_request(request_id)?.is_none() {
            return Err(Error::not_found("request", request_id));
        }
        self.store.get_final_output(request_id)
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}
