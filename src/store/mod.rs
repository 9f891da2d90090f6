//! SQLite-backed persistence for every pipeline entity.
//!
//! All writes for one category result go through its owning stage executor,
//! so there is a single writer per `(request_id, category_id)`. Mutations
//! that require audit run the entity write and the audit insert inside one
//! transaction; an audit-write failure aborts the mutation.

pub mod schema;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use crate::audit::{AuditEvent, AuditEventType};
use crate::category::{Category, CategoryDependency, ConflictStrategy, Phase};
use crate::error::{Error, Result};
use crate::model::{
    CategoryResult, CategoryStatus, DeliveryMethod, MergeMethod, MergedData, PipelineStageEvent,
    Priority, ProcessTracking, ProviderResponseRecord, Request, RequestFinalOutput,
    SourceConflict, SourceReference, SummaryHistory,
};
use crate::scoring::rubric::{Parameter, RubricRange};
use crate::scoring::ParameterResult;
use crate::status::{ProcessingStatus, StageTimestamps};

/// SQLite-backed store shared by the whole engine.
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        schema::initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("connection lock poisoned: {}", e)))?;
        f(&conn).map_err(Error::from)
    }

    /// Run a mutation and its audit record in one transaction.
    fn audited<F, T>(&self, event: AuditEvent, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction) -> rusqlite::Result<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("connection lock poisoned: {}", e)))?;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        insert_audit_event(&tx, &event).map_err(|e| Error::AuditWrite(e.to_string()))?;
        tx.commit()?;
        Ok(out)
    }

    // ==================== Requests ====================

    pub fn insert_request(&self, request: &Request) -> Result<()> {
        let event = AuditEvent::new(AuditEventType::Create, "request", &request.id)
            .with_request(&request.id)
            .with_correlation(&request.correlation_id)
            .with_images(None, Some(serde_json::to_value(request)?));

        self.audited(event, |tx| {
            tx.execute(
                "INSERT INTO requests (id, drug_name, delivery_method, priority, callback_url,
                     correlation_id, created_at, updated_at, completed_at, retry_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    request.id,
                    request.drug_name,
                    request.delivery_method.to_string(),
                    request.priority.to_string(),
                    request.callback_url,
                    request.correlation_id,
                    request.created_at.to_rfc3339(),
                    request.updated_at.to_rfc3339(),
                    request.completed_at.map(|t| t.to_rfc3339()),
                    request.retry_count,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_request(&self, id: &str) -> Result<Option<Request>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, drug_name, delivery_method, priority, callback_url, correlation_id,
                        created_at, updated_at, completed_at, retry_count
                 FROM requests WHERE id = ?1",
                params![id],
                row_to_request,
            )
            .optional()
        })
    }

    pub fn mark_request_completed(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let old = self.get_request(id)?;
        let event = AuditEvent::new(AuditEventType::Update, "request", id)
            .with_request(id)
            .with_images(
                old.as_ref().map(|r| serde_json::to_value(r)).transpose()?,
                None,
            );
        self.audited(event, |tx| {
            tx.execute(
                "UPDATE requests SET completed_at = ?2, updated_at = ?2 WHERE id = ?1",
                params![id, at.to_rfc3339()],
            )?;
            Ok(())
        })
    }

    // ==================== Process tracking ====================

    pub fn insert_tracking(&self, tracking: &ProcessTracking) -> Result<()> {
        let event = AuditEvent::new(
            AuditEventType::Create,
            "process_tracking",
            &tracking.request_id,
        )
        .with_request(&tracking.request_id)
        .with_images(None, Some(serde_json::to_value(tracking)?));

        self.audited(event, |tx| {
            tx.execute(
                "INSERT INTO process_tracking (request_id, status, progress_percent,
                     categories_total, categories_completed, drug_count,
                     estimated_completion_at, current_stage_start, submitted_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    tracking.request_id,
                    tracking.status.to_string(),
                    tracking.progress_percent,
                    tracking.categories_total,
                    tracking.categories_completed,
                    tracking.drug_count,
                    tracking.estimated_completion_at.map(|t| t.to_rfc3339()),
                    tracking.current_stage_start.map(|t| t.to_rfc3339()),
                    tracking.timestamps.submitted_at.map(|t| t.to_rfc3339()),
                    tracking.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_tracking(&self, request_id: &str) -> Result<Option<ProcessTracking>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT request_id, status, progress_percent, categories_total,
                        categories_completed, drug_count, estimated_completion_at,
                        current_stage_start, submitted_at,
                        collecting_started_at, collecting_completed_at,
                        verifying_started_at, verifying_completed_at,
                        merging_started_at, merging_completed_at,
                        summarizing_started_at, summarizing_completed_at,
                        completed_at, error_details, updated_at
                 FROM process_tracking WHERE request_id = ?1",
                params![request_id],
                row_to_tracking,
            )
            .optional()
        })
    }

    /// Persist tracking state with an audited pre/post image.
    pub fn update_tracking(&self, tracking: &ProcessTracking) -> Result<()> {
        let old = self.get_tracking(&tracking.request_id)?;
        let event = AuditEvent::new(
            AuditEventType::Update,
            "process_tracking",
            &tracking.request_id,
        )
        .with_request(&tracking.request_id)
        .with_images(
            old.as_ref().map(serde_json::to_value).transpose()?,
            Some(serde_json::to_value(tracking)?),
        );

        self.audited(event, |tx| {
            tx.execute(
                "UPDATE process_tracking SET
                     status = ?2, progress_percent = ?3, categories_total = ?4,
                     categories_completed = ?5, drug_count = ?6,
                     estimated_completion_at = ?7, current_stage_start = ?8,
                     submitted_at = ?9,
                     collecting_started_at = ?10, collecting_completed_at = ?11,
                     verifying_started_at = ?12, verifying_completed_at = ?13,
                     merging_started_at = ?14, merging_completed_at = ?15,
                     summarizing_started_at = ?16, summarizing_completed_at = ?17,
                     completed_at = ?18, error_details = ?19, updated_at = ?20
                 WHERE request_id = ?1",
                params![
                    tracking.request_id,
                    tracking.status.to_string(),
                    tracking.progress_percent,
                    tracking.categories_total,
                    tracking.categories_completed,
                    tracking.drug_count,
                    tracking.estimated_completion_at.map(|t| t.to_rfc3339()),
                    tracking.current_stage_start.map(|t| t.to_rfc3339()),
                    tracking.timestamps.submitted_at.map(|t| t.to_rfc3339()),
                    tracking.timestamps.collecting_started_at.map(|t| t.to_rfc3339()),
                    tracking.timestamps.collecting_completed_at.map(|t| t.to_rfc3339()),
                    tracking.timestamps.verifying_started_at.map(|t| t.to_rfc3339()),
                    tracking.timestamps.verifying_completed_at.map(|t| t.to_rfc3339()),
                    tracking.timestamps.merging_started_at.map(|t| t.to_rfc3339()),
                    tracking.timestamps.merging_completed_at.map(|t| t.to_rfc3339()),
                    tracking.timestamps.summarizing_started_at.map(|t| t.to_rfc3339()),
                    tracking.timestamps.summarizing_completed_at.map(|t| t.to_rfc3339()),
                    tracking.timestamps.completed_at.map(|t| t.to_rfc3339()),
                    tracking.error_details,
                    tracking.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    // ==================== Category results ====================

    pub fn upsert_category_result(&self, result: &CategoryResult) -> Result<()> {
        let old = self.get_category_result(&result.request_id, result.category_id)?;
        let event_type = if old.is_some() {
            AuditEventType::Update
        } else {
            AuditEventType::Create
        };
        let event = AuditEvent::new(event_type, "category_result", &result.id)
            .with_request(&result.request_id)
            .with_images(
                old.as_ref().map(serde_json::to_value).transpose()?,
                Some(serde_json::to_value(result)?),
            );

        self.audited(event, |tx| {
            tx.execute(
                "INSERT INTO category_results (id, request_id, category_id, category_name,
                     summary, confidence_score, data_quality_score, status, processing_time_ms,
                     retry_count, error_message, started_at, completed_at, api_calls_made,
                     token_count, cost_estimate)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                 ON CONFLICT (request_id, category_id) DO UPDATE SET
                     summary = excluded.summary,
                     confidence_score = excluded.confidence_score,
                     data_quality_score = excluded.data_quality_score,
                     status = excluded.status,
                     processing_time_ms = excluded.processing_time_ms,
                     retry_count = excluded.retry_count,
                     error_message = excluded.error_message,
                     started_at = excluded.started_at,
                     completed_at = excluded.completed_at,
                     api_calls_made = excluded.api_calls_made,
                     token_count = excluded.token_count,
                     cost_estimate = excluded.cost_estimate",
                params![
                    result.id,
                    result.request_id,
                    result.category_id,
                    result.category_name,
                    result.summary,
                    result.confidence_score,
                    result.data_quality_score,
                    result.status.to_string(),
                    result.processing_time_ms,
                    result.retry_count,
                    result.error_message,
                    result.started_at.map(|t| t.to_rfc3339()),
                    result.completed_at.map(|t| t.to_rfc3339()),
                    result.api_calls_made,
                    result.token_count,
                    result.cost_estimate,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_category_result(
        &self,
        request_id: &str,
        category_id: i64,
    ) -> Result<Option<CategoryResult>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, request_id, category_id, category_name, summary, confidence_score,
                        data_quality_score, status, processing_time_ms, retry_count,
                        error_message, started_at, completed_at, api_calls_made, token_count,
                        cost_estimate
                 FROM category_results WHERE request_id = ?1 AND category_id = ?2",
                params![request_id, category_id],
                row_to_category_result,
            )
            .optional()
        })
    }

    pub fn list_category_results(&self, request_id: &str) -> Result<Vec<CategoryResult>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, request_id, category_id, category_name, summary, confidence_score,
                        data_quality_score, status, processing_time_ms, retry_count,
                        error_message, started_at, completed_at, api_calls_made, token_count,
                        cost_estimate
                 FROM category_results WHERE request_id = ?1 ORDER BY category_id",
            )?;
            let rows = stmt
                .query_map(params![request_id], row_to_category_result)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    // ==================== Provider responses ====================

    pub fn insert_provider_response(&self, record: &ProviderResponseRecord) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO provider_responses (id, category_result_id, provider, model,
                     temperature, query_parameters, raw_text, latency_ms, token_count, cost,
                     checksum, created_at, retention_expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    record.id,
                    record.category_result_id,
                    record.provider,
                    record.model,
                    record.temperature,
                    record.query_parameters.to_string(),
                    record.raw_text,
                    record.latency_ms,
                    record.token_count,
                    record.cost,
                    record.checksum,
                    record.created_at.to_rfc3339(),
                    record.retention_expires_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn list_provider_responses(
        &self,
        category_result_id: &str,
    ) -> Result<Vec<ProviderResponseRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, category_result_id, provider, model, temperature, query_parameters,
                        raw_text, latency_ms, token_count, cost, checksum, created_at,
                        retention_expires_at
                 FROM provider_responses WHERE category_result_id = ?1 ORDER BY created_at",
            )?;
            let rows = stmt
                .query_map(params![category_result_id], row_to_provider_response)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    // ==================== Merged data ====================

    pub fn upsert_merged_data(&self, merged: &MergedData) -> Result<()> {
        let event = AuditEvent::new(AuditEventType::Update, "merged_data", &merged.id)
            .with_images(None, Some(serde_json::to_value(merged)?));

        self.audited(event, |tx| {
            tx.execute(
                "INSERT INTO merged_data (id, category_result_id, merged_text, structured_data,
                     confidence, data_quality_score, source_references, merge_method, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT (category_result_id) DO UPDATE SET
                     merged_text = excluded.merged_text,
                     structured_data = excluded.structured_data,
                     confidence = excluded.confidence,
                     data_quality_score = excluded.data_quality_score,
                     source_references = excluded.source_references,
                     merge_method = excluded.merge_method",
                params![
                    merged.id,
                    merged.category_result_id,
                    merged.merged_text,
                    Value::Object(merged.structured_data.clone()).to_string(),
                    merged.confidence,
                    merged.data_quality_score,
                    serde_json::to_string(&merged.source_references).unwrap_or_default(),
                    merged.merge_method.to_string(),
                    merged.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_merged_data(&self, category_result_id: &str) -> Result<Option<MergedData>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, category_result_id, merged_text, structured_data, confidence,
                        data_quality_score, source_references, merge_method, created_at
                 FROM merged_data WHERE category_result_id = ?1",
                params![category_result_id],
                row_to_merged_data,
            )
            .optional()
        })
    }

    // ==================== Source conflicts ====================

    pub fn insert_conflicts(&self, conflicts: &[SourceConflict]) -> Result<()> {
        for conflict in conflicts {
            let event = AuditEvent::new(AuditEventType::ConflictResolution, "source_conflict", &conflict.id)
                .with_images(None, Some(serde_json::to_value(conflict)?));
            self.audited(event, |tx| {
                tx.execute(
                    "INSERT INTO source_conflicts (id, category_result_id, conflict_type,
                         description, conflicting_source_ids, resolution_strategy, resolved_at,
                         confidence_impact, is_critical)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        conflict.id,
                        conflict.category_result_id,
                        conflict.conflict_type,
                        conflict.description,
                        serde_json::to_string(&conflict.conflicting_source_ids)
                            .unwrap_or_default(),
                        conflict.resolution_strategy,
                        conflict.resolved_at.map(|t| t.to_rfc3339()),
                        conflict.confidence_impact,
                        conflict.is_critical,
                    ],
                )?;
                Ok(())
            })?;
        }
        Ok(())
    }

    pub fn list_conflicts(&self, category_result_id: &str) -> Result<Vec<SourceConflict>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, category_result_id, conflict_type, description,
                        conflicting_source_ids, resolution_strategy, resolved_at,
                        confidence_impact, is_critical
                 FROM source_conflicts WHERE category_result_id = ?1",
            )?;
            let rows = stmt
                .query_map(params![category_result_id], row_to_conflict)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    // ==================== Pipeline stage events ====================

    /// Record a stage execution; idempotent on
    /// `(request_id, category_id, stage_name)`.
    pub fn record_stage_event(&self, event: &PipelineStageEvent) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO pipeline_stage_events (id, request_id, category_id, stage_name,
                     stage_order, executed, skipped, input_digest, output_digest, duration_ms,
                     created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT (request_id, category_id, stage_name) DO UPDATE SET
                     executed = excluded.executed,
                     skipped = excluded.skipped,
                     input_digest = excluded.input_digest,
                     output_digest = excluded.output_digest,
                     duration_ms = excluded.duration_ms,
                     created_at = excluded.created_at",
                params![
                    event.id,
                    event.request_id,
                    event.category_id,
                    event.stage_name,
                    event.stage_order,
                    event.executed,
                    event.skipped,
                    event.input_digest,
                    event.output_digest,
                    event.duration_ms,
                    event.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn list_stage_events(&self, request_id: &str) -> Result<Vec<PipelineStageEvent>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, request_id, category_id, stage_name, stage_order, executed, skipped,
                        input_digest, output_digest, duration_ms, created_at
                 FROM pipeline_stage_events WHERE request_id = ?1
                 ORDER BY created_at, category_id, stage_order",
            )?;
            let rows = stmt
                .query_map(params![request_id], row_to_stage_event)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    // ==================== Summary history ====================

    pub fn append_summary_history(&self, entry: &SummaryHistory) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO summary_history (id, request_id, category_name, style_name,
                     provider, model, generated_summary, generation_time_ms, tokens_used,
                     cost_estimate, error_message, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    entry.id,
                    entry.request_id,
                    entry.category_name,
                    entry.style_name,
                    entry.provider,
                    entry.model,
                    entry.generated_summary,
                    entry.generation_time_ms,
                    entry.tokens_used,
                    entry.cost_estimate,
                    entry.error_message,
                    entry.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    // ==================== Phase-2 parameter results ====================

    pub fn upsert_parameter_result(&self, request_id: &str, result: &ParameterResult) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO phase2_parameter_results (request_id, parameter, extracted_value,
                     unit, score, weighted_score, rationale, extraction_method, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT (request_id, parameter) DO UPDATE SET
                     extracted_value = excluded.extracted_value,
                     unit = excluded.unit,
                     score = excluded.score,
                     weighted_score = excluded.weighted_score,
                     rationale = excluded.rationale,
                     extraction_method = excluded.extraction_method",
                params![
                    request_id,
                    result.parameter.key(),
                    result.extracted_value,
                    result.unit,
                    result.score.map(|s| s as i64),
                    result.weighted_score,
                    result.rationale,
                    result.extraction_method.to_string(),
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn list_parameter_results(&self, request_id: &str) -> Result<Vec<ParameterResult>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT parameter, extracted_value, unit, score, weighted_score, rationale,
                        extraction_method
                 FROM phase2_parameter_results WHERE request_id = ?1",
            )?;
            let rows = stmt
                .query_map(params![request_id], row_to_parameter_result)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    // ==================== Final outputs ====================

    pub fn store_final_output(&self, output: &RequestFinalOutput) -> Result<()> {
        let event = AuditEvent::new(
            AuditEventType::ProcessComplete,
            "request_final_output",
            &output.request_id,
        )
        .with_request(&output.request_id);

        self.audited(event, |tx| {
            tx.execute(
                "INSERT INTO request_final_outputs (request_id, drug_name, delivery_method,
                     output, td_score, tm_score, td_verdict, tm_verdict, go_decision,
                     investment_priority, risk_level, version, generated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT (request_id) DO UPDATE SET
                     output = excluded.output,
                     td_score = excluded.td_score,
                     tm_score = excluded.tm_score,
                     td_verdict = excluded.td_verdict,
                     tm_verdict = excluded.tm_verdict,
                     go_decision = excluded.go_decision,
                     investment_priority = excluded.investment_priority,
                     risk_level = excluded.risk_level,
                     version = request_final_outputs.version + 1,
                     generated_at = excluded.generated_at",
                params![
                    output.request_id,
                    output.drug_name,
                    output.delivery_method.to_string(),
                    output.output.to_string(),
                    output.td_score,
                    output.tm_score,
                    output.td_verdict,
                    output.tm_verdict,
                    output.go_decision,
                    output.investment_priority,
                    output.risk_level,
                    output.version,
                    output.generated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_final_output(&self, request_id: &str) -> Result<Option<RequestFinalOutput>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT request_id, drug_name, delivery_method, output, td_score, tm_score,
                        td_verdict, tm_verdict, go_decision, investment_priority, risk_level,
                        version, generated_at
                 FROM request_final_outputs WHERE request_id = ?1",
                params![request_id],
                row_to_final_output,
            )
            .optional()
        })
    }

    // ==================== Audit ====================

    /// Insert a standalone audit event (process start/complete/error and
    /// access records).
    pub fn insert_audit_event(&self, event: &AuditEvent) -> Result<()> {
        self.with_conn(|conn| insert_audit_event(conn, event))
            .map_err(|e| Error::AuditWrite(e.to_string()))
    }

    pub fn count_audit_events(&self) -> Result<i64> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM audit_events", [], |row| row.get(0))
        })
    }

    pub fn has_audit_for_entity(&self, entity_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM audit_events WHERE entity_id = ?1",
                params![entity_id],
                |row| row.get::<_, i64>(0),
            )
            .map(|count| count > 0)
        })
    }

    pub fn list_audit_events(&self, request_id: &str) -> Result<Vec<AuditEvent>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, event_type, entity_type, entity_id, request_id, old_values,
                        new_values, actor, correlation_id, timestamp, ip_address, user_agent
                 FROM audit_events WHERE request_id = ?1 ORDER BY timestamp",
            )?;
            let rows = stmt
                .query_map(params![request_id], row_to_audit_event)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    // ==================== Reference data ====================

    /// Seed reference tables; idempotent.
    pub fn seed_reference_data(
        &self,
        categories: &[Category],
        dependencies: &[CategoryDependency],
        rubric: &[RubricRange],
    ) -> Result<()> {
        self.with_conn(|conn| {
            for c in categories {
                conn.execute(
                    "INSERT INTO pharmaceutical_categories (id, name, key, phase, display_order,
                         is_active, prompt_template, verification_rules, conflict_strategy,
                         expected_keys)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                     ON CONFLICT (id) DO UPDATE SET
                         is_active = excluded.is_active,
                         prompt_template = excluded.prompt_template,
                         verification_rules = excluded.verification_rules,
                         expected_keys = excluded.expected_keys",
                    params![
                        c.id,
                        c.name,
                        c.key,
                        c.phase.as_i64(),
                        c.display_order,
                        c.is_active,
                        c.prompt_template,
                        serde_json::to_string(&c.verification_rules).unwrap_or_default(),
                        match c.conflict_strategy {
                            ConflictStrategy::AuthorityWeighted => "authority_weighted",
                            ConflictStrategy::MostRecent => "most_recent",
                        },
                        serde_json::to_string(&c.expected_keys).unwrap_or_default(),
                    ],
                )?;
            }
            for d in dependencies {
                conn.execute(
                    "INSERT OR IGNORE INTO category_dependencies (dependent_id, required_id)
                     VALUES (?1, ?2)",
                    params![d.dependent_id, d.required_id],
                )?;
            }
            for p in Parameter::ALL {
                conn.execute(
                    "INSERT OR IGNORE INTO scoring_parameters (name, unit, weight)
                     VALUES (?1, ?2, ?3)",
                    params![p.key(), p.unit(), p.weight()],
                )?;
            }
            let existing: i64 =
                conn.query_row("SELECT COUNT(*) FROM scoring_ranges", [], |r| r.get(0))?;
            if existing == 0 {
                for r in rubric {
                    conn.execute(
                        "INSERT INTO scoring_ranges (parameter, delivery_method, min_value,
                             max_value, score, is_exclusion, range_text)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        params![
                            r.parameter.key(),
                            r.delivery_method.to_string(),
                            r.min_value,
                            r.max_value,
                            r.score,
                            r.is_exclusion,
                            r.range_text,
                        ],
                    )?;
                }
            }
            for (order, stage) in crate::pipeline::STAGE_ORDER.iter().enumerate() {
                conn.execute(
                    "INSERT OR IGNORE INTO pipeline_stages (name, stage_order, enabled)
                     VALUES (?1, ?2, 1)",
                    params![stage, order as i64 + 1],
                )?;
            }
            for style in crate::summary::default_styles() {
                conn.execute(
                    "INSERT OR IGNORE INTO summary_styles (style_name, system_prompt,
                         user_template, length_type, target_words)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        style.style_name,
                        style.system_prompt,
                        style.user_template,
                        style.length_type.to_string(),
                        style.target_words,
                    ],
                )?;
            }
            Ok(())
        })
    }

    pub fn load_categories(&self) -> Result<Vec<Category>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, key, phase, display_order, is_active, prompt_template,
                        verification_rules, conflict_strategy, expected_keys
                 FROM pharmaceutical_categories ORDER BY display_order",
            )?;
            let rows = stmt
                .query_map([], row_to_category)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn load_dependencies(&self) -> Result<Vec<CategoryDependency>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT dependent_id, required_id FROM category_dependencies")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(CategoryDependency {
                        dependent_id: row.get(0)?,
                        required_id: row.get(1)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn load_summary_styles(&self) -> Result<Vec<crate::summary::SummaryStyle>> {
        use crate::summary::LengthType;
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT style_name, system_prompt, user_template, length_type, target_words
                 FROM summary_styles",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    let length: String = row.get(3)?;
                    Ok(crate::summary::SummaryStyle {
                        style_name: row.get(0)?,
                        system_prompt: row.get(1)?,
                        user_template: row.get(2)?,
                        length_type: match length.as_str() {
                            "compact" => LengthType::Compact,
                            "deep" => LengthType::Deep,
                            _ => LengthType::Standard,
                        },
                        target_words: row.get::<_, i64>(4)? as u32,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn load_rubric(&self) -> Result<Vec<RubricRange>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT parameter, delivery_method, min_value, max_value, score, is_exclusion,
                        range_text
                 FROM scoring_ranges",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    let parameter: String = row.get(0)?;
                    let route: String = row.get(1)?;
                    Ok(RubricRange {
                        parameter: Parameter::from_key(&parameter)
                            .unwrap_or(Parameter::Dose),
                        delivery_method: DeliveryMethod::from_str(&route)
                            .unwrap_or_default(),
                        min_value: row.get(2)?,
                        max_value: row.get(3)?,
                        score: row.get::<_, i64>(4)? as u8,
                        is_exclusion: row.get(5)?,
                        range_text: row.get(6)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    // ==================== Retention support ====================

    /// Ids of terminal requests older than the cutoff and not yet archived.
    pub fn requests_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT r.id FROM requests r
                 JOIN process_tracking t ON t.request_id = r.id
                 WHERE r.created_at < ?1 AND r.archived_at IS NULL
                   AND t.status IN ('completed', 'failed', 'cancelled')",
            )?;
            let rows = stmt
                .query_map(params![cutoff.to_rfc3339()], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(rows)
        })
    }

    /// Ids of failed requests past the cutoff with retry_count above the
    /// threshold; eligible for deletion.
    pub fn failed_requests_older_than(
        &self,
        cutoff: DateTime<Utc>,
        min_retries: i64,
    ) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT r.id FROM requests r
                 JOIN process_tracking t ON t.request_id = r.id
                 WHERE r.created_at < ?1 AND t.status = 'failed' AND r.retry_count > ?2",
            )?;
            let rows = stmt
                .query_map(params![cutoff.to_rfc3339(), min_retries], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(rows)
        })
    }

    /// Archive rows in `table` matching the ids; stamps `archived_at`.
    pub fn archive_rows(&self, table: &str, id_column: &str, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let allowed: HashSet<&str> = [
            "requests",
            "process_tracking",
            "category_results",
            "provider_responses",
            "source_conflicts",
            "audit_events",
        ]
        .into();
        if !allowed.contains(table) {
            return Err(Error::Internal(format!("table not archivable: {}", table)));
        }
        self.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let mut archived = 0;
            for id in ids {
                archived += conn.execute(
                    &format!(
                        "UPDATE {} SET archived_at = ?1 WHERE {} = ?2 AND archived_at IS NULL",
                        table, id_column
                    ),
                    params![now, id],
                )?;
            }
            Ok(archived)
        })
    }

    /// Delete a failed request and its owned rows; the caller must already
    /// have verified an audit record exists.
    pub fn delete_request_cascade(&self, request_id: &str) -> Result<()> {
        let event = AuditEvent::new(AuditEventType::Delete, "request", request_id)
            .with_request(request_id);
        self.audited(event, |tx| {
            tx.execute(
                "DELETE FROM provider_responses WHERE category_result_id IN
                     (SELECT id FROM category_results WHERE request_id = ?1)",
                params![request_id],
            )?;
            tx.execute(
                "DELETE FROM source_conflicts WHERE category_result_id IN
                     (SELECT id FROM category_results WHERE request_id = ?1)",
                params![request_id],
            )?;
            tx.execute(
                "DELETE FROM merged_data WHERE category_result_id IN
                     (SELECT id FROM category_results WHERE request_id = ?1)",
                params![request_id],
            )?;
            tx.execute(
                "DELETE FROM category_results WHERE request_id = ?1",
                params![request_id],
            )?;
            tx.execute(
                "DELETE FROM phase2_parameter_results WHERE request_id = ?1",
                params![request_id],
            )?;
            tx.execute(
                "DELETE FROM request_final_outputs WHERE request_id = ?1",
                params![request_id],
            )?;
            tx.execute(
                "DELETE FROM pipeline_stage_events WHERE request_id = ?1",
                params![request_id],
            )?;
            tx.execute(
                "DELETE FROM process_tracking WHERE request_id = ?1",
                params![request_id],
            )?;
            tx.execute("DELETE FROM requests WHERE id = ?1", params![request_id])?;
            Ok(())
        })
    }

    /// Category results older than the cutoff, for archival.
    pub fn category_results_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM category_results
                 WHERE completed_at IS NOT NULL AND completed_at < ?1 AND archived_at IS NULL",
            )?;
            let rows = stmt
                .query_map(params![cutoff.to_rfc3339()], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(rows)
        })
    }

    /// Resolved source conflicts older than the cutoff, for archival.
    pub fn source_conflicts_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM source_conflicts
                 WHERE resolved_at IS NOT NULL AND resolved_at < ?1 AND archived_at IS NULL",
            )?;
            let rows = stmt
                .query_map(params![cutoff.to_rfc3339()], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(rows)
        })
    }

    /// Audit events older than the cutoff, for archival.
    pub fn audit_events_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM audit_events WHERE timestamp < ?1 AND archived_at IS NULL",
            )?;
            let rows = stmt
                .query_map(params![cutoff.to_rfc3339()], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(rows)
        })
    }

    /// Provider responses whose stored retention window has lapsed.
    pub fn expired_provider_responses(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM provider_responses
                 WHERE retention_expires_at < ?1 AND archived_at IS NULL",
            )?;
            let rows = stmt
                .query_map(params![now.to_rfc3339()], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(rows)
        })
    }

    // ==================== Rate-limit counters ====================

    /// Atomic check-and-consume against the shared counter table.
    ///
    /// Returns whether the request fits inside the current window.
    pub fn check_and_consume(
        &self,
        bucket: &str,
        limit: u32,
        window_s: u64,
        now_unix: i64,
    ) -> Result<bool> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("connection lock poisoned: {}", e)))?;
        let tx = conn.transaction()?;
        let row: Option<(i64, i64)> = tx
            .query_row(
                "SELECT window_start, used FROM rate_limit_counters WHERE bucket = ?1",
                params![bucket],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;

        let allowed = match row {
            Some((window_start, used)) if now_unix - window_start < window_s as i64 => {
                if used < limit as i64 {
                    tx.execute(
                        "UPDATE rate_limit_counters SET used = used + 1 WHERE bucket = ?1",
                        params![bucket],
                    )?;
                    true
                } else {
                    false
                }
            }
            _ => {
                tx.execute(
                    "INSERT INTO rate_limit_counters (bucket, window_start, used)
                     VALUES (?1, ?2, 1)
                     ON CONFLICT (bucket) DO UPDATE SET window_start = ?2, used = 1",
                    params![bucket, now_unix],
                )?;
                true
            }
        };
        tx.commit()?;
        Ok(allowed)
    }
}

fn insert_audit_event(conn: &Connection, event: &AuditEvent) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO audit_events (id, event_type, entity_type, entity_id, request_id,
             old_values, new_values, actor, correlation_id, timestamp, ip_address, user_agent)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            event.id,
            event.event_type.to_string(),
            event.entity_type,
            event.entity_id,
            event.request_id,
            event.old_values.as_ref().map(|v| v.to_string()),
            event.new_values.as_ref().map(|v| v.to_string()),
            event.actor,
            event.correlation_id,
            event.timestamp.to_rfc3339(),
            event.ip_address,
            event.user_agent,
        ],
    )?;
    Ok(())
}

// Row mappers

fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(parse_datetime)
}

fn row_to_request(row: &rusqlite::Row) -> rusqlite::Result<Request> {
    let delivery: String = row.get(2)?;
    let priority: String = row.get(3)?;
    Ok(Request {
        id: row.get(0)?,
        drug_name: row.get(1)?,
        delivery_method: DeliveryMethod::from_str(&delivery).unwrap_or_default(),
        priority: match priority.as_str() {
            "low" => Priority::Low,
            "high" => Priority::High,
            "urgent" => Priority::Urgent,
            _ => Priority::Normal,
        },
        callback_url: row.get(4)?,
        correlation_id: row.get(5)?,
        created_at: parse_datetime(row.get(6)?),
        updated_at: parse_datetime(row.get(7)?),
        completed_at: parse_optional_datetime(row.get(8)?),
        retry_count: row.get(9)?,
    })
}

fn row_to_tracking(row: &rusqlite::Row) -> rusqlite::Result<ProcessTracking> {
    let status: String = row.get(1)?;
    Ok(ProcessTracking {
        request_id: row.get(0)?,
        status: ProcessingStatus::from_str(&status)
            .unwrap_or(ProcessingStatus::Submitted),
        progress_percent: row.get::<_, i64>(2)? as u8,
        categories_total: row.get(3)?,
        categories_completed: row.get(4)?,
        drug_count: row.get(5)?,
        estimated_completion_at: parse_optional_datetime(row.get(6)?),
        current_stage_start: parse_optional_datetime(row.get(7)?),
        timestamps: StageTimestamps {
            submitted_at: parse_optional_datetime(row.get(8)?),
            collecting_started_at: parse_optional_datetime(row.get(9)?),
            collecting_completed_at: parse_optional_datetime(row.get(10)?),
            verifying_started_at: parse_optional_datetime(row.get(11)?),
            verifying_completed_at: parse_optional_datetime(row.get(12)?),
            merging_started_at: parse_optional_datetime(row.get(13)?),
            merging_completed_at: parse_optional_datetime(row.get(14)?),
            summarizing_started_at: parse_optional_datetime(row.get(15)?),
            summarizing_completed_at: parse_optional_datetime(row.get(16)?),
            completed_at: parse_optional_datetime(row.get(17)?),
        },
        error_details: row.get(18)?,
        updated_at: parse_datetime(row.get(19)?),
    })
}

fn row_to_category_result(row: &rusqlite::Row) -> rusqlite::Result<CategoryResult> {
    let status: String = row.get(7)?;
    Ok(CategoryResult {
        id: row.get(0)?,
        request_id: row.get(1)?,
        category_id: row.get(2)?,
        category_name: row.get(3)?,
        summary: row.get(4)?,
        confidence_score: row.get(5)?,
        data_quality_score: row.get(6)?,
        status: match status.as_str() {
            "processing" => CategoryStatus::Processing,
            "completed" => CategoryStatus::Completed,
            "failed" => CategoryStatus::Failed,
            "skipped" => CategoryStatus::Skipped,
            _ => CategoryStatus::Pending,
        },
        processing_time_ms: row.get(8)?,
        retry_count: row.get(9)?,
        error_message: row.get(10)?,
        started_at: parse_optional_datetime(row.get(11)?),
        completed_at: parse_optional_datetime(row.get(12)?),
        api_calls_made: row.get(13)?,
        token_count: row.get(14)?,
        cost_estimate: row.get(15)?,
    })
}

fn row_to_provider_response(row: &rusqlite::Row) -> rusqlite::Result<ProviderResponseRecord> {
    let query_parameters: String = row.get(5)?;
    Ok(ProviderResponseRecord {
        id: row.get(0)?,
        category_result_id: row.get(1)?,
        provider: row.get(2)?,
        model: row.get(3)?,
        temperature: row.get(4)?,
        query_parameters: serde_json::from_str(&query_parameters)
            .unwrap_or(Value::Object(Default::default())),
        raw_text: row.get(6)?,
        latency_ms: row.get(7)?,
        token_count: row.get(8)?,
        cost: row.get(9)?,
        checksum: row.get(10)?,
        created_at: parse_datetime(row.get(11)?),
        retention_expires_at: parse_datetime(row.get(12)?),
    })
}

fn row_to_merged_data(row: &rusqlite::Row) -> rusqlite::Result<MergedData> {
    let structured: String = row.get(3)?;
    let references: String = row.get(6)?;
    let method: String = row.get(7)?;
    Ok(MergedData {
        id: row.get(0)?,
        category_result_id: row.get(1)?,
        merged_text: row.get(2)?,
        structured_data: serde_json::from_str::<Value>(&structured)
            .ok()
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default(),
        confidence: row.get(4)?,
        data_quality_score: row.get(5)?,
        source_references: serde_json::from_str::<Vec<SourceReference>>(&references)
            .unwrap_or_default(),
        merge_method: match method.as_str() {
            "llm_assisted" => MergeMethod::LlmAssisted,
            "fallback_weighted" => MergeMethod::FallbackWeighted,
            "summary_extraction" => MergeMethod::SummaryExtraction,
            _ => MergeMethod::None,
        },
        created_at: parse_datetime(row.get(8)?),
    })
}

fn row_to_conflict(row: &rusqlite::Row) -> rusqlite::Result<SourceConflict> {
    let ids: String = row.get(4)?;
    Ok(SourceConflict {
        id: row.get(0)?,
        category_result_id: row.get(1)?,
        conflict_type: row.get(2)?,
        description: row.get(3)?,
        conflicting_source_ids: serde_json::from_str(&ids).unwrap_or_default(),
        resolution_strategy: row.get(5)?,
        resolved_at: parse_optional_datetime(row.get(6)?),
        confidence_impact: row.get(7)?,
        is_critical: row.get(8)?,
    })
}

fn row_to_stage_event(row: &rusqlite::Row) -> rusqlite::Result<PipelineStageEvent> {
    Ok(PipelineStageEvent {
        id: row.get(0)?,
        request_id: row.get(1)?,
        category_id: row.get(2)?,
        stage_name: row.get(3)?,
        stage_order: row.get(4)?,
        executed: row.get(5)?,
        skipped: row.get(6)?,
        input_digest: row.get(7)?,
        output_digest: row.get(8)?,
        duration_ms: row.get(9)?,
        created_at: parse_datetime(row.get(10)?),
    })
}

fn row_to_parameter_result(row: &rusqlite::Row) -> rusqlite::Result<ParameterResult> {
    use crate::scoring::ExtractionMethod;
    let parameter: String = row.get(0)?;
    let method: String = row.get(6)?;
    Ok(ParameterResult {
        parameter: Parameter::from_key(&parameter).unwrap_or(Parameter::Dose),
        extracted_value: row.get(1)?,
        unit: row.get(2)?,
        score: row.get::<_, Option<i64>>(3)?.map(|s| s as u8),
        weighted_score: row.get(4)?,
        rationale: row.get(5)?,
        range_text: String::new(),
        is_exclusion: false,
        extraction_method: match method.as_str() {
            "phase1_summary" => ExtractionMethod::Phase1Summary,
            "dedicated_llm" => ExtractionMethod::DedicatedLlm,
            "live_search" => ExtractionMethod::LiveSearch,
            _ => ExtractionMethod::None,
        },
    })
}

fn row_to_final_output(row: &rusqlite::Row) -> rusqlite::Result<RequestFinalOutput> {
    let delivery: String = row.get(2)?;
    let output: String = row.get(3)?;
    Ok(RequestFinalOutput {
        request_id: row.get(0)?,
        drug_name: row.get(1)?,
        delivery_method: DeliveryMethod::from_str(&delivery).unwrap_or_default(),
        output: serde_json::from_str(&output).unwrap_or(Value::Null),
        td_score: row.get(4)?,
        tm_score: row.get(5)?,
        td_verdict: row.get(6)?,
        tm_verdict: row.get(7)?,
        go_decision: row.get(8)?,
        investment_priority: row.get(9)?,
        risk_level: row.get(10)?,
        version: row.get(11)?,
        generated_at: parse_datetime(row.get(12)?),
    })
}

fn row_to_category(row: &rusqlite::Row) -> rusqlite::Result<Category> {
    let phase: i64 = row.get(3)?;
    let rules: String = row.get(7)?;
    let strategy: String = row.get(8)?;
    let expected: String = row.get(9)?;
    Ok(Category {
        id: row.get(0)?,
        name: row.get(1)?,
        key: row.get(2)?,
        phase: Phase::from_i64(phase).unwrap_or(Phase::One),
        display_order: row.get(4)?,
        is_active: row.get(5)?,
        prompt_template: row.get(6)?,
        verification_rules: serde_json::from_str(&rules).unwrap_or_default(),
        conflict_strategy: match strategy.as_str() {
            "most_recent" => ConflictStrategy::MostRecent,
            _ => ConflictStrategy::AuthorityWeighted,
        },
        expected_keys: serde_json::from_str(&expected).unwrap_or_default(),
    })
}

fn row_to_audit_event(row: &rusqlite::Row) -> rusqlite::Result<AuditEvent> {
    use crate::audit::AuditEventType::*;
    let event_type: String = row.get(1)?;
    let old_values: Option<String> = row.get(5)?;
    let new_values: Option<String> = row.get(6)?;
    Ok(AuditEvent {
        id: row.get(0)?,
        event_type: match event_type.as_str() {
            "create" => Create,
            "update" => Update,
            "delete" => Delete,
            "process_start" => ProcessStart,
            "process_complete" => ProcessComplete,
            "process_error" => ProcessError,
            "source_verification" => SourceVerification,
            "conflict_resolution" => ConflictResolution,
            "data_export" => DataExport,
            _ => UserAccess,
        },
        entity_type: row.get(2)?,
        entity_id: row.get(3)?,
        request_id: row.get(4)?,
        old_values: old_values.and_then(|s| serde_json::from_str(&s).ok()),
        new_values: new_values.and_then(|s| serde_json::from_str(&s).ok()),
        actor: row.get(7)?,
        correlation_id: row.get(8)?,
        timestamp: parse_datetime(row.get(9)?),
        ip_address: row.get(10)?,
        user_agent: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::{default_categories, default_dependencies};
    use crate::scoring::rubric::default_rubric;

    fn store_with_request() -> (Store, Request) {
        let store = Store::in_memory().unwrap();
        let request = Request::new("Apixaban", DeliveryMethod::Transdermal);
        store.insert_request(&request).unwrap();
        (store, request)
    }

    #[test]
    fn test_request_round_trip_with_audit() {
        let (store, request) = store_with_request();

        let loaded = store.get_request(&request.id).unwrap().unwrap();
        assert_eq!(loaded.drug_name, "Apixaban");
        assert_eq!(loaded.delivery_method, DeliveryMethod::Transdermal);

        // The create produced exactly one audit event for the entity.
        assert!(store.has_audit_for_entity(&request.id).unwrap());
        assert_eq!(store.count_audit_events().unwrap(), 1);
    }

    #[test]
    fn test_tracking_round_trip() {
        let (store, request) = store_with_request();
        let mut tracking = ProcessTracking::new(&request.id, 10);
        store.insert_tracking(&tracking).unwrap();

        tracking.status = ProcessingStatus::Collecting;
        tracking.progress_percent = 20;
        tracking
            .timestamps
            .mark_started(ProcessingStatus::Collecting, Utc::now());
        store.update_tracking(&tracking).unwrap();

        let loaded = store.get_tracking(&request.id).unwrap().unwrap();
        assert_eq!(loaded.status, ProcessingStatus::Collecting);
        assert_eq!(loaded.progress_percent, 20);
        assert!(loaded.timestamps.collecting_started_at.is_some());
    }

    #[test]
    fn test_update_tracking_records_pre_and_post_images() {
        let (store, request) = store_with_request();
        let mut tracking = ProcessTracking::new(&request.id, 10);
        store.insert_tracking(&tracking).unwrap();
        tracking.status = ProcessingStatus::Collecting;
        store.update_tracking(&tracking).unwrap();

        let events = store.list_audit_events(&request.id).unwrap();
        let update = events
            .iter()
            .find(|e| {
                e.entity_type == "process_tracking" && e.event_type == AuditEventType::Update
            })
            .unwrap();
        assert_eq!(
            update.old_values.as_ref().unwrap()["status"].as_str(),
            Some("submitted")
        );
        assert_eq!(
            update.new_values.as_ref().unwrap()["status"].as_str(),
            Some("collecting")
        );
    }

    #[test]
    fn test_category_result_upsert_is_idempotent() {
        let (store, request) = store_with_request();
        let mut result = CategoryResult::new(&request.id, 1, "Market Overview");
        store.upsert_category_result(&result).unwrap();

        result.status = CategoryStatus::Completed;
        result.summary = "done".into();
        store.upsert_category_result(&result).unwrap();

        let loaded = store.get_category_result(&request.id, 1).unwrap().unwrap();
        assert_eq!(loaded.status, CategoryStatus::Completed);
        assert_eq!(loaded.summary, "done");
        assert_eq!(store.list_category_results(&request.id).unwrap().len(), 1);
    }

    #[test]
    fn test_stage_event_idempotent_on_stage_key() {
        let (store, request) = store_with_request();
        let mut event = PipelineStageEvent {
            id: "evt_1".into(),
            request_id: request.id.clone(),
            category_id: 1,
            stage_name: "collect".into(),
            stage_order: 1,
            executed: true,
            skipped: false,
            input_digest: None,
            output_digest: Some("abc".into()),
            duration_ms: 100,
            created_at: Utc::now(),
        };
        store.record_stage_event(&event).unwrap();
        event.id = "evt_2".into();
        event.duration_ms = 150;
        store.record_stage_event(&event).unwrap();

        let events = store.list_stage_events(&request.id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].duration_ms, 150);
    }

    #[test]
    fn test_reference_data_round_trip() {
        let store = Store::in_memory().unwrap();
        store
            .seed_reference_data(
                &default_categories(),
                &default_dependencies(),
                &default_rubric(),
            )
            .unwrap();
        // Seeding twice is idempotent.
        store
            .seed_reference_data(
                &default_categories(),
                &default_dependencies(),
                &default_rubric(),
            )
            .unwrap();

        let categories = store.load_categories().unwrap();
        assert_eq!(categories.len(), 17);
        assert_eq!(categories[0].name, "Market Overview");
        assert!(!categories[0].verification_rules.is_empty());

        let rubric = store.load_rubric().unwrap();
        assert_eq!(rubric.len(), default_rubric().len());

        let deps = store.load_dependencies().unwrap();
        assert_eq!(deps.len(), default_dependencies().len());
    }

    #[test]
    fn test_final_output_versioning() {
        let (store, request) = store_with_request();
        let output = RequestFinalOutput {
            request_id: request.id.clone(),
            drug_name: "Apixaban".into(),
            delivery_method: DeliveryMethod::Transdermal,
            output: serde_json::json!({"structured_data": {}}),
            td_score: 6.8,
            tm_score: 7.2,
            td_verdict: "Conditional-Go".into(),
            tm_verdict: "Go".into(),
            go_decision: "CONDITIONAL".into(),
            investment_priority: "Medium".into(),
            risk_level: "Medium".into(),
            version: 1,
            generated_at: Utc::now(),
        };
        store.store_final_output(&output).unwrap();
        store.store_final_output(&output).unwrap();

        let loaded = store.get_final_output(&request.id).unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.td_verdict, "Conditional-Go");
    }

    #[test]
    fn test_check_and_consume_window() {
        let store = Store::in_memory().unwrap();
        let now = 1_000_000;
        assert!(store.check_and_consume("global", 2, 60, now).unwrap());
        assert!(store.check_and_consume("global", 2, 60, now + 1).unwrap());
        assert!(!store.check_and_consume("global", 2, 60, now + 2).unwrap());
        // A new window resets the counter.
        assert!(store.check_and_consume("global", 2, 60, now + 61).unwrap());
    }

    #[test]
    fn test_reopen_preserves_persisted_stages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.db");

        let request_id;
        {
            let store = Store::open(&path).unwrap();
            let request = Request::new("Apixaban", DeliveryMethod::Transdermal);
            request_id = request.id.clone();
            store.insert_request(&request).unwrap();

            let mut result = CategoryResult::new(&request_id, 1, "Market Overview");
            result.status = CategoryStatus::Completed;
            result.summary = "persisted before restart".into();
            store.upsert_category_result(&result).unwrap();
            store
                .record_stage_event(&PipelineStageEvent {
                    id: "evt_1".into(),
                    request_id: request_id.clone(),
                    category_id: 1,
                    stage_name: "collect".into(),
                    stage_order: 1,
                    executed: true,
                    skipped: false,
                    input_digest: Some("in".into()),
                    output_digest: Some("out".into()),
                    duration_ms: 42,
                    created_at: Utc::now(),
                })
                .unwrap();
        }

        // A fresh process resumes from the last persisted stage.
        let store = Store::open(&path).unwrap();
        let result = store.get_category_result(&request_id, 1).unwrap().unwrap();
        assert_eq!(result.summary, "persisted before restart");
        assert_eq!(result.status, CategoryStatus::Completed);
        let events = store.list_stage_events(&request_id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].output_digest.as_deref(), Some("out"));
    }

    #[test]
    fn test_delete_cascade_requires_caller_audit_then_removes_rows() {
        let (store, request) = store_with_request();
        let result = CategoryResult::new(&request.id, 1, "Market Overview");
        store.upsert_category_result(&result).unwrap();
        let tracking = ProcessTracking::new(&request.id, 10);
        store.insert_tracking(&tracking).unwrap();

        let audit_before = store.count_audit_events().unwrap();
        store.delete_request_cascade(&request.id).unwrap();

        assert!(store.get_request(&request.id).unwrap().is_none());
        assert!(store.get_tracking(&request.id).unwrap().is_none());
        // The delete itself is audited; the log only grows.
        assert_eq!(store.count_audit_events().unwrap(), audit_before + 1);
    }
}
