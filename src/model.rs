//! Persisted entities.
//!
//! A Request exclusively owns its ProcessTracking, CategoryResults, and
//! RequestFinalOutput; a CategoryResult exclusively owns its
//! ProviderResponses, MergedData, and SourceConflicts.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::status::{ProcessingStatus, StageTimestamps};

/// Delivery route under evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMethod {
    Transdermal,
    Transmucosal,
}

impl Default for DeliveryMethod {
    fn default() -> Self {
        Self::Transdermal
    }
}

impl std::fmt::Display for DeliveryMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transdermal => write!(f, "transdermal"),
            Self::Transmucosal => write!(f, "transmucosal"),
        }
    }
}

impl std::str::FromStr for DeliveryMethod {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "transdermal" => Ok(Self::Transdermal),
            "transmucosal" => Ok(Self::Transmucosal),
            other => Err(crate::error::Error::Config(format!(
                "invalid delivery method: {}",
                other
            ))),
        }
    }
}

/// Request priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        };
        write!(f, "{}", s)
    }
}

/// An analysis request for one drug.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub drug_name: String,
    pub delivery_method: DeliveryMethod,
    pub priority: Priority,
    pub callback_url: Option<String>,
    pub correlation_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: i64,
}

impl Request {
    pub fn new(drug_name: impl Into<String>, delivery_method: DeliveryMethod) -> Self {
        let now = Utc::now();
        Self {
            id: format!("req_{}", Uuid::new_v4().simple()),
            drug_name: drug_name.into(),
            delivery_method,
            priority: Priority::Normal,
            callback_url: None,
            correlation_id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            completed_at: None,
            retry_count: 0,
        }
    }
}

/// 1:1 status tracking record for a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessTracking {
    pub request_id: String,
    pub status: ProcessingStatus,
    pub progress_percent: u8,
    pub categories_total: i64,
    pub categories_completed: i64,
    pub drug_count: i64,
    pub estimated_completion_at: Option<DateTime<Utc>>,
    pub current_stage_start: Option<DateTime<Utc>>,
    pub timestamps: StageTimestamps,
    pub error_details: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessTracking {
    pub fn new(request_id: impl Into<String>, categories_total: i64) -> Self {
        let now = Utc::now();
        Self {
            request_id: request_id.into(),
            status: ProcessingStatus::Submitted,
            progress_percent: 0,
            categories_total,
            categories_completed: 0,
            drug_count: 1,
            estimated_completion_at: None,
            current_stage_start: Some(now),
            timestamps: StageTimestamps {
                submitted_at: Some(now),
                ..Default::default()
            },
            error_details: None,
            updated_at: now,
        }
    }
}

/// Lifecycle state of one category within a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Skipped,
}

impl std::fmt::Display for CategoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

impl CategoryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// Outcome of one category's pipeline for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryResult {
    pub id: String,
    pub request_id: String,
    pub category_id: i64,
    pub category_name: String,
    pub summary: String,
    pub confidence_score: f64,
    pub data_quality_score: f64,
    pub status: CategoryStatus,
    pub processing_time_ms: i64,
    pub retry_count: i64,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub api_calls_made: i64,
    pub token_count: i64,
    pub cost_estimate: f64,
}

impl CategoryResult {
    pub fn new(request_id: impl Into<String>, category_id: i64, category_name: impl Into<String>) -> Self {
        Self {
            id: format!("catres_{}", Uuid::new_v4().simple()),
            request_id: request_id.into(),
            category_id,
            category_name: category_name.into(),
            summary: String::new(),
            confidence_score: 0.0,
            data_quality_score: 0.0,
            status: CategoryStatus::Pending,
            processing_time_ms: 0,
            retry_count: 0,
            error_message: None,
            started_at: None,
            completed_at: None,
            api_calls_made: 0,
            token_count: 0,
            cost_estimate: 0.0,
        }
    }
}

/// Raw provider response retained for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponseRecord {
    pub id: String,
    pub category_result_id: String,
    pub provider: String,
    pub model: String,
    pub temperature: Option<f64>,
    pub query_parameters: Value,
    pub raw_text: String,
    pub latency_ms: i64,
    pub token_count: i64,
    pub cost: f64,
    /// SHA-256 over the raw text.
    pub checksum: String,
    pub created_at: DateTime<Utc>,
    pub retention_expires_at: DateTime<Utc>,
}

impl ProviderResponseRecord {
    /// Default retention: creation + 7 years.
    pub fn default_retention(created_at: DateTime<Utc>) -> DateTime<Utc> {
        created_at + Duration::days(365 * 7)
    }
}

/// How a merged artifact was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMethod {
    LlmAssisted,
    FallbackWeighted,
    SummaryExtraction,
    None,
}

impl std::fmt::Display for MergeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::LlmAssisted => "llm_assisted",
            Self::FallbackWeighted => "fallback_weighted",
            Self::SummaryExtraction => "summary_extraction",
            Self::None => "none",
        };
        write!(f, "{}", s)
    }
}

/// Reference back to a weighted source inside merged data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceReference {
    pub provider: String,
    pub model: String,
    pub weight: u8,
    pub authority_score: u16,
}

/// Canonical merged artifact for one category result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergedData {
    pub id: String,
    pub category_result_id: String,
    pub merged_text: String,
    pub structured_data: serde_json::Map<String, Value>,
    pub confidence: f64,
    pub data_quality_score: f64,
    pub source_references: Vec<SourceReference>,
    pub merge_method: MergeMethod,
    pub created_at: DateTime<Utc>,
}

/// A resolved disagreement between sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConflict {
    pub id: String,
    pub category_result_id: String,
    pub conflict_type: String,
    pub description: String,
    pub conflicting_source_ids: Vec<String>,
    pub resolution_strategy: String,
    pub resolved_at: Option<DateTime<Utc>>,
    pub confidence_impact: f64,
    pub is_critical: bool,
}

/// One pipeline stage execution (or skip) record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStageEvent {
    pub id: String,
    pub request_id: String,
    pub category_id: i64,
    pub stage_name: String,
    pub stage_order: i64,
    pub executed: bool,
    pub skipped: bool,
    pub input_digest: Option<String>,
    pub output_digest: Option<String>,
    pub duration_ms: i64,
    pub created_at: DateTime<Utc>,
}

/// Per-generation summary attempt record; appended regardless of success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryHistory {
    pub id: String,
    pub request_id: String,
    pub category_name: String,
    pub style_name: String,
    pub provider: String,
    pub model: String,
    pub generated_summary: String,
    pub generation_time_ms: i64,
    pub tokens_used: i64,
    pub cost_estimate: f64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Snapshot of the composed final report plus denormalized headline fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFinalOutput {
    pub request_id: String,
    pub drug_name: String,
    pub delivery_method: DeliveryMethod,
    pub output: Value,
    pub td_score: f64,
    pub tm_score: f64,
    pub td_verdict: String,
    pub tm_verdict: String,
    pub go_decision: String,
    pub investment_priority: String,
    pub risk_level: String,
    pub version: i64,
    pub generated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let r = Request::new("Apixaban", DeliveryMethod::Transdermal);
        assert!(r.id.starts_with("req_"));
        assert_eq!(r.priority, Priority::Normal);
        assert!(r.completed_at.is_none());
        assert!(!r.correlation_id.is_empty());
    }

    #[test]
    fn test_delivery_method_parse() {
        assert_eq!(
            "Transdermal".parse::<DeliveryMethod>().unwrap(),
            DeliveryMethod::Transdermal
        );
        assert_eq!(
            "transmucosal".parse::<DeliveryMethod>().unwrap(),
            DeliveryMethod::Transmucosal
        );
        assert!("oral".parse::<DeliveryMethod>().is_err());
    }

    #[test]
    fn test_tracking_starts_submitted() {
        let t = ProcessTracking::new("req_1", 10);
        assert_eq!(t.status, ProcessingStatus::Submitted);
        assert_eq!(t.progress_percent, 0);
        assert!(t.timestamps.submitted_at.is_some());
    }

    #[test]
    fn test_category_status_terminality() {
        assert!(!CategoryStatus::Pending.is_terminal());
        assert!(!CategoryStatus::Processing.is_terminal());
        assert!(CategoryStatus::Completed.is_terminal());
        assert!(CategoryStatus::Failed.is_terminal());
        assert!(CategoryStatus::Skipped.is_terminal());
    }

    #[test]
    fn test_provider_response_retention_default() {
        let now = Utc::now();
        let expires = ProviderResponseRecord::default_retention(now);
        assert_eq!((expires - now).num_days(), 365 * 7);
    }
}
