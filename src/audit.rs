//! Append-only audit event model.
//!
//! Every entity mutation and process start/complete/error produces an
//! [`AuditEvent`]. Events are written inside the same store transaction as
//! the mutation they describe, so an audit-write failure aborts the mutation.
//! Application code can never update or delete rows in `audit_events`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Kind of audited occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    Create,
    Update,
    Delete,
    ProcessStart,
    ProcessComplete,
    ProcessError,
    SourceVerification,
    ConflictResolution,
    DataExport,
    UserAccess,
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::ProcessStart => "process_start",
            Self::ProcessComplete => "process_complete",
            Self::ProcessError => "process_error",
            Self::SourceVerification => "source_verification",
            Self::ConflictResolution => "conflict_resolution",
            Self::DataExport => "data_export",
            Self::UserAccess => "user_access",
        };
        write!(f, "{}", s)
    }
}

/// One immutable audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub event_type: AuditEventType,
    pub entity_type: String,
    pub entity_id: String,
    pub request_id: Option<String>,
    pub old_values: Option<Value>,
    pub new_values: Option<Value>,
    pub actor: String,
    pub correlation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl AuditEvent {
    pub fn new(
        event_type: AuditEventType,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("audit_{}", Uuid::new_v4().simple()),
            event_type,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            request_id: None,
            old_values: None,
            new_values: None,
            actor: "engine".to_string(),
            correlation_id: None,
            timestamp: Utc::now(),
            ip_address: None,
            user_agent: None,
        }
    }

    pub fn with_request(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    /// Attach pre/post images, cleaned to JSON-safe values.
    pub fn with_images(mut self, old_values: Option<Value>, new_values: Option<Value>) -> Self {
        self.old_values = old_values.map(clean_json);
        self.new_values = new_values.map(clean_json);
        self
    }

    pub fn with_client(mut self, ip_address: Option<String>, user_agent: Option<String>) -> Self {
        self.ip_address = ip_address;
        self.user_agent = user_agent;
        self
    }
}

/// Replace non-representable numbers so images always round-trip as JSON.
fn clean_json(value: Value) -> Value {
    match value {
        Value::Number(n) => {
            if n.as_f64().map(|f| f.is_finite()).unwrap_or(true) {
                Value::Number(n)
            } else {
                Value::Null
            }
        }
        Value::Array(items) => Value::Array(items.into_iter().map(clean_json).collect()),
        Value::Object(map) => {
            Value::Object(map.into_iter().map(|(k, v)| (k, clean_json(v))).collect())
        }
        other => other,
    }
}
