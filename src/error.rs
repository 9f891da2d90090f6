//! Error types for pharmintel-core.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using pharmintel-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Typed failure categories for provider calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    NetworkError,
    AuthError,
    RateLimited,
    BadRequest,
    ServerError,
    DecodeError,
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NetworkError => "network_error",
            Self::AuthError => "auth_error",
            Self::RateLimited => "rate_limited",
            Self::BadRequest => "bad_request",
            Self::ServerError => "server_error",
            Self::DecodeError => "decode_error",
        };
        write!(f, "{}", s)
    }
}

/// Errors that can occur during pipeline operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A provider call failed with a typed category.
    #[error("provider {provider} failed ({kind}): {message}")]
    Provider {
        provider: String,
        kind: ProviderErrorKind,
        message: String,
        /// Server-supplied retry hint for `rate_limited`.
        retry_after_ms: Option<u64>,
    },

    /// Persistent storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A status transition not present in the transition table.
    #[error("invalid_transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// A referenced entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The category dependency graph contains a cycle.
    #[error("category dependency cycle involving {0}")]
    DependencyCycle(String),

    /// An audit write failed; treated as fatal for the owning mutation.
    #[error("audit write failed: {0}")]
    AuditWrite(String),

    /// The request was cancelled.
    #[error("request cancelled")]
    Cancelled,

    /// Timeout during operation.
    #[error("operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Invariant violation or corrupted persisted state.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a provider error.
    pub fn provider(
        provider: impl Into<String>,
        kind: ProviderErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self::Provider {
            provider: provider.into(),
            kind,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Create a rate-limited provider error with a retry hint.
    pub fn rate_limited(
        provider: impl Into<String>,
        message: impl Into<String>,
        retry_after_ms: Option<u64>,
    ) -> Self {
        Self::Provider {
            provider: provider.into(),
            kind: ProviderErrorKind::RateLimited,
            message: message.into(),
            retry_after_ms,
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create an invalid-transition error.
    pub fn invalid_transition(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::InvalidTransition {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Create a not-found error.
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Whether this error is transient and eligible for retry.
    ///
    /// Transient: network errors, 5xx responses, rate limits, timeouts.
    /// Everything else is fatal for the call.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Provider { kind, .. } => matches!(
                kind,
                ProviderErrorKind::NetworkError
                    | ProviderErrorKind::ServerError
                    | ProviderErrorKind::RateLimited
            ),
            Self::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Retry-after hint for rate-limited provider errors.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::Provider { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }

    /// Short stable tag for API bodies and audit records; never leaks internals.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Provider { kind, .. } => match kind {
                ProviderErrorKind::NetworkError => "network_error",
                ProviderErrorKind::AuthError => "auth_error",
                ProviderErrorKind::RateLimited => "rate_limited",
                ProviderErrorKind::BadRequest => "bad_request",
                ProviderErrorKind::ServerError => "server_error",
                ProviderErrorKind::DecodeError => "decode_error",
            },
            Self::Storage(_) => "storage_error",
            Self::Serialization(_) => "serialization_error",
            Self::Config(_) => "config_error",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::NotFound { .. } => "not_found",
            Self::DependencyCycle(_) => "dependency_cycle",
            Self::AuditWrite(_) => "audit_write_failure",
            Self::Cancelled => "cancelled",
            Self::Timeout { .. } => "timeout",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}
