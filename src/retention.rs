//! Retention policy execution.
//!
//! Policies archive or delete aged entities on a schedule. Deletion is
//! refused for any entity without at least one audit record, dry-run mode
//! reports the same counts without mutating state, and every run verifies
//! the global audit-event count did not decrease.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::store::Store;

/// Action a policy applies to eligible entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionAction {
    Archive,
    Delete,
}

/// Result of one policy's execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyReport {
    pub policy: String,
    pub entity: String,
    pub action: RetentionAction,
    pub eligible: usize,
    pub archived: usize,
    pub deleted: usize,
    /// Entities skipped because no audit record references them.
    pub refused_without_audit: usize,
}

/// Aggregate report for one retention run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionReport {
    pub executed_at: DateTime<Utc>,
    pub dry_run: bool,
    pub policies: Vec<PolicyReport>,
    pub audit_events_before: i64,
    pub audit_events_after: i64,
    /// Post-run check: the audit log only grew.
    pub audit_log_intact: bool,
}

impl RetentionReport {
    pub fn total_eligible(&self) -> usize {
        self.policies.iter().map(|p| p.eligible).sum()
    }
}

/// Scheduled retention manager.
pub struct RetentionManager {
    store: Arc<Store>,
    request_retention: Duration,
    category_result_retention: Duration,
    conflict_retention: Duration,
    audit_retention: Duration,
    failed_request_retention: Duration,
    failed_request_min_retries: i64,
}

impl RetentionManager {
    pub fn new(store: Arc<Store>, audit_retention_years: i64) -> Self {
        Self {
            store,
            request_retention: Duration::days(365 * 3),
            category_result_retention: Duration::days(365 * 2),
            conflict_retention: Duration::days(365 * 7),
            audit_retention: Duration::days(365 * audit_retention_years.max(7)),
            failed_request_retention: Duration::days(90),
            failed_request_min_retries: 3,
        }
    }

    /// Apply every policy. With `dry_run` the report carries the same
    /// eligibility counts but nothing is mutated.
    pub async fn run(&self, dry_run: bool) -> Result<RetentionReport> {
        let now = Utc::now();
        let audit_before = self.store.count_audit_events()?;
        let mut policies = Vec::new();

        // Requests: 3 years, terminal only, archive; audit required.
        policies.push(self.archive_policy(
            "Requests - 3 Year Operational Retention",
            "request",
            self.store.requests_older_than(now - self.request_retention)?,
            dry_run,
            true,
            |store, ids| {
                let archived = store.archive_rows("requests", "id", ids)?;
                store.archive_rows("process_tracking", "request_id", ids)?;
                Ok(archived)
            },
        )?);

        // Category results: 2 years, archive; audit required.
        policies.push(self.archive_policy(
            "Category Results - 2 Year Retention",
            "category_result",
            self.store
                .category_results_older_than(now - self.category_result_retention)?,
            dry_run,
            true,
            |store, ids| store.archive_rows("category_results", "id", ids),
        )?);

        // Provider responses: per-row stored expiry, archive.
        policies.push(self.archive_policy(
            "Provider Responses - Stored Expiry",
            "provider_response",
            self.store.expired_provider_responses(now)?,
            dry_run,
            false,
            |store, ids| store.archive_rows("provider_responses", "id", ids),
        )?);

        // Source conflicts: 7 years, archive; audit required.
        policies.push(self.archive_policy(
            "Source Conflicts - 7 Year Retention",
            "source_conflict",
            self.store
                .source_conflicts_older_than(now - self.conflict_retention)?,
            dry_run,
            true,
            |store, ids| store.archive_rows("source_conflicts", "id", ids),
        )?);

        // Audit events: configured years, archive only, always preserved.
        policies.push(self.archive_policy(
            "Audit Trail - Long-Term Archive",
            "audit_event",
            self.store
                .audit_events_older_than(now - self.audit_retention)?,
            dry_run,
            false,
            |store, ids| store.archive_rows("audit_events", "id", ids),
        )?);

        // Failed requests: 90 days with retries exhausted, delete.
        policies.push(self.delete_failed_requests(now, dry_run)?);

        let audit_after = self.store.count_audit_events()?;
        let audit_log_intact = audit_after >= audit_before;
        if !audit_log_intact {
            // Should be impossible: deletes are trigger-guarded.
            return Err(Error::Internal(
                "audit event count decreased during retention run".to_string(),
            ));
        }

        let report = RetentionReport {
            executed_at: now,
            dry_run,
            policies,
            audit_events_before: audit_before,
            audit_events_after: audit_after,
            audit_log_intact,
        };
        info!(
            dry_run,
            eligible = report.total_eligible(),
            "retention run complete"
        );
        Ok(report)
    }

    fn archive_policy<F>(
        &self,
        policy: &str,
        entity: &str,
        eligible_ids: Vec<String>,
        dry_run: bool,
        require_audit: bool,
        archive: F,
    ) -> Result<PolicyReport>
    where
        F: Fn(&Store, &[String]) -> Result<usize>,
    {
        let mut actionable = Vec::new();
        let mut refused = 0;
        for id in &eligible_ids {
            if require_audit && !self.store.has_audit_for_entity(id)? {
                warn!(policy, id, "refusing retention action without audit record");
                refused += 1;
                continue;
            }
            actionable.push(id.clone());
        }

        let archived = if dry_run {
            0
        } else {
            archive(&self.store, &actionable)?
        };

        Ok(PolicyReport {
            policy: policy.to_string(),
            entity: entity.to_string(),
            action: RetentionAction::Archive,
            eligible: actionable.len(),
            archived,
            deleted: 0,
            refused_without_audit: refused,
        })
    }

    fn delete_failed_requests(&self, now: DateTime<Utc>, dry_run: bool) -> Result<PolicyReport> {
        let eligible = self.store.failed_requests_older_than(
            now - self.failed_request_retention,
            self.failed_request_min_retries,
        )?;

        let mut actionable = Vec::new();
        let mut refused = 0;
        for id in &eligible {
            if !self.store.has_audit_for_entity(id)? {
                warn!(id, "refusing delete without audit record");
                refused += 1;
                continue;
            }
            actionable.push(id.clone());
        }

        let mut deleted = 0;
        if !dry_run {
            for id in &actionable {
                self.store.delete_request_cascade(id)?;
                deleted += 1;
            }
        }

        Ok(PolicyReport {
            policy: "Failed Requests - 90 Day Cleanup".to_string(),
            entity: "request".to_string(),
            action: RetentionAction::Delete,
            eligible: actionable.len(),
            archived: 0,
            deleted,
            refused_without_audit: refused,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeliveryMethod, ProcessTracking, Request};
    use crate::status::ProcessingStatus;

    fn aged_terminal_request(store: &Store, years_old: i64, status: ProcessingStatus) -> Request {
        let mut request = Request::new("Apixaban", DeliveryMethod::Transdermal);
        request.created_at = Utc::now() - Duration::days(365 * years_old + 30);
        request.retry_count = 5;
        store.insert_request(&request).unwrap();

        let mut tracking = ProcessTracking::new(&request.id, 10);
        store.insert_tracking(&tracking).unwrap();
        tracking.status = status;
        store.update_tracking(&tracking).unwrap();
        request
    }

    #[tokio::test]
    async fn test_dry_run_reports_without_mutation() {
        let store = Arc::new(Store::in_memory().unwrap());
        let request = aged_terminal_request(&store, 4, ProcessingStatus::Completed);

        let manager = RetentionManager::new(Arc::clone(&store), 7);
        let audit_before = store.count_audit_events().unwrap();

        let report = manager.run(true).await.unwrap();
        assert!(report.dry_run);

        let requests_policy = report
            .policies
            .iter()
            .find(|p| p.policy.starts_with("Requests"))
            .unwrap();
        assert_eq!(requests_policy.eligible, 1);
        assert_eq!(requests_policy.archived, 0);

        // Nothing changed.
        assert!(store.get_request(&request.id).unwrap().is_some());
        assert_eq!(store.count_audit_events().unwrap(), audit_before);
        assert!(report.audit_log_intact);
    }

    #[tokio::test]
    async fn test_real_run_archives_aged_requests() {
        let store = Arc::new(Store::in_memory().unwrap());
        let request = aged_terminal_request(&store, 4, ProcessingStatus::Completed);

        let manager = RetentionManager::new(Arc::clone(&store), 7);
        let report = manager.run(false).await.unwrap();

        let requests_policy = report
            .policies
            .iter()
            .find(|p| p.policy.starts_with("Requests"))
            .unwrap();
        assert_eq!(requests_policy.archived, 1);

        // Archived, not deleted: the row survives with a stamp, so a second
        // run finds nothing eligible.
        assert!(store.get_request(&request.id).unwrap().is_some());
        let report = manager.run(false).await.unwrap();
        let requests_policy = report
            .policies
            .iter()
            .find(|p| p.policy.starts_with("Requests"))
            .unwrap();
        assert_eq!(requests_policy.eligible, 0);
    }

    #[tokio::test]
    async fn test_fresh_requests_not_eligible() {
        let store = Arc::new(Store::in_memory().unwrap());
        aged_terminal_request(&store, 0, ProcessingStatus::Completed);

        let manager = RetentionManager::new(Arc::clone(&store), 7);
        let report = manager.run(true).await.unwrap();
        assert_eq!(report.total_eligible(), 0);
    }

    #[tokio::test]
    async fn test_failed_request_deletion_requires_audit() {
        let store = Arc::new(Store::in_memory().unwrap());
        let request = aged_terminal_request(&store, 1, ProcessingStatus::Failed);

        let manager = RetentionManager::new(Arc::clone(&store), 7);
        let report = manager.run(false).await.unwrap();

        let delete_policy = report
            .policies
            .iter()
            .find(|p| p.action == RetentionAction::Delete)
            .unwrap();
        // The insert audit record exists, so deletion proceeds.
        assert_eq!(delete_policy.deleted, 1);
        assert!(store.get_request(&request.id).unwrap().is_none());

        // The audit log never shrank.
        assert!(report.audit_log_intact);
        assert!(report.audit_events_after >= report.audit_events_before);
    }

    #[tokio::test]
    async fn test_audit_count_never_decreases() {
        let store = Arc::new(Store::in_memory().unwrap());
        for status in [
            ProcessingStatus::Completed,
            ProcessingStatus::Failed,
            ProcessingStatus::Cancelled,
        ] {
            aged_terminal_request(&store, 4, status);
        }

        let manager = RetentionManager::new(Arc::clone(&store), 7);
        let before = store.count_audit_events().unwrap();
        let report = manager.run(false).await.unwrap();
        assert!(store.count_audit_events().unwrap() >= before);
        assert!(report.audit_log_intact);
    }
}
