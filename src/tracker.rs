//! Stateful status tracking over the store.
//!
//! Wraps the pure state-machine logic in `status` with persistence, audit,
//! and monotonic progress. Only the scheduler and this tracker mutate status
//! fields.

use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use crate::audit::{AuditEvent, AuditEventType};
use crate::config::StageMeanMinutes;
use crate::error::{Error, Result};
use crate::model::ProcessTracking;
use crate::status::{
    calculate_progress, check_transition, estimate_completion, project_history, ProcessingStatus,
    StageHistoryEntry,
};
use crate::store::Store;

/// Persistent status tracker for requests.
pub struct StatusTracker {
    store: Arc<Store>,
    means: StageMeanMinutes,
}

impl StatusTracker {
    pub fn new(store: Arc<Store>, means: StageMeanMinutes) -> Self {
        Self { store, means }
    }

    /// Create the 1:1 tracking record for a new request.
    pub fn create(
        &self,
        request_id: &str,
        categories_total: i64,
        drug_count: i64,
    ) -> Result<ProcessTracking> {
        let mut tracking = ProcessTracking::new(request_id, categories_total);
        tracking.drug_count = drug_count;
        tracking.estimated_completion_at = estimate_completion(
            tracking.status,
            tracking.current_stage_start,
            drug_count as usize,
            &self.means,
            Utc::now(),
        );
        self.store.insert_tracking(&tracking)?;
        Ok(tracking)
    }

    fn load(&self, request_id: &str) -> Result<ProcessTracking> {
        self.store
            .get_tracking(request_id)?
            .ok_or_else(|| Error::not_found("process_tracking", request_id))
    }

    /// Transition to a new status.
    ///
    /// Rejected transitions are audit-logged and surfaced as
    /// `invalid_transition`; persisted state is unchanged.
    pub fn transition(&self, request_id: &str, to: ProcessingStatus) -> Result<ProcessTracking> {
        let mut tracking = self.load(request_id)?;
        let from = tracking.status;

        if let Err(e) = check_transition(from, to) {
            self.store.insert_audit_event(
                &AuditEvent::new(AuditEventType::ProcessError, "process_tracking", request_id)
                    .with_request(request_id)
                    .with_images(
                        Some(serde_json::json!({"status": from.to_string()})),
                        Some(serde_json::json!({
                            "rejected_status": to.to_string(),
                            "error": "invalid_transition",
                        })),
                    ),
            )?;
            return Err(e);
        }

        let now = Utc::now();
        tracking.timestamps.mark_completed(from, now);
        tracking.status = to;
        tracking.current_stage_start = Some(now);
        tracking.timestamps.mark_started(to, now);
        if to == ProcessingStatus::Completed {
            tracking.timestamps.completed_at.get_or_insert(now);
            tracking.progress_percent = 100;
        } else {
            let computed = calculate_progress(
                to,
                tracking.categories_completed,
                tracking.categories_total,
                tracking.progress_percent,
            );
            tracking.progress_percent = tracking.progress_percent.max(computed);
        }
        tracking.estimated_completion_at = estimate_completion(
            to,
            tracking.current_stage_start,
            tracking.drug_count as usize,
            &self.means,
            now,
        );
        tracking.updated_at = now;
        self.store.update_tracking(&tracking)?;
        info!(request_id, from = %from, to = %to, "status transition");
        Ok(tracking)
    }

    /// Record one more completed category and recompute progress
    /// monotonically.
    pub fn record_category_completion(&self, request_id: &str) -> Result<ProcessTracking> {
        let mut tracking = self.load(request_id)?;
        tracking.categories_completed =
            (tracking.categories_completed + 1).min(tracking.categories_total);
        let computed = calculate_progress(
            tracking.status,
            tracking.categories_completed,
            tracking.categories_total,
            tracking.progress_percent,
        );
        tracking.progress_percent = tracking.progress_percent.max(computed);
        tracking.updated_at = Utc::now();
        self.store.update_tracking(&tracking)?;
        Ok(tracking)
    }

    /// Terminal failure with error details.
    pub fn fail(&self, request_id: &str, details: impl Into<String>) -> Result<ProcessTracking> {
        let mut tracking = self.load(request_id)?;
        if tracking.status.is_terminal() {
            return Ok(tracking);
        }
        tracking.status = ProcessingStatus::Failed;
        tracking.error_details = Some(details.into());
        tracking.estimated_completion_at = None;
        tracking.updated_at = Utc::now();
        self.store.update_tracking(&tracking)?;
        Ok(tracking)
    }

    /// Terminal cancellation.
    pub fn cancel(&self, request_id: &str) -> Result<ProcessTracking> {
        let mut tracking = self.load(request_id)?;
        if tracking.status.is_terminal() {
            return Err(Error::invalid_transition(
                tracking.status.to_string(),
                ProcessingStatus::Cancelled.to_string(),
            ));
        }
        tracking.status = ProcessingStatus::Cancelled;
        tracking.estimated_completion_at = None;
        tracking.updated_at = Utc::now();
        self.store.update_tracking(&tracking)?;
        info!(request_id, "request cancelled");
        Ok(tracking)
    }

    pub fn get(&self, request_id: &str) -> Result<ProcessTracking> {
        self.load(request_id)
    }

    /// Chronological stage history reconstructed from stored timestamps.
    pub fn history(&self, request_id: &str) -> Result<Vec<StageHistoryEntry>> {
        let tracking = self.load(request_id)?;
        Ok(project_history(&tracking.timestamps))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeliveryMethod, Request};

    fn tracker_with_request() -> (StatusTracker, Arc<Store>, String) {
        let store = Arc::new(Store::in_memory().unwrap());
        let request = Request::new("Apixaban", DeliveryMethod::Transdermal);
        store.insert_request(&request).unwrap();
        let tracker = StatusTracker::new(Arc::clone(&store), StageMeanMinutes::default());
        tracker.create(&request.id, 10, 1).unwrap();
        (tracker, store, request.id)
    }

    #[test]
    fn test_full_legal_walk() {
        let (tracker, _store, id) = tracker_with_request();
        for to in [
            ProcessingStatus::Collecting,
            ProcessingStatus::Verifying,
            ProcessingStatus::Merging,
            ProcessingStatus::Summarizing,
            ProcessingStatus::Completed,
        ] {
            let tracking = tracker.transition(&id, to).unwrap();
            assert_eq!(tracking.status, to);
        }
        let tracking = tracker.get(&id).unwrap();
        assert_eq!(tracking.progress_percent, 100);
        assert!(tracking.timestamps.completed_at.is_some());
    }

    #[test]
    fn test_invalid_transition_rejected_and_audited() {
        let (tracker, store, id) = tracker_with_request();
        let audit_before = store.count_audit_events().unwrap();

        let err = tracker
            .transition(&id, ProcessingStatus::Completed)
            .unwrap_err();
        assert_eq!(err.tag(), "invalid_transition");

        // Status unchanged; the rejection itself is audited.
        let tracking = tracker.get(&id).unwrap();
        assert_eq!(tracking.status, ProcessingStatus::Submitted);
        assert_eq!(store.count_audit_events().unwrap(), audit_before + 1);
    }

    #[test]
    fn test_progress_is_monotonic_across_completions() {
        let (tracker, _store, id) = tracker_with_request();
        tracker.transition(&id, ProcessingStatus::Collecting).unwrap();

        let mut last = 0;
        for _ in 0..10 {
            let tracking = tracker.record_category_completion(&id).unwrap();
            assert!(tracking.progress_percent >= last);
            last = tracking.progress_percent;
        }
        assert_eq!(last, 80);
    }

    #[test]
    fn test_cancel_from_terminal_is_invalid() {
        let (tracker, _store, id) = tracker_with_request();
        tracker.transition(&id, ProcessingStatus::Collecting).unwrap();
        tracker.cancel(&id).unwrap();

        let err = tracker.cancel(&id).unwrap_err();
        assert_eq!(err.tag(), "invalid_transition");
    }

    #[test]
    fn test_fail_records_details_and_clears_estimate() {
        let (tracker, _store, id) = tracker_with_request();
        tracker.transition(&id, ProcessingStatus::Collecting).unwrap();
        let tracking = tracker.fail(&id, "collect stage: Pharmacokinetics").unwrap();
        assert_eq!(tracking.status, ProcessingStatus::Failed);
        assert_eq!(
            tracking.error_details.as_deref(),
            Some("collect stage: Pharmacokinetics")
        );
        assert!(tracking.estimated_completion_at.is_none());
    }

    #[test]
    fn test_history_projection_from_persisted_timestamps() {
        let (tracker, _store, id) = tracker_with_request();
        tracker.transition(&id, ProcessingStatus::Collecting).unwrap();
        tracker.transition(&id, ProcessingStatus::Verifying).unwrap();

        let history = tracker.history(&id).unwrap();
        assert!(history.len() >= 3);
        assert_eq!(history[0].status, ProcessingStatus::Submitted);
        assert_eq!(history[1].status, ProcessingStatus::Collecting);
        assert!(history[1].duration.is_some());
    }
}
