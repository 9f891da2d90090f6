//! Request status state machine, progress calculation, and history
//! projection.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::StageMeanMinutes;
use crate::error::{Error, Result};

/// Request-level processing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Submitted,
    Collecting,
    Verifying,
    Merging,
    Summarizing,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Submitted => "submitted",
            Self::Collecting => "collecting",
            Self::Verifying => "verifying",
            Self::Merging => "merging",
            Self::Summarizing => "summarizing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for ProcessingStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "submitted" => Ok(Self::Submitted),
            "collecting" => Ok(Self::Collecting),
            "verifying" => Ok(Self::Verifying),
            "merging" => Ok(Self::Merging),
            "summarizing" => Ok(Self::Summarizing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(Error::Internal(format!("unknown status: {}", other))),
        }
    }
}

impl ProcessingStatus {
    /// Terminal states are sinks.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Valid successor states.
    pub fn valid_transitions(&self) -> &'static [ProcessingStatus] {
        use ProcessingStatus::*;
        match self {
            Submitted => &[Collecting, Failed, Cancelled],
            Collecting => &[Verifying, Failed, Cancelled],
            Verifying => &[Merging, Failed, Cancelled],
            Merging => &[Summarizing, Failed, Cancelled],
            Summarizing => &[Completed, Failed, Cancelled],
            Completed | Failed | Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, to: ProcessingStatus) -> bool {
        self.valid_transitions().contains(&to)
    }

    /// Base progress percentage for the stage; `None` for failed/cancelled,
    /// which freeze the last computed value.
    pub fn base_progress(&self) -> Option<u8> {
        match self {
            Self::Submitted => Some(0),
            Self::Collecting => Some(20),
            Self::Verifying => Some(80),
            Self::Merging => Some(90),
            Self::Summarizing => Some(95),
            Self::Completed => Some(100),
            Self::Failed | Self::Cancelled => None,
        }
    }
}

/// Validate a transition, returning `invalid_transition` when it is not in
/// the table.
pub fn check_transition(from: ProcessingStatus, to: ProcessingStatus) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::invalid_transition(from.to_string(), to.to_string()))
    }
}

/// Progress percentage as a function of stage plus category completion.
///
/// Stage bonuses: collecting up to 60, verifying up to 10, merging up to 5,
/// summarizing up to 4; clamped at 80/90/95/99 respectively. Terminal
/// failed/cancelled return `previous` unchanged.
pub fn calculate_progress(
    status: ProcessingStatus,
    categories_completed: i64,
    categories_total: i64,
    previous: u8,
) -> u8 {
    let base = match status.base_progress() {
        Some(base) => base,
        None => return previous,
    };
    if categories_total <= 0 {
        return base;
    }
    let ratio = categories_completed as f64 / categories_total as f64;

    match status {
        ProcessingStatus::Collecting => ((base as f64 + ratio * 60.0) as u8).min(80),
        ProcessingStatus::Verifying => ((base as f64 + ratio * 10.0) as u8).min(90),
        ProcessingStatus::Merging => ((base as f64 + ratio * 5.0) as u8).min(95),
        ProcessingStatus::Summarizing => ((base as f64 + ratio * 4.0) as u8).min(99),
        _ => base,
    }
}

/// Per-stage start/complete timestamps recorded on process tracking.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageTimestamps {
    pub submitted_at: Option<DateTime<Utc>>,
    pub collecting_started_at: Option<DateTime<Utc>>,
    pub collecting_completed_at: Option<DateTime<Utc>>,
    pub verifying_started_at: Option<DateTime<Utc>>,
    pub verifying_completed_at: Option<DateTime<Utc>>,
    pub merging_started_at: Option<DateTime<Utc>>,
    pub merging_completed_at: Option<DateTime<Utc>>,
    pub summarizing_started_at: Option<DateTime<Utc>>,
    pub summarizing_completed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StageTimestamps {
    /// Record the start of a stage; first write wins so re-runs stay
    /// idempotent.
    pub fn mark_started(&mut self, status: ProcessingStatus, at: DateTime<Utc>) {
        let slot = match status {
            ProcessingStatus::Collecting => &mut self.collecting_started_at,
            ProcessingStatus::Verifying => &mut self.verifying_started_at,
            ProcessingStatus::Merging => &mut self.merging_started_at,
            ProcessingStatus::Summarizing => &mut self.summarizing_started_at,
            _ => return,
        };
        slot.get_or_insert(at);
    }

    pub fn mark_completed(&mut self, status: ProcessingStatus, at: DateTime<Utc>) {
        let slot = match status {
            ProcessingStatus::Collecting => &mut self.collecting_completed_at,
            ProcessingStatus::Verifying => &mut self.verifying_completed_at,
            ProcessingStatus::Merging => &mut self.merging_completed_at,
            ProcessingStatus::Summarizing => &mut self.summarizing_completed_at,
            ProcessingStatus::Completed => &mut self.completed_at,
            _ => return,
        };
        slot.get_or_insert(at);
    }
}

/// Estimated completion: remaining mean stage durations scaled by drug count
/// and a 1.2 load buffer. `None` once terminal.
pub fn estimate_completion(
    status: ProcessingStatus,
    current_stage_start: Option<DateTime<Utc>>,
    drug_count: usize,
    means: &StageMeanMinutes,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if status.is_terminal() {
        return None;
    }

    let stages = [
        (ProcessingStatus::Collecting, means.collecting),
        (ProcessingStatus::Verifying, means.verifying),
        (ProcessingStatus::Merging, means.merging),
        (ProcessingStatus::Summarizing, means.summarizing),
    ];

    let mut remaining_minutes = 0.0;
    let mut found_current = status == ProcessingStatus::Submitted;
    for (stage, mean) in stages {
        if stage == status {
            found_current = true;
            let elapsed = current_stage_start
                .map(|start| (now - start).num_seconds().max(0) as f64 / 60.0)
                .unwrap_or(0.0);
            remaining_minutes += (mean - elapsed).max(0.0);
        } else if found_current {
            remaining_minutes += mean;
        }
    }

    let multiplier = 1.0 + 0.5 * (drug_count.max(1) as f64 - 1.0);
    remaining_minutes *= multiplier * 1.2;

    Some(now + Duration::milliseconds((remaining_minutes * 60_000.0) as i64))
}

/// One reconstructed stage-entry event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageHistoryEntry {
    pub status: ProcessingStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// `HH:MM:SS`, present when the stage completed.
    pub duration: Option<String>,
    pub progress_percent: u8,
}

/// Reconstruct a chronological stage history from stored timestamps.
///
/// Read-only; derives duration per stage.
pub fn project_history(timestamps: &StageTimestamps) -> Vec<StageHistoryEntry> {
    let mut entries = Vec::new();

    if let Some(at) = timestamps.submitted_at {
        entries.push(StageHistoryEntry {
            status: ProcessingStatus::Submitted,
            started_at: at,
            completed_at: timestamps.collecting_started_at,
            duration: timestamps
                .collecting_started_at
                .map(|end| format_duration(at, end)),
            progress_percent: 0,
        });
    }

    let stages = [
        (
            ProcessingStatus::Collecting,
            timestamps.collecting_started_at,
            timestamps.collecting_completed_at,
        ),
        (
            ProcessingStatus::Verifying,
            timestamps.verifying_started_at,
            timestamps.verifying_completed_at,
        ),
        (
            ProcessingStatus::Merging,
            timestamps.merging_started_at,
            timestamps.merging_completed_at,
        ),
        (
            ProcessingStatus::Summarizing,
            timestamps.summarizing_started_at,
            timestamps.summarizing_completed_at,
        ),
    ];

    for (status, started, completed) in stages {
        if let Some(started_at) = started {
            entries.push(StageHistoryEntry {
                status,
                started_at,
                completed_at: completed,
                duration: completed.map(|end| format_duration(started_at, end)),
                progress_percent: status.base_progress().unwrap_or(0),
            });
        }
    }

    if let Some(at) = timestamps.completed_at {
        entries.push(StageHistoryEntry {
            status: ProcessingStatus::Completed,
            started_at: at,
            completed_at: Some(at),
            duration: Some("00:00:00".to_string()),
            progress_percent: 100,
        });
    }

    entries
}

/// `HH:MM:SS` between two timestamps.
pub fn format_duration(start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    let total = (end - start).num_seconds().max(0);
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
}
