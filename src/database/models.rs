//! Job row models and the status transition table.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::{Error, Result};

/// Job database model.
/// One row per submitted video; the `status` column is the storage partition.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub source_url: String,
    /// Status: QUEUED, PROCESSING, COMPLETED, FAILED, ARCHIVED
    pub status: String,
    /// Optional notification target (e.g., an email address)
    pub notify_target: Option<String>,
    /// ISO 8601 timestamp when the job entered the queue
    pub queued_at: String,
    /// ISO 8601 timestamp when processing started
    pub started_at: Option<String>,
    /// ISO 8601 timestamp of the last mutation
    pub updated_at: String,
    pub completed_at: Option<String>,
    pub failed_at: Option<String>,
    /// Cumulative progress, 0-100; meaningful only while processing
    pub progress_percent: i64,
    pub current_step: Option<String>,
    /// Attempt number, starts at 1; resets only on re-submission from failed
    pub attempt_count: i64,
    /// JSON blob, present only when completed
    pub result: Option<String>,
    /// JSON blob, present only when failed
    pub failure: Option<String>,
}

impl JobRecord {
    /// Parse the status column. `None` means the row is corrupt.
    pub fn job_status(&self) -> Option<JobStatus> {
        JobStatus::parse(&self.status)
    }

    /// Decode the result payload of a completed job.
    pub fn summary_result(&self) -> Result<Option<SummaryResult>> {
        match &self.result {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }

    /// Decode the failure payload of a failed job.
    pub fn failure_info(&self) -> Result<Option<FailureInfo>> {
        match &self.failure {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }
}

/// A job submission, prior to validation and insertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub id: String,
    pub source_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_target: Option<String>,
}

impl NewJob {
    pub fn new(id: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source_url: source_url.into(),
            notify_target: None,
        }
    }

    pub fn with_notify_target(mut self, target: impl Into<String>) -> Self {
        self.notify_target = Some(target.into());
        self
    }
}

/// Job status values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Job is queued and waiting to be claimed.
    Queued,
    /// Job is currently being executed by a runner.
    Processing,
    /// Job was detected as abandoned mid-processing. Never stored; only a
    /// validated intermediate on the recovery path back to the queue.
    Stalled,
    /// Job finished successfully.
    Completed,
    /// Job failed after exhausting retries.
    Failed,
    /// Completed job moved out of the active view.
    Archived,
    /// Job record removed. Terminal; never stored.
    Deleted,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Processing => "PROCESSING",
            Self::Stalled => "STALLED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Archived => "ARCHIVED",
            Self::Deleted => "DELETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(Self::Queued),
            "PROCESSING" => Some(Self::Processing),
            "STALLED" => Some(Self::Stalled),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "ARCHIVED" => Some(Self::Archived),
            "DELETED" => Some(Self::Deleted),
            _ => None,
        }
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// The legal next states from this status. Self-transitions are never legal.
    pub fn valid_next(&self) -> &'static [JobStatus] {
        match self {
            Self::Queued => &[Self::Processing],
            Self::Processing => &[Self::Stalled, Self::Completed, Self::Failed],
            Self::Stalled => &[Self::Processing, Self::Failed],
            Self::Completed => &[Self::Archived],
            Self::Failed => &[Self::Queued, Self::Deleted],
            Self::Archived => &[Self::Deleted],
            Self::Deleted => &[],
        }
    }

    /// Check whether a transition to `to` is legal.
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        self.valid_next().contains(&to)
    }
}

/// Validate a status transition, or fail with `InvalidTransition`.
///
/// Every store mutation that changes `status` must pass through here.
pub fn ensure_transition(from: JobStatus, to: JobStatus) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition {
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        })
    }
}

/// Sentiment classification of a summarized video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Negative,
    Neutral,
}

/// Metrics attached to a completed summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMetrics {
    /// Wall-clock processing time in seconds.
    pub processing_time_secs: f64,
    /// Confidence score in 0.0..=1.0.
    pub confidence: f64,
}

/// Result payload of a completed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryResult {
    pub summary: String,
    pub sentiment: Sentiment,
    pub keywords: Vec<String>,
    pub metrics: ResultMetrics,
}

/// Failure payload of a failed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureInfo {
    /// Class name of the final error (e.g., "FetchError").
    pub code: String,
    pub message: String,
}

impl FailureInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Per-status job counts across all partitions.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct JobCounts {
    pub queued: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub archived: u64,
}
