//! The job record and its lifecycle state machine.
//!
//! A [`Job`] moves `queued -> running -> completed | failed | canceled`.
//! While `running` it additionally walks the pipeline [`JobStage`]s in
//! order. All transition helpers refuse to leave a terminal status, and
//! [`Job::check_invariants`] enforces the pairing of `result_path` with
//! `completed` and `error` with `failed`.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::params::{JobParams, NewJob};
use crate::types::{JobId, Timestamp};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Coarse job status as exposed to submitters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Whether `self -> next` is a legal forward transition.
    ///
    /// Staying in the same non-terminal status is allowed (field updates).
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Queued, Queued | Running | Failed | Canceled) => true,
            (Running, Running | Completed | Failed | Canceled) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// Pipeline stage of a running job, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    FetchingInput,
    Submitting,
    Polling,
    Downloading,
    Notifying,
}

impl JobStage {
    /// Cancellation is honoured only before the artifact is being fetched.
    pub fn is_cancellable(self) -> bool {
        self < JobStage::Downloading
    }

    /// Progress percentage reported on entering the stage.
    pub fn progress(self) -> u8 {
        match self {
            Self::FetchingInput => 10,
            Self::Submitting => 30,
            Self::Polling => 50,
            Self::Downloading => 80,
            Self::Notifying => 100,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors recorded on the job
// ---------------------------------------------------------------------------

/// Structured failure reason persisted on a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    InputFetch,
    TemplateShape,
    Submit,
    Timeout,
    Backend,
    Download,
    Internal,
}

/// Broad origin of a failure, for operators deciding what to fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Configuration,
    Backend,
    Network,
    Internal,
}

impl JobErrorKind {
    pub fn category(self) -> ErrorCategory {
        match self {
            Self::TemplateShape | Self::Submit => ErrorCategory::Configuration,
            Self::Timeout | Self::Backend => ErrorCategory::Backend,
            Self::InputFetch | Self::Download => ErrorCategory::Network,
            Self::Internal => ErrorCategory::Internal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: JobErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: JobErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

// ---------------------------------------------------------------------------
// Notification annotation
// ---------------------------------------------------------------------------

/// How a result reached the chat destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMethod {
    /// The artifact itself was uploaded.
    File,
    /// A retrievable link was sent instead of the file.
    Link,
    /// Only a text notice was sent (failure, oversize without link, no media).
    Notice,
}

/// Outcome of the notification hand-off, recorded after the fact.
///
/// This never affects the job status: a failed delivery on a completed job
/// leaves it completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub target: String,
    pub delivered: bool,
    pub method: Option<DeliveryMethod>,
    /// Present when delivery failed (`NotificationDeliveryError`).
    pub error: Option<String>,
    pub at: Timestamp,
}

/// Outcome of the completion webhook call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookRecord {
    pub url: String,
    pub delivered: bool,
    /// HTTP status of the response, when one was received.
    pub status: Option<u16>,
    pub error: Option<String>,
    pub at: Timestamp,
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    #[serde(default)]
    pub stage: Option<JobStage>,
    #[serde(default)]
    pub progress: u8,
    pub prompt: String,
    pub input_image_ref: String,
    pub params: JobParams,
    #[serde(default)]
    pub backend_run_id: Option<String>,
    /// File names downloaded into the job's `output/` directory.
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub result_path: Option<PathBuf>,
    #[serde(default)]
    pub error: Option<JobError>,
    #[serde(default)]
    pub notify_target: Option<String>,
    #[serde(default)]
    pub notification: Option<NotificationRecord>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub webhook: Option<WebhookRecord>,
    /// Set by a cancellation request; observed by the worker at checkpoints.
    #[serde(default)]
    pub cancel_requested: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    #[serde(default)]
    pub started_at: Option<Timestamp>,
    #[serde(default)]
    pub finished_at: Option<Timestamp>,
}

impl Job {
    /// Build a fresh `queued` record from a validated submission.
    pub fn new(id: JobId, spec: NewJob, now: Timestamp) -> Self {
        Self {
            id,
            status: JobStatus::Queued,
            stage: None,
            progress: 0,
            prompt: spec.prompt,
            input_image_ref: spec.input_image_ref,
            params: spec.params,
            backend_run_id: None,
            files: Vec::new(),
            result_path: None,
            error: None,
            notify_target: spec.notify_target,
            notification: None,
            webhook_url: spec.webhook_url,
            webhook: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn transition(&mut self, next: JobStatus) -> Result<(), CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::Conflict(format!(
                "Job {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    /// `queued -> running`.
    pub fn start(&mut self, now: Timestamp) -> Result<(), CoreError> {
        if self.status != JobStatus::Queued {
            return Err(CoreError::Conflict(format!(
                "Job {} is {} and cannot be started",
                self.id, self.status
            )));
        }
        self.transition(JobStatus::Running)?;
        self.started_at = Some(now);
        Ok(())
    }

    /// Advance the pipeline stage of a running job. Stages never go back.
    pub fn enter_stage(&mut self, stage: JobStage) -> Result<(), CoreError> {
        if self.status != JobStatus::Running {
            return Err(CoreError::Conflict(format!(
                "Job {} is {} and cannot enter stage {stage:?}",
                self.id, self.status
            )));
        }
        if let Some(current) = self.stage {
            if stage < current {
                return Err(CoreError::Conflict(format!(
                    "Job {} cannot go back from {current:?} to {stage:?}",
                    self.id
                )));
            }
        }
        self.stage = Some(stage);
        self.progress = self.progress.max(stage.progress());
        Ok(())
    }

    /// `running -> completed` with the downloaded files and chosen artifact.
    pub fn complete(&mut self, files: Vec<String>, result_path: PathBuf, now: Timestamp) -> Result<(), CoreError> {
        self.transition(JobStatus::Completed)?;
        self.files = files;
        self.result_path = Some(result_path);
        self.error = None;
        self.progress = 100;
        self.finished_at = Some(now);
        Ok(())
    }

    /// Move to `failed` from any non-terminal status.
    pub fn fail(&mut self, error: JobError, now: Timestamp) -> Result<(), CoreError> {
        self.transition(JobStatus::Failed)?;
        self.error = Some(error);
        self.result_path = None;
        self.stage = None;
        self.finished_at = Some(now);
        Ok(())
    }

    /// Move to `canceled` from any non-terminal status.
    pub fn cancel(&mut self, now: Timestamp) -> Result<(), CoreError> {
        self.transition(JobStatus::Canceled)?;
        self.stage = None;
        self.finished_at = Some(now);
        Ok(())
    }

    /// Verify the field pairings that must hold in every persisted record.
    pub fn check_invariants(&self) -> Result<(), CoreError> {
        let completed = self.status == JobStatus::Completed;
        let failed = self.status == JobStatus::Failed;
        if self.result_path.is_some() != completed {
            return Err(CoreError::Internal(format!(
                "Job {}: result_path must be set exactly when completed (status {})",
                self.id, self.status
            )));
        }
        if self.error.is_some() != failed {
            return Err(CoreError::Internal(format!(
                "Job {}: error must be set exactly when failed (status {})",
                self.id, self.status
            )));
        }
        Ok(())
    }

    /// Whether `next` is an acceptable replacement for a terminal record.
    ///
    /// Only annotations may change once a job is terminal: status, result
    /// and error must stay as they are.
    pub fn is_idempotent_update(&self, next: &Job) -> bool {
        self.id == next.id
            && self.status == next.status
            && self.result_path == next.result_path
            && self.error == next.error
            && self.files == next.files
            && self.backend_run_id == next.backend_run_id
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
