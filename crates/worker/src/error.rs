//! Error types of the worker crate.
//!
//! [`PipelineError`] never escapes the worker loop: it is folded into the
//! job record as a [`JobError`]. [`JobServiceError`] is what callers of the
//! job API see.

use std::time::Duration;

use im2vid_comfyui::api::ComfyUIApiError;
use im2vid_comfyui::workflow::TemplateShapeError;
use im2vid_core::error::CoreError;
use im2vid_core::job::{JobError, JobErrorKind, JobStatus};

use crate::input::InputFetchError;

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("input fetch failed: {0}")]
    InputFetch(#[from] InputFetchError),

    #[error("workflow template error: {0}")]
    TemplateShape(#[from] TemplateShapeError),

    #[error("uploading input image failed: {0}")]
    Upload(#[source] ComfyUIApiError),

    #[error("workflow submission failed: {0}")]
    Submit(#[source] ComfyUIApiError),

    #[error("no result after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("backend reported an error: {0}")]
    Backend(String),

    #[error("download failed: {0}")]
    Download(String),

    /// Cancellation was observed; the record is already `canceled`.
    #[error("job canceled")]
    Canceled,

    #[error("worker stopped before the job finished")]
    Shutdown,

    #[error("job store error: {0}")]
    Store(#[from] CoreError),
}

impl PipelineError {
    pub fn kind(&self) -> JobErrorKind {
        match self {
            Self::InputFetch(_) => JobErrorKind::InputFetch,
            Self::TemplateShape(_) => JobErrorKind::TemplateShape,
            Self::Upload(_) | Self::Submit(_) => JobErrorKind::Submit,
            Self::Timeout(_) => JobErrorKind::Timeout,
            Self::Backend(_) => JobErrorKind::Backend,
            Self::Download(_) => JobErrorKind::Download,
            Self::Canceled | Self::Shutdown | Self::Store(_) => JobErrorKind::Internal,
        }
    }

    pub fn to_job_error(&self) -> JobError {
        JobError::new(self.kind(), self.to_string())
    }
}

// ---------------------------------------------------------------------------
// Job API
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum JobServiceError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Validation(String),

    /// The job has no result yet (or never will).
    #[error("job is {0}, result not available")]
    NotReady(JobStatus),

    #[error("job queue is full, try again later")]
    QueueFull,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<CoreError> for JobServiceError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotFound { .. } => Self::NotFound(err.to_string()),
            CoreError::Validation(msg) => Self::Validation(msg),
            CoreError::Conflict(msg) => Self::Conflict(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<JobServiceError> for CoreError {
    fn from(err: JobServiceError) -> Self {
        match err {
            JobServiceError::NotFound(msg) => CoreError::Internal(msg),
            JobServiceError::Conflict(msg) => CoreError::Conflict(msg),
            JobServiceError::Validation(msg) => CoreError::Validation(msg),
            other => CoreError::Internal(other.to_string()),
        }
    }
}
