//! Job API consumed by request handlers and chat transports.
//!
//! Submission writes the record and enqueues the id without waiting on
//! the worker. Everything else reads or annotates the record store, which
//! is the only state shared with the worker.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use im2vid_comfyui::api::BackendHealth;
use im2vid_comfyui::backend::GenerationBackend;
use im2vid_core::error::CoreError;
use im2vid_core::intake::JobIntake;
use im2vid_core::job::{
    ErrorCategory, Job, JobError, JobErrorKind, JobStage, JobStatus, NotificationRecord,
    WebhookRecord,
};
use im2vid_core::params::{JobParams, NewJob};
use im2vid_core::settings::RuntimeSettings;
use im2vid_core::store::JobStore;
use im2vid_core::types::{JobId, Timestamp};
use serde::Serialize;

use crate::error::JobServiceError;
use crate::queue::{JobQueue, QueueError};
use crate::stats::{StatsSnapshot, WorkerStats};

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ErrorView {
    pub kind: JobErrorKind,
    pub category: ErrorCategory,
    pub message: String,
}

impl From<&JobError> for ErrorView {
    fn from(error: &JobError) -> Self {
        Self {
            kind: error.kind,
            category: error.kind.category(),
            message: error.message.clone(),
        }
    }
}

/// Read model returned by [`JobService::get_job`].
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub id: JobId,
    pub status: JobStatus,
    pub stage: Option<JobStage>,
    pub progress: u8,
    pub prompt: String,
    pub input_image_ref: String,
    pub params: JobParams,
    pub backend_run_id: Option<String>,
    pub files: Vec<String>,
    pub result_path: Option<PathBuf>,
    pub error: Option<ErrorView>,
    pub notify_target: Option<String>,
    pub notification: Option<NotificationRecord>,
    pub webhook_url: Option<String>,
    pub webhook: Option<WebhookRecord>,
    pub cancel_requested: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            error: job.error.as_ref().map(ErrorView::from),
            id: job.id,
            status: job.status,
            stage: job.stage,
            progress: job.progress,
            prompt: job.prompt,
            input_image_ref: job.input_image_ref,
            params: job.params,
            backend_run_id: job.backend_run_id,
            files: job.files,
            result_path: job.result_path,
            notify_target: job.notify_target,
            notification: job.notification,
            webhook_url: job.webhook_url,
            webhook: job.webhook,
            cancel_requested: job.cancel_requested,
            created_at: job.created_at,
            updated_at: job.updated_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
        }
    }
}

/// Answer to a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelAck {
    /// The job had not started and is now `canceled`.
    Canceled,
    /// The worker will cancel the job at its next checkpoint.
    Requested,
    /// The result is already being downloaded; the job will finish.
    TooLate,
}

/// An opened result file.
#[derive(Debug)]
pub struct ResultArtifact {
    pub path: PathBuf,
    pub file: tokio::fs::File,
    pub size: u64,
    pub content_type: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub depth: usize,
    pub capacity: usize,
}

/// Combined view for status pages.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub queue: QueueStatus,
    pub worker: StatsSnapshot,
    pub backend: BackendHealth,
    pub notifications_enabled: bool,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub struct JobService {
    store: Arc<JobStore>,
    queue: JobQueue,
    backend: Arc<dyn GenerationBackend>,
    settings: Arc<RuntimeSettings>,
    stats: Arc<WorkerStats>,
    default_notify_target: Option<String>,
}

impl JobService {
    pub fn new(
        store: Arc<JobStore>,
        queue: JobQueue,
        backend: Arc<dyn GenerationBackend>,
        settings: Arc<RuntimeSettings>,
        stats: Arc<WorkerStats>,
    ) -> Self {
        Self {
            store,
            queue,
            backend,
            settings,
            stats,
            default_notify_target: None,
        }
    }

    /// Destination applied to submissions that do not name one.
    pub fn with_default_notify_target(mut self, target: Option<String>) -> Self {
        self.default_notify_target = target;
        self
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Validate, record and enqueue a job. Returns as soon as the id is
    /// queued.
    pub async fn create_job(&self, spec: NewJob) -> Result<JobId, JobServiceError> {
        let job = self.create_with_id(JobId::new(), spec).await?;
        Ok(job.id)
    }

    async fn create_with_id(&self, id: JobId, mut spec: NewJob) -> Result<Job, JobServiceError> {
        spec.check()?;
        if spec.notify_target.is_none() {
            spec.notify_target = self.default_notify_target.clone();
        }

        let job = self.store.create_with_id(id, spec).await?;

        match self.queue.try_enqueue(job.id) {
            Ok(()) => {
                tracing::info!(job_id = %job.id, queue_depth = self.queue.depth(), "Job queued");
                Ok(job)
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Job could not be queued");
                let reason = JobError::new(JobErrorKind::Internal, e.to_string());
                self.store.update(&job.id, |j| j.fail(reason, Utc::now())).await?;
                match e {
                    QueueError::Full(_) => Err(JobServiceError::QueueFull),
                    QueueError::Closed(_) => Err(JobServiceError::Internal(e.to_string())),
                }
            }
        }
    }

    pub async fn get_job(&self, id: &JobId) -> Result<JobView, JobServiceError> {
        Ok(self.store.load(id).await?.into())
    }

    /// All jobs, oldest first.
    pub async fn list_jobs(&self) -> Result<Vec<JobView>, JobServiceError> {
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .map(JobView::from)
            .collect())
    }

    /// Cancel a job.
    ///
    /// Queued jobs are canceled immediately. Running jobs get a flag the
    /// worker acts on at its next checkpoint, unless downloading has
    /// already started. Finished jobs yield `Conflict`.
    pub async fn cancel_job(&self, id: &JobId) -> Result<CancelAck, JobServiceError> {
        let mut ack = CancelAck::TooLate;
        self.store
            .update(id, |job| match job.status {
                JobStatus::Queued => {
                    ack = CancelAck::Canceled;
                    job.cancel(Utc::now())
                }
                JobStatus::Running => {
                    if job.stage.map_or(true, JobStage::is_cancellable) {
                        ack = CancelAck::Requested;
                        job.cancel_requested = true;
                    }
                    Ok(())
                }
                status => Err(CoreError::Conflict(format!(
                    "Job {} is already {status}",
                    job.id
                ))),
            })
            .await?;

        tracing::info!(job_id = %id, ack = ?ack, "Cancellation requested");
        Ok(ack)
    }

    /// Open the result artifact of a completed job.
    pub async fn get_result(&self, id: &JobId) -> Result<ResultArtifact, JobServiceError> {
        let job = self.store.load(id).await?;
        let path = match (job.status, job.result_path) {
            (JobStatus::Completed, Some(path)) => path,
            (status, _) => return Err(JobServiceError::NotReady(status)),
        };

        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| JobServiceError::Internal(format!("{}: {e}", path.display())))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| JobServiceError::Internal(e.to_string()))?
            .len();

        Ok(ResultArtifact {
            content_type: content_type(&path),
            path,
            file,
            size,
        })
    }

    pub async fn status_report(&self) -> StatusReport {
        StatusReport {
            queue: QueueStatus {
                depth: self.queue.depth(),
                capacity: self.queue.capacity(),
            },
            worker: self.stats.snapshot(),
            backend: self.backend.health().await,
            notifications_enabled: self.settings.notifications_enabled().await,
        }
    }
}

#[async_trait]
impl JobIntake for JobService {
    fn input_dir(&self, id: &JobId) -> PathBuf {
        self.store.input_dir(id)
    }

    async fn submit(&self, id: JobId, spec: NewJob) -> Result<Job, CoreError> {
        Ok(self.create_with_id(id, spec).await?)
    }
}

fn content_type(path: &std::path::Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("mov") => "video/quicktime",
        Some("avi") => "video/x-msvideo",
        Some("mkv") => "video/x-matroska",
        Some("gif") => "image/gif",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}
