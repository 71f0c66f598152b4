//! Outbound delivery of finished jobs to a chat.

use std::path::Path;

use async_trait::async_trait;
use im2vid_core::job::{DeliveryMethod, Job, JobStatus};
use im2vid_core::media;

use crate::api::{TelegramApi, TelegramApiError};

/// Bot API upload limit for bots.
pub const DEFAULT_MAX_FILE_BYTES: u64 = 50 * 1024 * 1024;

/// Delivery failed. Never affects the job's status.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Telegram delivery failed: {0}")]
    Api(#[from] TelegramApiError),

    #[error("Cannot read result file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Job is {0}; only finished jobs are delivered")]
    NotFinished(JobStatus),
}

/// Destination-agnostic delivery interface used by the worker.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Deliver the outcome of a finished job to `target`.
    async fn deliver(&self, target: &str, job: &Job) -> Result<DeliveryMethod, NotifyError>;
}

/// Sends results through a Telegram bot.
pub struct TelegramChannel {
    api: std::sync::Arc<TelegramApi>,
    max_file_bytes: u64,
    public_base_url: Option<String>,
}

impl TelegramChannel {
    pub fn new(api: std::sync::Arc<TelegramApi>) -> Self {
        Self {
            api,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            public_base_url: None,
        }
    }

    /// Artifacts above this size are sent as a link or a notice.
    pub fn with_max_file_bytes(mut self, bytes: u64) -> Self {
        self.max_file_bytes = bytes;
        self
    }

    /// Base URL used to build `/api/jobs/{id}/result` download links.
    pub fn with_public_base_url(mut self, url: Option<String>) -> Self {
        self.public_base_url = url.map(|u| u.trim_end_matches('/').to_string());
        self
    }

    pub fn result_link(&self, job: &Job) -> Option<String> {
        self.public_base_url
            .as_ref()
            .map(|base| format!("{base}/api/jobs/{}/result", job.id))
    }

    async fn deliver_result(
        &self,
        target: &str,
        job: &Job,
        path: &Path,
    ) -> Result<DeliveryMethod, NotifyError> {
        let size = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.api
                    .send_message(
                        target,
                        &format!("⚠️ Job {} finished but its result file is missing.", job.id),
                    )
                    .await?;
                return Ok(DeliveryMethod::Notice);
            }
            Err(e) => return Err(e.into()),
        };

        let caption = format!("🎥 Video ready!\n\nPrompt: {}\nJob: {}", job.prompt, job.id);

        if size > self.max_file_bytes {
            return match self.result_link(job) {
                Some(link) => {
                    self.api
                        .send_message(target, &format!("{caption}\n\nDownload: {link}"))
                        .await?;
                    Ok(DeliveryMethod::Link)
                }
                None => {
                    let mb = size as f64 / 1024.0 / 1024.0;
                    self.api
                        .send_message(
                            target,
                            &format!("⚠️ Video is too large ({mb:.1}MB) to send directly. Job: {}", job.id),
                        )
                        .await?;
                    Ok(DeliveryMethod::Notice)
                }
            };
        }

        if media::is_video(path) {
            self.api.send_video(target, path, Some(&caption)).await?;
        } else {
            self.api.send_document(target, path, Some(&caption)).await?;
        }
        Ok(DeliveryMethod::File)
    }
}

#[async_trait]
impl NotificationChannel for TelegramChannel {
    async fn deliver(&self, target: &str, job: &Job) -> Result<DeliveryMethod, NotifyError> {
        match job.status {
            JobStatus::Completed => match &job.result_path {
                Some(path) => self.deliver_result(target, job, path).await,
                None => Err(NotifyError::NotFinished(job.status)),
            },
            JobStatus::Failed => {
                let reason = job
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown error".to_string());
                self.api
                    .send_message(target, &format!("❌ Job {} failed: {reason}", job.id))
                    .await?;
                Ok(DeliveryMethod::Notice)
            }
            JobStatus::Canceled => {
                self.api
                    .send_message(target, &format!("Job {} was canceled.", job.id))
                    .await?;
                Ok(DeliveryMethod::Notice)
            }
            status => Err(NotifyError::NotFinished(status)),
        }
    }
}
