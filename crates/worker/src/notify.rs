//! Notification hand-off.
//!
//! The worker pushes a [`NotifyRequest`] for every finished job that has
//! somewhere to report to and moves straight on to the next job. The
//! [`NotificationDispatcher`] delivers them on its own task, one at a
//! time, and records the outcome on the job. The channel between the two
//! is unbounded so delivery never pushes back on job processing.

use std::sync::Arc;

use chrono::Utc;
use im2vid_core::job::{Job, NotificationRecord, WebhookRecord};
use im2vid_core::store::JobStore;
use im2vid_core::types::JobId;
use im2vid_telegram::channel::NotificationChannel;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::webhook::WebhookDelivery;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyRequest {
    pub job_id: JobId,
    /// Chat destination, set when the chat channel should be used.
    pub target: Option<String>,
    /// Whether the job's completion webhook should be called.
    pub webhook: bool,
}

pub type NotifySender = mpsc::UnboundedSender<NotifyRequest>;
pub type NotifyReceiver = mpsc::UnboundedReceiver<NotifyRequest>;

pub fn notify_channel() -> (NotifySender, NotifyReceiver) {
    mpsc::unbounded_channel()
}

pub struct NotificationDispatcher {
    store: Arc<JobStore>,
    channel: Option<Arc<dyn NotificationChannel>>,
    webhooks: WebhookDelivery,
}

impl NotificationDispatcher {
    pub fn new(store: Arc<JobStore>) -> Self {
        Self {
            store,
            channel: None,
            webhooks: WebhookDelivery::new(),
        }
    }

    /// Deliver chat notifications through `channel`.
    pub fn with_channel(mut self, channel: Arc<dyn NotificationChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Deliver requests until the sender side is dropped or `cancel` fires.
    pub async fn run(self, mut receiver: NotifyReceiver, cancel: CancellationToken) {
        tracing::info!(chat = self.channel.is_some(), "Notification dispatcher started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Notification dispatcher shutting down");
                    break;
                }
                request = receiver.recv() => {
                    match request {
                        Some(request) => self.deliver(request).await,
                        None => {
                            tracing::info!("Notification queue closed, dispatcher exiting");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Deliver one request and annotate the job with the outcome.
    pub async fn deliver(&self, request: NotifyRequest) {
        let job = match self.store.load(&request.job_id).await {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(job_id = %request.job_id, error = %e, "Cannot load job for notification");
                return;
            }
        };

        if let (Some(target), Some(channel)) = (request.target, &self.channel) {
            let record = self.deliver_chat(channel.as_ref(), target, &job).await;
            self.annotate(&job.id, |j| j.notification = Some(record)).await;
        }

        if request.webhook {
            if let Some(url) = &job.webhook_url {
                let record = self.call_webhook(url, &job).await;
                self.annotate(&job.id, |j| j.webhook = Some(record)).await;
            }
        }
    }

    async fn deliver_chat(
        &self,
        channel: &dyn NotificationChannel,
        target: String,
        job: &Job,
    ) -> NotificationRecord {
        match channel.deliver(&target, job).await {
            Ok(method) => {
                tracing::info!(
                    job_id = %job.id,
                    target = %target,
                    method = ?method,
                    "Notification delivered",
                );
                NotificationRecord {
                    target,
                    delivered: true,
                    method: Some(method),
                    error: None,
                    at: Utc::now(),
                }
            }
            Err(e) => {
                tracing::warn!(
                    job_id = %job.id,
                    target = %target,
                    error = %e,
                    "Notification delivery failed",
                );
                NotificationRecord {
                    target,
                    delivered: false,
                    method: None,
                    error: Some(e.to_string()),
                    at: Utc::now(),
                }
            }
        }
    }

    async fn call_webhook(&self, url: &str, job: &Job) -> WebhookRecord {
        match self.webhooks.deliver(url, job).await {
            Ok(status) => {
                tracing::info!(job_id = %job.id, url, status, "Webhook called");
                WebhookRecord {
                    url: url.to_string(),
                    delivered: true,
                    status: Some(status),
                    error: None,
                    at: Utc::now(),
                }
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, url, error = %e, "Webhook call failed");
                WebhookRecord {
                    url: url.to_string(),
                    delivered: false,
                    status: e.status(),
                    error: Some(e.to_string()),
                    at: Utc::now(),
                }
            }
        }
    }

    async fn annotate(&self, id: &JobId, apply: impl FnOnce(&mut Job)) {
        let result = self
            .store
            .update(id, |j| {
                apply(j);
                Ok(())
            })
            .await;
        if let Err(e) = result {
            tracing::error!(job_id = %id, error = %e, "Failed to record notification outcome");
        }
    }
}
