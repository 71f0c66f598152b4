//! Completion webhook.
//!
//! A job submitted with a `webhook_url` gets one JSON `POST` once it has
//! completed or failed:
//!
//! ```json
//! { "job_id": "...", "status": "completed", "files": ["clip.mp4"], "error": null }
//! ```
//!
//! There is a single attempt; the outcome is recorded on the job by the
//! notification dispatcher.

use std::time::Duration;

use im2vid_core::job::Job;

/// HTTP request timeout for the webhook call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// The request failed before a response arrived (network, DNS, timeout).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The receiver answered with a non-2xx status.
    #[error("Webhook returned HTTP {0}")]
    HttpStatus(u16),
}

impl WebhookError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus(status) => Some(*status),
            Self::Request(e) => e.status().map(|s| s.as_u16()),
        }
    }
}

pub struct WebhookDelivery {
    client: reqwest::Client,
}

impl WebhookDelivery {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// The JSON body sent for `job`.
    pub fn payload(job: &Job) -> serde_json::Value {
        serde_json::json!({
            "job_id": job.id,
            "status": job.status,
            "files": job.files,
            "error": job.error.as_ref().map(|e| e.message.clone()),
        })
    }

    /// POST the outcome of `job` to `url`, returning the response status.
    pub async fn deliver(&self, url: &str, job: &Job) -> Result<u16, WebhookError> {
        let response = self
            .client
            .post(url)
            .timeout(REQUEST_TIMEOUT)
            .json(&Self::payload(job))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(WebhookError::HttpStatus(status.as_u16()));
        }
        Ok(status.as_u16())
    }
}

impl Default for WebhookDelivery {
    fn default() -> Self {
        Self::new()
    }
}
