//! Minimal Telegram Bot API client.
//!
//! Covers the methods the channel needs: `sendMessage`, `sendVideo`,
//! `sendDocument`, `getFile`, `getUpdates`, plus downloading files
//! resolved through `getFile`.

use std::path::Path;
use std::time::Duration;

use futures::StreamExt;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;

use crate::types::{ApiResponse, File, Update};

pub const DEFAULT_API_URL: &str = "https://api.telegram.org";

const MESSAGE_TIMEOUT: Duration = Duration::from_secs(10);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);
const FILE_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);
/// Slack on top of the long-poll timeout before the request itself times out.
const LONG_POLL_GRACE: Duration = Duration::from_secs(5);

/// Errors from the Telegram Bot API layer.
#[derive(Debug, thiserror::Error)]
pub enum TelegramApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Telegram returned a non-2xx status code.
    #[error("Telegram API error ({status}): {body}")]
    ApiError { status: u16, body: String },

    /// Telegram answered `ok: false`.
    #[error("Telegram rejected the call: {0}")]
    Rejected(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `getFile` did not return a downloadable path.
    #[error("File {0} is not available for download")]
    FileUnavailable(String),
}

/// HTTP client for one bot.
pub struct TelegramApi {
    client: reqwest::Client,
    api_url: String,
    token: String,
}

impl TelegramApi {
    /// * `api_url` - Bot API base, normally [`DEFAULT_API_URL`].
    pub fn new(token: impl Into<String>, api_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_url, self.token, method)
    }

    fn file_url(&self, file_path: &str) -> String {
        format!("{}/file/bot{}/{}", self.api_url, self.token, file_path)
    }

    pub async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), TelegramApiError> {
        let body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        });

        let response = self
            .client
            .post(self.method_url("sendMessage"))
            .timeout(MESSAGE_TIMEOUT)
            .json(&body)
            .send()
            .await?;

        Self::parse_response::<serde_json::Value>(response).await?;
        Ok(())
    }

    /// Upload a video file with an optional caption.
    pub async fn send_video(
        &self,
        chat_id: &str,
        path: &Path,
        caption: Option<&str>,
    ) -> Result<(), TelegramApiError> {
        self.send_file("sendVideo", "video", chat_id, path, caption)
            .await
    }

    /// Upload any file as a document.
    pub async fn send_document(
        &self,
        chat_id: &str,
        path: &Path,
        caption: Option<&str>,
    ) -> Result<(), TelegramApiError> {
        self.send_file("sendDocument", "document", chat_id, path, caption)
            .await
    }

    /// Resolve a `file_id` to its downloadable path.
    pub async fn get_file(&self, file_id: &str) -> Result<File, TelegramApiError> {
        let response = self
            .client
            .post(self.method_url("getFile"))
            .timeout(MESSAGE_TIMEOUT)
            .json(&serde_json::json!({ "file_id": file_id }))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Stream a file returned by [`get_file`](Self::get_file) to `dest`.
    pub async fn download_file(&self, file_path: &str, dest: &Path) -> Result<u64, TelegramApiError> {
        let response = self
            .client
            .get(self.file_url(file_path))
            .timeout(FILE_DOWNLOAD_TIMEOUT)
            .send()
            .await?;
        let response = Self::ensure_success(response).await?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut out = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            out.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        out.flush().await?;
        Ok(written)
    }

    /// Long-poll for updates newer than `offset`.
    pub async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout_secs: u64,
    ) -> Result<Vec<Update>, TelegramApiError> {
        let mut query = vec![("timeout", timeout_secs.to_string())];
        if let Some(offset) = offset {
            query.push(("offset", offset.to_string()));
        }

        let response = self
            .client
            .get(self.method_url("getUpdates"))
            .timeout(Duration::from_secs(timeout_secs) + LONG_POLL_GRACE)
            .query(&query)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    // ---- private helpers ----

    async fn send_file(
        &self,
        method: &str,
        field: &'static str,
        chat_id: &str,
        path: &Path,
        caption: Option<&str>,
    ) -> Result<(), TelegramApiError> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("result")
            .to_string();

        let mut form = reqwest::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .part(field, reqwest::multipart::Part::bytes(bytes).file_name(file_name));
        if let Some(caption) = caption {
            form = form.text("caption", caption.to_string());
        }

        let response = self
            .client
            .post(self.method_url(method))
            .timeout(UPLOAD_TIMEOUT)
            .multipart(form)
            .send()
            .await?;

        Self::parse_response::<serde_json::Value>(response).await?;
        Ok(())
    }

    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, TelegramApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(TelegramApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Unwrap the `{ ok, result }` envelope of a successful response.
    async fn parse_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, TelegramApiError> {
        let response = Self::ensure_success(response).await?;
        let envelope: ApiResponse<T> = response.json().await?;
        match (envelope.ok, envelope.result) {
            (true, Some(result)) => Ok(result),
            (_, _) => Err(TelegramApiError::Rejected(
                envelope
                    .description
                    .unwrap_or_else(|| "no result".to_string()),
            )),
        }
    }
}
