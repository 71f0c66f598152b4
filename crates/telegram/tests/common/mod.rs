//! Shared fixtures: a fake Bot API server and a recording job intake.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use im2vid_core::error::CoreError;
use im2vid_core::intake::JobIntake;
use im2vid_core::job::Job;
use im2vid_core::params::NewJob;
use im2vid_core::types::JobId;
use serde_json::{json, Value};

pub const TOKEN: &str = "TEST";

/// Bytes served for every file download.
pub const IMAGE_BYTES: &[u8] = b"\x89PNG\r\n\x1a\nfake-image";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFile {
    pub method: String,
    pub chat_id: String,
    pub file_name: String,
    pub size: usize,
    pub caption: Option<String>,
}

#[derive(Clone, Default)]
pub struct FakeTelegram {
    pub messages: Arc<Mutex<Vec<(String, String)>>>,
    pub files: Arc<Mutex<Vec<SentFile>>>,
    pub updates: Arc<Mutex<Vec<Value>>>,
    pub offsets: Arc<Mutex<Vec<i64>>>,
    /// When set, every send method answers HTTP 500.
    pub fail_sends: Arc<Mutex<bool>>,
}

impl FakeTelegram {
    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().unwrap().clone()
    }

    pub fn files(&self) -> Vec<SentFile> {
        self.files.lock().unwrap().clone()
    }
}

fn ok(result: Value) -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!({ "ok": true, "result": result })))
}

fn server_error() -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "ok": false, "description": "boom" })),
    )
}

async fn send_message(State(state): State<FakeTelegram>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    if *state.fail_sends.lock().unwrap() {
        return server_error();
    }
    let chat_id = body["chat_id"].as_str().unwrap_or_default().to_string();
    let text = body["text"].as_str().unwrap_or_default().to_string();
    state.messages.lock().unwrap().push((chat_id, text));
    ok(json!({ "message_id": 1 }))
}

async fn record_upload(state: &FakeTelegram, method: &str, mut multipart: Multipart) -> (StatusCode, Json<Value>) {
    if *state.fail_sends.lock().unwrap() {
        return server_error();
    }
    let mut sent = SentFile {
        method: method.to_string(),
        chat_id: String::new(),
        file_name: String::new(),
        size: 0,
        caption: None,
    };
    while let Some(field) = multipart.next_field().await.unwrap() {
        match field.name().unwrap_or_default() {
            "chat_id" => sent.chat_id = field.text().await.unwrap(),
            "caption" => sent.caption = Some(field.text().await.unwrap()),
            _ => {
                sent.file_name = field.file_name().unwrap_or_default().to_string();
                sent.size = field.bytes().await.unwrap().len();
            }
        }
    }
    state.files.lock().unwrap().push(sent);
    ok(json!({ "message_id": 2 }))
}

async fn send_video(State(state): State<FakeTelegram>, multipart: Multipart) -> (StatusCode, Json<Value>) {
    record_upload(&state, "sendVideo", multipart).await
}

async fn send_document(State(state): State<FakeTelegram>, multipart: Multipart) -> (StatusCode, Json<Value>) {
    record_upload(&state, "sendDocument", multipart).await
}

async fn get_file(Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let file_id = body["file_id"].as_str().unwrap_or_default();
    if file_id == "expired" {
        return ok(json!({ "file_id": file_id }));
    }
    ok(json!({ "file_id": file_id, "file_path": format!("photos/{file_id}.png") }))
}

async fn download(Path(path): Path<String>) -> Result<Vec<u8>, StatusCode> {
    if path.starts_with("photos/") {
        Ok(IMAGE_BYTES.to_vec())
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

async fn get_updates(
    State(state): State<FakeTelegram>,
    Query(query): Query<std::collections::HashMap<String, String>>,
) -> (StatusCode, Json<Value>) {
    let offset: i64 = query.get("offset").and_then(|o| o.parse().ok()).unwrap_or(0);
    state.offsets.lock().unwrap().push(offset);
    let pending: Vec<Value> = state
        .updates
        .lock()
        .unwrap()
        .iter()
        .filter(|u| u["update_id"].as_i64().unwrap_or(0) >= offset)
        .cloned()
        .collect();
    ok(Value::Array(pending))
}

/// Start a fake Bot API on an ephemeral port; returns its base URL.
pub async fn spawn_fake_telegram() -> (String, FakeTelegram) {
    let state = FakeTelegram::default();
    let app = Router::new()
        .route(&format!("/bot{TOKEN}/sendMessage"), post(send_message))
        .route(&format!("/bot{TOKEN}/sendVideo"), post(send_video))
        .route(&format!("/bot{TOKEN}/sendDocument"), post(send_document))
        .route(&format!("/bot{TOKEN}/getFile"), post(get_file))
        .route(&format!("/bot{TOKEN}/getUpdates"), get(get_updates))
        .route(&format!("/file/bot{TOKEN}/{{*path}}"), get(download))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), state)
}

/// Records submissions instead of queueing them.
pub struct RecordingIntake {
    pub root: PathBuf,
    pub submitted: Mutex<Vec<(JobId, NewJob)>>,
    pub reject_with: Option<String>,
}

impl RecordingIntake {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            submitted: Mutex::new(Vec::new()),
            reject_with: None,
        }
    }
}

#[async_trait]
impl JobIntake for RecordingIntake {
    fn input_dir(&self, id: &JobId) -> PathBuf {
        self.root.join(id.to_string()).join("input")
    }

    async fn submit(&self, id: JobId, spec: NewJob) -> Result<Job, CoreError> {
        if let Some(reason) = &self.reject_with {
            return Err(CoreError::Validation(reason.clone()));
        }
        spec.check()?;
        self.submitted.lock().unwrap().push((id, spec.clone()));
        Ok(Job::new(id, spec, Utc::now()))
    }
}

/// A Telegram update carrying a message in chat 42.
pub fn update(update_id: i64, message: Value) -> Value {
    let mut message = message;
    message["message_id"] = json!(update_id);
    message["chat"] = json!({ "id": 42, "type": "private" });
    json!({ "update_id": update_id, "message": message })
}
