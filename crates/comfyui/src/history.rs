//! Interpretation of ComfyUI `/history/{prompt_id}` documents.
//!
//! The history endpoint returns `{}` until the prompt has been picked up,
//! then an object keyed by prompt id:
//!
//! ```json
//! { "<prompt_id>": {
//!     "status": { "status_str": "success", "completed": true, "messages": [...] },
//!     "outputs": { "<node_id>": { "gifs": [{ "filename": "...", "subfolder": "", "type": "output" }] } }
//! } }
//! ```

use serde::{Deserialize, Serialize};

/// Output media keys inspected, in preference order.
const MEDIA_KEYS: &[&str] = &["videos", "gifs", "images", "audio"];

/// Folder type ComfyUI uses for transient previews; never downloaded.
const TEMP_FOLDER: &str = "temp";

/// A file produced by a run, addressable through `/view`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// ComfyUI folder type (`output`, `input`, `temp`).
    #[serde(rename = "type", default = "default_folder")]
    pub folder: String,
    /// Node that produced the file.
    #[serde(skip)]
    pub node_id: String,
}

fn default_folder() -> String {
    "output".to_string()
}

/// Run state derived from one history poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    /// Not started, or still executing.
    Pending,
    /// Finished; carries every downloadable output.
    Done(Vec<OutputFile>),
    /// The backend reported an execution error.
    Error(String),
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Derive the [`RunStatus`] of `prompt_id` from a history document.
pub fn parse_history(prompt_id: &str, history: &serde_json::Value) -> RunStatus {
    let Some(entry) = history.get(prompt_id) else {
        return RunStatus::Pending;
    };

    let status = entry.get("status");
    let status_str = status
        .and_then(|s| s.get("status_str"))
        .and_then(|s| s.as_str());
    if status_str == Some("error") {
        return RunStatus::Error(error_message(status));
    }

    let outputs = collect_outputs(entry.get("outputs"));
    let completed = status
        .and_then(|s| s.get("completed"))
        .and_then(|c| c.as_bool())
        .unwrap_or(false);

    if !outputs.is_empty() || completed {
        RunStatus::Done(outputs)
    } else {
        RunStatus::Pending
    }
}

fn collect_outputs(outputs: Option<&serde_json::Value>) -> Vec<OutputFile> {
    let Some(nodes) = outputs.and_then(|o| o.as_object()) else {
        return Vec::new();
    };

    let mut files = Vec::new();
    for (node_id, node_output) in nodes {
        for key in MEDIA_KEYS {
            let Some(list) = node_output.get(*key).and_then(|v| v.as_array()) else {
                continue;
            };
            for item in list {
                match serde_json::from_value::<OutputFile>(item.clone()) {
                    Ok(mut file) if file.folder != TEMP_FOLDER && !file.filename.is_empty() => {
                        file.node_id = node_id.clone();
                        files.push(file);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(node_id = %node_id, error = %e, "Ignoring malformed output entry");
                    }
                }
            }
        }
    }
    files
}

/// Pull a human-readable message out of `status.messages`.
///
/// Messages are `[event_name, payload]` pairs; the `execution_error`
/// payload carries `node_type` and `exception_message`.
fn error_message(status: Option<&serde_json::Value>) -> String {
    let messages = status
        .and_then(|s| s.get("messages"))
        .and_then(|m| m.as_array());

    let Some(messages) = messages else {
        return "Unknown error".to_string();
    };

    for message in messages {
        let Some(pair) = message.as_array() else {
            continue;
        };
        if pair.first().and_then(|n| n.as_str()) != Some("execution_error") {
            continue;
        }
        let payload = pair.get(1);
        let exception = payload
            .and_then(|p| p.get("exception_message"))
            .and_then(|m| m.as_str())
            .unwrap_or("execution error");
        return match payload.and_then(|p| p.get("node_type")).and_then(|n| n.as_str()) {
            Some(node_type) => format!("{node_type}: {}", exception.trim()),
            None => exception.trim().to_string(),
        };
    }

    match messages.first() {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "Unknown error".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
