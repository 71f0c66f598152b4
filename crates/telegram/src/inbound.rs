//! Inbound chat commands.
//!
//! Recognised commands (the text may also be a photo caption):
//!
//! | Command | Effect |
//! |---|---|
//! | `/help` | usage reply |
//! | `/im2vid <prompt>` + image | stage the image, create a job notifying this chat |
//!
//! Commands may carry a `@BotName` suffix; when the bot's own username is
//! known, commands addressed to another bot are ignored. Anything else is
//! silently ignored.

use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use im2vid_core::intake::JobIntake;
use im2vid_core::params::{ImageSource, JobParams, NewJob, Resolution};
use im2vid_core::settings::RuntimeSettings;
use im2vid_core::types::JobId;
use regex::Regex;

use crate::api::{TelegramApi, TelegramApiError};
use crate::types::{Message, Update};

static COMMAND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^/([A-Za-z0-9_]+)(?:@([A-Za-z0-9_]+))?(?:\s+(.*))?$").expect("valid regex")
});

const HELP_TEXT: &str = "🎥 Image-to-video bot\n\n\
Commands:\n\
/im2vid <prompt> - generate a video from the attached image\n\
  Example: /im2vid slow camera orbit, cinematic lighting\n\
/help - show this message";

const DISABLED_TEXT: &str = "⚠️ The bot is currently disabled by the administrator.";

/// Generation parameters for jobs created from chat: landscape 720p at 16 fps.
pub fn chat_job_params() -> JobParams {
    JobParams {
        duration_seconds: 5,
        fps: 16,
        resolution: Resolution {
            width: 1280,
            height: 720,
        },
        ..JobParams::default()
    }
}

// ---------------------------------------------------------------------------
// Command parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    /// `/im2vid`, with whatever text followed it (trimmed, may be empty).
    Im2Vid(String),
}

/// Parse command text. Returns `None` for non-commands, unknown commands
/// and commands addressed to a different bot.
pub fn parse_command(text: &str, bot_username: Option<&str>) -> Option<Command> {
    let caps = COMMAND_RE.captures(text.trim())?;

    if let (Some(addressed), Some(me)) = (caps.get(2), bot_username) {
        if !addressed.as_str().eq_ignore_ascii_case(me) {
            return None;
        }
    }

    let rest = caps.get(3).map(|m| m.as_str().trim()).unwrap_or_default();
    match caps.get(1)?.as_str().to_ascii_lowercase().as_str() {
        "help" | "start" => Some(Command::Help),
        "im2vid" => Some(Command::Im2Vid(rest.to_string())),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Rejections
// ---------------------------------------------------------------------------

/// Why an inbound `/im2vid` did not create a job. Each variant is shown to
/// the sender.
#[derive(Debug, thiserror::Error)]
pub enum InboundRejection {
    #[error("Please attach an image with the /im2vid command.")]
    MissingImage,

    #[error("Usage: /im2vid <your prompt>\n\nExample: /im2vid slow camera orbit, cinematic lighting")]
    MissingPrompt,

    #[error("Could not download the attached image: {0}")]
    Download(#[from] TelegramApiError),

    #[error("Could not create the job: {0}")]
    Intake(String),
}

/// What [`InboundHandler::handle_update`] did with an update.
#[derive(Debug)]
pub enum InboundOutcome {
    Ignored,
    Disabled,
    Help,
    Rejected(InboundRejection),
    Queued(JobId),
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// Turns inbound updates into jobs. Shared by the long-poll and webhook
/// transports.
pub struct InboundHandler {
    api: Arc<TelegramApi>,
    intake: Arc<dyn JobIntake>,
    settings: Arc<RuntimeSettings>,
    bot_username: Option<String>,
}

impl InboundHandler {
    pub fn new(
        api: Arc<TelegramApi>,
        intake: Arc<dyn JobIntake>,
        settings: Arc<RuntimeSettings>,
    ) -> Self {
        Self {
            api,
            intake,
            settings,
            bot_username: None,
        }
    }

    pub fn with_bot_username(mut self, username: Option<String>) -> Self {
        self.bot_username = username;
        self
    }

    /// Parse a raw webhook body and handle it.
    pub async fn handle_payload(&self, payload: &serde_json::Value) -> InboundOutcome {
        match serde_json::from_value::<Update>(payload.clone()) {
            Ok(update) => self.handle_update(&update).await,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring malformed Telegram update");
                InboundOutcome::Ignored
            }
        }
    }

    pub async fn handle_update(&self, update: &Update) -> InboundOutcome {
        let Some(message) = &update.message else {
            return InboundOutcome::Ignored;
        };
        let chat_id = message.chat.id.to_string();

        if !self.settings.notifications_enabled().await {
            tracing::debug!(chat_id = %chat_id, "Telegram disabled, refusing inbound message");
            self.reply(&chat_id, DISABLED_TEXT).await;
            return InboundOutcome::Disabled;
        }

        let Some(command) = parse_command(message.command_text(), self.bot_username.as_deref())
        else {
            return InboundOutcome::Ignored;
        };

        match command {
            Command::Help => {
                self.reply(&chat_id, HELP_TEXT).await;
                InboundOutcome::Help
            }
            Command::Im2Vid(prompt) => match self.create_job(message, &chat_id, prompt).await {
                Ok(id) => InboundOutcome::Queued(id),
                Err(rejection) => {
                    tracing::info!(chat_id = %chat_id, reason = %rejection, "Inbound job rejected");
                    self.reply(&chat_id, &format!("⚠️ {rejection}")).await;
                    InboundOutcome::Rejected(rejection)
                }
            },
        }
    }

    async fn create_job(
        &self,
        message: &Message,
        chat_id: &str,
        prompt: String,
    ) -> Result<JobId, InboundRejection> {
        let file_id = image_file_id(message).ok_or(InboundRejection::MissingImage)?;
        if prompt.is_empty() {
            return Err(InboundRejection::MissingPrompt);
        }

        let file = self.api.get_file(file_id).await?;
        let remote_path = file
            .file_path
            .ok_or_else(|| TelegramApiError::FileUnavailable(file.file_id.clone()))?;

        let id = JobId::new();
        let dest = self.staged_path(&id, &remote_path);
        let spec = NewJob::new(prompt.clone(), ImageSource::staged_ref(&dest))
            .with_params(chat_job_params())
            .with_notify_target(chat_id);
        // Nothing is staged for a submission the job API would refuse anyway.
        spec.check()
            .map_err(|e| InboundRejection::Intake(e.to_string()))?;

        if let Err(e) = self.api.download_file(&remote_path, &dest).await {
            self.discard_staged(&id).await;
            return Err(e.into());
        }
        if let Err(e) = self.intake.submit(id, spec).await {
            self.discard_staged(&id).await;
            return Err(InboundRejection::Intake(e.to_string()));
        }

        tracing::info!(job_id = %id, chat_id = %chat_id, "Job created from Telegram");
        self.reply(
            chat_id,
            &format!("✅ Job queued: {id}\n\nPrompt: {prompt}\n\nYour video will be sent here when ready."),
        )
        .await;
        Ok(id)
    }

    fn staged_path(&self, id: &JobId, remote_path: &str) -> PathBuf {
        let ext = std::path::Path::new(remote_path)
            .extension()
            .and_then(|e| e.to_str())
            .filter(|e| !e.is_empty())
            .unwrap_or("jpg");
        self.intake.input_dir(id).join(format!("input.{ext}"))
    }

    /// Remove the staging directory of a job that was never created, and
    /// its parent if that leaves it empty.
    async fn discard_staged(&self, id: &JobId) {
        let input_dir = self.intake.input_dir(id);
        if let Err(e) = tokio::fs::remove_dir_all(&input_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(job_id = %id, error = %e, "Could not remove staged input");
            }
        }
        if let Some(parent) = input_dir.parent() {
            let _ = tokio::fs::remove_dir(parent).await;
        }
    }

    async fn reply(&self, chat_id: &str, text: &str) {
        if let Err(e) = self.api.send_message(chat_id, text).await {
            tracing::warn!(chat_id = %chat_id, error = %e, "Failed to send Telegram reply");
        }
    }
}

/// The attached image: the largest photo size, or an image document.
fn image_file_id(message: &Message) -> Option<&str> {
    if let Some(sizes) = &message.photo {
        let largest = sizes.iter().max_by_key(|p| {
            p.file_size
                .unwrap_or(u64::from(p.width) * u64::from(p.height))
        });
        if let Some(photo) = largest {
            return Some(&photo.file_id);
        }
    }

    message
        .document
        .as_ref()
        .filter(|d| {
            d.mime_type
                .as_deref()
                .is_some_and(|m| m.starts_with("image/"))
        })
        .map(|d| d.file_id.as_str())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
