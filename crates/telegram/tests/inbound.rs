//! Inbound command handling and the long-poll transport.

mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use common::{spawn_fake_telegram, update, RecordingIntake, IMAGE_BYTES, TOKEN};
use im2vid_core::intake::JobIntake;
use im2vid_core::params::{ImageSource, Resolution};
use im2vid_core::settings::RuntimeSettings;
use im2vid_telegram::api::TelegramApi;
use im2vid_telegram::inbound::{InboundHandler, InboundOutcome, InboundRejection};
use im2vid_telegram::poller::UpdatePoller;
use im2vid_telegram::types::Update;
use serde_json::json;

struct Fixture {
    _dir: tempfile::TempDir,
    fake: common::FakeTelegram,
    api: Arc<TelegramApi>,
    intake: Arc<RecordingIntake>,
    settings: Arc<RuntimeSettings>,
    handler: Arc<InboundHandler>,
}

async fn fixture(enabled: bool) -> Fixture {
    let (url, fake) = spawn_fake_telegram().await;
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(TelegramApi::new(TOKEN, url));
    let intake = Arc::new(RecordingIntake::new(dir.path().to_path_buf()));
    let settings = Arc::new(RuntimeSettings::in_memory(enabled));
    let handler = Arc::new(
        InboundHandler::new(api.clone(), intake.clone(), settings.clone())
            .with_bot_username(Some("im2vid_bot".to_string())),
    );
    Fixture {
        _dir: dir,
        fake,
        api,
        intake,
        settings,
        handler,
    }
}

fn parse(value: serde_json::Value) -> Update {
    serde_json::from_value(value).unwrap()
}

fn photo_message(caption: &str) -> serde_json::Value {
    json!({
        "caption": caption,
        "photo": [
            { "file_id": "thumb", "width": 90, "height": 90, "file_size": 900 },
            { "file_id": "full", "width": 1280, "height": 1280, "file_size": 120000 }
        ]
    })
}

// ---------------------------------------------------------------------------
// Test: /im2vid with a photo stages the image and creates a job
// ---------------------------------------------------------------------------

#[tokio::test]
async fn im2vid_with_photo_creates_job() {
    let f = fixture(true).await;

    let outcome = f
        .handler
        .handle_update(&parse(update(1, photo_message("/im2vid slow orbit, cinematic"))))
        .await;

    let id = match outcome {
        InboundOutcome::Queued(id) => id,
        other => panic!("expected a queued job, got {other:?}"),
    };

    let submitted = f.intake.submitted.lock().unwrap().clone();
    assert_eq!(submitted.len(), 1);
    let (submitted_id, spec) = &submitted[0];
    assert_eq!(*submitted_id, id);
    assert_eq!(spec.prompt, "slow orbit, cinematic");
    assert_eq!(spec.notify_target.as_deref(), Some("42"));
    assert_eq!(spec.params.fps, 16);
    assert_eq!(spec.params.duration_seconds, 5);
    assert_eq!(spec.params.resolution, Resolution { width: 1280, height: 720 });

    // The largest photo was downloaded into the job's input directory.
    let staged = f.intake.input_dir(&id).join("input.png");
    assert_eq!(std::fs::read(&staged).unwrap(), IMAGE_BYTES);
    assert_eq!(
        ImageSource::parse(&spec.input_image_ref).unwrap(),
        ImageSource::Staged(staged)
    );

    // The chat got an acknowledgement carrying the job id.
    let messages = f.fake.messages();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].1.contains(&id.to_string()));
}

// ---------------------------------------------------------------------------
// Test: malformed commands are rejected with a reply and no job
// ---------------------------------------------------------------------------

#[tokio::test]
async fn im2vid_without_image_is_rejected() {
    let f = fixture(true).await;

    let outcome = f
        .handler
        .handle_update(&parse(update(2, json!({ "text": "/im2vid orbit" }))))
        .await;

    assert_matches!(outcome, InboundOutcome::Rejected(InboundRejection::MissingImage));
    assert!(f.intake.submitted.lock().unwrap().is_empty());
    assert!(f.fake.messages()[0].1.contains("attach an image"));
}

#[tokio::test]
async fn im2vid_without_prompt_is_rejected() {
    let f = fixture(true).await;

    let outcome = f
        .handler
        .handle_update(&parse(update(3, photo_message("/im2vid"))))
        .await;

    assert_matches!(outcome, InboundOutcome::Rejected(InboundRejection::MissingPrompt));
    assert!(f.intake.submitted.lock().unwrap().is_empty());
    assert!(f.fake.messages()[0].1.contains("Usage"));
}

#[tokio::test]
async fn unavailable_file_is_rejected() {
    let f = fixture(true).await;
    let message = json!({
        "caption": "/im2vid orbit",
        "photo": [{ "file_id": "expired", "width": 10, "height": 10 }]
    });

    let outcome = f.handler.handle_update(&parse(update(4, message))).await;

    assert_matches!(outcome, InboundOutcome::Rejected(InboundRejection::Download(_)));
    assert!(f.intake.submitted.lock().unwrap().is_empty());
}

#[tokio::test]
async fn intake_refusal_is_reported_to_chat() {
    let (url, fake) = spawn_fake_telegram().await;
    let dir = tempfile::tempdir().unwrap();
    let mut intake = RecordingIntake::new(dir.path().to_path_buf());
    intake.reject_with = Some("queue is full".to_string());
    let handler = InboundHandler::new(
        Arc::new(TelegramApi::new(TOKEN, url)),
        Arc::new(intake),
        Arc::new(RuntimeSettings::in_memory(true)),
    );

    let outcome = handler
        .handle_update(&parse(update(5, photo_message("/im2vid orbit"))))
        .await;

    assert_matches!(outcome, InboundOutcome::Rejected(InboundRejection::Intake(_)));
    assert!(fake.messages()[0].1.contains("queue is full"));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn overlong_prompt_is_rejected_before_staging() {
    let f = fixture(true).await;
    let caption = format!("/im2vid {}", "a".repeat(1001));

    let outcome = f
        .handler
        .handle_update(&parse(update(9, photo_message(&caption))))
        .await;

    assert_matches!(outcome, InboundOutcome::Rejected(InboundRejection::Intake(msg)) if msg.contains("prompt"));
    assert!(f.intake.submitted.lock().unwrap().is_empty());
    assert_eq!(std::fs::read_dir(&f.intake.root).unwrap().count(), 0);
}

// ---------------------------------------------------------------------------
// Test: /help, disabled channel, plain chatter
// ---------------------------------------------------------------------------

#[tokio::test]
async fn help_replies_with_usage() {
    let f = fixture(true).await;

    let outcome = f
        .handler
        .handle_update(&parse(update(6, json!({ "text": "/help@im2vid_bot" }))))
        .await;

    assert_matches!(outcome, InboundOutcome::Help);
    assert!(f.fake.messages()[0].1.contains("/im2vid"));
}

#[tokio::test]
async fn disabled_channel_replies_and_creates_nothing() {
    let f = fixture(false).await;

    let outcome = f
        .handler
        .handle_update(&parse(update(7, photo_message("/im2vid orbit"))))
        .await;

    assert_matches!(outcome, InboundOutcome::Disabled);
    assert!(f.intake.submitted.lock().unwrap().is_empty());
    assert!(f.fake.messages()[0].1.contains("disabled"));
}

#[tokio::test]
async fn plain_text_is_ignored_silently() {
    let f = fixture(true).await;

    let outcome = f
        .handler
        .handle_update(&parse(update(8, json!({ "text": "nice bot" }))))
        .await;

    assert_matches!(outcome, InboundOutcome::Ignored);
    assert!(f.fake.messages().is_empty());
}

#[tokio::test]
async fn malformed_webhook_payload_is_ignored() {
    let f = fixture(true).await;

    let outcome = f.handler.handle_payload(&json!({ "not": "an update" })).await;

    assert_matches!(outcome, InboundOutcome::Ignored);
}

// ---------------------------------------------------------------------------
// Test: the poller feeds updates to the handler and advances its offset
// ---------------------------------------------------------------------------

#[tokio::test]
async fn poller_handles_updates_and_advances_offset() {
    let f = fixture(true).await;
    f.fake
        .updates
        .lock()
        .unwrap()
        .extend([update(10, json!({ "text": "/help" })), update(11, photo_message("/im2vid orbit"))]);

    let mut poller = UpdatePoller::new(f.api.clone(), f.handler.clone(), f.settings.clone())
        .with_long_poll_secs(0);
    assert_eq!(poller.poll_once().await, None);

    assert_eq!(poller.last_update_id(), 11);
    assert_eq!(f.intake.submitted.lock().unwrap().len(), 1);
    assert_eq!(f.fake.offsets.lock().unwrap().as_slice(), &[1]);

    // Already-handled updates are not fetched again.
    poller.poll_once().await;
    assert_eq!(f.fake.offsets.lock().unwrap().as_slice(), &[1, 12]);
    assert_eq!(f.intake.submitted.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn poller_sees_toggle_edited_on_disk() {
    let f = fixture(true).await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    let settings = Arc::new(RuntimeSettings::load(&path, true).await.unwrap());
    std::fs::write(&path, br#"{"notifications_enabled": false}"#).unwrap();

    let mut poller = UpdatePoller::new(f.api.clone(), f.handler.clone(), settings.clone());
    assert!(poller.poll_once().await.is_some());
    assert!(!settings.notifications_enabled().await);
    assert!(f.fake.offsets.lock().unwrap().is_empty());
}

#[tokio::test]
async fn poller_idles_while_disabled() {
    let f = fixture(false).await;

    let mut poller = UpdatePoller::new(f.api.clone(), f.handler.clone(), f.settings.clone());
    assert!(poller.poll_once().await.is_some());
    assert!(f.fake.offsets.lock().unwrap().is_empty());
}
