use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use im2vid_comfyui::api::ComfyUIApi;
use im2vid_comfyui::backend::GenerationBackend;
use im2vid_comfyui::workflow::WorkflowTemplate;
use im2vid_core::intake::JobIntake;
use im2vid_core::settings::RuntimeSettings;
use im2vid_core::store::JobStore;
use im2vid_telegram::api::TelegramApi;
use im2vid_telegram::channel::TelegramChannel;
use im2vid_telegram::inbound::InboundHandler;
use im2vid_telegram::poller::UpdatePoller;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use im2vid_worker::config::WorkerConfig;
use im2vid_worker::notify::{notify_channel, NotificationDispatcher};
use im2vid_worker::queue::job_queue;
use im2vid_worker::service::JobService;
use im2vid_worker::stats::WorkerStats;
use im2vid_worker::worker::{JobWorker, WorkerOptions};

/// How long background tasks get to wind down after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "im2vid_worker=debug,im2vid_comfyui=debug,im2vid_telegram=debug,im2vid_core=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = WorkerConfig::from_env().context("invalid configuration")?;
    tracing::info!(
        comfyui = %config.comfyui_base_url,
        storage_root = %config.storage_root.display(),
        queue_capacity = config.queue_capacity,
        telegram = config.telegram.is_some(),
        "Loaded worker configuration",
    );

    // The template is reloaded for every job; a broken file here only
    // means jobs will fail until it is fixed.
    match WorkflowTemplate::load(&config.workflow_path).await {
        Ok(_) => tracing::info!(path = %config.workflow_path.display(), "Workflow template validated"),
        Err(e) => tracing::warn!(
            path = %config.workflow_path.display(),
            error = %e,
            "Workflow template is not usable, jobs will fail until it is fixed",
        ),
    }

    // --- Storage and settings ---
    let store = Arc::new(
        JobStore::open(&config.storage_root)
            .await
            .context("failed to open job store")?,
    );
    let default_enabled = config.telegram.as_ref().is_some_and(|t| t.enabled);
    let settings = Arc::new(
        RuntimeSettings::load(&config.runtime_config_path, default_enabled)
            .await
            .context("failed to load runtime settings")?,
    );

    // --- Backend ---
    let backend: Arc<dyn GenerationBackend> = Arc::new(ComfyUIApi::new(&config.comfyui_base_url));
    let health = backend.health().await;
    if health.reachable {
        tracing::info!(latency_ms = ?health.latency_ms, "ComfyUI reachable");
    } else {
        tracing::warn!(error = ?health.error, "ComfyUI not reachable at startup");
    }

    // --- Queue, service and worker ---
    let (queue, receiver) = job_queue(config.queue_capacity);
    let stats = Arc::new(WorkerStats::new());
    let service = Arc::new(
        JobService::new(
            Arc::clone(&store),
            queue,
            Arc::clone(&backend),
            Arc::clone(&settings),
            Arc::clone(&stats),
        )
        .with_default_notify_target(config.default_notify_target.clone()),
    );

    let cancel = CancellationToken::new();
    let mut worker = JobWorker::new(
        Arc::clone(&store),
        backend,
        Arc::clone(&settings),
        Arc::clone(&stats),
        WorkerOptions {
            workflow_path: config.workflow_path.clone(),
            poll_interval: config.poll_interval,
            job_timeout: config.job_timeout,
        },
    );

    // --- Notifications: completion webhooks, plus Telegram when configured ---
    let mut handles = Vec::new();
    let (notify_tx, notify_rx) = notify_channel();
    worker = worker.with_notifier(notify_tx);
    let mut dispatcher = NotificationDispatcher::new(Arc::clone(&store));

    if let Some(telegram) = &config.telegram {
        let api = Arc::new(TelegramApi::new(&telegram.bot_token, &telegram.api_url));

        let channel = TelegramChannel::new(Arc::clone(&api))
            .with_max_file_bytes(config.notify_max_file_bytes)
            .with_public_base_url(config.public_base_url.clone());
        dispatcher = dispatcher.with_channel(Arc::new(channel));

        let intake: Arc<dyn JobIntake> = service.clone();
        let handler = Arc::new(InboundHandler::new(Arc::clone(&api), intake, Arc::clone(&settings)));
        let poller = UpdatePoller::new(api, handler, Arc::clone(&settings));
        handles.push(tokio::spawn(poller.run(cancel.clone())));

        tracing::info!("Telegram channel started");
    } else {
        tracing::info!("TELEGRAM_BOT_TOKEN not set, chat channel disabled");
    }
    handles.push(tokio::spawn(dispatcher.run(notify_rx, cancel.clone())));

    handles.push(tokio::spawn(worker.run(receiver, cancel.clone())));

    let report = service.status_report().await;
    tracing::info!(
        queue_capacity = report.queue.capacity,
        notifications_enabled = report.notifications_enabled,
        "Orchestrator ready",
    );

    shutdown_signal().await;

    // --- Shutdown ---
    cancel.cancel();
    for handle in handles {
        if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
            tracing::warn!("Background task did not stop in time");
        }
    }
    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for SIGINT (Ctrl-C) or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
