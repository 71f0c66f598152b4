//! `getUpdates` long-poll transport.
//!
//! Alternative to a webhook: repeatedly asks Telegram for new updates and
//! hands each one to the [`InboundHandler`]. While the channel is disabled
//! the poller idles instead of consuming updates.

use std::sync::Arc;
use std::time::Duration;

use im2vid_core::settings::RuntimeSettings;
use tokio_util::sync::CancellationToken;

use crate::api::TelegramApi;
use crate::inbound::InboundHandler;

/// Seconds Telegram holds a `getUpdates` request open.
const LONG_POLL_SECS: u64 = 30;

/// Pause while the channel is disabled.
const DISABLED_SLEEP: Duration = Duration::from_secs(5);

/// Pause after a failed `getUpdates` call.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

pub struct UpdatePoller {
    api: Arc<TelegramApi>,
    handler: Arc<InboundHandler>,
    settings: Arc<RuntimeSettings>,
    /// Highest update id handled so far.
    last_update_id: i64,
    long_poll_secs: u64,
}

impl UpdatePoller {
    pub fn new(
        api: Arc<TelegramApi>,
        handler: Arc<InboundHandler>,
        settings: Arc<RuntimeSettings>,
    ) -> Self {
        Self {
            api,
            handler,
            settings,
            last_update_id: 0,
            long_poll_secs: LONG_POLL_SECS,
        }
    }

    /// Shorter long-poll windows make shutdown and tests snappier.
    pub fn with_long_poll_secs(mut self, secs: u64) -> Self {
        self.long_poll_secs = secs;
        self
    }

    pub fn last_update_id(&self) -> i64 {
        self.last_update_id
    }

    /// Run until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!("Telegram poller started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Telegram poller stopping");
                    break;
                }
                pause = self.poll_once() => {
                    if let Some(pause) = pause {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(pause) => {}
                        }
                    }
                }
            }
        }
    }

    /// One poll cycle. Returns how long to pause before the next one.
    pub async fn poll_once(&mut self) -> Option<Duration> {
        if let Err(e) = self.settings.reload().await {
            tracing::warn!(error = %e, "Could not reload runtime settings, keeping current values");
        }
        if !self.settings.notifications_enabled().await {
            tracing::trace!("Telegram disabled, poller idle");
            return Some(DISABLED_SLEEP);
        }

        let offset = self.last_update_id + 1;
        let updates = match self.api.get_updates(Some(offset), self.long_poll_secs).await {
            Ok(updates) => updates,
            Err(e) => {
                tracing::warn!(error = %e, "getUpdates failed, backing off");
                return Some(ERROR_BACKOFF);
            }
        };

        if !updates.is_empty() {
            tracing::debug!(count = updates.len(), offset, "Received Telegram updates");
        }

        for update in updates {
            self.last_update_id = self.last_update_id.max(update.update_id);
            let outcome = self.handler.handle_update(&update).await;
            tracing::debug!(update_id = update.update_id, ?outcome, "Handled Telegram update");
        }
        None
    }
}
