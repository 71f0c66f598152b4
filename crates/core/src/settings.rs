//! Process-wide runtime settings.
//!
//! Settings are read through explicit accessors and persisted to a small
//! JSON file whenever they change. [`RuntimeSettings::reload`] is the only
//! point at which external edits to that file are picked up. Consumers that
//! need a consistent view for a longer operation (the worker, per job)
//! should read a value once and keep it.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::CoreError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsData {
    /// Whether the chat notification channel is active.
    #[serde(default)]
    pub notifications_enabled: bool,
}

pub struct RuntimeSettings {
    path: Option<PathBuf>,
    data: RwLock<SettingsData>,
}

impl RuntimeSettings {
    /// Load settings from `path`, falling back to `default_enabled` when the
    /// file does not exist yet.
    pub async fn load(path: impl Into<PathBuf>, default_enabled: bool) -> Result<Self, CoreError> {
        let path = path.into();
        let data = read_file(&path).await?.unwrap_or(SettingsData {
            notifications_enabled: default_enabled,
        });
        tracing::info!(
            path = %path.display(),
            notifications_enabled = data.notifications_enabled,
            "Runtime settings loaded",
        );
        Ok(Self {
            path: Some(path),
            data: RwLock::new(data),
        })
    }

    /// Settings that live only in memory (tests, embedded use).
    pub fn in_memory(notifications_enabled: bool) -> Self {
        Self {
            path: None,
            data: RwLock::new(SettingsData {
                notifications_enabled,
            }),
        }
    }

    pub async fn notifications_enabled(&self) -> bool {
        self.data.read().await.notifications_enabled
    }

    pub async fn set_notifications_enabled(&self, enabled: bool) -> Result<(), CoreError> {
        let mut data = self.data.write().await;
        data.notifications_enabled = enabled;
        if let Some(path) = &self.path {
            write_file(path, &data).await?;
        }
        tracing::info!(notifications_enabled = enabled, "Runtime settings updated");
        Ok(())
    }

    pub async fn snapshot(&self) -> SettingsData {
        self.data.read().await.clone()
    }

    /// Re-read the backing file. A missing file keeps the current values.
    pub async fn reload(&self) -> Result<(), CoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(fresh) = read_file(path).await? {
            *self.data.write().await = fresh;
        }
        Ok(())
    }
}

async fn read_file(path: &std::path::Path) -> Result<Option<SettingsData>, CoreError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_file(path: &std::path::Path, data: &SettingsData) -> Result<(), CoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    tokio::fs::write(path, serde_json::to_vec_pretty(data)?).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_uses_default() {
        let dir = tempfile::tempdir().unwrap();
        let settings = RuntimeSettings::load(dir.path().join("config.json"), true)
            .await
            .unwrap();
        assert!(settings.notifications_enabled().await);
    }

    #[tokio::test]
    async fn toggle_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let settings = RuntimeSettings::load(&path, false).await.unwrap();
        settings.set_notifications_enabled(true).await.unwrap();

        let reopened = RuntimeSettings::load(&path, false).await.unwrap();
        assert!(reopened.notifications_enabled().await);
    }

    #[tokio::test]
    async fn reload_picks_up_external_edit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let settings = RuntimeSettings::load(&path, false).await.unwrap();

        tokio::fs::write(&path, br#"{"notifications_enabled": true}"#)
            .await
            .unwrap();
        assert!(!settings.notifications_enabled().await);

        settings.reload().await.unwrap();
        assert!(settings.notifications_enabled().await);
    }

    #[tokio::test]
    async fn in_memory_settings_do_not_touch_disk() {
        let settings = RuntimeSettings::in_memory(false);
        settings.set_notifications_enabled(true).await.unwrap();
        settings.reload().await.unwrap();
        assert!(settings.snapshot().await.notifications_enabled);
    }
}
