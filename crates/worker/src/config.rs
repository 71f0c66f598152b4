//! Worker configuration loaded from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use im2vid_telegram::api::DEFAULT_API_URL;
use im2vid_telegram::channel::DEFAULT_MAX_FILE_BYTES;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} has an invalid value: '{value}'")]
    Invalid { key: &'static str, value: String },
}

/// Telegram settings; present only when a bot token is configured.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub api_url: String,
    /// Initial channel toggle used when no runtime settings file exists.
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub comfyui_base_url: String,
    pub storage_root: PathBuf,
    pub workflow_path: PathBuf,
    pub poll_interval: Duration,
    pub job_timeout: Duration,
    pub queue_capacity: usize,
    /// Artifacts above this size are sent as a link instead of a file.
    pub notify_max_file_bytes: u64,
    /// Destination used for jobs submitted without one.
    pub default_notify_target: Option<String>,
    /// Base for `/api/jobs/{id}/result` links.
    pub public_base_url: Option<String>,
    pub telegram: Option<TelegramConfig>,
    pub runtime_config_path: PathBuf,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                  | Default                            |
    /// |--------------------------|------------------------------------|
    /// | `COMFYUI_BASE_URL`       | `http://127.0.0.1:8188`            |
    /// | `STORAGE_ROOT`           | `./data`                           |
    /// | `WORKFLOW_PATH`          | `./workflows/image_to_video.json`  |
    /// | `POLL_INTERVAL_SECS`     | `2`                                |
    /// | `JOB_TIMEOUT_SECS`       | `600`                              |
    /// | `QUEUE_CAPACITY`         | `64`                               |
    /// | `NOTIFY_MAX_FILE_BYTES`  | `52428800`                         |
    /// | `NOTIFY_DEFAULT_CHAT_ID` | unset                              |
    /// | `PUBLIC_BASE_URL`        | unset                              |
    /// | `TELEGRAM_BOT_TOKEN`     | unset (channel off)                |
    /// | `TELEGRAM_API_URL`       | `https://api.telegram.org`         |
    /// | `TELEGRAM_ENABLED`       | `false`                            |
    /// | `RUNTIME_CONFIG_PATH`    | `./config.json`                    |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let poll_interval_secs: u64 = parse(&lookup, "POLL_INTERVAL_SECS", 2)?;
        let job_timeout_secs: u64 = parse(&lookup, "JOB_TIMEOUT_SECS", 600)?;
        let queue_capacity: usize = parse(&lookup, "QUEUE_CAPACITY", 64)?;
        if poll_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "POLL_INTERVAL_SECS",
                value: "0".into(),
            });
        }
        if queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "QUEUE_CAPACITY",
                value: "0".into(),
            });
        }

        let telegram = get("TELEGRAM_BOT_TOKEN")
            .map(|bot_token| -> Result<TelegramConfig, ConfigError> {
                Ok(TelegramConfig {
                    bot_token,
                    api_url: or("TELEGRAM_API_URL", DEFAULT_API_URL),
                    enabled: parse_bool(&lookup, "TELEGRAM_ENABLED", false)?,
                })
            })
            .transpose()?;

        Ok(Self {
            comfyui_base_url: or("COMFYUI_BASE_URL", "http://127.0.0.1:8188"),
            storage_root: or("STORAGE_ROOT", "./data").into(),
            workflow_path: or("WORKFLOW_PATH", "./workflows/image_to_video.json").into(),
            poll_interval: Duration::from_secs(poll_interval_secs),
            job_timeout: Duration::from_secs(job_timeout_secs),
            queue_capacity,
            notify_max_file_bytes: parse(&lookup, "NOTIFY_MAX_FILE_BYTES", DEFAULT_MAX_FILE_BYTES)?,
            default_notify_target: get("NOTIFY_DEFAULT_CHAT_ID"),
            public_base_url: get("PUBLIC_BASE_URL"),
            telegram,
            runtime_config_path: or("RUNTIME_CONFIG_PATH", "./config.json").into(),
        })
    }
}

fn parse<T, F>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

fn parse_bool<F>(lookup: &F, key: &'static str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            _ => Err(ConfigError::Invalid { key, value }),
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
