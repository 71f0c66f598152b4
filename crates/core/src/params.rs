//! Generation parameters and submission validation.
//!
//! [`NewJob`] is the payload a submitter hands to the job API. It is
//! validated with `validator` before a record is written so that a
//! queued job is always well-formed; nothing downstream re-checks it.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Limits and defaults
// ---------------------------------------------------------------------------

/// Largest accepted seed (32-bit unsigned range).
pub const MAX_SEED: u64 = 4_294_967_295;

/// Resolutions the default workflow templates are tuned for.
pub const ALLOWED_RESOLUTIONS: &[&str] = &["512x512", "768x768", "1024x576", "1024x1024", "1280x720"];

pub const DEFAULT_SEED: u64 = 1;
pub const DEFAULT_DURATION_SECONDS: u32 = 5;
pub const DEFAULT_FPS: u32 = 24;
pub const DEFAULT_RESOLUTION: Resolution = Resolution {
    width: 768,
    height: 768,
};

/// URL scheme marking a file already staged on local disk.
pub const STAGED_SCHEME: &str = "file://";

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Output frame size, written as `WIDTHxHEIGHT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CoreError::Validation(format!("Invalid resolution '{s}', expected WIDTHxHEIGHT"));
        let (w, h) = s.trim().split_once(['x', 'X']).ok_or_else(invalid)?;
        let width: u32 = w.parse().map_err(|_| invalid())?;
        let height: u32 = h.parse().map_err(|_| invalid())?;
        if width == 0 || height == 0 {
            return Err(invalid());
        }
        Ok(Self { width, height })
    }
}

impl Serialize for Resolution {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Resolution {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

fn validate_resolution(resolution: &Resolution) -> Result<(), ValidationError> {
    if ALLOWED_RESOLUTIONS.contains(&resolution.to_string().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("resolution");
        err.message = Some(format!("Resolution must be one of: {}", ALLOWED_RESOLUTIONS.join(", ")).into());
        Err(err)
    }
}

// ---------------------------------------------------------------------------
// JobParams
// ---------------------------------------------------------------------------

/// Numeric generation parameters carried on every job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct JobParams {
    #[validate(range(max = MAX_SEED, message = "Seed must be 0 to 4294967295"))]
    pub seed: u64,
    #[validate(range(min = 1, max = 30, message = "Duration must be 1-30 seconds"))]
    pub duration_seconds: u32,
    #[validate(range(min = 1, max = 60, message = "FPS must be 1-60"))]
    pub fps: u32,
    #[validate(custom(function = "validate_resolution"))]
    pub resolution: Resolution,
}

impl JobParams {
    /// Total number of frames the backend should render.
    pub fn frame_count(&self) -> u32 {
        self.duration_seconds * self.fps
    }
}

impl Default for JobParams {
    fn default() -> Self {
        Self {
            seed: DEFAULT_SEED,
            duration_seconds: DEFAULT_DURATION_SECONDS,
            fps: DEFAULT_FPS,
            resolution: DEFAULT_RESOLUTION,
        }
    }
}

// ---------------------------------------------------------------------------
// Input references
// ---------------------------------------------------------------------------

/// Where the source image of a job comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// An `http(s)://` URL fetched by the worker.
    Remote(String),
    /// A file already staged on local disk (`file://` reference).
    Staged(PathBuf),
}

impl ImageSource {
    pub fn parse(reference: &str) -> Result<Self, CoreError> {
        if reference.starts_with("http://") || reference.starts_with("https://") {
            Ok(Self::Remote(reference.to_string()))
        } else if let Some(path) = reference.strip_prefix(STAGED_SCHEME) {
            if path.is_empty() {
                return Err(CoreError::Validation("Staged input path is empty".to_string()));
            }
            Ok(Self::Staged(PathBuf::from(path)))
        } else {
            Err(CoreError::Validation(format!(
                "Invalid input_image_ref scheme: '{reference}' (expected http://, https:// or file://)"
            )))
        }
    }

    /// Build a `file://` reference for a locally staged image.
    pub fn staged_ref(path: &std::path::Path) -> String {
        format!("{STAGED_SCHEME}{}", path.display())
    }
}

fn validate_webhook_url(url: &str) -> Result<(), ValidationError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        let mut err = ValidationError::new("webhook_url");
        err.message = Some("Webhook URL must start with http:// or https://".into());
        Err(err)
    }
}

fn validate_image_ref(reference: &str) -> Result<(), ValidationError> {
    ImageSource::parse(reference).map(|_| ()).map_err(|e| {
        let mut err = ValidationError::new("input_image_ref");
        err.message = Some(e.to_string().into());
        err
    })
}

// ---------------------------------------------------------------------------
// NewJob
// ---------------------------------------------------------------------------

/// Submission payload for `createJob`.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewJob {
    #[validate(length(min = 1, max = 1000, message = "Prompt must be 1-1000 characters"))]
    pub prompt: String,
    #[validate(custom(function = "validate_image_ref"))]
    pub input_image_ref: String,
    #[serde(default)]
    #[validate(nested)]
    pub params: JobParams,
    #[serde(default)]
    pub notify_target: Option<String>,
    /// Called with the job outcome once the job completes or fails.
    #[serde(default)]
    #[validate(custom(function = "validate_webhook_url"))]
    pub webhook_url: Option<String>,
}

impl NewJob {
    pub fn new(prompt: impl Into<String>, input_image_ref: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            input_image_ref: input_image_ref.into(),
            params: JobParams::default(),
            notify_target: None,
            webhook_url: None,
        }
    }

    pub fn with_params(mut self, params: JobParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_notify_target(mut self, target: impl Into<String>) -> Self {
        self.notify_target = Some(target.into());
        self
    }

    pub fn with_webhook_url(mut self, url: impl Into<String>) -> Self {
        self.webhook_url = Some(url.into());
        self
    }

    /// Run all field validators, flattening failures into a [`CoreError`].
    pub fn check(&self) -> Result<(), CoreError> {
        if self.prompt.trim().is_empty() {
            return Err(CoreError::Validation("Prompt must be 1-1000 characters".to_string()));
        }
        self.validate().map_err(|errors| CoreError::Validation(flatten_errors(&errors)))
    }
}

/// Render validation errors as `field: message` pairs, nested fields dotted.
fn flatten_errors(errors: &validator::ValidationErrors) -> String {
    let mut parts = Vec::new();
    collect_errors(errors, "", &mut parts);
    parts.sort();
    parts.join("; ")
}

fn collect_errors(errors: &validator::ValidationErrors, prefix: &str, out: &mut Vec<String>) {
    for (field, kind) in errors.errors() {
        let path = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{prefix}.{field}")
        };
        match kind {
            validator::ValidationErrorsKind::Field(list) => {
                for e in list {
                    let msg = e
                        .message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| e.code.to_string());
                    out.push(format!("{path}: {msg}"));
                }
            }
            validator::ValidationErrorsKind::Struct(nested) => collect_errors(nested, &path, out),
            validator::ValidationErrorsKind::List(items) => {
                for (idx, nested) in items {
                    collect_errors(nested, &format!("{path}[{idx}]"), out);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
