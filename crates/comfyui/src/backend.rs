//! The generation backend seam used by the worker loop.
//!
//! [`ComfyUIApi`] is the production implementation; tests substitute
//! scripted fakes.

use std::path::Path;

use async_trait::async_trait;

use crate::api::{BackendHealth, ComfyUIApi, ComfyUIApiError};
use crate::history::{parse_history, OutputFile, RunStatus};

/// Operations the worker needs from a generative backend.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Make a local input image available to workflows; returns the name
    /// to inject into the template.
    async fn upload_image(&self, path: &Path) -> Result<String, ComfyUIApiError>;

    /// Queue a parameterized graph; returns the run identifier.
    async fn submit(&self, graph: &serde_json::Value) -> Result<String, ComfyUIApiError>;

    /// One status check for a submitted run.
    async fn poll(&self, run_id: &str) -> Result<RunStatus, ComfyUIApiError>;

    /// Fetch one produced file into `dest`; returns bytes written.
    async fn download(&self, file: &OutputFile, dest: &Path) -> Result<u64, ComfyUIApiError>;

    /// Reachability probe for status reporting.
    async fn health(&self) -> BackendHealth;
}

#[async_trait]
impl GenerationBackend for ComfyUIApi {
    async fn upload_image(&self, path: &Path) -> Result<String, ComfyUIApiError> {
        ComfyUIApi::upload_image(self, path).await
    }

    async fn submit(&self, graph: &serde_json::Value) -> Result<String, ComfyUIApiError> {
        let response = self.submit_workflow(graph).await?;
        tracing::debug!(
            prompt_id = %response.prompt_id,
            queue_position = response.number,
            "Workflow queued on ComfyUI",
        );
        Ok(response.prompt_id)
    }

    async fn poll(&self, run_id: &str) -> Result<RunStatus, ComfyUIApiError> {
        let history = self.get_history(run_id).await?;
        Ok(parse_history(run_id, &history))
    }

    async fn download(&self, file: &OutputFile, dest: &Path) -> Result<u64, ComfyUIApiError> {
        self.download_output(file, dest).await
    }

    async fn health(&self) -> BackendHealth {
        ComfyUIApi::health(self).await
    }
}
