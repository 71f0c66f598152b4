//! ComfyUI REST client and workflow handling.
//!
//! Provides the HTTP API wrapper ([`api::ComfyUIApi`]), interpretation of
//! run history ([`history`]), the [`backend::GenerationBackend`] seam the
//! worker drives, and template loading/parameterization ([`workflow`]).

pub mod api;
pub mod backend;
pub mod history;
pub mod workflow;
