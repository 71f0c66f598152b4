//! Image-to-video job orchestration: the job API, the bounded queue and
//! the single worker that drives jobs against a ComfyUI backend.

pub mod config;
pub mod error;
pub mod input;
pub mod notify;
pub mod queue;
pub mod service;
pub mod stats;
pub mod webhook;
pub mod worker;
