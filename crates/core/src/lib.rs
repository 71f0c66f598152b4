//! Domain model and job record storage for the image-to-video pipeline.
//!
//! - [`job`]: the [`Job`](job::Job) record, its status machine and
//!   structured failure reasons.
//! - [`params`]: generation parameters, input references and submission
//!   validation.
//! - [`store`]: the file-backed [`JobStore`](store::JobStore).
//! - [`settings`]: process-wide runtime toggles persisted to disk.
//! - [`intake`]: the seam through which chat transports create jobs.

pub mod error;
pub mod intake;
pub mod job;
pub mod media;
pub mod params;
pub mod settings;
pub mod store;
pub mod types;
