//! Seam through which chat transports turn inbound commands into jobs.
//!
//! A transport first stages the source image into
//! [`JobIntake::input_dir`] for a freshly generated [`JobId`], then calls
//! [`JobIntake::submit`] with a `file://` reference to that file. The
//! implementation writes the record and enqueues it for the worker.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::CoreError;
use crate::job::Job;
use crate::params::NewJob;
use crate::types::JobId;

#[async_trait]
pub trait JobIntake: Send + Sync {
    /// Directory where the input image for `id` must be staged.
    fn input_dir(&self, id: &JobId) -> PathBuf;

    /// Validate, record and enqueue a job under the given id.
    async fn submit(&self, id: JobId, spec: NewJob) -> Result<Job, CoreError>;
}
