//! File-backed job record storage.
//!
//! Layout under the storage root:
//!
//! ```text
//! <root>/<job_id>/meta.json   job record (pretty JSON)
//! <root>/<job_id>/input/      staged source image
//! <root>/<job_id>/output/     files downloaded from the backend
//! ```
//!
//! Every write goes to a temporary sibling first and is renamed over
//! `meta.json`, so readers only ever see complete records. Writers are
//! serialized by a store-wide lock, which makes each [`JobStore::update`]
//! an atomic read-modify-write. Job directories are never removed here.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::CoreError;
use crate::job::Job;
use crate::params::NewJob;
use crate::types::JobId;

const META_FILE: &str = "meta.json";
const META_TMP_FILE: &str = "meta.json.tmp";
const INPUT_DIR: &str = "input";
const OUTPUT_DIR: &str = "output";

pub struct JobStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl JobStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        tracing::debug!(root = %root.display(), "Job store opened");
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn job_dir(&self, id: &JobId) -> PathBuf {
        self.root.join(id.to_string())
    }

    pub fn input_dir(&self, id: &JobId) -> PathBuf {
        self.job_dir(id).join(INPUT_DIR)
    }

    pub fn output_dir(&self, id: &JobId) -> PathBuf {
        self.job_dir(id).join(OUTPUT_DIR)
    }

    fn meta_path(&self, id: &JobId) -> PathBuf {
        self.job_dir(id).join(META_FILE)
    }

    /// Create a `queued` record under a freshly generated id.
    pub async fn create(&self, spec: NewJob) -> Result<Job, CoreError> {
        self.create_with_id(JobId::new(), spec).await
    }

    /// Create a `queued` record under a caller-chosen id.
    ///
    /// Used when files must be staged into the job directory before the
    /// record exists. Fails with `Conflict` if the id already has a record.
    pub async fn create_with_id(&self, id: JobId, spec: NewJob) -> Result<Job, CoreError> {
        let _guard = self.write_lock.lock().await;

        if tokio::fs::try_exists(self.meta_path(&id)).await? {
            return Err(CoreError::Conflict(format!("Job {id} already exists")));
        }

        tokio::fs::create_dir_all(self.input_dir(&id)).await?;
        tokio::fs::create_dir_all(self.output_dir(&id)).await?;

        let job = Job::new(id, spec, Utc::now());
        job.check_invariants()?;
        self.write(&job).await?;

        tracing::debug!(job_id = %job.id, "Job record created");
        Ok(job)
    }

    pub async fn exists(&self, id: &JobId) -> Result<bool, CoreError> {
        Ok(tokio::fs::try_exists(self.meta_path(id)).await?)
    }

    /// Load a record, failing with `NotFound` when it does not exist.
    pub async fn load(&self, id: &JobId) -> Result<Job, CoreError> {
        let bytes = match tokio::fs::read(self.meta_path(id)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CoreError::job_not_found(id));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Atomically apply `mutator` to a record and persist the result.
    ///
    /// The mutator works on a copy; if it returns an error nothing is
    /// written. The update is rejected with `Conflict` when it would move
    /// the status backwards or change anything but annotations on a
    /// terminal record.
    pub async fn update<F>(&self, id: &JobId, mutator: F) -> Result<Job, CoreError>
    where
        F: FnOnce(&mut Job) -> Result<(), CoreError>,
    {
        let _guard = self.write_lock.lock().await;

        let current = self.load(id).await?;
        let mut next = current.clone();
        mutator(&mut next)?;

        if current.is_terminal() {
            if !current.is_idempotent_update(&next) {
                return Err(CoreError::Conflict(format!(
                    "Job {id} is already {} and cannot be modified",
                    current.status
                )));
            }
        } else if !current.status.can_transition_to(next.status) {
            return Err(CoreError::Conflict(format!(
                "Job {id} cannot move from {} to {}",
                current.status, next.status
            )));
        }

        if next.id != current.id || next.created_at != current.created_at {
            return Err(CoreError::Internal(format!("Job {id}: identity fields are immutable")));
        }

        next.check_invariants()?;
        next.updated_at = Utc::now();
        self.write(&next).await?;
        Ok(next)
    }

    /// All records, oldest first.
    ///
    /// Directories without a readable record are skipped with a warning.
    pub async fn list(&self) -> Result<Vec<Job>, CoreError> {
        let mut jobs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(id) = entry.file_name().to_str().and_then(|s| s.parse::<JobId>().ok()) else {
                continue;
            };
            match self.load(&id).await {
                Ok(job) => jobs.push(job),
                Err(CoreError::NotFound { .. }) => {}
                Err(e) => {
                    tracing::warn!(job_id = %id, error = %e, "Skipping unreadable job record");
                }
            }
        }

        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn write(&self, job: &Job) -> Result<(), CoreError> {
        let dir = self.job_dir(&job.id);
        let tmp = dir.join(META_TMP_FILE);
        let bytes = serde_json::to_vec_pretty(job)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, dir.join(META_FILE)).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
