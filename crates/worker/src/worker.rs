//! The single job worker.
//!
//! One long-lived task takes job ids off the queue and drives each job
//! through its stages before looking at the next id:
//!
//! ```text
//! queued -> fetching_input -> submitting -> polling -> downloading -> [notifying] -> completed
//! ```
//!
//! Any stage can end in `failed`. Cancellation is cooperative: a
//! cancellation request sets a flag on the record, and the worker checks
//! it at every stage boundary and around every poll wait. Once
//! `downloading` has begun the flag is ignored.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use im2vid_comfyui::backend::GenerationBackend;
use im2vid_comfyui::history::{OutputFile, RunStatus};
use im2vid_comfyui::workflow::WorkflowTemplate;
use im2vid_core::job::{Job, JobStage, JobStatus};
use im2vid_core::media;
use im2vid_core::settings::RuntimeSettings;
use im2vid_core::store::JobStore;
use im2vid_core::types::JobId;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;
use crate::input::InputFetcher;
use crate::notify::{NotifyRequest, NotifySender};
use crate::queue::JobReceiver;
use crate::stats::WorkerStats;

/// Timing and file locations the worker needs per job.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub workflow_path: PathBuf,
    pub poll_interval: Duration,
    pub job_timeout: Duration,
}

/// What a successful pipeline run produced.
struct Produced {
    files: Vec<String>,
    result_path: PathBuf,
}

pub struct JobWorker {
    store: Arc<JobStore>,
    backend: Arc<dyn GenerationBackend>,
    settings: Arc<RuntimeSettings>,
    stats: Arc<WorkerStats>,
    fetcher: InputFetcher,
    notifier: Option<NotifySender>,
    options: WorkerOptions,
}

impl JobWorker {
    pub fn new(
        store: Arc<JobStore>,
        backend: Arc<dyn GenerationBackend>,
        settings: Arc<RuntimeSettings>,
        stats: Arc<WorkerStats>,
        options: WorkerOptions,
    ) -> Self {
        Self {
            store,
            backend,
            settings,
            stats,
            fetcher: InputFetcher::new(),
            notifier: None,
            options,
        }
    }

    /// Forward finished jobs with a destination to a notification dispatcher.
    pub fn with_notifier(mut self, notifier: NotifySender) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Process queued jobs until `cancel` fires or the queue closes.
    pub async fn run(self, mut receiver: JobReceiver, cancel: CancellationToken) {
        tracing::info!(
            poll_interval_ms = self.options.poll_interval.as_millis() as u64,
            job_timeout_secs = self.options.job_timeout.as_secs(),
            "Job worker started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Job worker shutting down");
                    break;
                }
                next = receiver.recv() => {
                    match next {
                        Some(id) => self.process(id, &cancel).await,
                        None => {
                            tracing::info!("Job queue closed, worker exiting");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Drive one job to a terminal state. Never returns an error: every
    /// failure ends up on the record.
    pub async fn process(&self, id: JobId, shutdown: &CancellationToken) {
        let job = match self.store.load(&id).await {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(job_id = %id, error = %e, "Dequeued job cannot be loaded");
                return;
            }
        };
        if job.status != JobStatus::Queued {
            tracing::debug!(job_id = %id, status = %job.status, "Skipping job that is no longer queued");
            return;
        }

        // The channel toggle is read once so a job sees one consistent value.
        if let Err(e) = self.settings.reload().await {
            tracing::warn!(job_id = %id, error = %e, "Could not reload runtime settings, keeping current values");
        }
        let notifications_enabled = self.settings.notifications_enabled().await;

        let job = match self.store.update(&id, |j| j.start(Utc::now())).await {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(job_id = %id, error = %e, "Could not start job");
                return;
            }
        };
        let sequence = self.stats.begin(id);
        let deadline = Instant::now() + self.options.job_timeout;
        tracing::info!(job_id = %id, sequence, prompt = %job.prompt, "Job started");

        let will_notify = notifications_enabled && self.notifier.is_some() && job.notify_target.is_some();
        let outcome = self.execute(&job, will_notify, deadline, shutdown).await;

        let mut timed_out = false;
        let finished = match outcome {
            Ok(produced) => {
                self.store
                    .update(&id, |j| j.complete(produced.files, produced.result_path, Utc::now()))
                    .await
            }
            Err(PipelineError::Canceled) => self.store.load(&id).await,
            Err(e) => {
                timed_out = matches!(e, PipelineError::Timeout(_));
                let error = e.to_job_error();
                tracing::error!(job_id = %id, kind = ?error.kind, error = %e, "Job failed");
                self.store.update(&id, |j| j.fail(error, Utc::now())).await
            }
        };

        let job = match finished {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(job_id = %id, error = %e, "Could not record job outcome");
                self.stats.finish(JobStatus::Failed, false);
                return;
            }
        };
        self.stats.finish(job.status, timed_out);
        tracing::info!(job_id = %id, sequence, status = %job.status, "Job finished");

        if matches!(job.status, JobStatus::Completed | JobStatus::Failed) {
            self.hand_off(&job, will_notify);
        }
    }

    /// Queue chat delivery (when due) and the completion webhook (when the
    /// job has one) for the dispatcher.
    fn hand_off(&self, job: &Job, will_notify: bool) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let target = job.notify_target.clone().filter(|_| will_notify);
        let webhook = job.webhook_url.is_some();
        if target.is_none() && !webhook {
            return;
        }
        let request = NotifyRequest {
            job_id: job.id,
            target,
            webhook,
        };
        if notifier.send(request).is_err() {
            tracing::warn!(job_id = %job.id, "Notification dispatcher is gone, result not delivered");
        }
    }

    async fn execute(
        &self,
        job: &Job,
        will_notify: bool,
        deadline: Instant,
        shutdown: &CancellationToken,
    ) -> Result<Produced, PipelineError> {
        let id = job.id;

        // -- fetching input --
        self.checkpoint(&id, JobStage::FetchingInput).await?;
        let input = self
            .fetcher
            .fetch(&job.input_image_ref, &self.store.input_dir(&id))
            .await?;

        // -- submitting --
        self.checkpoint(&id, JobStage::Submitting).await?;
        let template = WorkflowTemplate::load(&self.options.workflow_path).await?;
        let image_name = if template.has_slot("image") {
            Some(
                self.backend
                    .upload_image(&input)
                    .await
                    .map_err(PipelineError::Upload)?,
            )
        } else {
            None
        };
        let graph = template.parameterize(&job.prompt, &job.params, image_name.as_deref())?;
        let run_id = self
            .backend
            .submit(&graph)
            .await
            .map_err(PipelineError::Submit)?;
        tracing::info!(job_id = %id, prompt_id = %run_id, "Workflow submitted");
        self.store
            .update(&id, |j| {
                j.backend_run_id = Some(run_id.clone());
                Ok(())
            })
            .await?;

        // -- polling --
        self.checkpoint(&id, JobStage::Polling).await?;
        let outputs = self.wait_for_outputs(&id, &run_id, deadline, shutdown).await?;
        if outputs.is_empty() {
            return Err(PipelineError::Backend("run finished without outputs".to_string()));
        }

        // -- downloading --
        self.checkpoint(&id, JobStage::Downloading).await?;
        let files = self.download_all(&id, &outputs).await?;
        let result_name = media::select_result(&files)
            .cloned()
            .ok_or_else(|| PipelineError::Download("no files downloaded".to_string()))?;
        let result_path = self.store.output_dir(&id).join(&result_name);
        match tokio::fs::metadata(&result_path).await {
            Ok(meta) if meta.len() > 0 => {}
            Ok(_) => return Err(PipelineError::Download(format!("{result_name} is empty"))),
            Err(e) => return Err(PipelineError::Download(format!("{result_name}: {e}"))),
        }

        // -- notifying --
        if will_notify {
            self.checkpoint(&id, JobStage::Notifying).await?;
        }

        Ok(Produced { files, result_path })
    }

    /// Enter `stage`, or cancel the job if a cancellation is pending and
    /// the job has not reached `downloading` yet.
    async fn checkpoint(&self, id: &JobId, stage: JobStage) -> Result<(), PipelineError> {
        let mut canceled = false;
        self.store
            .update(id, |job| {
                let cancellable = job.stage.map_or(true, JobStage::is_cancellable);
                if job.cancel_requested && cancellable {
                    canceled = true;
                    job.cancel(Utc::now())
                } else {
                    job.enter_stage(stage)
                }
            })
            .await?;

        if canceled {
            tracing::info!(job_id = %id, before = ?stage, "Job canceled at checkpoint");
            return Err(PipelineError::Canceled);
        }
        tracing::debug!(job_id = %id, stage = ?stage, "Entered stage");
        Ok(())
    }

    /// Cancel the job if a request is pending. Used around poll waits.
    async fn check_cancel(&self, id: &JobId) -> Result<(), PipelineError> {
        if !self.store.load(id).await?.cancel_requested {
            return Ok(());
        }
        self.store.update(id, |job| job.cancel(Utc::now())).await?;
        tracing::info!(job_id = %id, "Job canceled while polling");
        Err(PipelineError::Canceled)
    }

    /// Poll at the configured cadence until the run is terminal or the
    /// job deadline passes. The deadline is counted from job start, so time
    /// spent fetching, uploading and submitting uses it up too. Failed
    /// history requests are retried on the next tick.
    async fn wait_for_outputs(
        &self,
        id: &JobId,
        run_id: &str,
        deadline: Instant,
        shutdown: &CancellationToken,
    ) -> Result<Vec<OutputFile>, PipelineError> {
        if Instant::now() >= deadline {
            return Err(PipelineError::Timeout(self.options.job_timeout));
        }
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match self.backend.poll(run_id).await {
                Ok(RunStatus::Done(outputs)) => {
                    tracing::info!(job_id = %id, attempt, outputs = outputs.len(), "Run finished");
                    return Ok(outputs);
                }
                Ok(RunStatus::Error(message)) => return Err(PipelineError::Backend(message)),
                Ok(RunStatus::Pending) => {
                    tracing::trace!(job_id = %id, attempt, "Run still pending");
                }
                Err(e) => {
                    tracing::warn!(job_id = %id, attempt, error = %e, "History poll failed, will retry");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(PipelineError::Timeout(self.options.job_timeout));
            }

            self.check_cancel(id).await?;
            let wait = self.options.poll_interval.min(deadline - now);
            tokio::select! {
                _ = shutdown.cancelled() => return Err(PipelineError::Shutdown),
                _ = tokio::time::sleep(wait) => {}
            }
            self.check_cancel(id).await?;
        }
    }

    /// Fetch every output into the job's `output/` directory.
    async fn download_all(&self, id: &JobId, outputs: &[OutputFile]) -> Result<Vec<String>, PipelineError> {
        let out_dir = self.store.output_dir(id);
        tokio::fs::create_dir_all(&out_dir)
            .await
            .map_err(|e| PipelineError::Download(e.to_string()))?;

        let mut names: Vec<String> = Vec::with_capacity(outputs.len());
        for (index, output) in outputs.iter().enumerate() {
            let name = local_name(&output.filename, index, &names);
            let written = self
                .backend
                .download(output, &out_dir.join(&name))
                .await
                .map_err(|e| PipelineError::Download(format!("{}: {e}", output.filename)))?;
            tracing::debug!(job_id = %id, file = %name, bytes = written, "Output downloaded");
            names.push(name);
        }
        Ok(names)
    }
}

/// File name to store an output under: the bare name reported by the
/// backend, prefixed with its index if that name is already taken.
fn local_name(remote: &str, index: usize, taken: &[String]) -> String {
    let base = Path::new(remote)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("output_{index}"));
    if taken.contains(&base) {
        format!("{index}_{base}")
    } else {
        base
    }
}
