//! Shared fixtures for worker integration tests: a scripted generation
//! backend, a recording notification channel and a harness that wires the
//! job service, queue and worker over a temporary job store.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use im2vid_comfyui::api::{BackendHealth, ComfyUIApiError};
use im2vid_comfyui::backend::GenerationBackend;
use im2vid_comfyui::history::{OutputFile, RunStatus};
use im2vid_core::job::{DeliveryMethod, Job, JobStage};
use im2vid_core::params::{ImageSource, NewJob};
use im2vid_core::settings::RuntimeSettings;
use im2vid_core::store::JobStore;
use im2vid_core::types::JobId;
use im2vid_telegram::api::TelegramApiError;
use im2vid_telegram::channel::{NotificationChannel, NotifyError};
use im2vid_worker::notify::{notify_channel, NotificationDispatcher};
use im2vid_worker::queue::{job_queue, JobReceiver};
use im2vid_worker::service::JobService;
use im2vid_worker::stats::WorkerStats;
use im2vid_worker::worker::{JobWorker, WorkerOptions};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Smallest byte sequence `image::guess_format` recognises as PNG.
pub const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR\0\0\0\x01\0\0\0\x01\x08\x02\0\0\0";

// ---------------------------------------------------------------------------
// Scripted backend
// ---------------------------------------------------------------------------

/// One scripted answer to `poll`.
#[derive(Debug, Clone)]
pub enum Step {
    Pending,
    Done,
    Error(String),
    /// The history request itself fails.
    Unreachable,
}

pub struct FakeBackend {
    /// Operation log: `upload`, `submit`, `poll`, `download`.
    pub calls: Mutex<Vec<String>>,
    pub submitted: Mutex<Vec<Value>>,
    steps: Mutex<VecDeque<Step>>,
    /// Answer once the script is exhausted.
    fallback: Step,
    outputs: Vec<OutputFile>,
    sizes: HashMap<String, usize>,
    fail_submit: bool,
    /// When set, each download waits for one permit.
    download_gate: Option<Arc<Semaphore>>,
    upload_delay: Option<Duration>,
    run_counter: Mutex<u32>,
}

impl FakeBackend {
    /// Backend that finishes every run after `pending` pending polls with
    /// one 4 KiB `clip_00001.mp4`.
    pub fn finishing_after(pending: usize) -> Self {
        let mut steps: VecDeque<Step> = std::iter::repeat(Step::Pending).take(pending).collect();
        steps.push_back(Step::Done);
        Self {
            calls: Mutex::new(Vec::new()),
            submitted: Mutex::new(Vec::new()),
            steps: Mutex::new(steps),
            fallback: Step::Done,
            outputs: vec![output("clip_00001.mp4")],
            sizes: HashMap::new(),
            fail_submit: false,
            download_gate: None,
            upload_delay: None,
            run_counter: Mutex::new(0),
        }
    }

    pub fn with_script(mut self, steps: Vec<Step>, fallback: Step) -> Self {
        self.steps = Mutex::new(steps.into());
        self.fallback = fallback;
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<OutputFile>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_size(mut self, filename: &str, bytes: usize) -> Self {
        self.sizes.insert(filename.to_string(), bytes);
        self
    }

    pub fn failing_submit(mut self) -> Self {
        self.fail_submit = true;
        self
    }

    pub fn with_download_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.download_gate = Some(gate);
        self
    }

    pub fn with_upload_delay(mut self, delay: Duration) -> Self {
        self.upload_delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == op).count()
    }

    fn record(&self, op: &str) {
        self.calls.lock().unwrap().push(op.to_string());
    }
}

#[async_trait]
impl GenerationBackend for FakeBackend {
    async fn upload_image(&self, path: &Path) -> Result<String, ComfyUIApiError> {
        self.record("upload");
        if let Some(delay) = self.upload_delay {
            tokio::time::sleep(delay).await;
        }
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("input.png");
        Ok(format!("uploaded_{name}"))
    }

    async fn submit(&self, graph: &Value) -> Result<String, ComfyUIApiError> {
        self.record("submit");
        if self.fail_submit {
            return Err(ComfyUIApiError::ApiError {
                status: 500,
                body: "queue unavailable".to_string(),
            });
        }
        self.submitted.lock().unwrap().push(graph.clone());
        let mut counter = self.run_counter.lock().unwrap();
        *counter += 1;
        Ok(format!("run-{counter}"))
    }

    async fn poll(&self, _run_id: &str) -> Result<RunStatus, ComfyUIApiError> {
        self.record("poll");
        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        match step {
            Step::Pending => Ok(RunStatus::Pending),
            Step::Done => Ok(RunStatus::Done(self.outputs.clone())),
            Step::Error(message) => Ok(RunStatus::Error(message)),
            Step::Unreachable => Err(ComfyUIApiError::ApiError {
                status: 503,
                body: "restarting".to_string(),
            }),
        }
    }

    async fn download(&self, file: &OutputFile, dest: &Path) -> Result<u64, ComfyUIApiError> {
        self.record("download");
        if let Some(gate) = &self.download_gate {
            gate.acquire().await.unwrap().forget();
        }
        let size = self.sizes.get(&file.filename).copied().unwrap_or(4096);
        tokio::fs::write(dest, vec![7u8; size]).await?;
        Ok(size as u64)
    }

    async fn health(&self) -> BackendHealth {
        BackendHealth {
            reachable: true,
            latency_ms: Some(1),
            error: None,
        }
    }
}

pub fn output(filename: &str) -> OutputFile {
    OutputFile {
        filename: filename.to_string(),
        subfolder: String::new(),
        folder: "output".to_string(),
        node_id: "20".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Recording channel
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingChannel {
    pub delivered: Mutex<Vec<(String, Job)>>,
    pub fail: bool,
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    async fn deliver(&self, target: &str, job: &Job) -> Result<DeliveryMethod, NotifyError> {
        self.delivered.lock().unwrap().push((target.to_string(), job.clone()));
        if self.fail {
            return Err(NotifyError::Api(TelegramApiError::Rejected(
                "Bad Request: chat not found".to_string(),
            )));
        }
        Ok(DeliveryMethod::File)
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub fn template_doc() -> Value {
    json!({
        "version": 1,
        "slots": {
            "prompt": { "node": "6", "index": 0 },
            "image": { "node": "10", "index": 0 },
            "seed": { "node": "3", "index": 0 },
            "width": { "node": "12", "index": 1 },
            "height": { "node": "12", "index": 2 },
            "frames": { "node": "12", "index": 3 },
            "fps": { "node": "20", "index": 1 }
        },
        "graph": {
            "3": { "class_type": "KSampler", "inputs": { "seed": 0, "steps": 20, "model": ["4", 0] } },
            "6": { "class_type": "CLIPTextEncode", "inputs": { "text": "", "clip": ["4", 1] } },
            "10": { "class_type": "LoadImage", "inputs": { "image": "example.png" } },
            "12": { "class_type": "ImageToVideoLatent", "inputs": { "vae": ["4", 2], "width": 512, "height": 512, "length": 49 } },
            "20": { "class_type": "SaveVideo", "inputs": { "images": ["8", 0], "fps": 16.0 } }
        }
    })
}

pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<JobStore>,
    pub settings: Arc<RuntimeSettings>,
    pub stats: Arc<WorkerStats>,
    pub backend: Arc<FakeBackend>,
    pub service: Arc<JobService>,
    pub options: WorkerOptions,
    receiver: Option<JobReceiver>,
}

impl Harness {
    pub async fn new(backend: FakeBackend) -> Self {
        Self::with_capacity(backend, 16).await
    }

    pub async fn with_capacity(backend: FakeBackend, capacity: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JobStore::open(dir.path().join("jobs")).await.unwrap());
        let settings = Arc::new(RuntimeSettings::in_memory(true));
        let stats = Arc::new(WorkerStats::new());
        let backend = Arc::new(backend);

        let workflow_path = dir.path().join("workflow.json");
        std::fs::write(&workflow_path, serde_json::to_vec(&template_doc()).unwrap()).unwrap();

        let (queue, receiver) = job_queue(capacity);
        let service = Arc::new(JobService::new(
            Arc::clone(&store),
            queue,
            backend.clone(),
            Arc::clone(&settings),
            Arc::clone(&stats),
        ));

        Self {
            dir,
            store,
            settings,
            stats,
            backend,
            service,
            options: WorkerOptions {
                workflow_path,
                poll_interval: Duration::from_millis(10),
                job_timeout: Duration::from_secs(5),
            },
            receiver: Some(receiver),
        }
    }

    /// Write a PNG into the temp dir and return a job pointing at it.
    pub fn staged_job(&self, prompt: &str) -> NewJob {
        let path = self.dir.path().join(format!("src-{}.png", JobId::new()));
        std::fs::write(&path, PNG_BYTES).unwrap();
        NewJob::new(prompt, ImageSource::staged_ref(&path))
    }

    pub fn worker(&self) -> JobWorker {
        JobWorker::new(
            Arc::clone(&self.store),
            self.backend.clone(),
            Arc::clone(&self.settings),
            Arc::clone(&self.stats),
            self.options.clone(),
        )
    }

    /// Spawn the worker loop over the harness queue.
    pub fn spawn_worker(&mut self) -> Running {
        let worker = self.worker();
        self.spawn(worker, Vec::new())
    }

    /// Spawn the worker plus a notification dispatcher delivering to
    /// `channel`.
    pub fn spawn_with_channel(&mut self, channel: Arc<dyn NotificationChannel>) -> Running {
        let (tx, rx) = notify_channel();
        let worker = self.worker().with_notifier(tx);
        let cancel = CancellationToken::new();
        let dispatcher = NotificationDispatcher::new(Arc::clone(&self.store)).with_channel(channel);
        let handle = tokio::spawn(dispatcher.run(rx, cancel.clone()));
        let mut running = self.spawn(worker, vec![handle]);
        running.extra_cancel = Some(cancel);
        running
    }

    fn spawn(&mut self, worker: JobWorker, mut handles: Vec<JoinHandle<()>>) -> Running {
        let receiver = self.receiver.take().expect("worker already spawned");
        let cancel = CancellationToken::new();
        handles.push(tokio::spawn(worker.run(receiver, cancel.clone())));
        Running {
            cancel,
            extra_cancel: None,
            handles,
        }
    }

    pub async fn load(&self, id: &JobId) -> Job {
        self.store.load(id).await.unwrap()
    }

    /// Wait until the job is terminal.
    pub async fn wait_terminal(&self, id: &JobId) -> Job {
        self.wait_for(id, |job| job.is_terminal()).await
    }

    /// Wait until the job has entered `stage`.
    pub async fn wait_stage(&self, id: &JobId, stage: JobStage) -> Job {
        self.wait_for(id, |job| job.stage == Some(stage)).await
    }

    pub async fn wait_for(&self, id: &JobId, done: impl Fn(&Job) -> bool) -> Job {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let job = self.load(id).await;
            if done(&job) {
                return job;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting on job {id}: status {}, stage {:?}",
                job.status,
                job.stage
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub fn output_files(&self, id: &JobId) -> Vec<PathBuf> {
        let dir = self.store.output_dir(id);
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .map(|entries| entries.filter_map(|e| e.ok()).map(|e| e.path()).collect())
            .unwrap_or_default();
        files.sort();
        files
    }
}

pub struct Running {
    cancel: CancellationToken,
    extra_cancel: Option<CancellationToken>,
    handles: Vec<JoinHandle<()>>,
}

impl Running {
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Some(extra) = self.extra_cancel {
            extra.cancel();
        }
        for handle in self.handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .expect("task did not stop")
                .unwrap();
        }
    }
}
