//! Worker counters and the currently processed job.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use im2vid_core::job::JobStatus;
use im2vid_core::types::{JobId, Timestamp};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct ActiveJob {
    pub id: JobId,
    /// Position of this job in processing order, starting at 1.
    pub sequence: u64,
    pub started_at: Timestamp,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub canceled: u64,
    pub active: Option<ActiveJob>,
}

#[derive(Debug, Default)]
pub struct WorkerStats {
    sequence: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    canceled: AtomicU64,
    active: Mutex<Option<ActiveJob>>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `id` as the job in progress; returns its sequence number.
    pub fn begin(&self, id: JobId) -> u64 {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut active) = self.active.lock() {
            *active = Some(ActiveJob {
                id,
                sequence,
                started_at: Utc::now(),
            });
        }
        sequence
    }

    /// Clear the active job and count its outcome.
    pub fn finish(&self, status: JobStatus, timed_out: bool) {
        if let Ok(mut active) = self.active.lock() {
            *active = None;
        }
        let counter = match status {
            JobStatus::Completed => &self.succeeded,
            JobStatus::Canceled => &self.canceled,
            _ if timed_out => &self.timed_out,
            _ => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active(&self) -> Option<ActiveJob> {
        self.active.lock().ok().and_then(|a| a.clone())
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            processed: self.sequence.load(Ordering::SeqCst),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            canceled: self.canceled.load(Ordering::Relaxed),
            active: self.active(),
        }
    }
}
