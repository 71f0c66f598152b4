//! Bounded FIFO hand-off of job ids from submitters to the worker.
//!
//! Submitters never wait: [`JobQueue::try_enqueue`] fails immediately when
//! the queue is full. The single [`JobReceiver`] belongs to the worker.

use im2vid_core::types::JobId;
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("job queue is full")]
    Full(JobId),
    #[error("job queue is closed")]
    Closed(JobId),
}

/// Producer side; cheap to clone.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<JobId>,
}

/// Consumer side, owned by the worker loop.
pub struct JobReceiver {
    rx: mpsc::Receiver<JobId>,
}

/// Create a queue holding at most `capacity` pending ids.
pub fn job_queue(capacity: usize) -> (JobQueue, JobReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (JobQueue { tx }, JobReceiver { rx })
}

impl JobQueue {
    pub fn try_enqueue(&self, id: JobId) -> Result<(), QueueError> {
        self.tx.try_send(id).map_err(|e| match e {
            mpsc::error::TrySendError::Full(id) => QueueError::Full(id),
            mpsc::error::TrySendError::Closed(id) => QueueError::Closed(id),
        })
    }

    /// Ids waiting to be dequeued.
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}

impl JobReceiver {
    /// Wait for the next id; `None` once every producer is gone.
    pub async fn recv(&mut self) -> Option<JobId> {
        self.rx.recv().await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
