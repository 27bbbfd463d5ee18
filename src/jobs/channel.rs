//! Bounded job hand-off between the fetcher and the workers
//!
//! A plain tokio mpsc channel, except that the receiving half is shared:
//! workers clone a [`JobReceiver`] and the fetcher's [`JobSender`] keeps a
//! handle to the same buffer so it can pull back everything nobody picked up
//! when shutting down.

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::storage::JobRecord;

/// Create a channel holding at most `capacity` jobs
pub fn job_channel(capacity: usize) -> (JobSender, JobReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let rx = Arc::new(Mutex::new(rx));

    (
        JobSender {
            tx,
            rx: Arc::clone(&rx),
        },
        JobReceiver { rx },
    )
}

/// Producing half, owned by the fetcher
#[derive(Debug)]
pub struct JobSender {
    tx: mpsc::Sender<JobRecord>,
    rx: Arc<Mutex<mpsc::Receiver<JobRecord>>>,
}

impl JobSender {
    /// Wait for room and push a job
    ///
    /// Hands the job back if the channel is closed.
    pub async fn send(&self, job: JobRecord) -> Result<(), JobRecord> {
        self.tx.send(job).await.map_err(|e| e.0)
    }

    /// Take every buffered job without waiting for new ones
    ///
    /// Consumers give up the receiver as soon as their cancellation token
    /// fires, so this only waits while nobody has cancelled.
    pub async fn drain(&self) -> Vec<JobRecord> {
        let mut rx = self.rx.lock().await;
        let mut drained = Vec::new();
        while let Ok(job) = rx.try_recv() {
            drained.push(job);
        }
        drained
    }

    /// Free slots
    pub fn capacity(&self) -> usize {
        self.tx.capacity()
    }
}

/// Consuming half, cloned once per worker
#[derive(Debug, Clone)]
pub struct JobReceiver {
    rx: Arc<Mutex<mpsc::Receiver<JobRecord>>>,
}

impl JobReceiver {
    /// Wait for the next job
    ///
    /// `None` once `cancel` fires, or once the sender is gone and the buffer
    /// is empty. The shared receiver is released on cancellation so the
    /// sender can drain what is left.
    pub async fn recv(&self, cancel: &CancellationToken) -> Option<JobRecord> {
        let mut rx = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            rx = self.rx.lock() => rx,
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            job = rx.recv() => job,
        }
    }

    /// Take a buffered job if there is one
    pub async fn try_recv(&self) -> Option<JobRecord> {
        self.rx.lock().await.try_recv().ok()
    }
}
