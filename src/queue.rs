use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;
use tracing::warn;

/// Work item carried from the reader task to the STT worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Job {
    /// One accepted utterance: session-scoped id + raw PCM16LE bytes.
    Utterance { sid: u64, pcm: Bytes },
    /// Sentinel: the worker drains out and exits cleanly.
    Shutdown,
}

/// Outcome of a [`JobQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The queue was full; the oldest unprocessed job was evicted.
    DroppedOldest,
}

/// Fixed-capacity FIFO with a drop-oldest backpressure policy.
///
/// Under pressure the freshest speech wins: the device's newest command
/// should never wait behind stale utterances it has already given up on.
pub struct JobQueue {
    items: Mutex<VecDeque<Job>>,
    notify: Notify,
    capacity: usize,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        JobQueue {
            items: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Enqueue a job, evicting the head when full.
    pub fn push(&self, job: Job) -> PushOutcome {
        let outcome = {
            let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
            if items.len() >= self.capacity {
                items.pop_front();
                items.push_back(job);
                PushOutcome::DroppedOldest
            } else {
                items.push_back(job);
                PushOutcome::Queued
            }
        };
        if outcome == PushOutcome::DroppedOldest {
            warn!(capacity = self.capacity, "job queue full - dropped oldest utterance");
        }
        self.notify.notify_one();
        outcome
    }

    /// Dequeue the oldest job, waiting up to `timeout` when empty.
    pub async fn pop(&self, timeout: Duration) -> Option<Job> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(job) = self
                .items
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front()
            {
                return Some(job);
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return None;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
