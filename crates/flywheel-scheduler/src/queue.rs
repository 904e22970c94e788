use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};

use crate::action::JobAction;
use crate::types::JobInstance;

/// An admitted instance together with its resolved action, as handed from
/// the engine to a worker.
pub struct QueuedJob {
    pub instance: JobInstance,
    pub action: Arc<dyn JobAction>,
}

/// Sort key: lower priority value first, then earlier scheduled time, then
/// enqueue order (strict FIFO for equal priority and time).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct DispatchKey {
    priority: i32,
    scheduled_time: DateTime<Utc>,
    seq: u64,
}

struct DispatchEntry {
    key: DispatchKey,
    job: QueuedJob,
}

impl PartialEq for DispatchEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}
impl Eq for DispatchEntry {}
impl PartialOrd for DispatchEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for DispatchEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

struct QueueState {
    heap: BinaryHeap<Reverse<DispatchEntry>>,
    next_seq: u64,
    closed: bool,
}

/// Priority dispatch queue between the engine tick loop and the workers.
///
/// `push` never waits for consumers; `pop` waits until an item arrives or
/// the queue closes.
pub struct DispatchQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                next_seq: 0,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueue an admitted job. A push after close is dropped silently —
    /// shutdown does not start new work.
    pub async fn push(&self, job: QueuedJob) {
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            let key = DispatchKey {
                priority: job.instance.descriptor.priority,
                scheduled_time: job.instance.scheduled_time,
                seq: state.next_seq,
            };
            state.next_seq += 1;
            state.heap.push(Reverse(DispatchEntry { key, job }));
        }
        self.notify.notify_one();
    }

    /// Dequeue the highest-priority job, waiting while the queue is empty.
    ///
    /// Returns `None` once the queue is closed — the exit sentinel for
    /// worker loops.
    pub async fn pop(&self) -> Option<QueuedJob> {
        loop {
            // Register interest before checking state so a push or close
            // racing between the check and the await cannot be missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if state.closed {
                    return None;
                }
                if let Some(Reverse(entry)) = state.heap.pop() {
                    return Some(entry.job);
                }
            }

            notified.await;
        }
    }

    /// Close the queue and wake every waiting worker. Items still queued
    /// are discarded.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock().await;
            state.closed = true;
            state.heap.clear();
        }
        self.notify.notify_waiters();
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.heap.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for DispatchQueue {
    fn default() -> Self {
        Self::new()
    }
}
