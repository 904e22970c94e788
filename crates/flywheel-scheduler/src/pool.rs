use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::action::ActionContext;
use crate::deps::DependencyGate;
use crate::queue::{DispatchQueue, QueuedJob};
use crate::retry::run_with_retry;
use crate::types::{CompletionRecord, CompletionStatus, InstanceState, OutcomeEvent};

/// Execution counters shared by the workers, the engine, and its handle.
#[derive(Debug, Default)]
pub struct PoolStats {
    dispatched: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    abandoned: AtomicU64,
    retries: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub abandoned: u64,
    pub retries: u64,
}

impl PoolStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }

    /// Abandons are decided by the engine, not a worker.
    pub(crate) fn note_abandoned(&self) {
        self.abandoned.fetch_add(1, Ordering::Relaxed);
    }
}

/// Fixed set of worker tasks draining the dispatch queue.
///
/// Workers run until the queue is closed; a worker holding a job when the
/// close lands finishes that job before exiting, so shutdown never kills a
/// running action mid-flight.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        count: usize,
        queue: Arc<DispatchQueue>,
        gate: Arc<DependencyGate>,
        inflight: Arc<DashMap<String, ()>>,
        outcome_tx: mpsc::Sender<OutcomeEvent>,
        stats: Arc<PoolStats>,
    ) -> Self {
        let handles = (0..count.max(1))
            .map(|worker| {
                let queue = Arc::clone(&queue);
                let gate = Arc::clone(&gate);
                let inflight = Arc::clone(&inflight);
                let outcome_tx = outcome_tx.clone();
                let stats = Arc::clone(&stats);
                tokio::spawn(async move {
                    worker_loop(worker, queue, gate, inflight, outcome_tx, stats).await;
                })
            })
            .collect();
        Self { handles }
    }

    /// Wait for every worker to drain out.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("worker task failed: {e}");
            }
        }
    }
}

async fn worker_loop(
    worker: usize,
    queue: Arc<DispatchQueue>,
    gate: Arc<DependencyGate>,
    inflight: Arc<DashMap<String, ()>>,
    outcome_tx: mpsc::Sender<OutcomeEvent>,
    stats: Arc<PoolStats>,
) {
    info!(worker, "worker started");
    while let Some(job) = queue.pop().await {
        run_one(job, &gate, &inflight, &outcome_tx, &stats).await;
    }
    info!(worker, "worker stopped");
}

async fn run_one(
    job: QueuedJob,
    gate: &DependencyGate,
    inflight: &DashMap<String, ()>,
    outcome_tx: &mpsc::Sender<OutcomeEvent>,
    stats: &PoolStats,
) {
    let QueuedJob { mut instance, action } = job;
    stats.dispatched.fetch_add(1, Ordering::Relaxed);
    instance.state = InstanceState::Running;
    info!(
        job_id = %instance.descriptor.id,
        instance_id = %instance.id,
        cycle = %instance.cycle_key,
        "job started"
    );

    let mut ctx = ActionContext {
        job_id: instance.descriptor.id.clone(),
        scheduled_time: instance.scheduled_time,
        cycle_key: instance.cycle_key.clone(),
        attempt: 0,
        payload: instance.descriptor.payload.clone(),
    };

    let started = Instant::now();
    let outcome = run_with_retry(&instance.descriptor.retry, action.as_ref(), &mut ctx).await;
    let duration = started.elapsed();

    instance.attempts = outcome.attempts;
    if outcome.attempts > 1 {
        stats
            .retries
            .fetch_add(u64::from(outcome.attempts - 1), Ordering::Relaxed);
    }
    match outcome.status {
        CompletionStatus::Succeeded => {
            instance.state = InstanceState::Succeeded;
            stats.succeeded.fetch_add(1, Ordering::Relaxed);
            info!(
                job_id = %instance.descriptor.id,
                instance_id = %instance.id,
                attempts = outcome.attempts,
                duration_ms = duration.as_millis() as u64,
                "job succeeded"
            );
        }
        _ => {
            instance.state = InstanceState::Failed;
            stats.failed.fetch_add(1, Ordering::Relaxed);
            error!(
                job_id = %instance.descriptor.id,
                instance_id = %instance.id,
                attempts = outcome.attempts,
                "job failed: {}",
                outcome.error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    let record = CompletionRecord {
        descriptor_id: instance.descriptor.id.clone(),
        cycle_key: instance.cycle_key.clone(),
        status: outcome.status,
        completed_at: Utc::now(),
    };
    if let Err(e) = gate.record(record).await {
        error!(job_id = %instance.descriptor.id, "completion not durable: {e}");
    }

    let event = OutcomeEvent {
        descriptor_id: instance.descriptor.id.clone(),
        instance_id: instance.id.clone(),
        cycle_key: instance.cycle_key.clone(),
        status: outcome.status,
        attempts: outcome.attempts,
        duration,
        error: outcome.error,
    };
    if let Err(e) = outcome_tx.try_send(event) {
        warn!(job_id = %instance.descriptor.id, "outcome channel full or closed, event dropped: {e}");
    }

    // Clear the in-flight mark last so the tick loop cannot admit the next
    // fire for this job while this one is still wrapping up.
    inflight.remove(&instance.descriptor.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;

    use crate::action::{ActionError, JobAction};
    use crate::db::CompletionStore;
    use crate::types::{CycleGranularity, JobDescriptor, JobInstance, RetryPolicy, Trigger};

    struct Recorder {
        log: Arc<Mutex<Vec<String>>>,
        delay: Duration,
    }

    #[async_trait]
    impl JobAction for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }
        async fn execute(&self, ctx: &ActionContext) -> std::result::Result<(), ActionError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.log.lock().unwrap().push(ctx.job_id.clone());
            Ok(())
        }
    }

    fn descriptor(id: &str, priority: i32) -> Arc<JobDescriptor> {
        Arc::new(JobDescriptor {
            id: id.to_string(),
            trigger: Trigger::Interval {
                every: Duration::from_secs(60),
            },
            priority,
            dependencies: Vec::new(),
            retry: RetryPolicy::default(),
            cycle: CycleGranularity::Exact,
            action: "recorder".to_string(),
            payload: serde_json::Value::Null,
        })
    }

    fn queued(descriptor: Arc<JobDescriptor>, action: Arc<dyn JobAction>) -> QueuedJob {
        let now = Utc::now();
        QueuedJob {
            instance: JobInstance::new(descriptor, now, now.to_rfc3339()),
            action,
        }
    }

    struct Fixture {
        queue: Arc<DispatchQueue>,
        gate: Arc<DependencyGate>,
        inflight: Arc<DashMap<String, ()>>,
        stats: Arc<PoolStats>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(CompletionStore::open_in_memory().unwrap());
        Fixture {
            queue: Arc::new(DispatchQueue::new()),
            gate: Arc::new(DependencyGate::new(store, true).unwrap()),
            inflight: Arc::new(DashMap::new()),
            stats: Arc::new(PoolStats::default()),
        }
    }

    async fn wait_for(stats: &PoolStats, want_done: u64) {
        for _ in 0..200 {
            let snap = stats.snapshot();
            if snap.succeeded + snap.failed >= want_done {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("workers did not finish {want_done} jobs in time");
    }

    #[tokio::test]
    async fn two_workers_drain_three_jobs() {
        let fx = fixture();
        let log = Arc::new(Mutex::new(Vec::new()));
        let action: Arc<dyn JobAction> = Arc::new(Recorder {
            log: Arc::clone(&log),
            delay: Duration::ZERO,
        });
        let (tx, mut rx) = mpsc::channel(16);

        for id in ["a", "b", "c"] {
            fx.inflight.insert(id.to_string(), ());
            fx.queue
                .push(queued(descriptor(id, 100), Arc::clone(&action)))
                .await;
        }

        let pool = WorkerPool::spawn(
            2,
            Arc::clone(&fx.queue),
            Arc::clone(&fx.gate),
            Arc::clone(&fx.inflight),
            tx,
            Arc::clone(&fx.stats),
        );
        wait_for(&fx.stats, 3).await;
        fx.queue.close().await;
        pool.join().await;

        let snap = fx.stats.snapshot();
        assert_eq!(snap.dispatched, 3);
        assert_eq!(snap.succeeded, 3);
        assert_eq!(snap.failed, 0);
        assert_eq!(log.lock().unwrap().len(), 3);
        assert!(fx.inflight.is_empty());

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(events.len(), 3);
        assert!(events
            .iter()
            .all(|e| e.status == CompletionStatus::Succeeded));
    }

    #[tokio::test]
    async fn close_waits_for_the_running_job() {
        let fx = fixture();
        let log = Arc::new(Mutex::new(Vec::new()));
        let action: Arc<dyn JobAction> = Arc::new(Recorder {
            log: Arc::clone(&log),
            delay: Duration::from_millis(300),
        });
        let (tx, _rx) = mpsc::channel(16);

        fx.queue
            .push(queued(descriptor("slow", 100), action))
            .await;
        let pool = WorkerPool::spawn(
            1,
            Arc::clone(&fx.queue),
            Arc::clone(&fx.gate),
            Arc::clone(&fx.inflight),
            tx,
            Arc::clone(&fx.stats),
        );

        // Let the worker pick the job up, then close mid-run.
        tokio::time::sleep(Duration::from_millis(50)).await;
        fx.queue.close().await;
        pool.join().await;

        assert_eq!(*log.lock().unwrap(), vec!["slow".to_string()]);
        assert_eq!(fx.stats.snapshot().succeeded, 1);
    }

    #[tokio::test]
    async fn single_worker_honors_priority_order() {
        let fx = fixture();
        let log = Arc::new(Mutex::new(Vec::new()));
        let action: Arc<dyn JobAction> = Arc::new(Recorder {
            log: Arc::clone(&log),
            delay: Duration::ZERO,
        });
        let (tx, _rx) = mpsc::channel(16);

        for (id, priority) in [("mid", 5), ("urgent", 1), ("bulk", 9)] {
            fx.queue
                .push(queued(descriptor(id, priority), Arc::clone(&action)))
                .await;
        }

        let pool = WorkerPool::spawn(
            1,
            Arc::clone(&fx.queue),
            Arc::clone(&fx.gate),
            Arc::clone(&fx.inflight),
            tx,
            Arc::clone(&fx.stats),
        );
        wait_for(&fx.stats, 3).await;
        fx.queue.close().await;
        pool.join().await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["urgent".to_string(), "mid".to_string(), "bulk".to_string()]
        );
    }

    #[tokio::test]
    async fn failed_jobs_record_failed_completions() {
        struct AlwaysFatal;

        #[async_trait]
        impl JobAction for AlwaysFatal {
            fn name(&self) -> &str {
                "fatal"
            }
            async fn execute(
                &self,
                _ctx: &ActionContext,
            ) -> std::result::Result<(), ActionError> {
                Err(ActionError::Fatal("bad payload".to_string()))
            }
        }

        let fx = fixture();
        let (tx, mut rx) = mpsc::channel(16);
        let job = queued(descriptor("doomed", 100), Arc::new(AlwaysFatal));
        let cycle_key = job.instance.cycle_key.clone();
        fx.queue.push(job).await;

        let pool = WorkerPool::spawn(
            1,
            Arc::clone(&fx.queue),
            Arc::clone(&fx.gate),
            Arc::clone(&fx.inflight),
            tx,
            Arc::clone(&fx.stats),
        );
        wait_for(&fx.stats, 1).await;
        fx.queue.close().await;
        pool.join().await;

        assert_eq!(fx.stats.snapshot().failed, 1);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.status, CompletionStatus::Failed);
        assert_eq!(event.attempts, 1);
        assert_eq!(event.error.as_deref(), Some("bad payload"));
        // A Failed record never satisfies dependents.
        assert!(!fx.gate.has_succeeded("doomed", &cycle_key));
    }
}
