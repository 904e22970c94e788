use std::mem;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use flywheel_core::config::{JobSpec, SchedulerSection};

use crate::action::ActionRegistry;
use crate::db::CompletionStore;
use crate::deps::{DependencyGate, Readiness};
use crate::error::Result;
use crate::pool::{PoolStats, StatsSnapshot, WorkerPool};
use crate::queue::{DispatchQueue, QueuedJob};
use crate::registry::{LoadReport, ScheduleRegistry};
use crate::trigger;
use crate::types::{CompletionRecord, CompletionStatus, InstanceState, JobInstance, OutcomeEvent};

const CONTROL_CHANNEL_CAPACITY: usize = 8;

/// Engine-wide knobs, decoupled from the config file layout.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub timezone: String,
    pub workers: usize,
    pub tick: Duration,
    pub fail_open_dependencies: bool,
    /// Give up on instances blocked this long on unmet dependencies.
    /// None waits indefinitely.
    pub abandon_after: Option<Duration>,
    pub catch_up: bool,
    pub catch_up_window: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_section(&SchedulerSection::default())
    }
}

impl EngineConfig {
    pub fn from_section(section: &SchedulerSection) -> Self {
        Self {
            timezone: section.timezone.clone(),
            workers: section.workers.max(1),
            tick: Duration::from_secs(section.tick_secs.max(1)),
            fail_open_dependencies: section.fail_open_dependencies,
            abandon_after: section.abandon_after_secs.map(Duration::from_secs),
            catch_up: section.catch_up,
            catch_up_window: Duration::from_secs(section.catch_up_window_secs),
        }
    }
}

enum ControlMsg {
    Reload(Vec<JobSpec>),
}

/// Cloneable handle for poking the engine while its loop runs.
#[derive(Clone)]
pub struct EngineHandle {
    control_tx: mpsc::Sender<ControlMsg>,
    stats: Arc<PoolStats>,
}

impl EngineHandle {
    /// Hand the engine a replacement job set. The diff is applied on the
    /// next tick. Returns false once the engine has stopped.
    pub async fn reload(&self, specs: Vec<JobSpec>) -> bool {
        self.control_tx.send(ControlMsg::Reload(specs)).await.is_ok()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

/// Core scheduler: evaluates triggers each tick, gates instances on their
/// dependencies, and feeds the worker pool through the dispatch queue.
pub struct Engine {
    config: EngineConfig,
    registry: ScheduleRegistry,
    gate: Arc<DependencyGate>,
    store: Arc<CompletionStore>,
    queue: Arc<DispatchQueue>,
    /// Jobs with a live instance (pending, queued, or running). Guards
    /// single-flight admission; workers clear their entry on completion.
    inflight: Arc<DashMap<String, ()>>,
    /// Emitted instances still waiting on dependency admission.
    pending: Vec<QueuedJob>,
    stats: Arc<PoolStats>,
    outcome_tx: mpsc::Sender<OutcomeEvent>,
    control_tx: mpsc::Sender<ControlMsg>,
    control_rx: mpsc::Receiver<ControlMsg>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        store: Arc<CompletionStore>,
        actions: Arc<ActionRegistry>,
        outcome_tx: mpsc::Sender<OutcomeEvent>,
    ) -> Result<Self> {
        let registry = ScheduleRegistry::new(
            &config.timezone,
            actions,
            config.catch_up,
            config.catch_up_window,
        )?;
        let gate = Arc::new(DependencyGate::new(
            Arc::clone(&store),
            config.fail_open_dependencies,
        )?);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);

        Ok(Self {
            config,
            registry,
            gate,
            store,
            queue: Arc::new(DispatchQueue::new()),
            inflight: Arc::new(DashMap::new()),
            pending: Vec::new(),
            stats: Arc::new(PoolStats::default()),
            outcome_tx,
            control_tx,
            control_rx,
        })
    }

    /// Load or replace the job set before or between runs.
    pub fn load_jobs(&mut self, specs: &[JobSpec]) -> LoadReport {
        let report = self.registry.apply(specs, Utc::now());
        self.gate.set_known_jobs(self.registry.job_ids());
        report
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            control_tx: self.control_tx.clone(),
            stats: Arc::clone(&self.stats),
        }
    }

    /// Main loop. Ticks until `shutdown` broadcasts `true`, then closes the
    /// queue and waits for in-flight jobs to finish.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            workers = self.config.workers,
            timezone = %self.config.timezone,
            jobs = self.registry.len(),
            "engine started"
        );
        let pool = WorkerPool::spawn(
            self.config.workers,
            Arc::clone(&self.queue),
            Arc::clone(&self.gate),
            Arc::clone(&self.inflight),
            self.outcome_tx.clone(),
            Arc::clone(&self.stats),
        );

        let mut interval = tokio::time::interval(self.config.tick);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(Utc::now()).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("engine shutting down");
                        break;
                    }
                }
            }
        }

        self.queue.close().await;
        pool.join().await;
        let snap = self.stats.snapshot();
        info!(
            dispatched = snap.dispatched,
            succeeded = snap.succeeded,
            failed = snap.failed,
            abandoned = snap.abandoned,
            "engine stopped"
        );
    }

    async fn tick(&mut self, now: DateTime<Utc>) {
        self.drain_control(now);
        self.emit_due_fires(now);
        self.admit_pending(now).await;
    }

    /// Control messages are drained at tick granularity, so a reload takes
    /// effect within one tick of being sent.
    fn drain_control(&mut self, now: DateTime<Utc>) {
        while let Ok(msg) = self.control_rx.try_recv() {
            match msg {
                ControlMsg::Reload(specs) => {
                    let report = self.registry.apply(&specs, now);
                    self.gate.set_known_jobs(self.registry.job_ids());
                    if report.is_clean() {
                        info!(
                            added = report.added.len(),
                            updated = report.updated.len(),
                            removed = report.removed.len(),
                            "schedule reloaded"
                        );
                    } else {
                        warn!(
                            added = report.added.len(),
                            updated = report.updated.len(),
                            removed = report.removed.len(),
                            rejected = report.rejected.len(),
                            "schedule reloaded with rejected specs"
                        );
                    }
                }
            }
        }
    }

    /// Turn due trigger fires into pending instances, enforcing
    /// single-flight and per-slot/per-cycle idempotence.
    fn emit_due_fires(&mut self, now: DateTime<Utc>) {
        for fire in self.registry.due_fires(now) {
            let id = fire.descriptor.id.clone();
            if self.is_live(&id) {
                info!(job_id = %id, "fire skipped, previous instance still live");
                continue;
            }
            let key = trigger::cycle_key(
                fire.descriptor.cycle,
                fire.fire_time,
                self.registry.timezone(),
            );
            if self.gate.has_succeeded(&id, &key) {
                info!(job_id = %id, cycle = %key, "fire skipped, cycle already recorded");
                continue;
            }
            match self.store.try_record_firing(&id, fire.fire_time) {
                Ok(true) => {}
                Ok(false) => {
                    info!(job_id = %id, cycle = %key, "fire skipped, slot already emitted");
                    continue;
                }
                Err(e) => {
                    error!(job_id = %id, "firing log write failed, skipping fire: {e}");
                    continue;
                }
            }
            let instance = JobInstance::new(Arc::clone(&fire.descriptor), fire.fire_time, key);
            self.pending.push(QueuedJob {
                instance,
                action: fire.action,
            });
        }
    }

    /// Move pending instances whose dependencies are satisfied into the
    /// dispatch queue; abandon those blocked past the configured timeout.
    async fn admit_pending(&mut self, now: DateTime<Utc>) {
        let pending = mem::take(&mut self.pending);
        for mut job in pending {
            match self
                .gate
                .check(&job.instance.descriptor, &job.instance.cycle_key)
            {
                Readiness::Ready => {
                    job.instance.state = InstanceState::Queued;
                    self.inflight.insert(job.instance.descriptor.id.clone(), ());
                    self.queue.push(job).await;
                }
                Readiness::Waiting(missing) => {
                    if self.wait_expired(&job.instance, now) {
                        self.abandon(job.instance, missing, now).await;
                    } else {
                        self.pending.push(job);
                    }
                }
            }
        }
    }

    fn is_live(&self, id: &str) -> bool {
        self.inflight.contains_key(id)
            || self.pending.iter().any(|j| j.instance.descriptor.id == id)
    }

    fn wait_expired(&self, instance: &JobInstance, now: DateTime<Utc>) -> bool {
        let Some(limit) = self.config.abandon_after else {
            return false;
        };
        now.signed_duration_since(instance.created_at)
            .to_std()
            .map(|age| age >= limit)
            .unwrap_or(false)
    }

    async fn abandon(&self, mut instance: JobInstance, missing: Vec<String>, now: DateTime<Utc>) {
        instance.state = InstanceState::Abandoned;
        let reason = format!("unmet dependencies: {}", missing.join(", "));
        warn!(
            job_id = %instance.descriptor.id,
            instance_id = %instance.id,
            cycle = %instance.cycle_key,
            "instance abandoned: {reason}"
        );
        self.stats.note_abandoned();

        let record = CompletionRecord {
            descriptor_id: instance.descriptor.id.clone(),
            cycle_key: instance.cycle_key.clone(),
            status: CompletionStatus::Abandoned,
            completed_at: now,
        };
        if let Err(e) = self.gate.record(record).await {
            error!(job_id = %instance.descriptor.id, "completion not durable: {e}");
        }

        let event = OutcomeEvent {
            descriptor_id: instance.descriptor.id.clone(),
            instance_id: instance.id,
            cycle_key: instance.cycle_key,
            status: CompletionStatus::Abandoned,
            attempts: 0,
            duration: Duration::ZERO,
            error: Some(reason),
        };
        if let Err(e) = self.outcome_tx.try_send(event) {
            warn!(job_id = %instance.descriptor.id, "outcome channel full or closed, event dropped: {e}");
        }
    }
}
