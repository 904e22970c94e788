use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use flywheel_core::config::{CycleSpec, RetrySpec};

/// When a registered job becomes due.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// Parsed cron schedule plus the original expression for logs and
    /// change detection.
    Cron {
        schedule: cron::Schedule,
        source: String,
    },

    /// Fixed period anchored at registration time. The first fire happens
    /// immediately on registration.
    Interval { every: Duration },
}

impl Trigger {
    pub fn kind(&self) -> &'static str {
        match self {
            Trigger::Cron { .. } => "cron",
            Trigger::Interval { .. } => "interval",
        }
    }
}

/// Retry budget and backoff shape, resolved from the declarative spec.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first (1 = no retries).
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fractional jitter applied to each delay (0.1 = up to ±10%).
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn from_spec(spec: &RetrySpec) -> Self {
        Self {
            max_attempts: spec.max_attempts,
            base_delay: Duration::from_secs(spec.base_delay_secs),
            max_delay: Duration::from_secs(spec.max_delay_secs),
            jitter: spec.jitter,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_spec(&RetrySpec::default())
    }
}

/// How a fire timestamp is truncated into the cycle key that scopes
/// dependency completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleGranularity {
    Exact,
    Minute,
    Hour,
    Day,
}

impl CycleGranularity {
    /// Explicit setting, or the trigger-dependent default: cron jobs cycle
    /// per day, interval jobs per exact fire instant.
    pub fn resolve(spec: Option<CycleSpec>, trigger: &Trigger) -> Self {
        match spec {
            Some(CycleSpec::Exact) => CycleGranularity::Exact,
            Some(CycleSpec::Minute) => CycleGranularity::Minute,
            Some(CycleSpec::Hour) => CycleGranularity::Hour,
            Some(CycleSpec::Day) => CycleGranularity::Day,
            None => match trigger {
                Trigger::Cron { .. } => CycleGranularity::Day,
                Trigger::Interval { .. } => CycleGranularity::Exact,
            },
        }
    }
}

/// Immutable definition of a unit of scheduled work.
///
/// Built by the schedule registry from a declarative spec and handed out
/// behind `Arc`: a reload never mutates a descriptor an in-flight instance
/// still references.
#[derive(Debug, Clone)]
pub struct JobDescriptor {
    pub id: String,
    pub trigger: Trigger,
    /// Lower values dispatch first.
    pub priority: i32,
    /// Job ids that must have succeeded for the same cycle key before this
    /// job is admitted.
    pub dependencies: Vec<String>,
    pub retry: RetryPolicy,
    pub cycle: CycleGranularity,
    /// Registered action name this job dispatches to.
    pub action: String,
    /// Opaque payload forwarded to the action unchanged.
    pub payload: serde_json::Value,
}

/// Lifecycle state of one firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Waiting for dependency admission.
    Pending,
    /// Admitted, sitting in the dispatch queue.
    Queued,
    /// Executing on a worker.
    Running,
    Succeeded,
    Failed,
    /// Gave up waiting on dependencies that never completed.
    Abandoned,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceState::Pending => "pending",
            InstanceState::Queued => "queued",
            InstanceState::Running => "running",
            InstanceState::Succeeded => "succeeded",
            InstanceState::Failed => "failed",
            InstanceState::Abandoned => "abandoned",
        };
        write!(f, "{s}")
    }
}

/// One firing of a descriptor, alive from emission to terminal state.
#[derive(Debug, Clone)]
pub struct JobInstance {
    /// UUID v4, unique per firing.
    pub id: String,
    pub descriptor: Arc<JobDescriptor>,
    /// The trigger time this firing is for (not the admission time).
    pub scheduled_time: DateTime<Utc>,
    pub cycle_key: String,
    /// Attempts consumed; filled in by the retry controller.
    pub attempts: u32,
    pub state: InstanceState,
    /// Emission time, used for the abandon timeout.
    pub created_at: DateTime<Utc>,
}

impl JobInstance {
    pub fn new(
        descriptor: Arc<JobDescriptor>,
        scheduled_time: DateTime<Utc>,
        cycle_key: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            descriptor,
            scheduled_time,
            cycle_key,
            attempts: 0,
            state: InstanceState::Pending,
            created_at: Utc::now(),
        }
    }
}

/// Terminal outcome of one (job, cycle) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Succeeded,
    Failed,
    Abandoned,
}

impl std::fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CompletionStatus::Succeeded => "succeeded",
            CompletionStatus::Failed => "failed",
            CompletionStatus::Abandoned => "abandoned",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for CompletionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(CompletionStatus::Succeeded),
            "failed" => Ok(CompletionStatus::Failed),
            "abandoned" => Ok(CompletionStatus::Abandoned),
            other => Err(format!("unknown completion status: {other}")),
        }
    }
}

/// Persisted record gating dependent jobs and surviving restarts.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRecord {
    pub descriptor_id: String,
    pub cycle_key: String,
    pub status: CompletionStatus,
    pub completed_at: DateTime<Utc>,
}

/// Structured report of one finished instance, sent to the outcome sink.
#[derive(Debug, Clone)]
pub struct OutcomeEvent {
    pub descriptor_id: String,
    pub instance_id: String,
    pub cycle_key: String,
    pub status: CompletionStatus,
    pub attempts: u32,
    pub duration: Duration,
    /// Last error text for failed or abandoned outcomes.
    pub error: Option<String>,
}
