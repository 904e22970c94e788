//! `flywheel-scheduler` — trigger evaluation, dependency gating, and
//! prioritised dispatch on Tokio, with SQLite-backed completion state.
//!
//! # Overview
//!
//! The [`engine::Engine`] ticks on a fixed cadence. Each tick it evaluates
//! every registered trigger, emits an instance per due fire, admits instances
//! whose dependencies hold a `Succeeded` record for the same cycle, and
//! pushes them onto the priority [`queue::DispatchQueue`]. A fixed pool of
//! worker tasks pops jobs and drives them through the retry controller.
//!
//! # Trigger variants
//!
//! | Variant    | Behaviour                                               |
//! |------------|---------------------------------------------------------|
//! | `Cron`     | Cron expression in the scheduler timezone (5-7 fields)  |
//! | `Interval` | Repeat every N seconds, first fire at registration      |
//!
//! Completion records and the firing log live in SQLite, so dependency
//! state and per-slot idempotence survive restarts. A missed cron fire
//! inside the catch-up window is re-admitted once after startup.

pub mod action;
pub mod db;
pub mod deps;
pub mod engine;
pub mod error;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod trigger;
pub mod types;

pub use action::{ActionContext, ActionError, ActionRegistry, JobAction};
pub use db::CompletionStore;
pub use engine::{Engine, EngineConfig, EngineHandle};
pub use error::{Result, SchedulerError};
pub use pool::StatsSnapshot;
pub use registry::LoadReport;
pub use types::{
    CompletionRecord, CompletionStatus, InstanceState, JobDescriptor, JobInstance, OutcomeEvent,
};
