//! `flywheel-core` — configuration and shared declarative types.
//!
//! The config file (`flywheel.toml`) carries one `[scheduler]` section and a
//! `[[jobs]]` array of declarative job specs. [`config::FlywheelConfig::load`]
//! merges the file with `FLYWHEEL_*` env overrides via figment. The scheduler
//! crate turns [`config::JobSpec`] values into runtime descriptors.

pub mod config;
pub mod error;

pub use config::{
    CycleSpec, FlywheelConfig, JobSpec, RetrySpec, SchedulerSection, TriggerSpec,
};
pub use error::{CoreError, Result};
