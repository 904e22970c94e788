use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Why an action invocation failed, as seen by the retry controller.
#[derive(Debug, Error)]
pub enum ActionError {
    /// Worth retrying within the job's budget (network hiccup, exchange
    /// 5xx, transient rate limit).
    #[error("{0}")]
    Transient(String),

    /// Retrying cannot help (bad payload, missing binary, auth rejection).
    /// Fails the instance immediately.
    #[error("{0}")]
    Fatal(String),
}

/// Everything an action sees about the firing it serves.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub job_id: String,
    /// The trigger time this firing is for (not the wall clock at dispatch).
    pub scheduled_time: DateTime<Utc>,
    pub cycle_key: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Opaque payload from the job spec.
    pub payload: serde_json::Value,
}

/// A unit of executable work dispatched by the scheduler.
///
/// Implementations are registered by name and resolved once when job specs
/// load; an unknown name rejects that job spec only. Actions share no
/// mutable state with the scheduler — everything an invocation needs
/// arrives in the [`ActionContext`].
#[async_trait]
pub trait JobAction: Send + Sync {
    /// Registry name, matched against the `action` field of job specs.
    fn name(&self) -> &str;

    /// Run one attempt. Return [`ActionError::Transient`] to request a
    /// retry, [`ActionError::Fatal`] to fail the instance immediately.
    async fn execute(&self, ctx: &ActionContext) -> std::result::Result<(), ActionError>;
}

/// Name → implementation map, consulted at registry load time.
#[derive(Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn JobAction>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action under its own name, replacing any previous
    /// registration with the same name.
    pub fn register(&mut self, action: Arc<dyn JobAction>) {
        self.actions.insert(action.name().to_string(), action);
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn JobAction>> {
        self.actions.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.actions.keys().cloned().collect();
        names.sort();
        names
    }
}
