use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The trigger definition of one job could not be parsed or evaluated.
    /// Rejects that job only; the rest of the set still loads.
    #[error("Invalid trigger for job {id}: {reason}")]
    InvalidTrigger { id: String, reason: String },

    /// The canonical timezone name is not a known IANA zone.
    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    /// The job names an action that is not registered.
    #[error("Unknown action '{action}' for job {id}")]
    UnknownAction { id: String, action: String },

    /// Two job specs share the same id.
    #[error("Duplicate job id: {0}")]
    DuplicateJob(String),

    /// Other per-job misconfiguration (bad retry budget, self-dependency).
    #[error("Invalid job {id}: {reason}")]
    InvalidJob { id: String, reason: String },
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
