use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::types::{CompletionRecord, CompletionStatus};

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `completions` table (one row per job+cycle, upserted) and the
/// `firings` table (one row per emitted fire slot, insert-or-ignore). Both
/// are idempotent so every startup can call this unconditionally.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS completions (
            descriptor_id TEXT NOT NULL,
            cycle_key     TEXT NOT NULL,
            status        TEXT NOT NULL,
            completed_at  TEXT NOT NULL,   -- ISO-8601 UTC
            PRIMARY KEY (descriptor_id, cycle_key)
        ) STRICT;

        -- Retention pruning scans by age.
        CREATE INDEX IF NOT EXISTS idx_completions_completed_at
            ON completions (completed_at);

        CREATE TABLE IF NOT EXISTS firings (
            descriptor_id TEXT NOT NULL,
            fire_time     TEXT NOT NULL,   -- ISO-8601 UTC
            PRIMARY KEY (descriptor_id, fire_time)
        ) STRICT;
        ",
    )?;
    Ok(())
}

/// Durable store for completion records and the firing log.
///
/// Owns its `Connection` behind a mutex; every call is a single small
/// statement, so the lock is held only briefly and the store can be shared
/// between the tick loop and the workers.
pub struct CompletionStore {
    conn: Mutex<Connection>,
}

impl CompletionStore {
    /// Wrap an open connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open(path: &str) -> Result<Self> {
        Self::new(Connection::open(path)?)
    }

    /// In-memory store for tests and ephemeral runs.
    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    /// Upsert the outcome for one (job, cycle) pair.
    pub fn record_completion(&self, record: &CompletionRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO completions (descriptor_id, cycle_key, status, completed_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(descriptor_id, cycle_key)
             DO UPDATE SET status = excluded.status, completed_at = excluded.completed_at",
            params![
                record.descriptor_id,
                record.cycle_key,
                record.status.to_string(),
                record.completed_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Fetch the recorded outcome for one (job, cycle) pair, if any.
    pub fn get_completion(
        &self,
        descriptor_id: &str,
        cycle_key: &str,
    ) -> Result<Option<CompletionRecord>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT status, completed_at FROM completions
                 WHERE descriptor_id = ?1 AND cycle_key = ?2",
                params![descriptor_id, cycle_key],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        Ok(row.and_then(|(status, completed_at)| {
            let status: CompletionStatus = status.parse().ok()?;
            let completed_at = DateTime::parse_from_rfc3339(&completed_at)
                .ok()?
                .with_timezone(&Utc);
            Some(CompletionRecord {
                descriptor_id: descriptor_id.to_string(),
                cycle_key: cycle_key.to_string(),
                status,
                completed_at,
            })
        }))
    }

    /// All persisted completions, for hydrating the in-memory mirror at
    /// startup.
    pub fn load_completions(&self) -> Result<Vec<CompletionRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT descriptor_id, cycle_key, status, completed_at FROM completions",
        )?;
        let records = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?, // descriptor_id
                    row.get::<_, String>(1)?, // cycle_key
                    row.get::<_, String>(2)?, // status
                    row.get::<_, String>(3)?, // completed_at
                ))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(descriptor_id, cycle_key, status, completed_at)| {
                let status: CompletionStatus = status.parse().ok()?;
                let completed_at = DateTime::parse_from_rfc3339(&completed_at)
                    .ok()?
                    .with_timezone(&Utc);
                Some(CompletionRecord {
                    descriptor_id,
                    cycle_key,
                    status,
                    completed_at,
                })
            })
            .collect();
        Ok(records)
    }

    /// Record a fire slot. Returns false when this (job, fire time) pair was
    /// already emitted by an earlier run — the caller must skip the firing.
    pub fn try_record_firing(
        &self,
        descriptor_id: &str,
        fire_time: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO firings (descriptor_id, fire_time) VALUES (?1, ?2)",
            params![descriptor_id, fire_time.to_rfc3339()],
        )?;
        Ok(inserted > 0)
    }

    /// Delete completion and firing rows older than `cutoff`. Returns the
    /// number of rows removed.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let cutoff = cutoff.to_rfc3339();
        let conn = self.conn.lock().unwrap();
        let completions =
            conn.execute("DELETE FROM completions WHERE completed_at < ?1", [&cutoff])?;
        let firings = conn.execute("DELETE FROM firings WHERE fire_time < ?1", [&cutoff])?;
        Ok(completions + firings)
    }
}
