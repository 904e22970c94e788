use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Default dispatch priority when a job spec does not set one.
/// Lower values dispatch first.
pub const DEFAULT_PRIORITY: i32 = 100;
/// Capacity of the outcome-event channel between workers and the sink.
pub const OUTCOME_CHANNEL_CAPACITY: usize = 256;

/// Top-level config (flywheel.toml + FLYWHEEL_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlywheelConfig {
    #[serde(default)]
    pub scheduler: SchedulerSection,
    /// Declarative job list. The daemon loads these into the schedule
    /// registry at startup and re-reads them on reload.
    #[serde(default)]
    pub jobs: Vec<JobSpec>,
}

impl Default for FlywheelConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerSection::default(),
            jobs: Vec::new(),
        }
    }
}

/// `[scheduler]` section — engine-wide knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSection {
    /// Canonical timezone for all trigger math (IANA name, e.g. "Europe/Kyiv").
    /// Override with env var: FLYWHEEL_SCHEDULER__TIMEZONE
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Number of worker tasks consuming the dispatch queue.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Tick cadence of the engine loop in seconds.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,

    /// SQLite database holding completion records and the firing log.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// When true, a dependency id that is not registered counts as satisfied
    /// (a warning is logged each time). When false it blocks admission.
    #[serde(default = "bool_true")]
    pub fail_open_dependencies: bool,

    /// If set, an instance blocked on unmet dependencies for longer than this
    /// many seconds is marked Abandoned instead of waiting indefinitely.
    pub abandon_after_secs: Option<u64>,

    /// Re-admit the most recent missed fire per job after a restart.
    #[serde(default = "bool_true")]
    pub catch_up: bool,

    /// How far back catch-up looks for a missed fire, in seconds.
    #[serde(default = "default_catch_up_window_secs")]
    pub catch_up_window_secs: u64,

    /// Completion rows older than this many days are pruned at daemon startup.
    pub completion_retention_days: Option<u32>,

    /// Poll the config file for changes every N seconds. 0 disables polling;
    /// SIGHUP always triggers a reload.
    #[serde(default)]
    pub reload_poll_secs: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            workers: default_workers(),
            tick_secs: default_tick_secs(),
            db_path: default_db_path(),
            fail_open_dependencies: true,
            abandon_after_secs: None,
            catch_up: true,
            catch_up_window_secs: default_catch_up_window_secs(),
            completion_retention_days: None,
            reload_poll_secs: 0,
        }
    }
}

/// Declarative description of one scheduled job (`[[jobs]]` entry).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Unique job identifier, also used in dependency references.
    pub id: String,

    /// Name of a registered action implementation.
    pub action: String,

    /// Opaque payload forwarded to the action unchanged.
    #[serde(default)]
    pub payload: serde_json::Value,

    pub trigger: TriggerSpec,

    /// Lower values dispatch first; ties break by scheduled time, then
    /// enqueue order.
    #[serde(default = "default_priority")]
    pub priority: i32,

    /// Job ids that must have succeeded for the same cycle before this job
    /// is admitted.
    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(default)]
    pub retry: RetrySpec,

    /// Cycle-key granularity. Defaults to `day` for cron triggers and
    /// `exact` for interval triggers when unset.
    pub cycle: Option<CycleSpec>,
}

/// Defines when a job becomes due.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerSpec {
    /// Cron expression evaluated in the scheduler's canonical timezone.
    /// Classic 5-field expressions are accepted alongside the 6/7-field
    /// forms that carry a seconds (and optional year) field.
    Cron { expression: String },

    /// Repeat every N seconds, anchored at registration time. The first
    /// fire happens immediately on registration.
    Interval { every_secs: u64 },
}

/// Retry budget and backoff shape for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySpec {
    /// Total attempts including the first (1 = no retries).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry; doubles on each subsequent attempt.
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,

    /// Upper bound on any single retry delay.
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,

    /// Fractional jitter applied to each delay (0.1 = up to ±10%).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            jitter: default_jitter(),
        }
    }
}

/// How a fire timestamp is truncated into the cycle key that scopes
/// dependency completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleSpec {
    /// Full fire instant — every firing is its own cycle.
    Exact,
    Minute,
    Hour,
    Day,
}

fn bool_true() -> bool {
    true
}

fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_workers() -> usize {
    4
}
fn default_tick_secs() -> u64 {
    1
}
fn default_catch_up_window_secs() -> u64 {
    86_400
}
fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_secs() -> u64 {
    1
}
fn default_max_delay_secs() -> u64 {
    60
}
fn default_jitter() -> f64 {
    0.1
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.flywheel/flywheel.db", home)
}

impl FlywheelConfig {
    /// Resolve which config file `load` will read: the explicit path, then
    /// the FLYWHEEL_CONFIG env var, then `~/.flywheel/flywheel.toml`.
    pub fn resolve_path(config_path: Option<&str>) -> String {
        config_path
            .map(String::from)
            .or_else(|| std::env::var("FLYWHEEL_CONFIG").ok())
            .unwrap_or_else(default_config_path)
    }

    /// Load config from a TOML file with FLYWHEEL_* env var overrides.
    ///
    /// Env overrides use `__` as the section separator, e.g.
    /// `FLYWHEEL_SCHEDULER__WORKERS=8`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = Self::resolve_path(config_path);

        let config: FlywheelConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("FLYWHEEL_").split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.flywheel/flywheel.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [scheduler]
        timezone = "Europe/Kyiv"
        workers = 2
        abandon_after_secs = 120

        [[jobs]]
        id = "fetch_prices"
        action = "command"
        priority = 1
        payload = { command = "fetch-prices --pair BTC/USDT" }

        [jobs.trigger]
        kind = "interval"
        every_secs = 300

        [[jobs]]
        id = "daily_report"
        action = "command"
        depends_on = ["fetch_prices"]
        payload = { command = "make-report" }

        [jobs.trigger]
        kind = "cron"
        expression = "0 9 * * *"

        [jobs.retry]
        max_attempts = 5
        base_delay_secs = 2
    "#;

    fn parse(toml: &str) -> FlywheelConfig {
        Figment::new()
            .merge(Toml::string(toml))
            .extract()
            .expect("config should parse")
    }

    #[test]
    fn parses_sample_config() {
        let cfg = parse(SAMPLE);
        assert_eq!(cfg.scheduler.timezone, "Europe/Kyiv");
        assert_eq!(cfg.scheduler.workers, 2);
        assert_eq!(cfg.scheduler.abandon_after_secs, Some(120));
        assert_eq!(cfg.jobs.len(), 2);

        let fetch = &cfg.jobs[0];
        assert_eq!(fetch.id, "fetch_prices");
        assert_eq!(fetch.priority, 1);
        assert_eq!(
            fetch.trigger,
            TriggerSpec::Interval { every_secs: 300 }
        );

        let report = &cfg.jobs[1];
        assert_eq!(report.priority, DEFAULT_PRIORITY);
        assert_eq!(report.depends_on, vec!["fetch_prices".to_string()]);
        assert_eq!(report.retry.max_attempts, 5);
        assert_eq!(report.retry.base_delay_secs, 2);
        // Unset retry fields keep their defaults.
        assert_eq!(report.retry.max_delay_secs, 60);
    }

    #[test]
    fn empty_config_uses_defaults() {
        let cfg = parse("");
        assert_eq!(cfg.scheduler.timezone, "UTC");
        assert_eq!(cfg.scheduler.workers, 4);
        assert_eq!(cfg.scheduler.tick_secs, 1);
        assert!(cfg.scheduler.fail_open_dependencies);
        assert!(cfg.scheduler.catch_up);
        assert_eq!(cfg.scheduler.abandon_after_secs, None);
        assert!(cfg.jobs.is_empty());
    }

    #[test]
    fn load_reads_file_from_explicit_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("flywheel.toml");
        std::fs::write(&path, SAMPLE).expect("write config");

        let cfg = FlywheelConfig::load(path.to_str()).expect("load");
        assert_eq!(cfg.jobs.len(), 2);
        assert_eq!(cfg.scheduler.workers, 2);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        // figment treats a missing TOML file as an empty source.
        let cfg = FlywheelConfig::load(Some("/nonexistent/flywheel.toml"))
            .expect("load");
        assert_eq!(cfg.scheduler.workers, 4);
        assert!(cfg.jobs.is_empty());
    }
}
