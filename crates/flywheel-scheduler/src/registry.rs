use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use chrono_tz::Tz;
use tracing::{info, warn};

use flywheel_core::config::JobSpec;

use crate::action::{ActionRegistry, JobAction};
use crate::deps;
use crate::error::{Result, SchedulerError};
use crate::trigger;
use crate::types::{CycleGranularity, JobDescriptor, RetryPolicy, Trigger};

/// Upper bound on the catch-up window. Keeps the reference subtraction in
/// `build_entry` representable and the missed-slot walk in `due_fires`
/// bounded; coalescing replays at most one fire per job regardless.
const MAX_CATCH_UP_WINDOW_SECS: i64 = 365 * 24 * 60 * 60;

/// Outcome of applying a job-spec set (initial load and reload alike).
#[derive(Debug, Default)]
pub struct LoadReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    /// (job id, why it was rejected) — the rest of the set still applies.
    pub rejected: Vec<(String, SchedulerError)>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// One due firing handed from the registry to the engine.
pub struct DueFire {
    pub descriptor: Arc<JobDescriptor>,
    pub action: Arc<dyn JobAction>,
    pub fire_time: DateTime<Utc>,
}

struct RegistryEntry {
    descriptor: Arc<JobDescriptor>,
    action: Arc<dyn JobAction>,
    /// The raw spec, kept for change detection on reload.
    spec: JobSpec,
    next_fire: Option<DateTime<Utc>>,
}

/// Live set of registered jobs and their trigger state.
///
/// Initial load and hot reload share one path: [`ScheduleRegistry::apply`]
/// diffs the incoming spec list against the current set. Unchanged jobs keep
/// their trigger state; new and changed jobs take effect for future fire
/// times; removed jobs stop firing while their completion history stays in
/// the store.
pub struct ScheduleRegistry {
    tz: Tz,
    actions: Arc<ActionRegistry>,
    entries: HashMap<String, RegistryEntry>,
    catch_up: bool,
    catch_up_window: ChronoDuration,
}

impl ScheduleRegistry {
    pub fn new(
        timezone: &str,
        actions: Arc<ActionRegistry>,
        catch_up: bool,
        catch_up_window: Duration,
    ) -> Result<Self> {
        let tz = trigger::parse_timezone(timezone)?;
        let window_secs = i64::try_from(catch_up_window.as_secs()).unwrap_or(i64::MAX);
        let window_secs = if window_secs > MAX_CATCH_UP_WINDOW_SECS {
            warn!(configured_secs = window_secs, "catch-up window clamped to one year");
            MAX_CATCH_UP_WINDOW_SECS
        } else {
            window_secs
        };
        Ok(Self {
            tz,
            actions,
            entries: HashMap::new(),
            catch_up,
            catch_up_window: ChronoDuration::seconds(window_secs),
        })
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn job_ids(&self) -> HashSet<String> {
        self.entries.keys().cloned().collect()
    }

    /// Stored next-fire time for one job, if registered.
    pub fn next_fire(&self, id: &str) -> Option<DateTime<Utc>> {
        self.entries.get(id).and_then(|e| e.next_fire)
    }

    /// Apply `specs` as the complete new job set and report the diff.
    ///
    /// Validation failures reject that spec only. When a reload changes a
    /// job into an invalid spec, the previous definition is kept running so
    /// a config typo cannot silently stop a live job.
    pub fn apply(&mut self, specs: &[JobSpec], now: DateTime<Utc>) -> LoadReport {
        let mut report = LoadReport::default();
        let mut next_entries: HashMap<String, RegistryEntry> = HashMap::new();

        for spec in specs {
            if next_entries.contains_key(&spec.id) {
                warn!(job_id = %spec.id, "duplicate job id rejected");
                report
                    .rejected
                    .push((spec.id.clone(), SchedulerError::DuplicateJob(spec.id.clone())));
                continue;
            }

            match self.entries.remove(&spec.id) {
                Some(existing) if existing.spec == *spec => {
                    // Unchanged: carry the entry and its trigger state over.
                    next_entries.insert(spec.id.clone(), existing);
                }
                Some(existing) => match self.build_entry(spec, now) {
                    Ok(entry) => {
                        report.updated.push(spec.id.clone());
                        next_entries.insert(spec.id.clone(), entry);
                    }
                    Err(e) => {
                        warn!(job_id = %spec.id, "rejected spec change, keeping previous definition: {e}");
                        report.rejected.push((spec.id.clone(), e));
                        next_entries.insert(spec.id.clone(), existing);
                    }
                },
                None => match self.build_entry(spec, now) {
                    Ok(entry) => {
                        info!(job_id = %spec.id, trigger = %entry.descriptor.trigger.kind(), "job registered");
                        report.added.push(spec.id.clone());
                        next_entries.insert(spec.id.clone(), entry);
                    }
                    Err(e) => {
                        warn!(job_id = %spec.id, "job spec rejected: {e}");
                        report.rejected.push((spec.id.clone(), e));
                    }
                },
            }
        }

        // Whatever is left was not in the incoming set.
        for id in self.entries.keys() {
            info!(job_id = %id, "job removed from schedule");
            report.removed.push(id.clone());
        }
        self.entries = next_entries;

        let edges: HashMap<String, Vec<String>> = self
            .entries
            .values()
            .map(|e| (e.descriptor.id.clone(), e.descriptor.dependencies.clone()))
            .collect();
        for cycle in deps::find_cycles(&edges) {
            warn!(cycle = %cycle.join(" -> "), "dependency cycle detected; these jobs will gate on each other");
        }

        report
    }

    /// Collect every fire due at `now`, advancing each entry's trigger
    /// state. A stalled entry coalesces to its most recent missed slot, so
    /// at most one fire per job per call.
    pub fn due_fires(&mut self, now: DateTime<Utc>) -> Vec<DueFire> {
        let mut due = Vec::new();
        for entry in self.entries.values_mut() {
            let Some(next) = entry.next_fire else { continue };
            if next > now {
                continue;
            }
            let (fired, upcoming) = trigger::advance(&entry.descriptor.trigger, self.tz, next, now);
            entry.next_fire = upcoming;
            if let Some(fire_time) = fired {
                due.push(DueFire {
                    descriptor: Arc::clone(&entry.descriptor),
                    action: Arc::clone(&entry.action),
                    fire_time,
                });
            }
        }
        due
    }

    fn build_entry(&self, spec: &JobSpec, now: DateTime<Utc>) -> Result<RegistryEntry> {
        if spec.depends_on.iter().any(|dep| *dep == spec.id) {
            return Err(SchedulerError::InvalidJob {
                id: spec.id.clone(),
                reason: "job depends on itself".to_string(),
            });
        }
        if spec.retry.max_attempts == 0 {
            return Err(SchedulerError::InvalidJob {
                id: spec.id.clone(),
                reason: "retry.max_attempts must be at least 1".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&spec.retry.jitter) {
            return Err(SchedulerError::InvalidJob {
                id: spec.id.clone(),
                reason: "retry.jitter must be within 0.0..=1.0".to_string(),
            });
        }

        let action = self
            .actions
            .resolve(&spec.action)
            .ok_or_else(|| SchedulerError::UnknownAction {
                id: spec.id.clone(),
                action: spec.action.clone(),
            })?;
        let trigger = trigger::parse_trigger(&spec.id, &spec.trigger)?;
        let cycle = CycleGranularity::resolve(spec.cycle, &trigger);

        // With catch-up, cron triggers look back into the window so a fire
        // missed while the process was down becomes due at the first tick.
        // Interval triggers anchor at registration and have no history.
        let reference = if self.catch_up && matches!(trigger, Trigger::Cron { .. }) {
            now - self.catch_up_window
        } else {
            now
        };
        let next_fire = trigger::initial_fire(&trigger, self.tz, reference);

        let mut dependencies = Vec::new();
        for dep in &spec.depends_on {
            if !dependencies.contains(dep) {
                dependencies.push(dep.clone());
            }
        }

        let descriptor = Arc::new(JobDescriptor {
            id: spec.id.clone(),
            trigger,
            priority: spec.priority,
            dependencies,
            retry: RetryPolicy::from_spec(&spec.retry),
            cycle,
            action: spec.action.clone(),
            payload: spec.payload.clone(),
        });

        Ok(RegistryEntry {
            descriptor,
            action,
            spec: spec.clone(),
            next_fire,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use flywheel_core::config::{RetrySpec, TriggerSpec};

    use crate::action::{ActionContext, ActionError};

    struct Noop;

    #[async_trait]
    impl JobAction for Noop {
        fn name(&self) -> &str {
            "noop"
        }
        async fn execute(&self, _ctx: &ActionContext) -> std::result::Result<(), ActionError> {
            Ok(())
        }
    }

    fn actions() -> Arc<ActionRegistry> {
        let mut registry = ActionRegistry::new();
        registry.register(Arc::new(Noop));
        Arc::new(registry)
    }

    fn registry(catch_up: bool) -> ScheduleRegistry {
        ScheduleRegistry::new("UTC", actions(), catch_up, Duration::from_secs(3600)).unwrap()
    }

    fn interval_spec(id: &str, every_secs: u64) -> JobSpec {
        JobSpec {
            id: id.to_string(),
            action: "noop".to_string(),
            payload: serde_json::Value::Null,
            trigger: TriggerSpec::Interval { every_secs },
            priority: 100,
            depends_on: Vec::new(),
            retry: RetrySpec::default(),
            cycle: None,
        }
    }

    fn cron_spec(id: &str, expression: &str) -> JobSpec {
        JobSpec {
            trigger: TriggerSpec::Cron {
                expression: expression.to_string(),
            },
            ..interval_spec(id, 1)
        }
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn bad_spec_rejects_that_job_only() {
        let mut reg = registry(false);
        let report = reg.apply(
            &[
                interval_spec("good", 60),
                cron_spec("bad", "not a cron"),
                JobSpec {
                    action: "missing".to_string(),
                    ..interval_spec("orphan", 60)
                },
            ],
            Utc::now(),
        );

        assert_eq!(report.added, vec!["good".to_string()]);
        assert_eq!(report.rejected.len(), 2);
        assert!(reg.contains("good"));
        assert!(!reg.contains("bad"));
        assert!(!reg.contains("orphan"));
    }

    #[test]
    fn duplicate_ids_keep_the_first_definition() {
        let mut reg = registry(false);
        let report = reg.apply(
            &[interval_spec("fetch", 60), interval_spec("fetch", 120)],
            Utc::now(),
        );
        assert_eq!(report.added, vec!["fetch".to_string()]);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn self_dependency_is_rejected() {
        let mut reg = registry(false);
        let mut spec = interval_spec("loop", 60);
        spec.depends_on = vec!["loop".to_string()];
        let report = reg.apply(&[spec], Utc::now());
        assert!(report.added.is_empty());
        assert_eq!(report.rejected.len(), 1);
    }

    #[test]
    fn interval_jobs_fire_immediately_and_stay_on_grid() {
        let mut reg = registry(false);
        let t0 = utc(2024, 3, 1, 12, 0, 0);
        reg.apply(&[interval_spec("fetch", 5)], t0);

        let due = reg.due_fires(t0);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].fire_time, t0);

        // Nothing due until the next slot.
        assert!(reg.due_fires(t0 + ChronoDuration::seconds(3)).is_empty());
        let due = reg.due_fires(t0 + ChronoDuration::milliseconds(5_200));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].fire_time, t0 + ChronoDuration::seconds(5));
    }

    #[test]
    fn reload_keeps_unchanged_trigger_state() {
        let mut reg = registry(false);
        let t0 = utc(2024, 3, 1, 12, 0, 0);
        reg.apply(&[interval_spec("fetch", 60)], t0);
        reg.due_fires(t0); // consume the initial fire
        let next_before = reg.next_fire("fetch");

        let report = reg.apply(&[interval_spec("fetch", 60)], t0 + ChronoDuration::seconds(10));
        assert!(report.added.is_empty());
        assert!(report.updated.is_empty());
        assert_eq!(reg.next_fire("fetch"), next_before);
    }

    #[test]
    fn reload_resets_state_for_changed_specs() {
        let mut reg = registry(false);
        let t0 = utc(2024, 3, 1, 12, 0, 0);
        reg.apply(&[interval_spec("fetch", 60)], t0);
        reg.due_fires(t0);

        let t1 = t0 + ChronoDuration::seconds(10);
        let report = reg.apply(&[interval_spec("fetch", 30)], t1);
        assert_eq!(report.updated, vec!["fetch".to_string()]);
        // New anchor: the changed job is due again at reload time.
        assert_eq!(reg.next_fire("fetch"), Some(t1));
    }

    #[test]
    fn reload_removes_missing_jobs() {
        let mut reg = registry(false);
        reg.apply(
            &[interval_spec("fetch", 60), interval_spec("notify", 60)],
            Utc::now(),
        );
        let report = reg.apply(&[interval_spec("fetch", 60)], Utc::now());
        assert_eq!(report.removed, vec!["notify".to_string()]);
        assert!(!reg.contains("notify"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn invalid_reload_keeps_the_previous_definition() {
        let mut reg = registry(false);
        let t0 = utc(2024, 3, 1, 12, 0, 0);
        reg.apply(&[cron_spec("report", "0 9 * * *")], t0);
        let next_before = reg.next_fire("report");
        assert!(next_before.is_some());

        let report = reg.apply(&[cron_spec("report", "not a cron")], t0);
        assert_eq!(report.rejected.len(), 1);
        assert!(reg.contains("report"));
        assert_eq!(reg.next_fire("report"), next_before);
    }

    #[test]
    fn catch_up_makes_a_recent_cron_slot_due() {
        // 14:30 with an hourly job: the 14:00 slot is inside the 1 h window.
        let now = utc(2024, 5, 10, 14, 30, 0);
        let mut reg = registry(true);
        reg.apply(&[cron_spec("hourly", "0 * * * *")], now);

        let due = reg.due_fires(now);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].fire_time, utc(2024, 5, 10, 14, 0, 0));
        assert_eq!(reg.next_fire("hourly"), Some(utc(2024, 5, 10, 15, 0, 0)));
    }

    #[test]
    fn without_catch_up_only_future_slots_fire() {
        let now = utc(2024, 5, 10, 14, 30, 0);
        let mut reg = registry(false);
        reg.apply(&[cron_spec("hourly", "0 * * * *")], now);

        assert!(reg.due_fires(now).is_empty());
        assert_eq!(reg.next_fire("hourly"), Some(utc(2024, 5, 10, 15, 0, 0)));
    }

    #[test]
    fn oversized_catch_up_window_is_clamped() {
        let mut reg =
            ScheduleRegistry::new("UTC", actions(), true, Duration::from_secs(u64::MAX)).unwrap();
        let now = utc(2024, 5, 10, 14, 30, 0);
        assert!(reg.apply(&[cron_spec("monthly", "0 0 1 * *")], now).is_clean());

        // Still coalesces to the most recent missed slot, with no overflow.
        let due = reg.due_fires(now);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].fire_time, utc(2024, 5, 1, 0, 0, 0));
        assert_eq!(reg.next_fire("monthly"), Some(utc(2024, 6, 1, 0, 0, 0)));
    }
}
