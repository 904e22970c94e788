use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use tracing::{error, warn};

use crate::db::CompletionStore;
use crate::error::Result;
use crate::types::{CompletionRecord, CompletionStatus, JobDescriptor};

const PERSIST_ATTEMPTS: u32 = 3;
const PERSIST_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Result of a dependency check for one (descriptor, cycle) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Names the dependencies still missing a Succeeded record.
    Waiting(Vec<String>),
}

/// Gate deciding when an instance may enter the dispatch queue, backed by
/// the durable completion store.
///
/// Keeps an in-memory mirror of completion state, hydrated from SQLite at
/// construction so checks stay correct across restarts. Writes go to the
/// store first; the mirror only reflects rows that are durable.
pub struct DependencyGate {
    store: Arc<CompletionStore>,
    seen: DashMap<(String, String), CompletionStatus>,
    known_jobs: RwLock<HashSet<String>>,
    fail_open: bool,
}

impl DependencyGate {
    pub fn new(store: Arc<CompletionStore>, fail_open: bool) -> Result<Self> {
        let seen = DashMap::new();
        for record in store.load_completions()? {
            seen.insert(
                (record.descriptor_id.clone(), record.cycle_key.clone()),
                record.status,
            );
        }
        Ok(Self {
            store,
            seen,
            known_jobs: RwLock::new(HashSet::new()),
            fail_open,
        })
    }

    /// The registry hands over the registered id set on load and reload so
    /// dangling dependency references can be told apart from pending ones.
    pub fn set_known_jobs(&self, ids: HashSet<String>) {
        *self.known_jobs.write().unwrap() = ids;
    }

    /// True when `dep` has a Succeeded record for `cycle_key`.
    pub fn has_succeeded(&self, dep: &str, cycle_key: &str) -> bool {
        self.seen
            .get(&(dep.to_string(), cycle_key.to_string()))
            .map(|status| *status == CompletionStatus::Succeeded)
            .unwrap_or(false)
    }

    /// Decide whether `descriptor` may run for `cycle_key`.
    ///
    /// A Succeeded record satisfies its dependency even when that job has
    /// since been removed from the schedule; completion history is retained
    /// across reloads. The fail-open/fail-closed policy applies only to an
    /// unregistered dependency with no record for this cycle.
    pub fn check(&self, descriptor: &JobDescriptor, cycle_key: &str) -> Readiness {
        let known = self.known_jobs.read().unwrap();
        let mut missing = Vec::new();
        for dep in &descriptor.dependencies {
            if self.has_succeeded(dep, cycle_key) {
                continue;
            }
            if !known.contains(dep) {
                if self.fail_open {
                    warn!(
                        job_id = %descriptor.id,
                        dependency = %dep,
                        "unregistered dependency treated as satisfied"
                    );
                    continue;
                }
                warn!(
                    job_id = %descriptor.id,
                    dependency = %dep,
                    "unregistered dependency blocks admission"
                );
                missing.push(dep.clone());
                continue;
            }
            missing.push(dep.clone());
        }
        if missing.is_empty() {
            Readiness::Ready
        } else {
            Readiness::Waiting(missing)
        }
    }

    /// Persist a completion record, then update the mirror.
    ///
    /// The write gets its own short retry, independent of the job's retry
    /// budget. On exhaustion the record is not mirrored — the outcome is not
    /// durable, so dependents keep waiting and the next cycle can heal.
    pub async fn record(&self, record: CompletionRecord) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.store.record_completion(&record) {
                Ok(()) => {
                    self.seen.insert(
                        (record.descriptor_id.clone(), record.cycle_key.clone()),
                        record.status,
                    );
                    return Ok(());
                }
                Err(e) if attempt < PERSIST_ATTEMPTS => {
                    warn!(
                        job_id = %record.descriptor_id,
                        attempt,
                        "completion write failed, retrying: {e}"
                    );
                    tokio::time::sleep(PERSIST_RETRY_DELAY * attempt).await;
                }
                Err(e) => {
                    error!(
                        job_id = %record.descriptor_id,
                        cycle = %record.cycle_key,
                        "completion write failed permanently: {e}"
                    );
                    return Err(e);
                }
            }
        }
    }
}

/// DFS over the dependency edges, returning each cycle found as the path of
/// ids that closes it. Unregistered dependency targets are not nodes and
/// cannot form cycles.
pub fn find_cycles(edges: &HashMap<String, Vec<String>>) -> Vec<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Grey,
        Black,
    }

    fn visit<'a>(
        node: &'a str,
        edges: &'a HashMap<String, Vec<String>>,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        marks.insert(node, Mark::Grey);
        path.push(node);
        if let Some(deps) = edges.get(node) {
            for dep in deps {
                match marks.get(dep.as_str()) {
                    None => {
                        if edges.contains_key(dep.as_str()) {
                            visit(dep, edges, marks, path, cycles);
                        }
                    }
                    Some(Mark::Grey) => {
                        if let Some(pos) = path.iter().position(|n| *n == dep.as_str()) {
                            cycles.push(path[pos..].iter().map(|s| s.to_string()).collect());
                        }
                    }
                    Some(Mark::Black) => {}
                }
            }
        }
        path.pop();
        marks.insert(node, Mark::Black);
    }

    let mut marks = HashMap::new();
    let mut path = Vec::new();
    let mut cycles = Vec::new();
    let mut roots: Vec<&str> = edges.keys().map(|s| s.as_str()).collect();
    roots.sort_unstable();
    for root in roots {
        if !marks.contains_key(root) {
            visit(root, edges, &mut marks, &mut path, &mut cycles);
        }
    }
    cycles
}
