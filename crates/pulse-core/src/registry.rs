//! Process-wide run registry: run-ID allocation, abort routing, live-stats
//! handles and persisted results, in one explicit container instead of
//! scattered globals.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::abort::Aborter;
use crate::live::LiveStatsHandle;
use crate::progress::{ProgressBroker, EVICTION_GRACE};
use crate::runner::RunnerResults;

/// One line of the active-run status listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: i64,
    pub run_type: String,
    pub labels: String,
    pub started: DateTime<Utc>,
}

struct ActiveRun {
    summary: RunSummary,
    aborter: Arc<Aborter>,
    live: Arc<LiveStatsHandle>,
}

pub struct Registry {
    next_id: AtomicI64,
    active: RwLock<HashMap<i64, ActiveRun>>,
    broker: Arc<ProgressBroker>,
    data_dir: PathBuf,
}

impl Registry {
    pub fn new(data_dir: impl Into<PathBuf>) -> Registry {
        Registry {
            next_id: AtomicI64::new(0),
            active: RwLock::new(HashMap::new()),
            broker: Arc::new(ProgressBroker::new()),
            data_dir: data_dir.into(),
        }
    }

    pub fn broker(&self) -> Arc<ProgressBroker> {
        self.broker.clone()
    }

    /// Monotonic within the process lifetime, starting at 1.
    pub fn next_run_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Registers a run, creating its aborter and live-stats handle.
    pub fn register(
        &self,
        run_id: i64,
        run_type: &str,
        labels: &str,
    ) -> (Arc<Aborter>, Arc<LiveStatsHandle>) {
        let aborter = Arc::new(Aborter::new());
        let live = Arc::new(LiveStatsHandle::new());
        let entry = ActiveRun {
            summary: RunSummary {
                run_id,
                run_type: run_type.to_string(),
                labels: labels.to_string(),
                started: Utc::now(),
            },
            aborter: aborter.clone(),
            live: live.clone(),
        };
        let mut active = write_lock(&self.active);
        if active.insert(run_id, entry).is_some() {
            warn!(run_id, "run id registered twice");
        }
        (aborter, live)
    }

    pub fn live_stats(&self, run_id: i64) -> Option<Arc<LiveStatsHandle>> {
        read_lock(&self.active).get(&run_id).map(|r| r.live.clone())
    }

    /// Aborts a run by ID. Returns false when no such run is active.
    pub fn stop_by_run_id(&self, run_id: i64) -> bool {
        let aborter = read_lock(&self.active)
            .get(&run_id)
            .map(|r| r.aborter.clone());
        match aborter {
            Some(a) => {
                info!(run_id, "stop requested");
                a.abort();
                true
            }
            None => false,
        }
    }

    /// Summaries of the currently active runs, ordered by run ID.
    pub fn status(&self) -> Vec<RunSummary> {
        let mut runs: Vec<RunSummary> = read_lock(&self.active)
            .values()
            .map(|r| r.summary.clone())
            .collect();
        runs.sort_by_key(|r| r.run_id);
        runs
    }

    /// Drops the run's registry entry after the same grace period the
    /// progress broker uses, so a stop request racing the run's end still
    /// resolves.
    pub fn finish(self: &Arc<Registry>, run_id: i64) {
        let registry = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(EVICTION_GRACE).await;
            write_lock(&registry.active).remove(&run_id);
        });
    }

    /// Writes the pretty-printed JSON result under the data directory,
    /// named by the result ID. Returns the path.
    pub fn save_result(&self, results: &RunnerResults) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.data_dir)?;
        let path = self.data_dir.join(format!("{}.json", results.id));
        let json = serde_json::to_string_pretty(results)?;
        std::fs::write(&path, json)?;
        info!(path = %path.display(), "results written");
        Ok(path)
    }

    /// File names (without directory) of all persisted results, sorted.
    pub fn list_results(&self) -> anyhow::Result<Vec<String>> {
        let mut names = Vec::new();
        let entries = match std::fs::read_dir(&self.data_dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(".json") {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Reads one persisted result by file name. Bare names only: anything
    /// path-like is rejected.
    pub fn get_result(&self, name: &str) -> anyhow::Result<String> {
        if name.contains('/') || name.contains('\\') || name.contains("..") {
            anyhow::bail!("invalid result name {name:?}");
        }
        let path = self.data_dir.join(name);
        Ok(std::fs::read_to_string(path)?)
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{make_result_id, AdapterCounters};
    use crate::stats::{Histogram, ResultCodeMap};

    fn test_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "pulse-registry-{}-{}",
            tag,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn sample_results(labels: &str) -> RunnerResults {
        let start = Utc::now();
        let mut h = Histogram::new(0., 0.001).unwrap();
        h.record(0.002);
        RunnerResults {
            id: make_result_id(labels, "mock", &start),
            run_type: "mock".to_string(),
            labels: labels.to_string(),
            start_time: start,
            run_id: 1,
            requested_qps: "8".to_string(),
            requested_duration: "5s".to_string(),
            actual_qps: 8.,
            actual_duration: 5.,
            num_threads: 1,
            exactly: 0,
            jitter: false,
            uniform: false,
            no_catch_up: false,
            duration_histogram: h.export(),
            errors_duration_histogram: Histogram::new(0., 0.001).unwrap().export(),
            ret_codes: ResultCodeMap::new(),
            counters: AdapterCounters::default(),
        }
    }

    #[test]
    fn run_ids_are_monotonic() {
        let r = Registry::new(test_dir("ids"));
        let a = r.next_run_id();
        let b = r.next_run_id();
        let c = r.next_run_id();
        assert!(a < b && b < c);
        assert_eq!(a, 1);
    }

    #[test]
    fn stop_routes_to_the_right_aborter() {
        let r = Registry::new(test_dir("stop"));
        let id = r.next_run_id();
        let (aborter, _live) = r.register(id, "mock", "");
        assert!(!aborter.is_aborted());
        assert!(r.stop_by_run_id(id));
        assert!(aborter.is_aborted());
        assert!(!r.stop_by_run_id(id + 1));
    }

    #[test]
    fn status_lists_active_runs() {
        let r = Registry::new(test_dir("status"));
        let id1 = r.next_run_id();
        let id2 = r.next_run_id();
        r.register(id2, "tcp", "b");
        r.register(id1, "http", "a");
        let status = r.status();
        assert_eq!(status.len(), 2);
        assert_eq!(status[0].run_id, id1);
        assert_eq!(status[0].run_type, "http");
        assert_eq!(status[1].run_id, id2);
    }

    #[tokio::test(start_paused = true)]
    async fn finish_evicts_after_grace() {
        let r = Arc::new(Registry::new(test_dir("finish")));
        let id = r.next_run_id();
        r.register(id, "mock", "");
        r.finish(id);
        assert!(r.live_stats(id).is_some());
        tokio::time::sleep(EVICTION_GRACE + std::time::Duration::from_secs(1)).await;
        assert!(r.live_stats(id).is_none());
    }

    #[test]
    fn save_list_get_results() {
        let r = Registry::new(test_dir("save"));
        let res = sample_results("t1");
        let path = r.save_result(&res).unwrap();
        assert!(path.exists());

        let names = r.list_results().unwrap();
        assert_eq!(names.len(), 1);
        assert!(names[0].ends_with(".json"));

        let body = r.get_result(&names[0]).unwrap();
        assert!(body.contains("\"RunType\": \"mock\""));
    }

    #[test]
    fn get_result_rejects_path_traversal() {
        let r = Registry::new(test_dir("traversal"));
        assert!(r.get_result("../etc/passwd").is_err());
        assert!(r.get_result("a/b.json").is_err());
    }

    #[test]
    fn list_results_empty_when_dir_missing() {
        let r = Registry::new(test_dir("missing"));
        assert!(r.list_results().unwrap().is_empty());
    }
}
