//! Filesystem-backed [`StateStore`] implementation.
//!
//! Every record is a standalone JSON file under a state directory,
//! written atomically (write to a sibling `.tmp` file, then rename).
//! This is the reference backend for single-instance deployments and for
//! the test suite; a networked backend (SQL/KV) would implement the same
//! `StateStore` trait and share its CAS semantics.
//!
//! Writes are serialized through a single process-wide mutex. That is the
//! right tradeoff for a development/single-instance backend: it keeps the
//! CAS logic trivially correct at the cost of cross-request parallelism a
//! networked backend wouldn't need to give up.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use orchestrator_schema::SchemaVersion;
use orchestrator_store::{
    NodeId, PipelineId, RunHistoryFilter, RunId, ScheduleId, ScheduleRunId, StateStore, StoreError,
    StoreResult,
};
use orchestrator_types::{
    CircuitBreaker, Lock, NodeResult, Pipeline, Run, RunStatus, Schedule, ScheduleRun,
};
use serde::Serialize;
use serde::de::DeserializeOwned;

fn io_err_to_store(context: &str, e: std::io::Error) -> StoreError {
    use std::io::ErrorKind::*;
    match e.kind() {
        PermissionDenied | Other => StoreError::Transient(format!("{context}: {e}")),
        _ => StoreError::Fatal(format!("{context}: {e}")),
    }
}

/// Sanitize an arbitrary key (a breaker key, a lock key) into a filesystem
/// path segment by replacing characters that are awkward on disk.
fn sanitize_segment(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[derive(Serialize, serde::Deserialize)]
struct Envelope<T> {
    schema_version: u32,
    record: T,
}

pub struct FileSystemBackend {
    root: PathBuf,
    lock: Mutex<()>,
}

impl FileSystemBackend {
    pub fn new(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| io_err_to_store("creating state dir", e))?;
        Ok(Self { root, lock: Mutex::new(()) })
    }

    fn path(&self, segments: &[&str]) -> PathBuf {
        let mut p = self.root.clone();
        for s in segments {
            p.push(s);
        }
        p
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> StoreResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err_to_store("creating parent dir", e))?;
        }
        let envelope = Envelope {
            schema_version: SchemaVersion::current().version(),
            record: value,
        };
        let json = serde_json::to_vec_pretty(&envelope)
            .map_err(|e| StoreError::Fatal(format!("serializing record: {e}")))?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json).map_err(|e| io_err_to_store("writing temp file", e))?;
        fs::rename(&tmp, path).map_err(|e| io_err_to_store("renaming into place", e))?;
        Ok(())
    }

    fn read_json<T: DeserializeOwned>(&self, path: &Path) -> StoreResult<Option<T>> {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(path).map_err(|e| io_err_to_store("reading file", e))?;
        let envelope: Envelope<T> = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::Fatal(format!("deserializing {}: {e}", path.display())))?;
        Ok(Some(envelope.record))
    }

    fn list_json<T: DeserializeOwned>(&self, dir: &Path) -> StoreResult<Vec<T>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(dir).map_err(|e| io_err_to_store("listing dir", e))? {
            let entry = entry.map_err(|e| io_err_to_store("reading dir entry", e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(record) = self.read_json(&path)? {
                out.push(record);
            }
        }
        Ok(out)
    }

    fn pipeline_path(&self, id: PipelineId, version: u32) -> PathBuf {
        self.path(&["pipelines", &id.to_string(), &format!("{version:010}.json")])
    }

    fn pipeline_dir(&self, id: PipelineId) -> PathBuf {
        self.path(&["pipelines", &id.to_string()])
    }

    fn run_path(&self, id: RunId) -> PathBuf {
        self.path(&["runs", &format!("{}.json", id)])
    }

    fn node_result_path(&self, run_id: RunId, node_id: &NodeId) -> PathBuf {
        self.path(&[
            "node_results",
            &run_id.to_string(),
            &format!("{}.json", sanitize_segment(&node_id.0)),
        ])
    }

    fn node_results_dir(&self, run_id: RunId) -> PathBuf {
        self.path(&["node_results", &run_id.to_string()])
    }

    fn breaker_path(&self, key: &str) -> PathBuf {
        self.path(&["breakers", &format!("{}.json", sanitize_segment(key))])
    }

    fn schedule_path(&self, id: ScheduleId) -> PathBuf {
        self.path(&["schedules", &format!("{}.json", id)])
    }

    fn schedule_run_path(&self, id: ScheduleRunId) -> PathBuf {
        self.path(&["schedule_runs", &format!("{}.json", id)])
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.path(&["locks", &format!("{}.json", sanitize_segment(key))])
    }
}

impl StateStore for FileSystemBackend {
    fn put_pipeline(&self, pipeline: &Pipeline) -> StoreResult<()> {
        let _guard = self.lock.lock().unwrap();
        self.write_json(&self.pipeline_path(pipeline.id, pipeline.version), pipeline)
    }

    fn get_pipeline(&self, id: PipelineId, version: u32) -> StoreResult<Pipeline> {
        self.read_json(&self.pipeline_path(id, version))?
            .ok_or_else(|| StoreError::NotFound(format!("pipeline {id} v{version}")))
    }

    fn latest_pipeline_version(&self, id: PipelineId) -> StoreResult<Pipeline> {
        let dir = self.pipeline_dir(id);
        let versions: Vec<Pipeline> = self.list_json(&dir)?;
        versions
            .into_iter()
            .max_by_key(|p| p.version)
            .ok_or_else(|| StoreError::NotFound(format!("pipeline {id}")))
    }

    fn find_pipeline_by_name(&self, name: &str) -> StoreResult<Option<Pipeline>> {
        let pipelines_dir = self.path(&["pipelines"]);
        if !pipelines_dir.exists() {
            return Ok(None);
        }
        let mut best: Option<Pipeline> = None;
        for entry in fs::read_dir(&pipelines_dir).map_err(|e| io_err_to_store("listing pipelines", e))? {
            let entry = entry.map_err(|e| io_err_to_store("reading dir entry", e))?;
            if !entry.path().is_dir() {
                continue;
            }
            for p in self.list_json::<Pipeline>(&entry.path())? {
                if p.name == name && best.as_ref().map(|b| p.version > b.version).unwrap_or(true) {
                    best = Some(p);
                }
            }
        }
        Ok(best)
    }

    fn put_run(&self, run: &Run) -> StoreResult<()> {
        let _guard = self.lock.lock().unwrap();
        self.write_json(&self.run_path(run.id), run)
    }

    fn get_run(&self, id: RunId) -> StoreResult<Run> {
        self.read_json(&self.run_path(id))?
            .ok_or_else(|| StoreError::NotFound(format!("run {id}")))
    }

    fn find_run_by_idempotency_key(&self, key: &str) -> StoreResult<Option<Run>> {
        let runs: Vec<Run> = self.list_json(&self.path(&["runs"]))?;
        Ok(runs.into_iter().find(|r| r.idempotency_key.as_deref() == Some(key)))
    }

    fn cas_update_run(
        &self,
        id: RunId,
        expected_version: u64,
        mutate: &mut dyn FnMut(&mut Run),
    ) -> StoreResult<Run> {
        let _guard = self.lock.lock().unwrap();
        let mut run = self
            .read_json::<Run>(&self.run_path(id))?
            .ok_or_else(|| StoreError::NotFound(format!("run {id}")))?;
        if run.version != expected_version {
            return Err(StoreError::Conflict(format!(
                "run {id} version {} != expected {expected_version}",
                run.version
            )));
        }
        mutate(&mut run);
        run.version = expected_version + 1;
        self.write_json(&self.run_path(id), &run)?;
        Ok(run)
    }

    fn history(&self, filter: &RunHistoryFilter, limit: usize, offset: usize) -> StoreResult<Vec<Run>> {
        let mut runs: Vec<Run> = self
            .list_json::<Run>(&self.path(&["runs"]))?
            .into_iter()
            .filter(|r| r.status.is_terminal())
            .filter(|r| filter.pipeline_id.map(|p| p == r.pipeline_id).unwrap_or(true))
            .filter(|r| filter.status.map(|s| s == r.status).unwrap_or(true))
            .filter(|r| {
                filter
                    .since
                    .zip(r.finished_at)
                    .map(|(since, fin)| fin >= since)
                    .unwrap_or(true)
            })
            .filter(|r| {
                filter
                    .until
                    .zip(r.finished_at)
                    .map(|(until, fin)| fin <= until)
                    .unwrap_or(true)
            })
            .collect();
        runs.sort_by_key(|r| std::cmp::Reverse(r.finished_at));
        Ok(runs.into_iter().skip(offset).take(limit).collect())
    }

    fn stale_running_runs(&self) -> StoreResult<Vec<Run>> {
        let runs: Vec<Run> = self.list_json(&self.path(&["runs"]))?;
        let mut stale = Vec::new();
        for run in runs {
            if run.status != RunStatus::Running {
                continue;
            }
            let key = Lock::run_key(run.id);
            let expired = match self.get_lock(&key)? {
                Some(lock) => lock.is_expired(Utc::now()),
                None => true,
            };
            if expired {
                stale.push(run);
            }
        }
        Ok(stale)
    }

    fn put_node_result(&self, result: &NodeResult) -> StoreResult<()> {
        let _guard = self.lock.lock().unwrap();
        self.write_json(&self.node_result_path(result.run_id, &result.node_id), result)
    }

    fn get_node_result(&self, run_id: RunId, node_id: &NodeId) -> StoreResult<Option<NodeResult>> {
        self.read_json(&self.node_result_path(run_id, node_id))
    }

    fn node_results_for_run(&self, run_id: RunId) -> StoreResult<Vec<NodeResult>> {
        self.list_json(&self.node_results_dir(run_id))
    }

    fn cas_update_node_result(
        &self,
        run_id: RunId,
        node_id: &NodeId,
        expected_version: u64,
        mutate: &mut dyn FnMut(&mut NodeResult),
    ) -> StoreResult<NodeResult> {
        let _guard = self.lock.lock().unwrap();
        let path = self.node_result_path(run_id, node_id);
        let mut result = self
            .read_json::<NodeResult>(&path)?
            .unwrap_or_else(|| NodeResult::pending(run_id, node_id.clone()));
        if result.version != expected_version {
            return Err(StoreError::Conflict(format!(
                "node result {run_id}/{node_id} version {} != expected {expected_version}",
                result.version
            )));
        }
        mutate(&mut result);
        result.version = expected_version + 1;
        self.write_json(&path, &result)?;
        Ok(result)
    }

    fn get_breaker(&self, key: &str) -> StoreResult<Option<CircuitBreaker>> {
        self.read_json(&self.breaker_path(key))
    }

    fn cas_update_breaker(
        &self,
        key: &str,
        expected_version: Option<u64>,
        mutate: &mut dyn FnMut(&mut CircuitBreaker),
        default: &dyn Fn() -> CircuitBreaker,
    ) -> StoreResult<CircuitBreaker> {
        let _guard = self.lock.lock().unwrap();
        let path = self.breaker_path(key);
        let existing = self.read_json::<CircuitBreaker>(&path)?;
        let mut breaker = match (&existing, expected_version) {
            (Some(b), Some(v)) if b.version != v => {
                return Err(StoreError::Conflict(format!(
                    "breaker {key} version {} != expected {v}",
                    b.version
                )));
            }
            (Some(b), _) => b.clone(),
            (None, Some(v)) => {
                return Err(StoreError::Conflict(format!(
                    "breaker {key} missing but caller expected version {v}"
                )));
            }
            (None, None) => default(),
        };
        let next_version = breaker.version + 1;
        mutate(&mut breaker);
        breaker.version = next_version;
        self.write_json(&path, &breaker)?;
        Ok(breaker)
    }

    fn put_schedule(&self, schedule: &Schedule) -> StoreResult<()> {
        let _guard = self.lock.lock().unwrap();
        self.write_json(&self.schedule_path(schedule.id), schedule)
    }

    fn get_schedule(&self, id: ScheduleId) -> StoreResult<Schedule> {
        self.read_json(&self.schedule_path(id))?
            .ok_or_else(|| StoreError::NotFound(format!("schedule {id}")))
    }

    fn list_schedules(&self) -> StoreResult<Vec<Schedule>> {
        self.list_json(&self.path(&["schedules"]))
    }

    fn due_schedules(&self, now: chrono::DateTime<Utc>, limit: usize, offset: usize) -> StoreResult<Vec<Schedule>> {
        let mut due: Vec<Schedule> = self
            .list_schedules()?
            .into_iter()
            .filter(|s| s.is_due(now))
            .collect();
        due.sort_by_key(|s| s.next_fire_at);
        Ok(due.into_iter().skip(offset).take(limit).collect())
    }

    fn cas_update_schedule(
        &self,
        id: ScheduleId,
        expected_version: u64,
        mutate: &mut dyn FnMut(&mut Schedule),
    ) -> StoreResult<Schedule> {
        let _guard = self.lock.lock().unwrap();
        let mut schedule = self
            .read_json::<Schedule>(&self.schedule_path(id))?
            .ok_or_else(|| StoreError::NotFound(format!("schedule {id}")))?;
        if schedule.version != expected_version {
            return Err(StoreError::Conflict(format!(
                "schedule {id} version {} != expected {expected_version}",
                schedule.version
            )));
        }
        mutate(&mut schedule);
        schedule.version = expected_version + 1;
        self.write_json(&self.schedule_path(id), &schedule)?;
        Ok(schedule)
    }

    fn put_schedule_run(&self, run: &ScheduleRun) -> StoreResult<()> {
        let _guard = self.lock.lock().unwrap();
        self.write_json(&self.schedule_run_path(run.id), run)
    }

    fn get_schedule_run(&self, id: ScheduleRunId) -> StoreResult<ScheduleRun> {
        self.read_json(&self.schedule_run_path(id))?
            .ok_or_else(|| StoreError::NotFound(format!("schedule run {id}")))
    }

    fn schedule_runs_for(&self, schedule_id: ScheduleId) -> StoreResult<Vec<ScheduleRun>> {
        let mut runs: Vec<ScheduleRun> = self
            .list_json::<ScheduleRun>(&self.path(&["schedule_runs"]))?
            .into_iter()
            .filter(|r| r.schedule_id == schedule_id)
            .collect();
        runs.sort_by_key(|r| r.fire_at);
        Ok(runs)
    }

    fn non_terminal_schedule_run(&self, schedule_id: ScheduleId) -> StoreResult<Option<ScheduleRun>> {
        Ok(self
            .schedule_runs_for(schedule_id)?
            .into_iter()
            .find(|r| !r.status.is_terminal()))
    }

    fn cas_update_schedule_run(
        &self,
        id: ScheduleRunId,
        expected_version: u64,
        mutate: &mut dyn FnMut(&mut ScheduleRun),
    ) -> StoreResult<ScheduleRun> {
        let _guard = self.lock.lock().unwrap();
        let mut run = self
            .read_json::<ScheduleRun>(&self.schedule_run_path(id))?
            .ok_or_else(|| StoreError::NotFound(format!("schedule run {id}")))?;
        if run.version != expected_version {
            return Err(StoreError::Conflict(format!(
                "schedule run {id} version {} != expected {expected_version}",
                run.version
            )));
        }
        mutate(&mut run);
        run.version = expected_version + 1;
        self.write_json(&self.schedule_run_path(id), &run)?;
        Ok(run)
    }

    fn get_lock(&self, key: &str) -> StoreResult<Option<Lock>> {
        self.read_json(&self.lock_path(key))
    }

    fn put_lock(&self, lock: &Lock) -> StoreResult<()> {
        let _guard = self.lock.lock().unwrap();
        self.write_json(&self.lock_path(&lock.key), lock)
    }

    fn delete_lock(&self, key: &str) -> StoreResult<()> {
        let _guard = self.lock.lock().unwrap();
        let path = self.lock_path(key);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| io_err_to_store("deleting lock file", e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_environment::InstanceId;
    use orchestrator_types::{FailureMode, NodeKind, PipelineStatus};
    use tempfile::tempdir;

    fn sample_pipeline() -> Pipeline {
        Pipeline {
            id: PipelineId::new(),
            name: "sample".into(),
            version: 1,
            nodes: vec![orchestrator_types::Node::new("t", NodeKind::Trigger)],
            edges: vec![],
            input_schema: None,
            default_policy: Default::default(),
            default_failure_mode: FailureMode::FailRun,
            status: PipelineStatus::Active,
        }
    }

    #[test]
    fn put_then_get_pipeline_round_trips() {
        let dir = tempdir().unwrap();
        let backend = FileSystemBackend::new(dir.path()).unwrap();
        let pipeline = sample_pipeline();
        backend.put_pipeline(&pipeline).unwrap();
        let fetched = backend.get_pipeline(pipeline.id, pipeline.version).unwrap();
        assert_eq!(fetched, pipeline);
    }

    #[test]
    fn get_missing_pipeline_is_not_found() {
        let dir = tempdir().unwrap();
        let backend = FileSystemBackend::new(dir.path()).unwrap();
        let err = backend.get_pipeline(PipelineId::new(), 1).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn latest_pipeline_version_picks_max() {
        let dir = tempdir().unwrap();
        let backend = FileSystemBackend::new(dir.path()).unwrap();
        let mut p1 = sample_pipeline();
        let mut p2 = p1.clone();
        p2.version = 2;
        backend.put_pipeline(&p1).unwrap();
        backend.put_pipeline(&p2).unwrap();
        p1.version = 1;
        let latest = backend.latest_pipeline_version(p1.id).unwrap();
        assert_eq!(latest.version, 2);
    }

    #[test]
    fn cas_update_run_rejects_stale_version() {
        let dir = tempdir().unwrap();
        let backend = FileSystemBackend::new(dir.path()).unwrap();
        let run = Run::new(PipelineId::new(), 1, serde_json::json!({}));
        backend.put_run(&run).unwrap();

        let updated = backend
            .cas_update_run(run.id, 0, &mut |r| r.status = RunStatus::Running)
            .unwrap();
        assert_eq!(updated.version, 1);
        assert_eq!(updated.status, RunStatus::Running);

        let err = backend
            .cas_update_run(run.id, 0, &mut |r| r.status = RunStatus::Failed)
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn find_run_by_idempotency_key() {
        let dir = tempdir().unwrap();
        let backend = FileSystemBackend::new(dir.path()).unwrap();
        let mut run = Run::new(PipelineId::new(), 1, serde_json::json!({}));
        run.idempotency_key = Some("abc".into());
        backend.put_run(&run).unwrap();

        let found = backend.find_run_by_idempotency_key("abc").unwrap().unwrap();
        assert_eq!(found.id, run.id);
        assert!(backend.find_run_by_idempotency_key("missing").unwrap().is_none());
    }

    #[test]
    fn breaker_cas_creates_on_first_write() {
        let dir = tempdir().unwrap();
        let backend = FileSystemBackend::new(dir.path()).unwrap();
        let key = "pipeline/node";
        let breaker = backend
            .cas_update_breaker(
                key,
                None,
                &mut |b| b.consecutive_failures += 1,
                &|| CircuitBreaker::closed(key, 3, orchestrator_duration::HumanDuration::from_secs(30)),
            )
            .unwrap();
        assert_eq!(breaker.consecutive_failures, 1);
        assert_eq!(breaker.version, 1);
    }

    #[test]
    fn lock_round_trips_and_deletes() {
        let dir = tempdir().unwrap();
        let backend = FileSystemBackend::new(dir.path()).unwrap();
        let lock = Lock {
            key: "scheduler.primary".into(),
            owner: InstanceId::generate(),
            acquired_at: Utc::now(),
            lease_expires_at: Utc::now() + chrono::Duration::seconds(30),
        };
        backend.put_lock(&lock).unwrap();
        assert!(backend.get_lock(&lock.key).unwrap().is_some());
        backend.delete_lock(&lock.key).unwrap();
        assert!(backend.get_lock(&lock.key).unwrap().is_none());
    }

    #[test]
    fn stale_running_runs_detects_expired_lock() {
        let dir = tempdir().unwrap();
        let backend = FileSystemBackend::new(dir.path()).unwrap();
        let mut run = Run::new(PipelineId::new(), 1, serde_json::json!({}));
        run.status = RunStatus::Running;
        backend.put_run(&run).unwrap();

        // No lock at all counts as stale (crashed before acquiring/renewing).
        let stale = backend.stale_running_runs().unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, run.id);
    }

    #[test]
    fn history_filters_to_terminal_runs_only() {
        let dir = tempdir().unwrap();
        let backend = FileSystemBackend::new(dir.path()).unwrap();
        let pipeline_id = PipelineId::new();

        let mut pending = Run::new(pipeline_id, 1, serde_json::json!({}));
        pending.status = RunStatus::Running;
        backend.put_run(&pending).unwrap();

        let mut done = Run::new(pipeline_id, 1, serde_json::json!({}));
        done.status = RunStatus::Succeeded;
        done.finished_at = Some(Utc::now());
        backend.put_run(&done).unwrap();

        let results = backend
            .history(&RunHistoryFilter::default(), 10, 0)
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, done.id);
    }
}
