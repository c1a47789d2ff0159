//! Durable audit trail for run, node, and schedule transitions.
//!
//! Independent of the store's queryable CRUD tables, every transition the
//! engine and dispatcher make is also appended here as newline-delimited
//! JSON, keyed by run id (or schedule id for dispatcher-only events). This
//! is the durable counterpart to `orchestrator-bus`'s non-durable
//! publish/subscribe stream, and is what crash recovery replays when a
//! snapshot is stale or absent.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use orchestrator_types::{NodeId, NodeStatus, PipelineId, RunId, RunStatus, ScheduleId, ScheduleRunStatus};
use serde::{Deserialize, Serialize};

pub const EVENTS_FILE: &str = "events.jsonl";

pub fn events_path(state_dir: &Path) -> PathBuf {
    state_dir.join(EVENTS_FILE)
}

/// One durable transition record. Every variant that concerns a run
/// carries that run's id so [`EventLog::for_run`] can rebuild its history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    RunCreated {
        run_id: RunId,
        pipeline_id: PipelineId,
        pipeline_version: u32,
    },
    RunStatusChanged {
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
    },
    NodeStatusChanged {
        run_id: RunId,
        node_id: NodeId,
        from: NodeStatus,
        to: NodeStatus,
        attempt: u32,
    },
    ScheduleFired {
        schedule_id: ScheduleId,
        fire_at: DateTime<Utc>,
    },
    ScheduleRunStatusChanged {
        schedule_id: ScheduleId,
        fire_at: DateTime<Utc>,
        to: ScheduleRunStatus,
    },
}

impl AuditEvent {
    pub fn run_id(&self) -> Option<RunId> {
        match self {
            AuditEvent::RunCreated { run_id, .. }
            | AuditEvent::RunStatusChanged { run_id, .. }
            | AuditEvent::NodeStatusChanged { run_id, .. } => Some(*run_id),
            AuditEvent::ScheduleFired { .. } | AuditEvent::ScheduleRunStatusChanged { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: AuditEvent,
}

/// An append-only, in-memory-mirrored JSONL event log.
#[derive(Debug, Default)]
pub struct EventLog {
    records: Vec<EventRecord>,
}

impl EventLog {
    pub fn new() -> Self {
        Self { records: Vec::new() }
    }

    pub fn record(&mut self, event: AuditEvent) {
        self.records.push(EventRecord { at: Utc::now(), event });
    }

    pub fn record_at(&mut self, event: AuditEvent, at: DateTime<Utc>) {
        self.records.push(EventRecord { at, event });
    }

    /// Append every in-memory record not yet flushed to `path`, then clear
    /// the in-memory buffer. Intended to be called after each record so a
    /// crash never loses more than the last unflushed call.
    pub fn flush_to_file(&mut self, path: &Path) -> Result<()> {
        if self.records.is_empty() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create events dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;
        let mut writer = std::io::BufWriter::new(file);
        for record in &self.records {
            let line = serde_json::to_string(record).context("failed to serialize audit event")?;
            writeln!(writer, "{line}").context("failed to write audit event line")?;
        }
        writer.flush().context("failed to flush events file")?;
        self.records.clear();
        Ok(())
    }

    pub fn read_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let file = File::open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line.with_context(|| format!("failed to read line from {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: EventRecord = serde_json::from_str(&line)
                .with_context(|| format!("failed to parse audit event from line: {line}"))?;
            records.push(record);
        }
        Ok(Self { records })
    }

    /// All events recorded for a given run, in the order they were written —
    /// the sequence crash recovery replays to rebuild a run's ready set.
    pub fn for_run(&self, run_id: RunId) -> Vec<&EventRecord> {
        self.records
            .iter()
            .filter(|r| r.event.run_id() == Some(run_id))
            .collect()
    }

    pub fn all(&self) -> &[EventRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Shared write handle the engine and dispatcher append transitions through:
/// one `record` call buffers the event and immediately flushes it to disk,
/// so a crash never loses more than is already acknowledged to a caller.
/// `Send + Sync` via the inner mutex, cheap to share behind an `Arc`.
pub struct AuditSink {
    path: PathBuf,
    log: Mutex<EventLog>,
}

impl AuditSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path, log: Mutex::new(EventLog::new()) }
    }

    /// Append `event` and flush it to disk. Failures are logged, not
    /// propagated: the audit trail is a durability aid for operators and
    /// crash recovery, not something a run should fail over.
    pub fn record(&self, event: AuditEvent) {
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        log.record(event);
        if let Err(e) = log.flush_to_file(&self.path) {
            tracing::warn!(error = %e, path = %self.path.display(), "failed to flush audit event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_run_event(run_id: RunId) -> AuditEvent {
        AuditEvent::RunStatusChanged {
            run_id,
            from: RunStatus::Pending,
            to: RunStatus::Running,
        }
    }

    #[test]
    fn new_log_is_empty() {
        let log = EventLog::new();
        assert!(log.is_empty());
    }

    #[test]
    fn record_then_flush_then_read_back_round_trips() {
        let dir = tempdir().unwrap();
        let path = events_path(dir.path());
        let run_id = RunId::new();

        let mut log = EventLog::new();
        log.record(sample_run_event(run_id));
        log.flush_to_file(&path).unwrap();
        assert!(log.is_empty(), "flush should drain the in-memory buffer");

        let read_back = EventLog::read_from_file(&path).unwrap();
        assert_eq!(read_back.len(), 1);
        assert_eq!(read_back.for_run(run_id).len(), 1);
    }

    #[test]
    fn flush_appends_across_multiple_calls() {
        let dir = tempdir().unwrap();
        let path = events_path(dir.path());
        let run_id = RunId::new();

        let mut log = EventLog::new();
        log.record(sample_run_event(run_id));
        log.flush_to_file(&path).unwrap();
        log.record(sample_run_event(run_id));
        log.flush_to_file(&path).unwrap();

        let read_back = EventLog::read_from_file(&path).unwrap();
        assert_eq!(read_back.len(), 2);
    }

    #[test]
    fn schedule_events_have_no_run_id() {
        let mut log = EventLog::new();
        log.record(AuditEvent::ScheduleFired {
            schedule_id: ScheduleId::new(),
            fire_at: Utc::now(),
        });
        assert_eq!(log.all()[0].event.run_id(), None);
    }

    #[test]
    fn reading_a_missing_file_is_an_empty_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("does-not-exist.jsonl");
        let log = EventLog::read_from_file(&path).unwrap();
        assert!(log.is_empty());
    }
}
