//! Shared-context ledger: an append-only, per-run JSONL log of dispatches,
//! observations, and coordinator decisions, used to build the `<shared_context>`
//! handoff packet a child sees alongside its task.
//!
//! The ledger is a behavior-level sum type rather than a struct with an
//! "enabled" flag: [`build_ledger`] returns whichever of [`FileLedger`] or
//! [`NullLedger`] is usable for a given mode and directory, and callers only
//! ever see the [`Ledger`] trait object. No call site branches on whether
//! persistence is active — any I/O failure at construction time, or on a
//! later write, simply routes through the no-op implementation.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;

const MAX_OBSERVATION_SUMMARY: usize = 800;
const MAX_DECISION_SUMMARY: usize = 1000;
const MIN_RECENT: usize = 1;
const MAX_RECENT: usize = 100;

/// How a run shares context between dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContextMode {
    /// Skip writes entirely; packets are always empty.
    Isolated,
    /// Write dispatches/observations and inject packets into child tasks.
    SharedRead,
    /// `shared-read` plus a final coordinator `decision` entry.
    SharedWrite,
}

impl ContextMode {
    pub fn writes_enabled(self) -> bool {
        !matches!(self, ContextMode::Isolated)
    }

    pub fn allows_decision(self) -> bool {
        matches!(self, ContextMode::SharedWrite)
    }
}

/// The handoff envelope for a `dispatch` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchEnvelope {
    pub run_id: String,
    pub task_id: String,
    pub parent_task_id: Option<String>,
    pub agent: String,
    pub task: String,
    pub mode: String,
    pub depth: u32,
    pub created_at_ms: i64,
}

/// Outcome recorded for a completed dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservationStatus {
    Success,
    Error,
}

impl std::fmt::Display for ObservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One line of the ledger file, as read back from disk.
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub entry_id: String,
    pub run_id: String,
    pub created_at_ms: i64,
    #[serde(flatten)]
    pub fields: Value,
}

impl LedgerEntry {
    fn field_str(&self, key: &str) -> &str {
        self.fields.get(key).and_then(Value::as_str).unwrap_or("")
    }

    /// Render this entry the way `build_packet` summarizes it.
    pub fn as_packet_line(&self) -> String {
        let task_id = self.field_str("task_id");
        match self.kind.as_str() {
            "dispatch" => format!("dispatch {} task:{}", self.field_str("agent"), task_id),
            "observation" => format!(
                "{} {} task:{} {}",
                self.field_str("status"),
                self.field_str("agent"),
                task_id,
                self.field_str("summary")
            ),
            "decision" => format!(
                "decision {} task:{} {}",
                self.field_str("coordinator"),
                task_id,
                self.field_str("summary")
            ),
            other => format!("{other} task:{task_id}"),
        }
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars().take(max_chars).collect()
    }
}

fn new_entry_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Behavior shared by [`FileLedger`] and [`NullLedger`]; the orchestrator
/// only ever depends on this trait.
pub trait Ledger: Send + Sync {
    fn append_dispatch(&self, envelope: &DispatchEnvelope, context_mode: ContextMode);

    fn append_observation(
        &self,
        task_id: &str,
        agent: &str,
        status: ObservationStatus,
        summary: &str,
        created_at_ms: i64,
    );

    fn append_decision(&self, task_id: &str, coordinator: &str, summary: &str, created_at_ms: i64);

    fn read_recent(&self, limit: usize) -> Vec<LedgerEntry>;

    /// Assemble the `<shared_context>` packet a child sees, from the most
    /// recent entries in this run.
    fn build_packet(
        &self,
        context_mode: ContextMode,
        envelope: &DispatchEnvelope,
        limit: usize,
    ) -> String {
        if !context_mode.writes_enabled() {
            return String::new();
        }
        let recent = self.read_recent(limit);
        let mut out = String::from("<shared_context>\n");
        out.push_str(&format!("run_id: {}\n", envelope.run_id));
        out.push_str(&format!("task_id: {}\n", envelope.task_id));
        if let Some(parent) = &envelope.parent_task_id {
            out.push_str(&format!("parent_task_id: {parent}\n"));
        }
        out.push_str(&format!("context_mode: {:?}\n", context_mode));
        if recent.is_empty() {
            out.push_str("(no prior entries)\n");
        } else {
            for entry in &recent {
                out.push_str(&format!("- {}\n", entry.as_packet_line()));
            }
        }
        out.push_str(
            "Treat the entries above as source of truth for prior work in this run; do not re-quote long excerpts from them.\n",
        );
        out.push_str("</shared_context>");
        out
    }
}

/// A file-backed ledger at `<cwd>/.pi/subagent-memory/runs/<run_id>.jsonl`.
/// Every write is a single self-delimited JSON line; any I/O failure is
/// logged and swallowed — a ledger must never fail the call it backs.
pub struct FileLedger {
    run_id: String,
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileLedger {
    pub fn ledger_path(cwd: &Path, run_id: &str) -> PathBuf {
        cwd.join(".pi")
            .join("subagent-memory")
            .join("runs")
            .join(format!("{run_id}.jsonl"))
    }

    /// Try to open (creating parent directories as needed) a ledger file
    /// for this run. Returns `None` on any I/O failure, signalling the
    /// caller to fall back to [`NullLedger`].
    pub fn try_new(cwd: &Path, run_id: impl Into<String>) -> Option<Self> {
        let run_id = run_id.into();
        let path = Self::ledger_path(cwd, &run_id);
        if let Some(parent) = path.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                tracing::warn!(error = %err, path = %parent.display(), "ledger directory creation failed, degrading to no-op");
                return None;
            }
        }
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(_) => Some(Self {
                run_id,
                path,
                write_lock: Mutex::new(()),
            }),
            Err(err) => {
                tracing::warn!(error = %err, path = %path.display(), "ledger file open failed, degrading to no-op");
                None
            }
        }
    }

    fn append_line(&self, value: Value) {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let line = match serde_json::to_string(&value) {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(error = %err, "ledger entry serialization failed");
                return;
            }
        };
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(err) = result {
            tracing::warn!(error = %err, path = %self.path.display(), "ledger append failed");
        }
    }
}

impl Ledger for FileLedger {
    fn append_dispatch(&self, envelope: &DispatchEnvelope, context_mode: ContextMode) {
        if !context_mode.writes_enabled() {
            return;
        }
        let value = serde_json::json!({
            "type": "dispatch",
            "entry_id": new_entry_id(),
            "run_id": envelope.run_id,
            "created_at_ms": envelope.created_at_ms,
            "task_id": envelope.task_id,
            "parent_task_id": envelope.parent_task_id,
            "agent": envelope.agent,
            "task": envelope.task,
            "mode": envelope.mode,
            "depth": envelope.depth,
            "context_mode": context_mode,
        });
        self.append_line(value);
    }

    fn append_observation(
        &self,
        task_id: &str,
        agent: &str,
        status: ObservationStatus,
        summary: &str,
        created_at_ms: i64,
    ) {
        let value = serde_json::json!({
            "type": "observation",
            "entry_id": new_entry_id(),
            "run_id": self.run_id,
            "created_at_ms": created_at_ms,
            "task_id": task_id,
            "agent": agent,
            "status": status,
            "summary": truncate(summary, MAX_OBSERVATION_SUMMARY),
        });
        self.append_line(value);
    }

    fn append_decision(&self, task_id: &str, coordinator: &str, summary: &str, created_at_ms: i64) {
        let value = serde_json::json!({
            "type": "decision",
            "entry_id": new_entry_id(),
            "run_id": self.run_id,
            "created_at_ms": created_at_ms,
            "task_id": task_id,
            "coordinator": coordinator,
            "summary": truncate(summary, MAX_DECISION_SUMMARY),
        });
        self.append_line(value);
    }

    fn read_recent(&self, limit: usize) -> Vec<LedgerEntry> {
        let limit = limit.clamp(MIN_RECENT, MAX_RECENT);
        let file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(err) => {
                tracing::warn!(error = %err, path = %self.path.display(), "ledger read failed, returning empty");
                return Vec::new();
            }
        };
        let mut entries = Vec::new();
        for line in BufReader::new(file).lines().map_while(Result::ok) {
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(entry) = serde_json::from_str::<LedgerEntry>(&line) {
                if entry.run_id == self.run_id {
                    entries.push(entry);
                }
            }
        }
        if entries.len() > limit {
            entries.split_off(entries.len() - limit)
        } else {
            entries
        }
    }
}

/// The no-op ledger: isolated mode, or any mode whose file backing could not
/// be opened. Reads always return empty; writes are discarded.
#[derive(Default)]
pub struct NullLedger;

impl Ledger for NullLedger {
    fn append_dispatch(&self, _envelope: &DispatchEnvelope, _context_mode: ContextMode) {}
    fn append_observation(
        &self,
        _task_id: &str,
        _agent: &str,
        _status: ObservationStatus,
        _summary: &str,
        _created_at_ms: i64,
    ) {
    }
    fn append_decision(&self, _task_id: &str, _coordinator: &str, _summary: &str, _created_at_ms: i64) {}
    fn read_recent(&self, _limit: usize) -> Vec<LedgerEntry> {
        Vec::new()
    }
}

/// Build the ledger implementation appropriate for a run: a [`FileLedger`]
/// when the mode writes and the file opens cleanly, a [`NullLedger`]
/// otherwise. Callers receive a trait object and never branch again.
pub fn build_ledger(cwd: &Path, run_id: &str, context_mode: ContextMode) -> Box<dyn Ledger> {
    if !context_mode.writes_enabled() {
        return Box::new(NullLedger);
    }
    match FileLedger::try_new(cwd, run_id) {
        Some(ledger) => Box::new(ledger),
        None => Box::new(NullLedger),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn envelope(run_id: &str, task_id: &str) -> DispatchEnvelope {
        DispatchEnvelope {
            run_id: run_id.to_string(),
            task_id: task_id.to_string(),
            parent_task_id: None,
            agent: "scout".to_string(),
            task: "list files".to_string(),
            mode: "single".to_string(),
            depth: 0,
            created_at_ms: 1_000,
        }
    }

    #[test]
    fn isolated_mode_never_touches_disk() {
        let dir = tempdir().unwrap();
        let ledger = build_ledger(dir.path(), "run-1", ContextMode::Isolated);
        ledger.append_dispatch(&envelope("run-1", "t1"), ContextMode::Isolated);
        assert!(ledger.read_recent(10).is_empty());
        assert!(!FileLedger::ledger_path(dir.path(), "run-1").exists());
    }

    #[test]
    fn file_ledger_appends_and_reads_back_filtered_by_run_id() {
        let dir = tempdir().unwrap();
        let ledger = build_ledger(dir.path(), "run-1", ContextMode::SharedRead);
        ledger.append_dispatch(&envelope("run-1", "t1"), ContextMode::SharedRead);
        ledger.append_observation("t1", "scout", ObservationStatus::Success, "done", 2_000);

        let recent = ledger.read_recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].kind, "dispatch");
        assert_eq!(recent[1].kind, "observation");
    }

    #[test]
    fn read_recent_clamps_limit_and_returns_tail() {
        let dir = tempdir().unwrap();
        let ledger = build_ledger(dir.path(), "run-1", ContextMode::SharedRead);
        for i in 0..5 {
            ledger.append_observation(
                &format!("t{i}"),
                "scout",
                ObservationStatus::Success,
                "done",
                1_000 + i,
            );
        }
        let recent = ledger.read_recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].field_str("task_id"), "t4");
    }

    #[test]
    fn packet_is_empty_in_isolated_mode() {
        let dir = tempdir().unwrap();
        let ledger = build_ledger(dir.path(), "run-1", ContextMode::Isolated);
        let packet = ledger.build_packet(ContextMode::Isolated, &envelope("run-1", "t1"), 10);
        assert!(packet.is_empty());
    }

    #[test]
    fn packet_wraps_shared_context_tags_and_lists_entries() {
        let dir = tempdir().unwrap();
        let ledger = build_ledger(dir.path(), "run-1", ContextMode::SharedRead);
        ledger.append_dispatch(&envelope("run-1", "t1"), ContextMode::SharedRead);
        ledger.append_observation("t1", "scout", ObservationStatus::Success, "found 3 files", 2_000);

        let packet = ledger.build_packet(ContextMode::SharedRead, &envelope("run-1", "t2"), 10);
        assert!(packet.starts_with("<shared_context>"));
        assert!(packet.ends_with("</shared_context>"));
        assert!(packet.contains("dispatch scout task:t1"));
        assert!(packet.contains("success scout task:t1 found 3 files"));
    }

    #[test]
    fn observation_summary_is_truncated_to_800_chars() {
        let dir = tempdir().unwrap();
        let ledger = build_ledger(dir.path(), "run-1", ContextMode::SharedRead);
        let long = "x".repeat(2000);
        ledger.append_observation("t1", "scout", ObservationStatus::Error, &long, 1_000);
        let recent = ledger.read_recent(1);
        assert_eq!(recent[0].field_str("summary").chars().count(), 800);
    }

    #[test]
    fn entries_outside_run_id_are_ignored_on_read() {
        let dir = tempdir().unwrap();
        let path = FileLedger::ledger_path(dir.path(), "run-1");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut f = OpenOptions::new().create(true).append(true).open(&path).unwrap();
        writeln!(
            f,
            r#"{{"type":"dispatch","entry_id":"e1","run_id":"other-run","created_at_ms":1,"task_id":"t1","agent":"scout"}}"#
        )
        .unwrap();
        drop(f);

        let ledger = FileLedger::try_new(dir.path(), "run-1").unwrap();
        ledger.append_observation("t2", "scout", ObservationStatus::Success, "ok", 2_000);
        let recent = ledger.read_recent(10);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].kind, "observation");
    }
}
