//! Coordinator monitor: tracks zero or more in-flight runs and renders a
//! compact status token a downstream UI can poll cheaply.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

const MAX_TOKENS: usize = 3;
const COMPLETION_WINDOW_MS: i64 = 5_000;
const STALE_AFTER_MS: i64 = 60_000;
const MAX_TRACKED_FINISHED: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Starting,
    Dispatch,
    Running,
    Finalizing,
    Done,
    Error,
}

impl RunPhase {
    fn is_finished(self) -> bool {
        matches!(self, RunPhase::Done | RunPhase::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Pending,
    Running,
    Done,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatusEntry {
    pub agent: String,
    pub task: String,
    pub status: AgentStatus,
    pub step: Option<u32>,
    pub error: Option<String>,
}

/// One tracked run, as the monitor sees it.
#[derive(Debug, Clone)]
pub struct CoordinatorRun {
    pub id: u64,
    pub run_id: String,
    pub mode: String,
    pub phase: RunPhase,
    pub agents: Vec<AgentStatusEntry>,
    pub parallel_running: u32,
    pub governance_snapshot: String,
    pub error: Option<String>,
    pub finished_at_ms: Option<i64>,
}

impl CoordinatorRun {
    fn total(&self) -> usize {
        self.agents.len()
    }

    fn running_count(&self) -> u32 {
        self.parallel_running
    }
}

/// Tracks every run the orchestrator has started, pruning stale finished
/// entries so the set stays bounded.
#[derive(Debug, Default)]
pub struct CoordinatorMonitor {
    runs: HashMap<u64, CoordinatorRun>,
    next_id: u64,
}

impl CoordinatorMonitor {
    pub fn new() -> Self {
        Self {
            runs: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn start_run(&mut self, run_id: impl Into<String>, mode: impl Into<String>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.runs.insert(
            id,
            CoordinatorRun {
                id,
                run_id: run_id.into(),
                mode: mode.into(),
                phase: RunPhase::Starting,
                agents: Vec::new(),
                parallel_running: 0,
                governance_snapshot: String::new(),
                error: None,
                finished_at_ms: None,
            },
        );
        id
    }

    pub fn update_phase(&mut self, id: u64, phase: RunPhase, now_ms: i64) {
        if let Some(run) = self.runs.get_mut(&id) {
            run.phase = phase;
            if phase.is_finished() {
                run.finished_at_ms = Some(now_ms);
            }
        }
    }

    pub fn set_error(&mut self, id: u64, message: impl Into<String>, now_ms: i64) {
        if let Some(run) = self.runs.get_mut(&id) {
            run.phase = RunPhase::Error;
            run.error = Some(message.into());
            run.finished_at_ms = Some(now_ms);
        }
    }

    pub fn set_agents(&mut self, id: u64, agents: Vec<AgentStatusEntry>) {
        if let Some(run) = self.runs.get_mut(&id) {
            run.agents = agents;
        }
    }

    pub fn set_parallel_running(&mut self, id: u64, running: u32) {
        if let Some(run) = self.runs.get_mut(&id) {
            run.parallel_running = running;
        }
    }

    pub fn run(&self, id: u64) -> Option<&CoordinatorRun> {
        self.runs.get(&id)
    }

    /// Remove finished runs older than [`STALE_AFTER_MS`], keeping at most
    /// [`MAX_TRACKED_FINISHED`] finished runs regardless of age.
    pub fn prune(&mut self, now_ms: i64) {
        let mut finished: Vec<u64> = self
            .runs
            .values()
            .filter(|r| r.phase.is_finished())
            .map(|r| r.id)
            .collect();
        finished.sort_unstable();

        self.runs.retain(|_, r| match r.finished_at_ms {
            Some(finished_at) => now_ms - finished_at < STALE_AFTER_MS,
            None => true,
        });

        if finished.len() > MAX_TRACKED_FINISHED {
            for id in finished.iter().take(finished.len() - MAX_TRACKED_FINISHED) {
                self.runs.remove(id);
            }
        }
    }

    /// Render the compact status line. Active runs take priority; when
    /// idle, recently-finished runs render `done`/`err` within the
    /// completion window, then the status clears entirely.
    pub fn status_line(&self, now_ms: i64) -> String {
        let mut active: Vec<&CoordinatorRun> = self
            .runs
            .values()
            .filter(|r| !r.phase.is_finished())
            .collect();
        active.sort_by_key(|r| r.id);

        if !active.is_empty() {
            let tokens: Vec<String> = active
                .iter()
                .rev()
                .take(MAX_TOKENS)
                .map(|r| {
                    if r.running_count() > 0 {
                        format!("c{}:a{}:p{}", r.id, r.total(), r.running_count())
                    } else {
                        format!("c{}:a{}", r.id, r.total())
                    }
                })
                .collect();
            return tokens.into_iter().rev().collect::<Vec<_>>().join(" | ");
        }

        let mut recent: Vec<&CoordinatorRun> = self
            .runs
            .values()
            .filter(|r| {
                r.finished_at_ms
                    .map(|t| now_ms - t <= COMPLETION_WINDOW_MS)
                    .unwrap_or(false)
            })
            .collect();
        recent.sort_by_key(|r| r.id);

        let tokens: Vec<String> = recent
            .iter()
            .rev()
            .take(MAX_TOKENS)
            .map(|r| {
                if matches!(r.phase, RunPhase::Error) {
                    format!("c{}:err", r.id)
                } else {
                    format!("c{}:done", r.id)
                }
            })
            .collect();
        tokens.into_iter().rev().collect::<Vec<_>>().join(" | ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_run_renders_agent_count_and_parallel_running() {
        let mut monitor = CoordinatorMonitor::new();
        let id = monitor.start_run("run-1", "parallel");
        monitor.update_phase(id, RunPhase::Running, 0);
        monitor.set_agents(
            id,
            vec![
                AgentStatusEntry {
                    agent: "a".into(),
                    task: "t".into(),
                    status: AgentStatus::Running,
                    step: None,
                    error: None,
                },
                AgentStatusEntry {
                    agent: "b".into(),
                    task: "t".into(),
                    status: AgentStatus::Running,
                    step: None,
                    error: None,
                },
            ],
        );
        monitor.set_parallel_running(id, 2);
        assert_eq!(monitor.status_line(0), format!("c{id}:a2:p2"));
    }

    #[test]
    fn completed_run_shows_done_within_window_then_clears() {
        let mut monitor = CoordinatorMonitor::new();
        let id = monitor.start_run("run-1", "single");
        monitor.update_phase(id, RunPhase::Done, 1_000);
        assert_eq!(monitor.status_line(1_500), format!("c{id}:done"));
        assert_eq!(monitor.status_line(1_000 + COMPLETION_WINDOW_MS + 1), "");
    }

    #[test]
    fn errored_run_renders_err_token() {
        let mut monitor = CoordinatorMonitor::new();
        let id = monitor.start_run("run-1", "single");
        monitor.set_error(id, "boom", 1_000);
        assert_eq!(monitor.status_line(1_200), format!("c{id}:err"));
    }

    #[test]
    fn status_line_caps_at_three_tokens() {
        let mut monitor = CoordinatorMonitor::new();
        let mut ids = Vec::new();
        for i in 0..5 {
            let id = monitor.start_run(format!("run-{i}"), "single");
            monitor.update_phase(id, RunPhase::Running, 0);
            ids.push(id);
        }
        let line = monitor.status_line(0);
        assert_eq!(line.split(" | ").count(), MAX_TOKENS);
    }

    #[test]
    fn prune_removes_stale_finished_runs() {
        let mut monitor = CoordinatorMonitor::new();
        let id = monitor.start_run("run-1", "single");
        monitor.update_phase(id, RunPhase::Done, 0);
        monitor.prune(STALE_AFTER_MS + 1);
        assert!(monitor.run(id).is_none());
    }
}
