//! Coordinator core: the guardrail budget, shared-context ledger, topology
//! policy, worktree isolation, phase gate state, and coordinator monitor
//! that back the subagent coordinator's execution orchestrator.
//!
//! This crate is pure policy and state — it never spawns a child process or
//! touches stdio. `subagent-coordinator` drives it.

#![allow(clippy::uninlined_format_args)]

pub mod budget;
pub mod error;
pub mod ledger;
pub mod monitor;
pub mod phase_gate;
pub mod topology;
pub mod worktree;

pub use budget::Budget;
pub use error::{CoordinatorError, CoordinatorResult, StructuredError};
pub use ledger::{build_ledger, ContextMode, DispatchEnvelope, Ledger, ObservationStatus};
pub use monitor::{AgentStatus, AgentStatusEntry, CoordinatorMonitor, CoordinatorRun, RunPhase};
pub use phase_gate::{FixOutcome, Gate, GateStatus, PhaseGateState, SmokeFailure, SmokeRunOutcome};
pub use topology::{ExecutionPlan, TaskItem, TopologyDecision, TopologyMode, TopologyPolicy};
pub use worktree::{IsolationChoice, IsolationMode, LaneIntegrationReport, WorktreeAssignment, WorktreeSession};
