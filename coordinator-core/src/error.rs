//! Structured error taxonomy for the subagent coordinator.
//!
//! Every failure class from the coordinator's error handling design is a
//! variant here: input validation, budget/guardrail violations, child
//! execution failures, worktree integration failures, smoke gate failures,
//! and cleanup warnings. Variants carry enough context to render a
//! tool-output message without killing the orchestrator process.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// All ways a coordinator call can fail.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    // ---- (1) Input validation ----
    #[error("exactly one of {{single, parallel, chain}} must be provided")]
    InvalidModeCount,

    #[error("unknown agent: {agent}")]
    UnknownAgent { agent: String },

    #[error("invalid topology policy: {policy}")]
    InvalidPolicy { policy: String },

    #[error("invalid phase gate configuration: {message}")]
    InvalidPhaseGateConfig { message: String },

    // ---- (2) Budget / guardrail ----
    #[error("loop detected: duplicate delegation for {fingerprint}")]
    LoopDetected { fingerprint: String },

    #[error("subagent budget exhausted: need {needed}, have {remaining}")]
    BudgetExhausted { needed: u32, remaining: u32 },

    #[error("max delegation depth exceeded: depth {depth} > max_depth {max_depth}")]
    DepthExceeded { depth: u32, max_depth: u32 },

    #[error("run deadline reached")]
    DeadlineReached,

    #[error("nested spawn blocked: agent does not declare the delegation capability")]
    NestedSpawnBlocked,

    // ---- (3) Child execution ----
    #[error("child process exited with code {exit_code}: {message}")]
    ChildFailed { exit_code: i32, message: String },

    #[error("child process wall-time exceeded")]
    ChildTimedOut,

    #[error("child process aborted by cancellation")]
    ChildAborted,

    // ---- (4) Integration ----
    #[error("worktree integration failed ({lane}): {message}")]
    IntegrationFailed { lane: String, message: String },

    // ---- (5) Smoke gate ----
    #[error("phase smoke gate failed: {message}")]
    SmokeGateFailed { message: String },

    #[error("phase smoke fix attempts exhausted ({attempts}/{max})")]
    SmokeFixExhausted { attempts: u32, max: u32 },

    // ---- (6) Cleanup (always non-fatal; kept for structured reporting) ----
    #[error("worktree cleanup warning: {message}")]
    CleanupWarning { message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl CoordinatorError {
    /// Whether retrying the same operation might succeed without caller
    /// intervention (e.g. a timeout, a transient I/O error).
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ChildTimedOut => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// A short, human-actionable recovery hint, if one exists.
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            Self::LoopDetected { .. } => {
                Some("rephrase the task or agent so it is not a duplicate delegation")
            }
            Self::BudgetExhausted { .. } => {
                Some("reduce the number of planned tasks or raise remaining_tokens")
            }
            Self::DepthExceeded { .. } => Some("flatten the delegation chain"),
            Self::DeadlineReached => Some("raise the run deadline or shorten the plan"),
            Self::NestedSpawnBlocked => {
                Some("grant the agent the delegation capability before nesting")
            }
            Self::SmokeFixExhausted { .. } => {
                Some("inspect smoke_fix_history for the last failing command")
            }
            _ => None,
        }
    }

    /// Stable machine-readable code for this error's variant, independent of
    /// the interpolated `Display` message.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidModeCount => "invalid_mode_count",
            Self::UnknownAgent { .. } => "unknown_agent",
            Self::InvalidPolicy { .. } => "invalid_policy",
            Self::InvalidPhaseGateConfig { .. } => "invalid_phase_gate_config",
            Self::LoopDetected { .. } => "loop_detected",
            Self::BudgetExhausted { .. } => "budget_exhausted",
            Self::DepthExceeded { .. } => "depth_exceeded",
            Self::DeadlineReached => "deadline_reached",
            Self::NestedSpawnBlocked => "nested_spawn_blocked",
            Self::ChildFailed { .. } => "child_failed",
            Self::ChildTimedOut => "child_timed_out",
            Self::ChildAborted => "child_aborted",
            Self::IntegrationFailed { .. } => "integration_failed",
            Self::SmokeGateFailed { .. } => "smoke_gate_failed",
            Self::SmokeFixExhausted { .. } => "smoke_fix_exhausted",
            Self::CleanupWarning { .. } => "cleanup_warning",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
        }
    }

    /// Render as the agent-friendly structured error the orchestrator emits
    /// as tool output instead of propagating a process-killing panic.
    pub fn to_structured(&self) -> StructuredError {
        StructuredError::new(self.code(), self.to_string())
            .retryable(self.is_retryable())
            .maybe_recovery(self.recovery_suggestion())
    }

    pub fn to_structured_json(&self) -> String {
        serde_json::to_string(&self.to_structured()).unwrap_or_else(|_| {
            format!(r#"{{"code":"{}","message":"{}"}}"#, self.code(), self)
        })
    }
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Agent-friendly structured error representation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredError {
    pub code: String,
    pub message: String,
    pub recovery_action: Option<String>,
    #[serde(default)]
    pub context: HashMap<String, Value>,
    pub retryable: bool,
}

impl StructuredError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            recovery_action: None,
            context: HashMap::new(),
            retryable: false,
        }
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn maybe_recovery(mut self, suggestion: Option<&str>) -> Self {
        self.recovery_action = suggestion.map(str::to_string);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }
}

impl std::fmt::Display for StructuredError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for StructuredError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_detected_is_not_retryable_and_has_hint() {
        let err = CoordinatorError::LoopDetected {
            fingerprint: "scout::list files".into(),
        };
        assert!(!err.is_retryable());
        assert!(err.recovery_suggestion().is_some());
        assert_eq!(err.code(), "loop_detected");
    }

    #[test]
    fn timeout_is_retryable() {
        let err = CoordinatorError::ChildTimedOut;
        assert!(err.is_retryable());
    }

    #[test]
    fn structured_round_trips_through_json() {
        let err = CoordinatorError::BudgetExhausted {
            needed: 4,
            remaining: 3,
        };
        let structured = err.to_structured();
        let json = serde_json::to_string(&structured).unwrap();
        let back: StructuredError = serde_json::from_str(&json).unwrap();
        assert_eq!(back.code, "budget_exhausted");
        assert!(back.message.contains("need 4"));
    }
}
