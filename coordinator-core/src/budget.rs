//! Guardrail budget: the execution budget that bounds how deep, how long,
//! and how many children a run may spawn, and the loop-detection fingerprint
//! set that prevents a coordinator from re-dispatching the same work.
//!
//! The budget is environment-encoded so it survives a process boundary: a
//! nested child coordinator reconstructs the same `Budget` shape by reading
//! nine variables out of its own environment. See [`ENV_VARS`] for the full
//! list and [`Budget::from_env`]/[`Budget::to_env`] for the round trip.

use std::collections::{HashMap, HashSet};

use crate::error::{CoordinatorError, CoordinatorResult};

pub const ENV_RUN_ID: &str = "SUBAGENT_RUN_ID";
pub const ENV_DEPTH: &str = "SUBAGENT_DEPTH";
pub const ENV_MAX_DEPTH: &str = "SUBAGENT_MAX_DEPTH";
pub const ENV_ROOT_STARTED_AT_MS: &str = "SUBAGENT_ROOT_STARTED_AT_MS";
pub const ENV_DEADLINE_AT_MS: &str = "SUBAGENT_DEADLINE_AT_MS";
pub const ENV_REMAINING_TOKENS: &str = "SUBAGENT_REMAINING_TOKENS";
pub const ENV_FINGERPRINTS: &str = "SUBAGENT_FINGERPRINTS";
pub const ENV_CAN_SPAWN_CHILDREN: &str = "SUBAGENT_CAN_SPAWN_CHILDREN";
pub const ENV_CONTEXT_MODE: &str = "SUBAGENT_CONTEXT_MODE";

/// The nine environment variables the budget is encoded into, in the order
/// documented above. A nested child's environment must carry all of these.
pub const ENV_VARS: [&str; 9] = [
    ENV_RUN_ID,
    ENV_DEPTH,
    ENV_MAX_DEPTH,
    ENV_ROOT_STARTED_AT_MS,
    ENV_DEADLINE_AT_MS,
    ENV_REMAINING_TOKENS,
    ENV_FINGERPRINTS,
    ENV_CAN_SPAWN_CHILDREN,
    ENV_CONTEXT_MODE,
];

const DEFAULT_MAX_DEPTH: u32 = 2;
const DEFAULT_DEADLINE_MS: i64 = 10 * 60 * 1000;
const DEFAULT_REMAINING_TOKENS: u32 = 16;

/// The budget that bounds a single run (and, recursively, every nested
/// delegation spawned from it).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Budget {
    pub run_id: String,
    pub depth: u32,
    pub max_depth: u32,
    pub root_started_at_ms: i64,
    pub deadline_at_ms: i64,
    pub remaining_tokens: u32,
    pub fingerprints: HashSet<String>,
    pub can_spawn_children: bool,
    pub context_mode: String,
}

fn env_var(env: &HashMap<String, String>, key: &str) -> Option<String> {
    env.get(key).cloned()
}

fn parse_or<T: std::str::FromStr>(env: &HashMap<String, String>, key: &str, default: T) -> T {
    env_var(env, key)
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl Budget {
    /// Construct a fresh root budget, the shape a run has when no budget
    /// environment was inherited from a parent process.
    pub fn root(run_id: impl Into<String>, now_ms: i64) -> Self {
        Self {
            run_id: run_id.into(),
            depth: 0,
            max_depth: DEFAULT_MAX_DEPTH,
            root_started_at_ms: now_ms,
            deadline_at_ms: now_ms + DEFAULT_DEADLINE_MS,
            remaining_tokens: DEFAULT_REMAINING_TOKENS,
            fingerprints: HashSet::new(),
            can_spawn_children: true,
            context_mode: "isolated".to_string(),
        }
    }

    /// Reconstruct a budget from a process environment, falling back to root
    /// defaults for any variable that is missing or malformed. `now_ms` is
    /// used only as the root-start/deadline fallback for a freshly rooted
    /// run; an inherited budget always trusts its own encoded timestamps.
    pub fn from_env(env: &HashMap<String, String>, default_run_id: impl Into<String>, now_ms: i64) -> Self {
        let run_id = env_var(env, ENV_RUN_ID).unwrap_or_else(|| default_run_id.into());
        let fingerprints = env_var(env, ENV_FINGERPRINTS)
            .and_then(|raw| serde_json::from_str::<Vec<String>>(&raw).ok())
            .map(|v| v.into_iter().collect())
            .unwrap_or_default();
        let can_spawn_children = env_var(env, ENV_CAN_SPAWN_CHILDREN)
            .map(|v| v == "1")
            .unwrap_or(true);
        Self {
            depth: parse_or(env, ENV_DEPTH, 0),
            max_depth: parse_or(env, ENV_MAX_DEPTH, DEFAULT_MAX_DEPTH),
            root_started_at_ms: parse_or(env, ENV_ROOT_STARTED_AT_MS, now_ms),
            deadline_at_ms: parse_or(env, ENV_DEADLINE_AT_MS, now_ms + DEFAULT_DEADLINE_MS),
            remaining_tokens: parse_or(env, ENV_REMAINING_TOKENS, DEFAULT_REMAINING_TOKENS),
            fingerprints,
            can_spawn_children,
            context_mode: env_var(env, ENV_CONTEXT_MODE).unwrap_or_else(|| "isolated".to_string()),
            run_id,
        }
    }

    /// Serialize into the nine environment variables a child process should
    /// inherit. The fingerprint set is encoded as a JSON array string.
    pub fn to_env(&self) -> HashMap<String, String> {
        let mut out = HashMap::with_capacity(ENV_VARS.len());
        out.insert(ENV_RUN_ID.to_string(), self.run_id.clone());
        out.insert(ENV_DEPTH.to_string(), self.depth.to_string());
        out.insert(ENV_MAX_DEPTH.to_string(), self.max_depth.to_string());
        out.insert(
            ENV_ROOT_STARTED_AT_MS.to_string(),
            self.root_started_at_ms.to_string(),
        );
        out.insert(ENV_DEADLINE_AT_MS.to_string(), self.deadline_at_ms.to_string());
        out.insert(
            ENV_REMAINING_TOKENS.to_string(),
            self.remaining_tokens.to_string(),
        );
        let fp: Vec<&String> = self.fingerprints.iter().collect();
        out.insert(
            ENV_FINGERPRINTS.to_string(),
            serde_json::to_string(&fp).unwrap_or_else(|_| "[]".to_string()),
        );
        out.insert(
            ENV_CAN_SPAWN_CHILDREN.to_string(),
            if self.can_spawn_children { "1" } else { "0" }.to_string(),
        );
        out.insert(ENV_CONTEXT_MODE.to_string(), self.context_mode.clone());
        out
    }

    pub fn deadline_reached(&self, now_ms: i64) -> bool {
        now_ms >= self.deadline_at_ms
    }

    /// Canonical fingerprint for a (agent, task) dispatch: the thing loop
    /// detection keys on. Normalization is intentionally crude (lowercase +
    /// collapse whitespace) and is not meant to catch paraphrases — only
    /// verbatim re-dispatch modulo spacing.
    pub fn fingerprint(agent: &str, task: &str) -> String {
        format!("{}::{}", agent.trim().to_lowercase(), normalize_task(task))
    }

    /// Reserve a child delegation against this budget, mutating `self` (the
    /// reserving parent) and returning the freshly minted child budget.
    ///
    /// `allow_nested` reflects whether the child agent's declared tool set
    /// names the delegation capability — it is the caller's responsibility
    /// to look that up; the budget itself only propagates the bit.
    pub fn reserve_child(
        &mut self,
        agent: &str,
        task: &str,
        reserved_descendants: u32,
        allow_nested: bool,
        now_ms: i64,
    ) -> CoordinatorResult<Budget> {
        if !self.can_spawn_children {
            return Err(CoordinatorError::NestedSpawnBlocked);
        }
        if self.depth >= self.max_depth {
            return Err(CoordinatorError::DepthExceeded {
                depth: self.depth,
                max_depth: self.max_depth,
            });
        }
        if self.deadline_reached(now_ms) {
            return Err(CoordinatorError::DeadlineReached);
        }
        let needed = 1 + reserved_descendants;
        if self.remaining_tokens < needed {
            return Err(CoordinatorError::BudgetExhausted {
                needed,
                remaining: self.remaining_tokens,
            });
        }
        let fingerprint = Self::fingerprint(agent, task);
        if self.fingerprints.contains(&fingerprint) {
            return Err(CoordinatorError::LoopDetected { fingerprint });
        }

        self.fingerprints.insert(fingerprint);
        self.remaining_tokens -= needed;

        Ok(Budget {
            run_id: self.run_id.clone(),
            depth: self.depth + 1,
            max_depth: self.max_depth,
            root_started_at_ms: self.root_started_at_ms,
            deadline_at_ms: self.deadline_at_ms,
            remaining_tokens: reserved_descendants,
            fingerprints: self.fingerprints.clone(),
            can_spawn_children: allow_nested,
            context_mode: self.context_mode.clone(),
        })
    }
}

fn normalize_task(task: &str) -> String {
    task.trim().to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_budget_has_documented_defaults() {
        let b = Budget::root("run-1", 1_000);
        assert_eq!(b.depth, 0);
        assert_eq!(b.max_depth, DEFAULT_MAX_DEPTH);
        assert_eq!(b.remaining_tokens, DEFAULT_REMAINING_TOKENS);
        assert_eq!(b.deadline_at_ms, 1_000 + DEFAULT_DEADLINE_MS);
        assert!(b.can_spawn_children);
    }

    #[test]
    fn env_round_trip_preserves_fields() {
        let mut b = Budget::root("run-42", 1_000);
        b.fingerprints.insert("scout::list files".to_string());
        let env = b.to_env();
        let restored = Budget::from_env(&env, "fallback", 1_000);
        assert_eq!(restored, b);
    }

    #[test]
    fn from_env_falls_back_on_malformed_values() {
        let mut env = HashMap::new();
        env.insert(ENV_MAX_DEPTH.to_string(), "not-a-number".to_string());
        let b = Budget::from_env(&env, "fallback-run", 5_000);
        assert_eq!(b.max_depth, DEFAULT_MAX_DEPTH);
        assert_eq!(b.run_id, "fallback-run");
    }

    #[test]
    fn reserve_child_rejects_duplicate_fingerprint() {
        let mut b = Budget::root("run-1", 0);
        b.reserve_child("scout", "list files", 0, false, 0).unwrap();
        let err = b
            .reserve_child("scout", "list files", 0, false, 0)
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::LoopDetected { .. }));
    }

    #[test]
    fn reserve_child_rejects_when_depth_exhausted() {
        let mut b = Budget::root("run-1", 0);
        b.depth = b.max_depth;
        let err = b
            .reserve_child("scout", "list files", 0, false, 0)
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::DepthExceeded { .. }));
    }

    #[test]
    fn reserve_child_rejects_past_deadline() {
        let mut b = Budget::root("run-1", 0);
        let deadline = b.deadline_at_ms;
        let err = b
            .reserve_child("scout", "list files", 0, false, deadline + 1)
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::DeadlineReached));
    }

    #[test]
    fn reserve_child_rejects_when_tokens_insufficient() {
        let mut b = Budget::root("run-1", 0);
        b.remaining_tokens = 0;
        let err = b
            .reserve_child("scout", "list files", 0, false, 0)
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::BudgetExhausted { .. }));
    }

    #[test]
    fn reserve_child_rejects_when_nested_spawn_blocked() {
        let mut b = Budget::root("run-1", 0);
        b.can_spawn_children = false;
        let err = b
            .reserve_child("scout", "list files", 0, false, 0)
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::NestedSpawnBlocked));
    }

    #[test]
    fn reserve_child_accounts_for_descendant_reservation() {
        let mut b = Budget::root("run-1", 0);
        b.remaining_tokens = 3;
        let child = b
            .reserve_child("scout", "list files", 2, false, 0)
            .unwrap();
        assert_eq!(child.remaining_tokens, 2);
        assert_eq!(b.remaining_tokens, 0);
    }

    #[test]
    fn reserve_child_propagates_allow_nested_bit() {
        let mut b = Budget::root("run-1", 0);
        let child = b
            .reserve_child("scout", "list files", 0, true, 0)
            .unwrap();
        assert!(child.can_spawn_children);
        assert_eq!(child.depth, 1);
    }

    #[test]
    fn fingerprint_normalizes_case_and_whitespace_trim() {
        let a = Budget::fingerprint("  Scout ", "List Files");
        let b = Budget::fingerprint("scout", "list files");
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_collapses_internal_whitespace() {
        let a = Budget::fingerprint("scout", "implement  x");
        let b = Budget::fingerprint("scout", "implement x");
        assert_eq!(a, b);
    }
}
