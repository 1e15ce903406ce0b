//! Coordinator configuration: the three top-level environment variables
//! plus the process-wide defaults for phase-gate and ledger parameters,
//! read with the same tolerant-fallback idiom the budget uses for its own
//! environment propagation.

use std::env;

use coordinator_core::{IsolationChoice, TopologyPolicy};

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

fn bool_from_env(key: &str, default: bool) -> bool {
    match env::var(key).ok().as_deref() {
        Some("1") | Some("true") | Some("yes") => true,
        Some("0") | Some("false") | Some("no") => false,
        _ => default,
    }
}

fn topology_policy_from_env() -> TopologyPolicy {
    match env::var("SUBAGENT_TOPOLOGY_POLICY").ok().as_deref() {
        Some("advisory") => TopologyPolicy::Advisory,
        Some("auto") => TopologyPolicy::Auto,
        _ => TopologyPolicy::Auto,
    }
}

fn isolation_from_env() -> IsolationChoice {
    match env::var("SUBAGENT_EXECUTION_ISOLATION").ok().as_deref() {
        Some("shared") => IsolationChoice::Shared,
        Some("worktree") => IsolationChoice::Worktree,
        Some("auto") => IsolationChoice::Auto,
        _ => IsolationChoice::Auto,
    }
}

/// Process-wide coordinator configuration, with every field overridable by
/// an environment variable and a safe fallback for missing/malformed input.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub topology_policy: TopologyPolicy,
    pub execution_isolation: IsolationChoice,
    pub worktree_base_dir: Option<String>,
    pub default_shared_context_limit: usize,
    pub default_memory_dir: Option<String>,
    pub parallel_concurrency_cap: usize,
    pub parallel_task_cap: usize,
    pub child_grace_period_secs: u64,
    pub confirm_project_agents: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            topology_policy: topology_policy_from_env(),
            execution_isolation: isolation_from_env(),
            worktree_base_dir: env::var("SUBAGENT_WORKTREE_BASE_DIR").ok(),
            default_shared_context_limit: parse_env("SUBAGENT_SHARED_CONTEXT_LIMIT")
                .filter(|v: &usize| *v > 0)
                .unwrap_or(20),
            default_memory_dir: env::var("SUBAGENT_MEMORY_DIR").ok(),
            parallel_concurrency_cap: parse_env("SUBAGENT_PARALLEL_CONCURRENCY_CAP")
                .filter(|v: &usize| *v > 0)
                .unwrap_or(4),
            parallel_task_cap: parse_env("SUBAGENT_PARALLEL_TASK_CAP")
                .filter(|v: &usize| *v > 0)
                .unwrap_or(8),
            child_grace_period_secs: parse_env("SUBAGENT_CHILD_GRACE_PERIOD_SECS")
                .filter(|v: &u64| *v > 0)
                .unwrap_or(5),
            confirm_project_agents: bool_from_env("SUBAGENT_CONFIRM_PROJECT_AGENTS", false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_documented_fallbacks() {
        let config = CoordinatorConfig::default();
        assert!(config.parallel_concurrency_cap > 0);
        assert!(config.parallel_task_cap > 0);
        assert!(config.child_grace_period_secs > 0);
    }
}
