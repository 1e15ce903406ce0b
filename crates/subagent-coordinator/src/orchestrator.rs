//! Execution orchestrator: the single entry point that validates a
//! dispatch request, resolves its topology, drives single/parallel/chain
//! delegation through the child process driver, integrates worktree lanes,
//! and runs the phase smoke gate — with a guaranteed cleanup phase no
//! matter which branch returns early.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, Semaphore};

use coordinator_core::{
    build_ledger, ContextMode, CoordinatorError, CoordinatorResult, DispatchEnvelope,
    ExecutionPlan, FixOutcome, IsolationChoice, IsolationMode, Ledger, ObservationStatus,
    PhaseGateState, TaskItem, TopologyDecision, TopologyMode, TopologyPolicy,
};
use coordinator_core::budget::Budget;
use coordinator_core::worktree::{self, LaneIntegrationOutcome, LaneIntegrationReport, WorktreeAssignment, WorktreeSession};

use crate::child_driver::{self, AgentSource, ChildLaunchSpec, ChildResult};
use crate::config::CoordinatorConfig;

/// Everything the orchestrator needs to know about an agent it might
/// dispatch to, without reaching into the agent-definition file format.
#[derive(Debug, Clone)]
pub struct AgentDescriptor {
    pub source: AgentSource,
    pub tools: Vec<String>,
    pub allow_nested: bool,
    pub model: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub run_id: String,
    pub cwd: PathBuf,
    pub single: Option<TaskItem>,
    pub parallel: Option<Vec<TaskItem>>,
    pub chain: Option<Vec<TaskItem>>,
    pub known_agents: HashMap<String, AgentDescriptor>,
    pub context_mode: ContextMode,
    pub isolation: IsolationChoice,
    pub topology_policy: TopologyPolicy,
    pub shared_context_limit: usize,
    pub phase_name: Option<String>,
    pub require_phase_smoke: bool,
    pub phase_smoke_commands: Vec<String>,
    pub phase_smoke_retries: Option<u32>,
    pub phase_max_fix_attempts: Option<u32>,
    pub budget: Budget,
}

#[derive(Debug, Clone)]
pub struct Update {
    pub running: u32,
    pub completed: u32,
    pub last_items: Vec<String>,
}

pub type UpdateSender = mpsc::UnboundedSender<Update>;

#[derive(Debug)]
pub struct ExecutionReport {
    pub topology: TopologyDecision,
    pub phase_gate: PhaseGateState,
    pub worktree_reports: Vec<LaneIntegrationReport>,
    pub child_results: Vec<ChildResult>,
    pub warnings: Vec<String>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn plan_from_request(request: &ExecuteRequest) -> CoordinatorResult<ExecutionPlan> {
    let provided = [
        request.single.is_some(),
        request.parallel.is_some(),
        request.chain.is_some(),
    ]
    .iter()
    .filter(|b| **b)
    .count();
    if provided != 1 {
        return Err(CoordinatorError::InvalidModeCount);
    }
    if let Some(item) = &request.single {
        return Ok(ExecutionPlan::Single { item: item.clone() });
    }
    if let Some(items) = &request.parallel {
        return Ok(ExecutionPlan::Parallel { items: items.clone() });
    }
    if let Some(items) = &request.chain {
        return Ok(ExecutionPlan::Chain { items: items.clone() });
    }
    unreachable!("exactly one branch checked above")
}

fn check_agents_exist(
    plan: &ExecutionPlan,
    known_agents: &HashMap<String, AgentDescriptor>,
) -> CoordinatorResult<()> {
    for task in plan.tasks() {
        if !known_agents.contains_key(&task.agent) {
            return Err(CoordinatorError::UnknownAgent {
                agent: task.agent.clone(),
            });
        }
    }
    Ok(())
}

/// The execution orchestrator; stateless beyond the config it was built
/// with. One instance can drive many `execute` calls.
pub struct Orchestrator {
    config: CoordinatorConfig,
}

impl Orchestrator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self { config }
    }

    pub async fn execute(
        &self,
        request: ExecuteRequest,
        updates: Option<UpdateSender>,
    ) -> CoordinatorResult<ExecutionReport> {
        let mode = if request.single.is_some() {
            "single"
        } else if request.parallel.is_some() {
            "parallel"
        } else if request.chain.is_some() {
            "chain"
        } else {
            "unknown"
        };
        let span = tracing::info_span!("run", run_id = %request.budget.run_id, mode = %mode);
        let _enter = span.enter();

        // ---- Entry: nesting gate ----
        if request.budget.depth > 0 && !request.budget.can_spawn_children {
            return Err(CoordinatorError::NestedSpawnBlocked);
        }
        if request.budget.deadline_reached(now_ms()) {
            return Err(CoordinatorError::DeadlineReached);
        }
        if request.budget.depth >= request.budget.max_depth {
            return Err(CoordinatorError::DepthExceeded {
                depth: request.budget.depth,
                max_depth: request.budget.max_depth,
            });
        }

        let plan = plan_from_request(&request)?;
        check_agents_exist(&plan, &request.known_agents)?;

        let (mut topology, plan) =
            coordinator_core::topology::resolve(plan, request.topology_policy);

        let mut warnings: Vec<String> = Vec::new();

        let tasks_owned: Vec<TaskItem> = plan.tasks().into_iter().cloned().collect();
        let agent_tools = |agent: &str| -> Vec<String> {
            request
                .known_agents
                .get(agent)
                .map(|d| d.tools.clone())
                .unwrap_or_default()
        };
        let task_refs: Vec<&TaskItem> = tasks_owned.iter().collect();
        let mut isolation =
            worktree::decide_isolation(request.isolation, topology.selected_mode, &task_refs, agent_tools);

        let mut session = if matches!(isolation, IsolationMode::Worktree) {
            match worktree::is_inside_repo(&request.cwd).await {
                Some(repo_root) => Some(WorktreeSession::new(
                    request.run_id.clone(),
                    repo_root,
                    request.config_worktree_base_dir(&self.config),
                )),
                None => {
                    warnings.push(format!(
                        "{} is not inside a VCS repository; downgrading to shared isolation",
                        request.cwd.display()
                    ));
                    isolation = IsolationMode::Shared;
                    None
                }
            }
        } else {
            None
        };

        let ledger: Box<dyn Ledger> =
            build_ledger(&request.cwd, &request.run_id, request.context_mode);

        let topology_summary = format!(
            "selected={} requested={} recommended={}",
            topology.selected_mode, topology.requested_mode, topology.recommended_mode
        );
        let mut phase_gate = PhaseGateState::initialize(
            request.phase_name.clone(),
            request.require_phase_smoke,
            request.phase_smoke_commands.clone(),
            request.phase_smoke_retries,
            request.phase_max_fix_attempts,
            &topology_summary,
        )?;

        let mut budget = request.budget.clone();

        // Tokens withheld from the main dispatch so the smoke-fix loop below
        // still has something to reserve against; otherwise single/parallel/
        // chain dispatch spends the whole budget and remediation always
        // fails with BudgetExhausted before it can run.
        let fix_reserve = if phase_gate.require_smoke {
            phase_gate.smoke_max_fix_attempts
        } else {
            0
        };

        let run_result: CoordinatorResult<(Vec<ChildResult>, Vec<LaneIntegrationReport>, String)> =
            match &plan {
                ExecutionPlan::Single { item } => {
                    self.run_single(
                        item,
                        &request,
                        &mut budget,
                        fix_reserve,
                        &mut session,
                        ledger.as_ref(),
                        &updates,
                        &mut warnings,
                    )
                    .await
                }
                ExecutionPlan::Parallel { items } => {
                    self.run_parallel(
                        items,
                        &request,
                        &mut budget,
                        fix_reserve,
                        &mut session,
                        ledger.as_ref(),
                        &updates,
                        &mut warnings,
                    )
                    .await
                }
                ExecutionPlan::Chain { items } => {
                    self.run_chain(
                        items,
                        &request,
                        &mut budget,
                        fix_reserve,
                        &mut session,
                        ledger.as_ref(),
                        &updates,
                        &mut warnings,
                    )
                    .await
                }
            };

        // smoke gate + bounded fix loop, only attempted if the main flow succeeded
        let final_result = match run_result {
            Ok((mut child_results, worktree_reports, fix_agent)) => {
                let smoke_result = self
                    .run_smoke_with_fix_loop(
                        &request,
                        &mut budget,
                        &mut phase_gate,
                        ledger.as_ref(),
                        &fix_agent,
                        &mut child_results,
                    )
                    .await;
                smoke_result.map(|()| (child_results, worktree_reports))
            }
            Err(err) => Err(err),
        };

        // ---- Guaranteed post-execution cleanup ----
        if let Some(session) = &session {
            session.cleanup(&mut warnings).await;
        }
        topology.reasons.extend(warnings.iter().cloned());

        let (child_results, worktree_reports) = final_result?;

        Ok(ExecutionReport {
            topology,
            phase_gate,
            worktree_reports,
            child_results,
            warnings,
        })
    }

    async fn run_smoke_with_fix_loop(
        &self,
        request: &ExecuteRequest,
        budget: &mut Budget,
        phase_gate: &mut PhaseGateState,
        ledger: &dyn Ledger,
        fix_agent: &str,
        child_results: &mut Vec<ChildResult>,
    ) -> CoordinatorResult<()> {
        if !phase_gate.require_smoke {
            return Ok(());
        }
        loop {
            let outcome = phase_gate.run_smoke(&request.cwd).await;
            let failure = match outcome {
                coordinator_core::SmokeRunOutcome::Passed => return Ok(()),
                coordinator_core::SmokeRunOutcome::Failed(failure) => failure,
            };

            if phase_gate.smoke_max_fix_attempts == 0 || phase_gate.fix_attempts_exhausted() {
                return Err(CoordinatorError::SmokeFixExhausted {
                    attempts: phase_gate.smoke_fix_attempts,
                    max: phase_gate.smoke_max_fix_attempts,
                });
            }

            let attempt = phase_gate.smoke_fix_attempts + 1;
            let prompt = coordinator_core::phase_gate::build_fix_prompt(
                &failure,
                attempt,
                phase_gate.smoke_max_fix_attempts,
            );

            let descriptor = request.known_agents.get(fix_agent);
            let allow_nested = descriptor.map(|d| d.allow_nested).unwrap_or(false);
            let child_budget = budget.reserve_child(fix_agent, &prompt, 0, allow_nested, now_ms())?;

            let spec = ChildLaunchSpec {
                agent: fix_agent.to_string(),
                agent_source: descriptor.map(|d| d.source).unwrap_or(AgentSource::Unknown),
                task: prompt,
                model: descriptor.and_then(|d| d.model.clone()),
                tools: descriptor.map(|d| d.tools.clone()),
                append_system_prompt: None,
                cwd: request.cwd.clone(),
                env: child_budget.to_env(),
                deadline_at_ms: child_budget.deadline_at_ms,
                step: None,
                grace_period: std::time::Duration::from_secs(self.config.child_grace_period_secs),
            };
            let result = child_driver::run_child(spec, std::future::pending()).await;
            let success = result.is_success();
            phase_gate.record_fix_attempt(
                fix_agent,
                if success { FixOutcome::Success } else { FixOutcome::Error },
                &result.error_message.clone().unwrap_or_else(|| "fix attempt completed".to_string()),
            );
            ledger.append_observation(
                "smoke-fix",
                fix_agent,
                if success { ObservationStatus::Success } else { ObservationStatus::Error },
                &result.error_message.clone().unwrap_or_default(),
                now_ms(),
            );
            child_results.push(result);
            // on failure, loop continues to the next fix attempt; on
            // success, loop back to rerun smoke with its own retries.
        }
    }

    async fn run_single(
        &self,
        item: &TaskItem,
        request: &ExecuteRequest,
        budget: &mut Budget,
        fix_reserve: u32,
        session: &mut Option<WorktreeSession>,
        ledger: &dyn Ledger,
        updates: &Option<UpdateSender>,
        warnings: &mut Vec<String>,
    ) -> CoordinatorResult<(Vec<ChildResult>, Vec<LaneIntegrationReport>, String)> {
        let available = budget.remaining_tokens.saturating_sub(fix_reserve);
        let reserved_descendants = available.saturating_sub(1);
        let descriptor = request.known_agents.get(&item.agent);
        let allow_nested = descriptor.map(|d| d.allow_nested).unwrap_or(false);
        let child_budget =
            budget.reserve_child(&item.agent, &item.task, reserved_descendants, allow_nested, now_ms())?;

        let lane = if let Some(session) = session.as_mut() {
            Some(session.create_lane(&item.agent, warnings).await?)
        } else {
            None
        };
        let cwd = lane_cwd(&request.cwd, lane.as_ref(), item.cwd.as_deref(), warnings);

        let task_id = format!("{}-0", request.run_id);
        let envelope = DispatchEnvelope {
            run_id: request.run_id.clone(),
            task_id: task_id.clone(),
            parent_task_id: None,
            agent: item.agent.clone(),
            task: item.task.clone(),
            mode: "single".to_string(),
            depth: budget.depth,
            created_at_ms: now_ms(),
        };
        ledger.append_dispatch(&envelope, request.context_mode);
        let packet = ledger.build_packet(request.context_mode, &envelope, request.shared_context_limit);
        let task_text = append_packet(&item.task, &packet);

        let spec = ChildLaunchSpec {
            agent: item.agent.clone(),
            agent_source: descriptor.map(|d| d.source).unwrap_or(AgentSource::Unknown),
            task: task_text,
            model: descriptor.and_then(|d| d.model.clone()),
            tools: descriptor.map(|d| d.tools.clone()),
            append_system_prompt: None,
            cwd,
            env: child_budget.to_env(),
            deadline_at_ms: child_budget.deadline_at_ms,
            step: None,
            grace_period: std::time::Duration::from_secs(self.config.child_grace_period_secs),
        };
        let result = child_driver::run_child(spec, std::future::pending()).await;
        let success = result.is_success();
        ledger.append_observation(
            &task_id,
            &item.agent,
            if success { ObservationStatus::Success } else { ObservationStatus::Error },
            &result.error_message.clone().unwrap_or_else(|| "completed".to_string()),
            now_ms(),
        );
        if request.context_mode.allows_decision() {
            ledger.append_decision(&task_id, "coordinator", "single dispatch complete", now_ms());
        }
        notify(updates, 0, 1, vec![item.agent.clone()]);

        let mut reports = Vec::new();
        if success {
            if let Some(session) = session.as_ref() {
                if let Some(lane) = &lane {
                    let report = session.integrate_lane(lane).await;
                    if let LaneIntegrationOutcome::Failed { message } = &report.outcome {
                        return Err(CoordinatorError::IntegrationFailed {
                            lane: lane.id.clone(),
                            message: message.clone(),
                        });
                    }
                    reports.push(report);
                }
            }
        }

        Ok((vec![result], reports, item.agent.clone()))
    }

    async fn run_parallel(
        &self,
        items: &[TaskItem],
        request: &ExecuteRequest,
        budget: &mut Budget,
        fix_reserve: u32,
        session: &mut Option<WorktreeSession>,
        ledger: &dyn Ledger,
        updates: &Option<UpdateSender>,
        warnings: &mut Vec<String>,
    ) -> CoordinatorResult<(Vec<ChildResult>, Vec<LaneIntegrationReport>, String)> {
        let n = items.len();
        if n > self.config.parallel_task_cap {
            return Err(CoordinatorError::BudgetExhausted {
                needed: n as u32,
                remaining: self.config.parallel_task_cap as u32,
            });
        }
        let available = budget.remaining_tokens.saturating_sub(fix_reserve);
        if available < n as u32 {
            return Err(CoordinatorError::BudgetExhausted {
                needed: n as u32,
                remaining: budget.remaining_tokens,
            });
        }

        let total_descendant_budget = available - n as u32;
        let base = total_descendant_budget / n as u32;
        let remainder = total_descendant_budget % n as u32;

        // Reserve every child's budget before launching any of them, so a
        // reservation failure aborts the whole batch before any spawn.
        let mut child_budgets = Vec::with_capacity(n);
        for (i, item) in items.iter().enumerate() {
            let reserved_descendants = base + if (i as u32) < remainder { 1 } else { 0 };
            let descriptor = request.known_agents.get(&item.agent);
            let allow_nested = descriptor.map(|d| d.allow_nested).unwrap_or(false);
            let child_budget =
                budget.reserve_child(&item.agent, &item.task, reserved_descendants, allow_nested, now_ms())?;
            child_budgets.push(child_budget);
        }

        let mut lanes: Vec<Option<WorktreeAssignment>> = Vec::with_capacity(n);
        if let Some(session) = session.as_mut() {
            for item in items {
                lanes.push(Some(session.create_lane(&item.agent, warnings).await?));
            }
        } else {
            lanes.resize(n, None);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.parallel_concurrency_cap));
        let mut handles = Vec::with_capacity(n);
        for (i, item) in items.iter().enumerate() {
            let descriptor = request.known_agents.get(&item.agent).cloned();
            let child_budget = child_budgets[i].clone();
            let lane = lanes[i].clone();
            let repo_cwd = request.cwd.clone();
            let task_text_base = item.task.clone();
            let agent = item.agent.clone();
            let grace = std::time::Duration::from_secs(self.config.child_grace_period_secs);
            let sem = semaphore.clone();

            let task_id = format!("{}-{}", request.run_id, i);
            let envelope = DispatchEnvelope {
                run_id: request.run_id.clone(),
                task_id: task_id.clone(),
                parent_task_id: None,
                agent: agent.clone(),
                task: task_text_base.clone(),
                mode: "parallel".to_string(),
                depth: child_budget.depth,
                created_at_ms: now_ms(),
            };
            ledger.append_dispatch(&envelope, request.context_mode);
            let packet = ledger.build_packet(request.context_mode, &envelope, request.shared_context_limit);
            let task_text = append_packet(&task_text_base, &packet);
            let cwd = lane_cwd(&repo_cwd, lane.as_ref(), item.cwd.as_deref(), warnings);

            let handle = tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.expect("semaphore not closed");
                let spec = ChildLaunchSpec {
                    agent: agent.clone(),
                    agent_source: descriptor.as_ref().map(|d| d.source).unwrap_or(AgentSource::Unknown),
                    task: task_text,
                    model: descriptor.as_ref().and_then(|d| d.model.clone()),
                    tools: descriptor.as_ref().map(|d| d.tools.clone()),
                    append_system_prompt: None,
                    cwd,
                    env: child_budget.to_env(),
                    deadline_at_ms: child_budget.deadline_at_ms,
                    step: None,
                    grace_period: grace,
                };
                (task_id, agent, child_driver::run_child(spec, std::future::pending()).await)
            });
            handles.push(handle);
        }

        // Await in completion order (not spawn order) so observations land on
        // the ledger as children actually finish, while still slotting each
        // result back into its original item position for integration below.
        let mut in_flight = FuturesUnordered::new();
        for (idx, handle) in handles.into_iter().enumerate() {
            in_flight.push(async move { (idx, handle.await) });
        }

        let mut slots: Vec<Option<ChildResult>> = (0..n).map(|_| None).collect();
        let mut completed = 0u32;
        while let Some((idx, joined)) = in_flight.next().await {
            let (task_id, agent, result) = joined.map_err(|err| CoordinatorError::ChildFailed {
                exit_code: -1,
                message: format!("join error: {err}"),
            })?;
            let success = result.is_success();
            ledger.append_observation(
                &task_id,
                &agent,
                if success { ObservationStatus::Success } else { ObservationStatus::Error },
                &result.error_message.clone().unwrap_or_else(|| "completed".to_string()),
                now_ms(),
            );
            completed += 1;
            notify(updates, 0, completed, vec![agent]);
            slots[idx] = Some(result);
        }
        let results: Vec<ChildResult> = slots
            .into_iter()
            .map(|r| r.expect("every spawned index is filled before the loop exits"))
            .collect();

        let mut reports = Vec::new();
        if let Some(session) = session.as_ref() {
            for (i, result) in results.iter().enumerate() {
                if !result.is_success() {
                    continue;
                }
                if let Some(lane) = &lanes[i] {
                    let report = session.integrate_lane(lane).await;
                    if let LaneIntegrationOutcome::Failed { message } = &report.outcome {
                        return Err(CoordinatorError::IntegrationFailed {
                            lane: lane.id.clone(),
                            message: message.clone(),
                        });
                    }
                    reports.push(report);
                }
            }
        }

        if request.context_mode.allows_decision() {
            ledger.append_decision(
                &format!("{}-parallel", request.run_id),
                "coordinator",
                "parallel batch complete",
                now_ms(),
            );
        }

        let fix_agent = items.first().map(|t| t.agent.clone()).unwrap_or_default();
        Ok((results, reports, fix_agent))
    }

    async fn run_chain(
        &self,
        items: &[TaskItem],
        request: &ExecuteRequest,
        budget: &mut Budget,
        fix_reserve: u32,
        session: &mut Option<WorktreeSession>,
        ledger: &dyn Ledger,
        updates: &Option<UpdateSender>,
        warnings: &mut Vec<String>,
    ) -> CoordinatorResult<(Vec<ChildResult>, Vec<LaneIntegrationReport>, String)> {
        let chain_length = items.len() as u32;
        if budget.remaining_tokens.saturating_sub(fix_reserve) < chain_length {
            return Err(CoordinatorError::BudgetExhausted {
                needed: chain_length,
                remaining: budget.remaining_tokens,
            });
        }

        let lane = if let Some(session) = session.as_mut() {
            Some(session.create_lane("chain", warnings).await?)
        } else {
            None
        };

        let mut results = Vec::with_capacity(items.len());
        let mut previous_output = String::new();
        let mut last_agent = String::new();

        for (i, item) in items.iter().enumerate() {
            let remaining_steps_after_this = (items.len() - i - 1) as u32;
            let effective_remaining = budget.remaining_tokens.saturating_sub(fix_reserve);
            let reserved_descendants = effective_remaining.saturating_sub(remaining_steps_after_this + 1);
            let descriptor = request.known_agents.get(&item.agent);
            let allow_nested = descriptor.map(|d| d.allow_nested).unwrap_or(false);
            let substituted = coordinator_core::topology::substitute_previous(&item.task, &previous_output);

            let child_budget = match budget.reserve_child(
                &item.agent,
                &substituted,
                reserved_descendants,
                allow_nested,
                now_ms(),
            ) {
                Ok(b) => b,
                Err(err) => {
                    return Err(err);
                }
            };

            let cwd = lane_cwd(&request.cwd, lane.as_ref(), item.cwd.as_deref(), warnings);
            let task_id = format!("{}-{}", request.run_id, i);
            let envelope = DispatchEnvelope {
                run_id: request.run_id.clone(),
                task_id: task_id.clone(),
                parent_task_id: if i == 0 { None } else { Some(format!("{}-{}", request.run_id, i - 1)) },
                agent: item.agent.clone(),
                task: substituted.clone(),
                mode: "chain".to_string(),
                depth: child_budget.depth,
                created_at_ms: now_ms(),
            };
            ledger.append_dispatch(&envelope, request.context_mode);
            let packet = ledger.build_packet(request.context_mode, &envelope, request.shared_context_limit);
            let task_text = append_packet(&substituted, &packet);

            let spec = ChildLaunchSpec {
                agent: item.agent.clone(),
                agent_source: descriptor.map(|d| d.source).unwrap_or(AgentSource::Unknown),
                task: task_text,
                model: descriptor.and_then(|d| d.model.clone()),
                tools: descriptor.map(|d| d.tools.clone()),
                append_system_prompt: None,
                cwd,
                env: child_budget.to_env(),
                deadline_at_ms: child_budget.deadline_at_ms,
                step: Some(i as u32),
                grace_period: std::time::Duration::from_secs(self.config.child_grace_period_secs),
            };
            let result = child_driver::run_child(spec, std::future::pending()).await;
            let success = result.is_success();
            ledger.append_observation(
                &task_id,
                &item.agent,
                if success { ObservationStatus::Success } else { ObservationStatus::Error },
                &result.error_message.clone().unwrap_or_else(|| "completed".to_string()),
                now_ms(),
            );
            notify(updates, 0, i as u32 + 1, vec![item.agent.clone()]);

            last_agent = item.agent.clone();
            previous_output = last_text(&result);
            let failed = !success;
            results.push(result);
            if failed {
                return Err(CoordinatorError::ChildFailed {
                    exit_code: -1,
                    message: format!("chain step {i} ({}) failed", item.agent),
                });
            }
        }

        if request.context_mode.allows_decision() {
            ledger.append_decision(
                &format!("{}-chain", request.run_id),
                "coordinator",
                "chain complete",
                now_ms(),
            );
        }

        let mut reports = Vec::new();
        if let (Some(session), Some(lane)) = (session.as_ref(), lane.as_ref()) {
            let report = session.integrate_lane(lane).await;
            if let LaneIntegrationOutcome::Failed { message } = &report.outcome {
                return Err(CoordinatorError::IntegrationFailed {
                    lane: lane.id.clone(),
                    message: message.clone(),
                });
            }
            reports.push(report);
        }

        Ok((results, reports, last_agent))
    }
}

impl ExecuteRequest {
    fn config_worktree_base_dir(&self, config: &CoordinatorConfig) -> Option<PathBuf> {
        config.worktree_base_dir.as_ref().map(PathBuf::from)
    }
}

fn append_packet(task: &str, packet: &str) -> String {
    if packet.is_empty() {
        task.to_string()
    } else {
        format!("{task}\n\n{packet}")
    }
}

fn last_text(result: &ChildResult) -> String {
    result
        .messages
        .iter()
        .rev()
        .find_map(|m| {
            m.content.iter().rev().find_map(|c| match c {
                child_driver::ContentPart::Text { text } => Some(text.clone()),
                _ => None,
            })
        })
        .unwrap_or_default()
}

fn lane_cwd(
    repo_root: &PathBuf,
    lane: Option<&WorktreeAssignment>,
    requested: Option<&str>,
    warnings: &mut Vec<String>,
) -> PathBuf {
    match lane {
        Some(lane) => worktree::map_lane_cwd(
            lane,
            repo_root,
            requested.map(PathBuf::from).as_deref(),
            warnings,
        ),
        None => requested.map(PathBuf::from).unwrap_or_else(|| repo_root.clone()),
    }
}

fn notify(updates: &Option<UpdateSender>, running: u32, completed: u32, last_items: Vec<String>) {
    if let Some(sender) = updates {
        let _ = sender.send(Update {
            running,
            completed,
            last_items,
        });
    }
}
