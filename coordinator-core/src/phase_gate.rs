//! Phase gate state: the topology/smoke gate summary plus the bounded
//! smoke-fix loop that drives a remediation child when the project's smoke
//! commands fail.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::error::{CoordinatorError, CoordinatorResult};

const SMOKE_RETRIES_MAX: u32 = 5;
const SMOKE_FIX_ATTEMPTS_MAX: u32 = 5;
const DEFAULT_SMOKE_RETRIES: u32 = 1;
const DEFAULT_SMOKE_FIX_ATTEMPTS: u32 = 2;
const SMOKE_COMMAND_TIMEOUT_SECS: u64 = 300;
const STDERR_EXCERPT_BYTES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateStatus {
    Pending,
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gate {
    pub key: String,
    pub required: bool,
    pub status: GateStatus,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixOutcome {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmokeFixRecord {
    pub attempt: u32,
    pub agent: String,
    pub outcome: FixOutcome,
    pub summary: String,
}

#[derive(Debug, Clone)]
pub struct PhaseGateState {
    pub phase_name: Option<String>,
    pub require_smoke: bool,
    pub smoke_commands: Vec<String>,
    pub smoke_max_retries: u32,
    pub smoke_max_fix_attempts: u32,
    pub smoke_attempts: u32,
    pub smoke_fix_attempts: u32,
    pub smoke_fix_history: Vec<SmokeFixRecord>,
    pub gates: Vec<Gate>,
}

fn clamp_retries(value: Option<u32>, default: u32, max: u32) -> u32 {
    value.unwrap_or(default).min(max)
}

impl PhaseGateState {
    /// Build the initial gate state: `topology` passes immediately, `smoke`
    /// is required iff commands were configured or the caller requested it.
    pub fn initialize(
        phase_name: Option<String>,
        require_smoke: bool,
        smoke_commands: Vec<String>,
        smoke_max_retries: Option<u32>,
        smoke_max_fix_attempts: Option<u32>,
        topology_summary: &str,
    ) -> CoordinatorResult<Self> {
        let require_smoke = require_smoke || !smoke_commands.is_empty();
        if require_smoke && smoke_commands.is_empty() {
            return Err(CoordinatorError::InvalidPhaseGateConfig {
                message: "require_smoke is set but no smoke_commands were provided".to_string(),
            });
        }

        let smoke_max_retries = clamp_retries(smoke_max_retries, DEFAULT_SMOKE_RETRIES, SMOKE_RETRIES_MAX);
        let smoke_max_fix_attempts = clamp_retries(
            smoke_max_fix_attempts,
            DEFAULT_SMOKE_FIX_ATTEMPTS,
            SMOKE_FIX_ATTEMPTS_MAX,
        );

        let smoke_status = if require_smoke {
            GateStatus::Pending
        } else {
            GateStatus::Skipped
        };

        Ok(Self {
            phase_name,
            require_smoke,
            smoke_commands,
            smoke_max_retries,
            smoke_max_fix_attempts,
            smoke_attempts: 0,
            smoke_fix_attempts: 0,
            smoke_fix_history: Vec::new(),
            gates: vec![
                Gate {
                    key: "topology".to_string(),
                    required: true,
                    status: GateStatus::Passed,
                    detail: Some(topology_summary.to_string()),
                },
                Gate {
                    key: "smoke".to_string(),
                    required: require_smoke,
                    status: smoke_status,
                    detail: None,
                },
            ],
        })
    }

    fn smoke_gate_mut(&mut self) -> &mut Gate {
        self.gates
            .iter_mut()
            .find(|g| g.key == "smoke")
            .expect("smoke gate always present")
    }

    /// Run the configured smoke commands in `cwd`, stopping at the first
    /// non-zero exit, retrying the whole list up to `smoke_max_retries`
    /// times. Returns the outcome of the final attempt.
    pub async fn run_smoke(&mut self, cwd: &Path) -> SmokeRunOutcome {
        if !self.require_smoke {
            return SmokeRunOutcome::Passed;
        }
        let mut last_failure = None;
        for _attempt in 0..=self.smoke_max_retries {
            self.smoke_attempts += 1;
            match run_commands_sequentially(cwd, &self.smoke_commands).await {
                Ok(()) => {
                    self.smoke_gate_mut().status = GateStatus::Passed;
                    self.smoke_gate_mut().detail = Some("smoke commands passed".to_string());
                    return SmokeRunOutcome::Passed;
                }
                Err(failure) => last_failure = Some(failure),
            }
        }
        let failure = last_failure.expect("at least one attempt ran");
        self.smoke_gate_mut().status = GateStatus::Failed;
        self.smoke_gate_mut().detail = Some(failure.to_detail());
        SmokeRunOutcome::Failed(failure)
    }

    pub fn record_fix_attempt(&mut self, agent: &str, outcome: FixOutcome, summary: &str) {
        self.smoke_fix_attempts += 1;
        self.smoke_fix_history.push(SmokeFixRecord {
            attempt: self.smoke_fix_attempts,
            agent: agent.to_string(),
            outcome,
            summary: summary.to_string(),
        });
    }

    pub fn fix_attempts_exhausted(&self) -> bool {
        self.smoke_fix_attempts >= self.smoke_max_fix_attempts
    }

    pub fn smoke_gate(&self) -> &Gate {
        self.gates.iter().find(|g| g.key == "smoke").expect("smoke gate present")
    }
}

#[derive(Debug, Clone)]
pub struct SmokeFailure {
    pub command: String,
    pub exit_code: i32,
    pub stdout_excerpt: String,
    pub stderr_excerpt: String,
}

impl SmokeFailure {
    fn to_detail(&self) -> String {
        format!(
            "command `{}` exited {}: {}",
            self.command, self.exit_code, self.stderr_excerpt
        )
    }
}

#[derive(Debug, Clone)]
pub enum SmokeRunOutcome {
    Passed,
    Failed(SmokeFailure),
}

fn truncate_bytes(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut truncated: String = s.chars().take(max).collect();
        truncated.push_str(&format!("...[truncated at {max} bytes]"));
        truncated
    }
}

async fn run_commands_sequentially(cwd: &Path, commands: &[String]) -> Result<(), SmokeFailure> {
    for command in commands {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let output = tokio::time::timeout(
            Duration::from_secs(SMOKE_COMMAND_TIMEOUT_SECS),
            cmd.output(),
        )
        .await;

        let output = match output {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                return Err(SmokeFailure {
                    command: command.clone(),
                    exit_code: -1,
                    stdout_excerpt: String::new(),
                    stderr_excerpt: truncate_bytes(&err.to_string(), STDERR_EXCERPT_BYTES),
                });
            }
            Err(_) => {
                return Err(SmokeFailure {
                    command: command.clone(),
                    exit_code: -1,
                    stdout_excerpt: String::new(),
                    stderr_excerpt: "command timed out".to_string(),
                });
            }
        };

        if !output.status.success() {
            return Err(SmokeFailure {
                command: command.clone(),
                exit_code: output.status.code().unwrap_or(-1),
                stdout_excerpt: truncate_bytes(
                    &String::from_utf8_lossy(&output.stdout),
                    STDERR_EXCERPT_BYTES,
                ),
                stderr_excerpt: truncate_bytes(
                    &String::from_utf8_lossy(&output.stderr),
                    STDERR_EXCERPT_BYTES,
                ),
            });
        }
    }
    Ok(())
}

/// Build the remediation prompt a fix agent is dispatched with.
pub fn build_fix_prompt(failure: &SmokeFailure, attempt: u32, max_attempts: u32) -> String {
    format!(
        "The phase smoke gate failed (attempt {attempt}/{max_attempts}).\n\
         Failing command: `{}`\n\
         Exit code: {}\n\
         --- stdout ---\n{}\n\
         --- stderr ---\n{}\n\
         Apply the minimal fix needed to make this command pass. Do not refactor unrelated files.",
        failure.command, failure.exit_code, failure.stdout_excerpt, failure.stderr_excerpt
    )
}
