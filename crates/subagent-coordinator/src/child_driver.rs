//! Child process driver: launches the opaque `pi` child, streams its
//! JSON-lines stdout, enforces the run's wall-time deadline, and assembles
//! the terminal [`ChildResult`].

use std::collections::HashMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

const CHILD_PROGRAM: &str = "pi";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentSource {
    User,
    Project,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    Normal,
    Error,
    Aborted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ToolCall { name: String, input: serde_json::Value },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageCounters {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl UsageCounters {
    fn add(&mut self, other: &UsageCounters) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub role: String,
    pub content: Vec<ContentPart>,
}

/// One decoded line of the child's stdout event stream. Any line that
/// doesn't match a recognized `type` is ignored per the streaming protocol.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ChildEvent {
    MessageEnd {
        message: AssistantMessage,
        #[serde(default)]
        usage: UsageCounters,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        stop_reason: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
    ToolResultEnd {
        #[serde(default)]
        message: Option<AssistantMessage>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone)]
pub struct ChildLaunchSpec {
    pub agent: String,
    pub agent_source: AgentSource,
    pub task: String,
    pub model: Option<String>,
    pub tools: Option<Vec<String>>,
    pub append_system_prompt: Option<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub deadline_at_ms: i64,
    pub step: Option<u32>,
    pub grace_period: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildResult {
    pub agent: String,
    pub agent_source: AgentSource,
    pub task: String,
    pub exit_code: i32,
    pub messages: Vec<AssistantMessage>,
    pub usage: UsageCounters,
    pub model: Option<String>,
    pub stop_reason: StopReason,
    pub error_message: Option<String>,
    pub stderr: String,
    pub step: Option<u32>,
}

impl ChildResult {
    pub fn is_success(&self) -> bool {
        matches!(self.stop_reason, StopReason::Normal) && self.exit_code == 0
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Launch the child and drive it to completion, honoring the spec's
/// deadline/cancellation semantics. `cancel` resolves when an external
/// cancellation signal fires; it is otherwise expected to never resolve.
pub async fn run_child(
    spec: ChildLaunchSpec,
    cancel: impl std::future::Future<Output = ()>,
) -> ChildResult {
    let remaining_ms = spec.deadline_at_ms - now_ms();
    if remaining_ms <= 0 {
        return ChildResult {
            agent: spec.agent,
            agent_source: spec.agent_source,
            task: spec.task,
            exit_code: -1,
            messages: Vec::new(),
            usage: UsageCounters::default(),
            model: spec.model,
            stop_reason: StopReason::Error,
            error_message: Some("run deadline already reached, child not spawned".to_string()),
            stderr: String::new(),
            step: spec.step,
        };
    }

    let prompt_file = match &spec.append_system_prompt {
        Some(contents) => write_temp_prompt(contents).ok(),
        None => None,
    };

    let mut command = Command::new(CHILD_PROGRAM);
    command
        .current_dir(&spec.cwd)
        .arg("--mode")
        .arg("json")
        .arg("-p")
        .arg("--no-session");
    if let Some(model) = &spec.model {
        command.arg("--model").arg(model);
    }
    if let Some(tools) = &spec.tools {
        command.arg("--tools").arg(tools.join(","));
    }
    if let Some(path) = &prompt_file {
        command.arg("--append-system-prompt").arg(path);
    }
    command.arg(&spec.task);
    command.envs(&spec.env);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            cleanup_prompt_file(&prompt_file);
            return ChildResult {
                agent: spec.agent,
                agent_source: spec.agent_source,
                task: spec.task,
                exit_code: -1,
                messages: Vec::new(),
                usage: UsageCounters::default(),
                model: spec.model,
                stop_reason: StopReason::Error,
                error_message: Some(format!("failed to launch child: {err}")),
                stderr: String::new(),
                step: spec.step,
            };
        }
    };

    let stdout = child.stdout.take().expect("stdout piped");
    let mut lines = BufReader::new(stdout).lines();

    let mut messages = Vec::new();
    let mut usage = UsageCounters::default();
    let mut model = spec.model.clone();
    let mut stop_reason = StopReason::Normal;
    let mut error_message = None;
    let mut aborted = false;
    let mut timed_out = false;

    let deadline_sleep = tokio::time::sleep(Duration::from_millis(remaining_ms as u64));
    tokio::pin!(deadline_sleep);
    tokio::pin!(cancel);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(raw)) => {
                        if let Ok(event) = serde_json::from_str::<ChildEvent>(&raw) {
                            match event {
                                ChildEvent::MessageEnd { message, usage: u, model: m, stop_reason: sr, error } => {
                                    usage.add(&u);
                                    if m.is_some() {
                                        model = m;
                                    }
                                    if let Some(sr) = sr {
                                        if sr == "error" {
                                            stop_reason = StopReason::Error;
                                        }
                                    }
                                    if error.is_some() {
                                        error_message = error;
                                    }
                                    messages.push(message);
                                }
                                ChildEvent::ToolResultEnd { message } => {
                                    if let Some(message) = message {
                                        messages.push(message);
                                    }
                                }
                                ChildEvent::Unknown => {}
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(error = %err, "child stdout read failed");
                        break;
                    }
                }
            }
            _ = &mut deadline_sleep, if !timed_out => {
                timed_out = true;
                stop_reason = StopReason::Error;
                error_message = Some("child process wall-time exceeded".to_string());
                terminate_gracefully(&mut child, spec.grace_period).await;
            }
            _ = &mut cancel, if !aborted => {
                aborted = true;
                stop_reason = StopReason::Aborted;
                terminate_gracefully(&mut child, spec.grace_period).await;
            }
        }
        if timed_out || aborted {
            break;
        }
    }

    let mut stderr = String::new();
    if let Some(mut stderr_handle) = child.stderr.take() {
        use tokio::io::AsyncReadExt;
        let _ = stderr_handle.read_to_string(&mut stderr).await;
    }

    let exit_code = match child.wait().await {
        Ok(status) => status.code().unwrap_or(-1),
        Err(_) => -1,
    };

    cleanup_prompt_file(&prompt_file);

    if exit_code != 0 && matches!(stop_reason, StopReason::Normal) {
        stop_reason = StopReason::Error;
        if error_message.is_none() {
            error_message = Some(format!("child exited with code {exit_code}"));
        }
    }

    ChildResult {
        agent: spec.agent,
        agent_source: spec.agent_source,
        task: spec.task,
        exit_code,
        messages,
        usage,
        model,
        stop_reason,
        error_message,
        stderr,
        step: spec.step,
    }
}

/// Graceful (SIGTERM) then, after `grace_period`, forceful (SIGKILL)
/// termination. On non-unix targets this degrades straight to `kill`.
async fn terminate_gracefully(child: &mut Child, grace_period: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let _ = std::process::Command::new("kill")
                .arg("-TERM")
                .arg(pid.to_string())
                .status();
        }
    }
    let grace = tokio::time::timeout(grace_period, child.wait()).await;
    if grace.is_err() {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

fn write_temp_prompt(contents: &str) -> std::io::Result<String> {
    let mut file = tempfile::Builder::new()
        .prefix("subagent-system-prompt-")
        .suffix(".txt")
        .tempfile()?;
    file.write_all(contents.as_bytes())?;
    let (_, path) = file.keep().map_err(|e| e.error)?;
    Ok(path.to_string_lossy().to_string())
}

fn cleanup_prompt_file(path: &Option<String>) {
    if let Some(path) = path {
        let _ = std::fs::remove_file(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_spec(task: &str, deadline_at_ms: i64) -> ChildLaunchSpec {
        ChildLaunchSpec {
            agent: "scout".to_string(),
            agent_source: AgentSource::User,
            task: task.to_string(),
            model: None,
            tools: None,
            append_system_prompt: None,
            cwd: std::env::temp_dir(),
            env: HashMap::new(),
            deadline_at_ms,
            step: None,
            grace_period: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn past_deadline_fails_without_spawning() {
        let spec = base_spec("list files", now_ms() - 1);
        let result = run_child(spec, std::future::pending()).await;
        assert_eq!(result.stop_reason, StopReason::Error);
        assert_eq!(result.exit_code, -1);
        assert!(result.error_message.unwrap().contains("deadline"));
    }

    #[test]
    fn usage_counters_add_sums_both_fields() {
        let mut total = UsageCounters::default();
        total.add(&UsageCounters {
            input_tokens: 10,
            output_tokens: 5,
        });
        total.add(&UsageCounters {
            input_tokens: 2,
            output_tokens: 1,
        });
        assert_eq!(total.input_tokens, 12);
        assert_eq!(total.output_tokens, 6);
    }

    #[test]
    fn child_result_success_requires_normal_stop_and_zero_exit() {
        let result = ChildResult {
            agent: "scout".to_string(),
            agent_source: AgentSource::User,
            task: "t".to_string(),
            exit_code: 0,
            messages: Vec::new(),
            usage: UsageCounters::default(),
            model: None,
            stop_reason: StopReason::Normal,
            error_message: None,
            stderr: String::new(),
            step: None,
        };
        assert!(result.is_success());
    }
}
