//! Worktree isolation: decides whether a plan needs per-lane git worktrees
//! or can share the working tree, manages the lane lifecycle (branch +
//! worktree creation, three-way integration, guaranteed cleanup).

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::Serialize;
use tokio::process::Command;

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::topology::{TaskItem, TopologyMode};

const WRITE_KEYWORDS: &[&str] = &[
    "edit", "modify", "update", "implement", "write", "create", "refactor", "fix", "delete",
    "add", "remove", "patch", "rename", "replace", "migrate", "apply",
];

const READ_ONLY_KEYWORDS: &[&str] = &[
    "list", "find", "search", "inspect", "read", "analyze", "summarize", "explain", "locate",
    "show", "identify", "scan", "report",
];

const DIRECT_WRITE_TOOLS: &[&str] = &["write", "edit", "bash"];

/// Explicit override a caller may supply; `Auto` defers to keyword-based
/// decision logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationChoice {
    Auto,
    Shared,
    Worktree,
}

fn task_has_write_keyword(task: &str) -> bool {
    let lower = task.to_lowercase();
    WRITE_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

fn task_is_read_only(task: &str) -> bool {
    let lower = task.to_lowercase();
    let has_read_only = READ_ONLY_KEYWORDS.iter().any(|kw| lower.contains(kw));
    has_read_only && !task_has_write_keyword(&lower)
}

fn agent_has_direct_write_tool(tools: &[String]) -> bool {
    tools
        .iter()
        .any(|t| DIRECT_WRITE_TOOLS.contains(&t.to_lowercase().as_str()))
}

/// Auto-decide isolation from the plan shape and task text, per §4.4.
pub fn decide_isolation(
    choice: IsolationChoice,
    mode: TopologyMode,
    tasks: &[&TaskItem],
    agent_tools: impl Fn(&str) -> Vec<String>,
) -> IsolationMode {
    match choice {
        IsolationChoice::Shared => return IsolationMode::Shared,
        IsolationChoice::Worktree => return IsolationMode::Worktree,
        IsolationChoice::Auto => {}
    }

    match mode {
        TopologyMode::Parallel => {
            if tasks.len() <= 1 {
                IsolationMode::Shared
            } else if tasks.iter().all(|t| task_is_read_only(&t.task))
                && !tasks.iter().any(|t| task_has_write_keyword(&t.task))
            {
                IsolationMode::Shared
            } else {
                IsolationMode::Worktree
            }
        }
        TopologyMode::Chain => {
            let any_write_intent = tasks.iter().any(|t| task_has_write_keyword(&t.task));
            let any_write_tool = tasks
                .iter()
                .any(|t| agent_has_direct_write_tool(&agent_tools(&t.agent)));
            if any_write_intent || any_write_tool {
                IsolationMode::Worktree
            } else {
                IsolationMode::Shared
            }
        }
        TopologyMode::Single => {
            let task = tasks.first().map(|t| t.task.as_str()).unwrap_or("");
            let agent = tasks.first().map(|t| t.agent.as_str()).unwrap_or("");
            if task_has_write_keyword(task) && agent_has_direct_write_tool(&agent_tools(agent)) {
                IsolationMode::Worktree
            } else {
                IsolationMode::Shared
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationMode {
    Shared,
    Worktree,
}

#[derive(Debug, Clone)]
pub struct WorktreeAssignment {
    pub id: String,
    pub label: String,
    pub branch_name: String,
    pub worktree_path: PathBuf,
    pub base_head: String,
}

#[derive(Debug, Clone)]
pub struct WorktreeSession {
    pub run_id: String,
    pub repo_root: PathBuf,
    pub base_dir: PathBuf,
    pub assignments: Vec<WorktreeAssignment>,
}

/// Result of integrating one lane's diff back onto the repo root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LaneIntegrationOutcome {
    Applied { files_changed: usize },
    Skipped,
    Failed { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct LaneIntegrationReport {
    pub lane_id: String,
    pub outcome: LaneIntegrationOutcome,
}

fn sanitize_label(label: &str) -> String {
    let mut out = String::new();
    let mut last_was_sep = false;
    for c in label.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
            out.push(c);
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('-');
            last_was_sep = true;
        }
    }
    out.trim_matches('-').to_string()
}

async fn run_git(repo_root: &Path, args: &[&str]) -> CoordinatorResult<(bool, String, String)> {
    let output = Command::new("git")
        .current_dir(repo_root)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(CoordinatorError::Io)?;
    Ok((
        output.status.success(),
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
    ))
}

/// Whether `cwd` sits inside a VCS repository; if not, callers must
/// downgrade to `shared` and record a warning.
pub async fn is_inside_repo(cwd: &Path) -> Option<PathBuf> {
    let (ok, stdout, _) = run_git(cwd, &["rev-parse", "--show-toplevel"]).await.ok()?;
    if ok {
        Some(PathBuf::from(stdout.trim()))
    } else {
        None
    }
}

impl WorktreeSession {
    pub fn new(run_id: impl Into<String>, repo_root: PathBuf, base_dir_override: Option<PathBuf>) -> Self {
        let run_id = run_id.into();
        let base_dir = base_dir_override.unwrap_or_else(|| repo_root.join(".pi").join("worktrees"));
        Self {
            run_id,
            repo_root,
            base_dir,
            assignments: Vec::new(),
        }
    }

    /// Create one lane: a new branch off current HEAD and a worktree
    /// directory materializing it.
    pub async fn create_lane(
        &mut self,
        label: &str,
        warnings: &mut Vec<String>,
    ) -> CoordinatorResult<WorktreeAssignment> {
        let sanitized = sanitize_label(label);
        let ordinal = self.assignments.len() + 1;
        let id = format!("{sanitized}-{ordinal}");
        let branch_name = format!("pi/subagent/{}/{}", self.run_id, id);
        let worktree_path = self.base_dir.join(format!("{}-{}", self.run_id, id));

        if worktree_path.exists() {
            return Err(CoordinatorError::IntegrationFailed {
                lane: id,
                message: format!("worktree path already exists: {}", worktree_path.display()),
            });
        }

        let (head_ok, head_stdout, head_stderr) =
            run_git(&self.repo_root, &["rev-parse", "HEAD"]).await?;
        if !head_ok {
            return Err(CoordinatorError::IntegrationFailed {
                lane: id,
                message: format!("failed to resolve HEAD: {head_stderr}"),
            });
        }
        let base_head = head_stdout.trim().to_string();

        let worktree_path_str = worktree_path.to_string_lossy().to_string();
        let (ok, _out, stderr) = run_git(
            &self.repo_root,
            &[
                "worktree",
                "add",
                "-b",
                &branch_name,
                &worktree_path_str,
                &base_head,
            ],
        )
        .await?;
        if !ok {
            return Err(CoordinatorError::IntegrationFailed {
                lane: id,
                message: format!("git worktree add failed: {stderr}"),
            });
        }

        let assignment = WorktreeAssignment {
            id: id.clone(),
            label: label.to_string(),
            branch_name,
            worktree_path,
            base_head,
        };
        self.assignments.push(assignment.clone());
        let _ = warnings; // reserved: cwd-outside-repo-root warnings are emitted by the caller mapping cwd
        Ok(assignment)
    }

    /// Capture the lane's diff against `base_head` and three-way apply it
    /// onto the repo root.
    pub async fn integrate_lane(&self, assignment: &WorktreeAssignment) -> LaneIntegrationReport {
        let diff_result = run_git(
            &assignment.worktree_path,
            &["diff", "--binary", &assignment.base_head, "HEAD"],
        )
        .await;

        let (ok, diff, stderr) = match diff_result {
            Ok(v) => v,
            Err(err) => {
                return LaneIntegrationReport {
                    lane_id: assignment.id.clone(),
                    outcome: LaneIntegrationOutcome::Failed {
                        message: err.to_string(),
                    },
                };
            }
        };
        if !ok {
            return LaneIntegrationReport {
                lane_id: assignment.id.clone(),
                outcome: LaneIntegrationOutcome::Failed {
                    message: format!("diff capture failed: {stderr}"),
                },
            };
        }
        if diff.trim().is_empty() {
            return LaneIntegrationReport {
                lane_id: assignment.id.clone(),
                outcome: LaneIntegrationOutcome::Skipped,
            };
        }

        let files_changed = diff
            .lines()
            .filter(|l| l.starts_with("diff --git "))
            .count();

        let apply_result = apply_patch_three_way(&self.repo_root, &diff).await;
        match apply_result {
            Ok(true) => LaneIntegrationReport {
                lane_id: assignment.id.clone(),
                outcome: LaneIntegrationOutcome::Applied { files_changed },
            },
            Ok(false) => LaneIntegrationReport {
                lane_id: assignment.id.clone(),
                outcome: LaneIntegrationOutcome::Failed {
                    message: "git apply --3way rejected the lane's patch".to_string(),
                },
            },
            Err(err) => LaneIntegrationReport {
                lane_id: assignment.id.clone(),
                outcome: LaneIntegrationOutcome::Failed {
                    message: err.to_string(),
                },
            },
        }
    }

    /// Always-attempted cleanup: remove the worktree, then delete the
    /// branch if no commits landed on it. Failures become warnings.
    pub async fn cleanup(&self, warnings: &mut Vec<String>) {
        for assignment in &self.assignments {
            let path_str = assignment.worktree_path.to_string_lossy().to_string();
            let (ok, _out, stderr) =
                match run_git(&self.repo_root, &["worktree", "remove", "--force", &path_str]).await {
                    Ok(v) => v,
                    Err(err) => {
                        warnings.push(format!("worktree remove errored for {}: {err}", assignment.id));
                        continue;
                    }
                };
            if !ok {
                warnings.push(format!(
                    "worktree remove failed for {}: {stderr}",
                    assignment.id
                ));
            }
            if assignment.worktree_path.exists() {
                if let Err(err) = tokio::fs::remove_dir_all(&assignment.worktree_path).await {
                    warnings.push(format!(
                        "filesystem cleanup failed for {}: {err}",
                        assignment.id
                    ));
                }
            }

            let (head_ok, head_stdout, _) = run_git(
                &self.repo_root,
                &["rev-parse", &assignment.branch_name],
            )
            .await
            .unwrap_or((false, String::new(), String::new()));
            if head_ok && head_stdout.trim() == assignment.base_head {
                let (ok, _out, stderr) = run_git(
                    &self.repo_root,
                    &["branch", "-D", &assignment.branch_name],
                )
                .await
                .unwrap_or((false, String::new(), String::new()));
                if !ok {
                    warnings.push(format!(
                        "branch deletion failed for {}: {stderr}",
                        assignment.branch_name
                    ));
                }
            }
        }
    }
}

async fn apply_patch_three_way(repo_root: &Path, diff: &str) -> CoordinatorResult<bool> {
    use tokio::io::AsyncWriteExt;

    let mut child = Command::new("git")
        .current_dir(repo_root)
        .args(["apply", "--3way", "--whitespace=nowarn"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(CoordinatorError::Io)?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(diff.as_bytes()).await.map_err(CoordinatorError::Io)?;
    }
    let status = child.wait().await.map_err(CoordinatorError::Io)?;
    Ok(status.success())
}

/// Plan a lane's `cwd`: a path outside `repo_root` maps to the worktree
/// root (with a warning); a path inside maps preserving the relative path.
pub fn map_lane_cwd(
    assignment: &WorktreeAssignment,
    repo_root: &Path,
    requested_cwd: Option<&Path>,
    warnings: &mut Vec<String>,
) -> PathBuf {
    match requested_cwd {
        None => assignment.worktree_path.clone(),
        Some(cwd) => match cwd.strip_prefix(repo_root) {
            Ok(rel) => assignment.worktree_path.join(rel),
            Err(_) => {
                warnings.push(format!(
                    "cwd {} is outside the repo root; mapping to worktree root",
                    cwd.display()
                ));
                assignment.worktree_path.clone()
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::TaskItem;

    fn item(agent: &str, task: &str) -> TaskItem {
        TaskItem {
            agent: agent.to_string(),
            task: task.to_string(),
            cwd: None,
        }
    }

    fn no_tools(_agent: &str) -> Vec<String> {
        Vec::new()
    }

    #[test]
    fn single_task_without_write_keyword_stays_shared() {
        let tasks = vec![item("scout", "list the files in src")];
        let refs: Vec<&TaskItem> = tasks.iter().collect();
        let mode = decide_isolation(IsolationChoice::Auto, TopologyMode::Single, &refs, no_tools);
        assert_eq!(mode, IsolationMode::Shared);
    }

    #[test]
    fn single_task_with_write_keyword_and_write_tool_is_worktree() {
        let tasks = vec![item("coder", "refactor the auth module")];
        let refs: Vec<&TaskItem> = tasks.iter().collect();
        let mode = decide_isolation(IsolationChoice::Auto, TopologyMode::Single, &refs, |_| {
            vec!["edit".to_string()]
        });
        assert_eq!(mode, IsolationMode::Worktree);
    }

    #[test]
    fn parallel_all_read_only_tasks_stays_shared() {
        let tasks = vec![item("scout", "list files"), item("scout", "search logs")];
        let refs: Vec<&TaskItem> = tasks.iter().collect();
        let mode = decide_isolation(IsolationChoice::Auto, TopologyMode::Parallel, &refs, no_tools);
        assert_eq!(mode, IsolationMode::Shared);
    }

    #[test]
    fn parallel_with_write_keyword_is_worktree() {
        let tasks = vec![item("coder", "edit the config"), item("coder", "add a test")];
        let refs: Vec<&TaskItem> = tasks.iter().collect();
        let mode = decide_isolation(IsolationChoice::Auto, TopologyMode::Parallel, &refs, no_tools);
        assert_eq!(mode, IsolationMode::Worktree);
    }

    #[test]
    fn single_task_parallel_is_always_shared() {
        let tasks = vec![item("coder", "delete the old config")];
        let refs: Vec<&TaskItem> = tasks.iter().collect();
        let mode = decide_isolation(IsolationChoice::Auto, TopologyMode::Parallel, &refs, no_tools);
        assert_eq!(mode, IsolationMode::Shared);
    }

    #[test]
    fn chain_with_write_capable_agent_tool_is_worktree() {
        let tasks = vec![item("coder", "inspect the repo")];
        let refs: Vec<&TaskItem> = tasks.iter().collect();
        let mode = decide_isolation(IsolationChoice::Auto, TopologyMode::Chain, &refs, |_| {
            vec!["bash".to_string()]
        });
        assert_eq!(mode, IsolationMode::Worktree);
    }

    #[test]
    fn explicit_choice_always_wins() {
        let tasks = vec![item("coder", "refactor auth")];
        let refs: Vec<&TaskItem> = tasks.iter().collect();
        let mode = decide_isolation(IsolationChoice::Shared, TopologyMode::Chain, &refs, |_| {
            vec!["bash".to_string()]
        });
        assert_eq!(mode, IsolationMode::Shared);
    }

    #[test]
    fn sanitize_label_lowercases_and_collapses_separators() {
        assert_eq!(sanitize_label("Fix Auth!!Bug"), "fix-auth-bug");
        assert_eq!(sanitize_label("scout_1.a"), "scout_1.a");
    }
}
