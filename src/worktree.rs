//! Creates/destroys an isolated worktree, copies the plan, emits merge
//! hints.
//!
//! Adapted from the teacher's `git_worktree` module: same shell-out-to-git
//! shape (repo-root/branch detection, submodule check, worktree add/remove)
//! but renamed to this spec's branch/path conventions and with worktree
//! bookkeeping persisted to a registry file under the same lock discipline
//! as the plan store, using a second lock token keyed on the registry path.

use crate::error::RalphError;
use crate::plan_store::LockPolicy;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorktreeStatus {
    Active,
    Done,
    Failed,
    Removing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeEntry {
    pub name: String,
    pub path: PathBuf,
    pub branch: String,
    #[serde(rename = "baseBranch")]
    pub base_branch: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    pub source: String,
    pub agent: String,
    pub status: WorktreeStatus,
    #[serde(rename = "planPath", default, skip_serializing_if = "Option::is_none")]
    pub plan_path: Option<PathBuf>,
    #[serde(rename = "storyId", default, skip_serializing_if = "Option::is_none")]
    pub story_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

type Registry = BTreeMap<String, WorktreeEntry>;

fn registry_path(repo_root: &Path) -> PathBuf {
    repo_root.join(".poe-code-worktrees").join("worktrees.yaml")
}

fn with_registry_lock<T>(
    repo_root: &Path,
    policy: &LockPolicy,
    f: impl FnOnce(Registry) -> (Registry, T),
) -> Result<T, RalphError> {
    let path = registry_path(repo_root);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| RalphError::Io {
            context: format!("creating {}", parent.display()),
            message: e.to_string(),
        })?;
    }
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&path)
        .map_err(|e| RalphError::Io {
            context: format!("opening {}", path.display()),
            message: e.to_string(),
        })?;

    let mut backoff = policy.min_backoff;
    let mut acquired = false;
    for attempt in 1..=policy.max_attempts {
        if file.try_lock_exclusive().is_ok() {
            acquired = true;
            break;
        }
        if attempt < policy.max_attempts {
            std::thread::sleep(backoff);
            backoff = (backoff * 2).min(policy.max_backoff);
        }
    }
    if !acquired {
        return Err(RalphError::LockUnavailable {
            path: path.clone(),
            attempts: policy.max_attempts,
        });
    }

    let content = std::fs::read_to_string(&path).unwrap_or_default();
    let registry: Registry = if content.trim().is_empty() {
        Registry::new()
    } else {
        serde_yaml::from_str(&content).map_err(|e| RalphError::Io {
            context: format!("parsing {}", path.display()),
            message: e.to_string(),
        })?
    };

    let (updated, result) = f(registry);

    let serialized = serde_yaml::to_string(&updated).map_err(|e| RalphError::Io {
        context: "serializing worktree registry".to_string(),
        message: e.to_string(),
    })?;
    let tmp_path = path.with_extension("yaml.tmp");
    std::fs::write(&tmp_path, serialized).map_err(|e| RalphError::Io {
        context: format!("writing {}", tmp_path.display()),
        message: e.to_string(),
    })?;
    std::fs::rename(&tmp_path, &path).map_err(|e| RalphError::Io {
        context: format!("renaming into {}", path.display()),
        message: e.to_string(),
    })?;
    fs2::FileExt::unlock(&file).ok();

    Ok(result)
}

fn is_git_repo(path: &Path) -> bool {
    Command::new("git")
        .current_dir(path)
        .args(["rev-parse", "--git-dir"])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn repo_root_and_branch(path: &Path) -> Result<(PathBuf, String), RalphError> {
    let root_output = Command::new("git")
        .current_dir(path)
        .args(["rev-parse", "--show-toplevel"])
        .output()
        .map_err(|e| RalphError::WorktreeSetupFailure {
            message: format!("failed to run git: {e}"),
        })?;
    if !root_output.status.success() {
        return Err(RalphError::WorktreeSetupFailure {
            message: "not a git repository".to_string(),
        });
    }
    let repo_root = PathBuf::from(String::from_utf8_lossy(&root_output.stdout).trim());

    let branch_output = Command::new("git")
        .current_dir(&repo_root)
        .args(["rev-parse", "--abbrev-ref", "HEAD"])
        .output()
        .map_err(|e| RalphError::WorktreeSetupFailure {
            message: format!("failed to read current branch: {e}"),
        })?;
    let branch = String::from_utf8_lossy(&branch_output.stdout).trim().to_string();
    // A stable sentinel if detection fails (e.g. detached HEAD).
    let branch = if branch.is_empty() || branch == "HEAD" {
        "main".to_string()
    } else {
        branch
    };

    Ok((repo_root, branch))
}

/// The repository's current commit hash, or `None` outside a git repository.
pub fn head(repo_root: &Path) -> Option<String> {
    let output = Command::new("git")
        .current_dir(repo_root)
        .args(["rev-parse", "HEAD"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Git activity recorded around one iteration: the commits the agent made
/// (if any), the files those commits touched, and anything left uncommitted
/// in the working tree.
#[derive(Debug, Clone)]
pub struct GitActivity {
    pub head_before: String,
    pub head_after: String,
    pub commits: Vec<(String, String)>,
    pub changed_files: Vec<String>,
    pub uncommitted: Vec<String>,
}

fn lines_of(output: &std::process::Output) -> Vec<String> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::to_string)
        .filter(|l| !l.is_empty())
        .collect()
}

/// Gathers `GitActivity` since `head_before`. Returns `None` if `repo_root`
/// is not (or is no longer) inside a git repository.
pub fn activity_since(repo_root: &Path, head_before: &str) -> Option<GitActivity> {
    let head_after = head(repo_root)?;

    let (commits, changed_files) = if head_after == head_before {
        (Vec::new(), Vec::new())
    } else {
        let range = format!("{head_before}..{head_after}");
        let log_output = Command::new("git")
            .current_dir(repo_root)
            .args(["log", "--format=%h %s", &range])
            .output()
            .ok()?;
        let commits = lines_of(&log_output)
            .into_iter()
            .filter_map(|line| {
                line.split_once(' ')
                    .map(|(hash, subject)| (hash.to_string(), subject.to_string()))
            })
            .collect();

        let diff_output = Command::new("git")
            .current_dir(repo_root)
            .args(["diff", "--name-only", &range])
            .output()
            .ok()?;
        (commits, lines_of(&diff_output))
    };

    let status_output = Command::new("git")
        .current_dir(repo_root)
        .args(["status", "--porcelain"])
        .output()
        .ok()?;

    Some(GitActivity {
        head_before: head_before.to_string(),
        head_after,
        commits,
        changed_files,
        uncommitted: lines_of(&status_output),
    })
}

pub fn has_submodules(repo_root: &Path) -> bool {
    let gitmodules = repo_root.join(".gitmodules");
    std::fs::metadata(&gitmodules).map(|m| m.len() > 0).unwrap_or(false)
}

/// Derives the worktree name from the plan file's base name unless the
/// caller supplies an explicit name.
pub fn derive_name(plan_path: &Path, explicit: Option<&str>) -> String {
    if let Some(name) = explicit {
        return name.to_string();
    }
    plan_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("plan")
        .to_string()
}

#[derive(Debug, Clone)]
pub struct WorktreeSetup {
    pub name: String,
    pub path: PathBuf,
    pub branch: String,
    pub has_submodules: bool,
    pub plan_path: PathBuf,
}

/// Creates the branch and worktree, registers it, and copies the plan file
/// into it preserving its relative path.
pub fn setup(
    original_dir: &Path,
    plan_path: &Path,
    name: Option<&str>,
    agent: &str,
    lock_policy: &LockPolicy,
    now: DateTime<Utc>,
) -> Result<WorktreeSetup, RalphError> {
    if !is_git_repo(original_dir) {
        return Err(RalphError::WorktreeSetupFailure {
            message: "not a git repository".to_string(),
        });
    }
    let (repo_root, base_branch) = repo_root_and_branch(original_dir)?;
    let submodules = has_submodules(&repo_root);

    let worktree_name = derive_name(plan_path, name);
    let branch_name = format!("poe-code/{worktree_name}");
    let worktree_path = repo_root.join(".poe-code-worktrees").join(&worktree_name);

    let output = Command::new("git")
        .current_dir(&repo_root)
        .args([
            "worktree",
            "add",
            "-b",
            &branch_name,
            &worktree_path.to_string_lossy(),
            "HEAD",
        ])
        .output()
        .map_err(|e| RalphError::WorktreeSetupFailure {
            message: format!("failed to run git worktree add: {e}"),
        })?;
    if !output.status.success() {
        return Err(RalphError::WorktreeSetupFailure {
            message: format!(
                "git worktree add failed: {}",
                String::from_utf8_lossy(&output.stderr)
            ),
        });
    }

    let relative_plan_path = plan_path
        .strip_prefix(&repo_root)
        .unwrap_or(plan_path)
        .to_path_buf();
    let plan_dest = worktree_path.join(&relative_plan_path);
    if let Some(parent) = plan_dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| RalphError::WorktreeSetupFailure {
            message: format!("failed to create {}: {e}", parent.display()),
        })?;
    }
    std::fs::copy(plan_path, &plan_dest).map_err(|e| RalphError::WorktreeSetupFailure {
        message: format!("failed to copy plan into worktree: {e}"),
    })?;

    with_registry_lock(&repo_root, lock_policy, |mut registry| {
        registry.insert(
            worktree_name.clone(),
            WorktreeEntry {
                name: worktree_name.clone(),
                path: worktree_path.clone(),
                branch: branch_name.clone(),
                base_branch: base_branch.clone(),
                created_at: now.to_rfc3339(),
                source: "build_loop".to_string(),
                agent: agent.to_string(),
                status: WorktreeStatus::Active,
                plan_path: Some(relative_plan_path.clone()),
                story_id: None,
                prompt: None,
            },
        );
        (registry, ())
    })?;

    Ok(WorktreeSetup {
        name: worktree_name,
        path: worktree_path,
        branch: branch_name,
        has_submodules: submodules,
        plan_path: plan_dest,
    })
}

/// Sets the registry entry's status to `done`/`failed` depending on whether
/// any story reached `done` during this run, and returns a merge hint
/// naming the branch and the equivalent merge command.
pub fn finalize(
    repo_root: &Path,
    name: &str,
    any_story_done: bool,
    lock_policy: &LockPolicy,
) -> Result<String, RalphError> {
    let final_status = if any_story_done {
        WorktreeStatus::Done
    } else {
        WorktreeStatus::Failed
    };

    let entry = with_registry_lock(repo_root, lock_policy, |mut registry| {
        if let Some(entry) = registry.get_mut(name) {
            entry.status = final_status;
        }
        let entry = registry.get(name).cloned();
        (registry, entry)
    })?;

    let entry = entry.ok_or_else(|| RalphError::WorktreeSetupFailure {
        message: format!("worktree '{name}' not found in registry"),
    })?;

    Ok(format!(
        "worktree '{}' on branch '{}' ({:?}) — merge with: git merge {}",
        entry.name, entry.branch, entry.status, entry.branch
    ))
}
