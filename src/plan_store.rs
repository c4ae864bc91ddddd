//! File-locked read-modify-write of the plan file on disk.
//!
//! The lock is the consistency boundary: no in-memory plan manager is kept
//! across calls, each operation re-reads the file under lock. Mirrors the
//! lock-then-rewrite discipline of the teacher's event store, adapted from
//! append-only event logs to whole-file rewrite of a single document.

use crate::clock::Clock;
use crate::error::RalphError;
use crate::plan::{parser, Plan};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Retry policy for lock acquisition. Exposed as a value (not a constant) so
/// tests can inject a faster policy without touching production defaults.
#[derive(Debug, Clone, Copy)]
pub struct LockPolicy {
    pub max_attempts: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            min_backoff: Duration::from_millis(25),
            max_backoff: Duration::from_millis(250),
        }
    }
}

/// Opens the plan file for locking, using `anyhow::Context` the way the
/// teacher's IO-heavy functions do internally, before the caller converts
/// any failure into a `RalphError` at the component boundary.
fn open_for_lock(path: &Path) -> anyhow::Result<File> {
    use anyhow::Context;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating parent directory for {}", path.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))
}

fn acquire_exclusive(path: &Path, policy: &LockPolicy) -> Result<File, RalphError> {
    let file = open_for_lock(path).map_err(|e| RalphError::Io {
        context: format!("acquiring lock on {}", path.display()),
        message: e.to_string(),
    })?;

    let mut backoff = policy.min_backoff;
    for attempt in 1..=policy.max_attempts {
        match file.try_lock_exclusive() {
            Ok(()) => return Ok(file),
            Err(_) if attempt < policy.max_attempts => {
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(policy.max_backoff);
            }
            Err(_) => {
                return Err(RalphError::LockUnavailable {
                    path: path.to_path_buf(),
                    attempts: policy.max_attempts,
                })
            }
        }
    }
    unreachable!("loop always returns before exhausting attempts")
}

fn read_plan(path: &Path) -> Result<(Plan, parser::Format), RalphError> {
    let content = std::fs::read_to_string(path).map_err(|e| RalphError::InvalidPlan {
        path: path.to_path_buf(),
        message: format!("could not read plan file: {e}"),
    })?;
    parser::parse(&content, path)
}

fn write_plan_atomically(
    path: &Path,
    plan: &Plan,
    format: parser::Format,
) -> Result<(), RalphError> {
    let serialized = parser::write(plan, format)?;
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, serialized).map_err(|e| RalphError::Io {
        context: format!("writing {}", tmp_path.display()),
        message: e.to_string(),
    })?;
    std::fs::rename(&tmp_path, path).map_err(|e| RalphError::Io {
        context: format!("renaming into {}", path.display()),
        message: e.to_string(),
    })?;
    Ok(())
}

/// Reads the plan file under a shared read lock. Used for callers that only
/// need a consistent snapshot, not a read-modify-write cycle.
pub fn read_under_lock(path: &Path, policy: &LockPolicy) -> Result<Plan, RalphError> {
    let file = acquire_exclusive(path, policy)?;
    let (plan, _) = read_plan(path)?;
    fs2::FileExt::unlock(&file).ok();
    Ok(plan)
}

/// Reads, mutates via `f`, and writes back the plan file under a single
/// exclusive lock held for the full cycle. Guarantees at-most-one concurrent
/// writer per path.
pub fn mutate_under_lock(
    path: &Path,
    policy: &LockPolicy,
    f: impl FnOnce(Plan) -> Plan,
) -> Result<Plan, RalphError> {
    let file = acquire_exclusive(path, policy)?;
    let (plan, format) = read_plan(path)?;
    let updated = f(plan);
    write_plan_atomically(path, &updated, format)?;
    fs2::FileExt::unlock(&file).ok();
    Ok(updated)
}

/// Sets `status`, `updatedAt`, and (`completedAt` if `done`) atomically,
/// preserving `startedAt`. Applying this twice with the same `now` is
/// idempotent.
pub fn update_story_status(
    path: &Path,
    policy: &LockPolicy,
    id: &str,
    new_status: crate::plan::StoryStatus,
    clock: &dyn Clock,
) -> Result<Plan, RalphError> {
    let now = clock.now().to_rfc3339();
    mutate_under_lock(path, policy, |mut plan| {
        if let Some(story) = plan.story_mut(id) {
            story.status = new_status;
            story.updated_at = Some(now.clone());
            if new_status == crate::plan::StoryStatus::Done {
                story.completed_at = Some(now.clone());
            }
        }
        plan
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::plan::StoryStatus;

    fn fast_policy() -> LockPolicy {
        LockPolicy {
            max_attempts: 5,
            min_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    fn write_fixture(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("plan.yaml");
        std::fs::write(
            &path,
            r#"
version: 1
project: demo
stories:
  - id: US-001
    title: Do the thing
"#,
        )
        .unwrap();
        path
    }

    #[test]
    fn mutate_under_lock_persists_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(&dir);
        let policy = fast_policy();

        mutate_under_lock(&path, &policy, |mut plan| {
            plan.stories[0].status = StoryStatus::InProgress;
            plan
        })
        .unwrap();

        let reread = read_under_lock(&path, &policy).unwrap();
        assert_eq!(reread.stories[0].status, StoryStatus::InProgress);
    }

    #[test]
    fn update_story_status_sets_completed_at_on_done() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(&dir);
        let policy = fast_policy();
        let clock = SystemClock;

        let plan = update_story_status(&path, &policy, "US-001", StoryStatus::Done, &clock)
            .unwrap();
        let story = plan.story("US-001").unwrap();
        assert_eq!(story.status, StoryStatus::Done);
        assert!(story.completed_at.is_some());
    }

    #[test]
    fn update_story_status_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(&dir);
        let policy = fast_policy();
        let clock = SystemClock;

        update_story_status(&path, &policy, "US-001", StoryStatus::Done, &clock).unwrap();
        let first = read_under_lock(&path, &policy).unwrap();
        update_story_status(&path, &policy, "US-001", StoryStatus::Done, &clock).unwrap();
        let second = read_under_lock(&path, &policy).unwrap();

        assert_eq!(
            first.story("US-001").unwrap().status,
            second.story("US-001").unwrap().status
        );
    }

    #[test]
    fn missing_plan_file_is_invalid_plan_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.yaml");
        let policy = fast_policy();
        let err = read_under_lock(&path, &policy).unwrap_err();
        assert!(matches!(err, RalphError::InvalidPlan { .. }));
    }
}
