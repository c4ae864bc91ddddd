//! Emits per-iteration log and metadata files; appends to the errors log.
//!
//! Grounded on the teacher's `StructuredLogger`: ensure parent directories
//! exist, open append-mode for the shared log, one writer per call. Unlike
//! the teacher's JSONL event stream, artifacts here are the plain-text
//! `.log`/`.md` pair the spec names explicitly, since this is an
//! operator-facing trail rather than a machine-replayable event log.

use crate::overbake::IterationStatus;
use chrono::{DateTime, Utc};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Coarse classification of a failure iteration, recorded for human
/// readability only — it never feeds back into scheduling or completion
/// logic.
#[derive(Debug, Clone)]
pub enum FailureClass {
    Exit(i32),
    SpawnError,
    IoError,
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureClass::Exit(code) => write!(f, "exit({code})"),
            FailureClass::SpawnError => write!(f, "spawn_error"),
            FailureClass::IoError => write!(f, "io_error"),
        }
    }
}

const SETUP_HINT: &str =
    "hint: verify the agent executable is installed and on PATH, and that it accepts a prompt on stdin";

pub struct IterationArtifactInput<'a> {
    pub run_id: &'a str,
    pub iteration: u32,
    pub story_id: &'a str,
    pub story_title: &'a str,
    pub status: IterationStatus,
    pub stdout: &'a str,
    pub stderr: &'a str,
    pub failure_class: Option<FailureClass>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub git: Option<crate::worktree::GitActivity>,
}

pub struct IterationArtifactPaths {
    pub log_path: PathBuf,
    pub meta_path: PathBuf,
}

fn status_label(status: IterationStatus) -> &'static str {
    match status {
        IterationStatus::Success => "success",
        IterationStatus::Failure => "failure",
        IterationStatus::Incomplete => "incomplete",
    }
}

/// Writes `run-<runId>-iter-<i>.log` and `run-<runId>-iter-<i>.md` under
/// `<repoRoot>/.poe-code-ralph/runs/`.
pub fn write_iteration_artifacts(
    repo_root: &Path,
    input: &IterationArtifactInput,
) -> std::io::Result<IterationArtifactPaths> {
    let runs_dir = repo_root.join(".poe-code-ralph").join("runs");
    std::fs::create_dir_all(&runs_dir)?;

    let stem = format!("run-{}-iter-{}", input.run_id, input.iteration);
    let log_path = runs_dir.join(format!("{stem}.log"));
    let meta_path = runs_dir.join(format!("{stem}.md"));

    let mut log_body = String::new();
    if !input.stdout.is_empty() {
        log_body.push_str("# stdout\n");
        log_body.push_str(input.stdout);
        if !input.stdout.ends_with('\n') {
            log_body.push('\n');
        }
    }
    if !input.stderr.is_empty() {
        log_body.push_str("# stderr\n");
        log_body.push_str(input.stderr);
        if !input.stderr.ends_with('\n') {
            log_body.push('\n');
        }
    }
    let failed = matches!(
        (input.status, &input.failure_class),
        (IterationStatus::Failure, _)
    );
    if failed {
        log_body.push('\n');
        log_body.push_str(SETUP_HINT);
        log_body.push('\n');
    }
    std::fs::write(&log_path, log_body)?;

    let duration = (input.ended_at - input.started_at).num_seconds();
    let mut meta = vec![
        format!("Run ID: {}", input.run_id),
        format!("Iteration: {}", input.iteration),
        "Mode: build".to_string(),
        format!("Story: {}: {}", input.story_id, input.story_title),
        format!("Started: {}", input.started_at.to_rfc3339()),
        format!("Ended: {}", input.ended_at.to_rfc3339()),
        format!("Duration: {}s", duration),
        format!("Status: {}", status_label(input.status)),
        format!("Log: {}", log_path.display()),
    ];
    if let Some(class) = &input.failure_class {
        meta.push(format!("Failure: {}", class));
    }
    let mut meta = meta.join("\n") + "\n";
    if let Some(git) = &input.git {
        meta.push_str("\n## Git\n");
        meta.push_str(&format!("Head before: {}\n", git.head_before));
        meta.push_str(&format!("Head after: {}\n", git.head_after));
        if !git.commits.is_empty() {
            meta.push_str("\n### Commits\n");
            for (hash, subject) in &git.commits {
                meta.push_str(&format!("- {hash} {subject}\n"));
            }
        }
        if !git.changed_files.is_empty() {
            meta.push_str("\n### Changed Files (commits)\n");
            for file in &git.changed_files {
                meta.push_str(&format!("- {file}\n"));
            }
        }
        if !git.uncommitted.is_empty() {
            meta.push_str("\n### Uncommitted Changes\n");
            for line in &git.uncommitted {
                meta.push_str(&format!("- {line}\n"));
            }
        }
    }
    std::fs::write(&meta_path, meta)?;

    Ok(IterationArtifactPaths { log_path, meta_path })
}

/// Appends stderr (plus setup hint) to the errors log on a failure
/// iteration with non-empty stderr. Creates the file and any missing parent
/// directories.
pub fn append_errors_log(
    errors_log_path: &Path,
    story_id: &str,
    story_title: &str,
    stderr: &str,
    warned_overbake: bool,
) -> std::io::Result<()> {
    if let Some(parent) = errors_log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(errors_log_path)?;

    if warned_overbake {
        writeln!(file, "[OVERBAKE] {story_id}: {story_title}")?;
    }
    if !stderr.is_empty() {
        write!(file, "{}", stderr)?;
        if !stderr.ends_with('\n') {
            writeln!(file)?;
        }
        writeln!(file, "{}", SETUP_HINT)?;
    }
    Ok(())
}
