//! Integration tests for the build loop, driven only through its public
//! surface (`BuildLoopOptions`/`Capabilities`/`ralph::run`).
//!
//! These tests verify the end-to-end flows including:
//! - A single story completing on the first try
//! - Dependency ordering across stories
//! - Repeated failures landing in the errors log
//!
//! Unlike the whitebox scenario tests colocated with `build_loop.rs`, nothing
//! here reaches into a private helper.

use async_trait::async_trait;
use ralph::agent_invoker::{InvocationOutput, InvocationRequest};
use ralph::build_loop::{AgentInvoker, BuildLoopOptions, Capabilities, NonInteractivePrompter};
use ralph::error::RalphError;
use ralph::plan::StoryStatus;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Drains a scripted queue of canned responses, repeating the last one once
/// exhausted — the same shape as the whitebox `ScriptedAgent`, reimplemented
/// here since that one is test-only and private to the lib crate.
struct ScriptedAgent {
    responses: Mutex<Vec<(String, String, Option<i32>)>>,
}

#[async_trait]
impl AgentInvoker for ScriptedAgent {
    async fn invoke(&self, _request: InvocationRequest<'_>) -> Result<InvocationOutput, RalphError> {
        let mut responses = self.responses.lock().unwrap();
        let (stdout, stderr, exit_code) = if responses.len() > 1 {
            responses.remove(0)
        } else {
            responses[0].clone()
        };
        Ok(InvocationOutput { stdout, stderr, exit_code })
    }
}

fn setup_repo_root() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join(".agents").join("poe-code-ralph")).unwrap();
    std::fs::write(
        dir.path().join(".agents").join("poe-code-ralph").join("PROMPT_build.md"),
        "Work on {{STORY_ID}}: {{STORY_TITLE}}\n{{STORY_BLOCK}}\n{{QUALITY_GATES}}\n",
    )
    .unwrap();
    dir
}

fn write_plan(dir: &Path, yaml: &str) -> PathBuf {
    let path = dir.join("plan.yaml");
    std::fs::write(&path, yaml).unwrap();
    path
}

fn base_options(dir: &Path, plan_path: PathBuf, max_iterations: u32) -> BuildLoopOptions {
    BuildLoopOptions {
        plan_path,
        progress_path: None,
        guardrails_path: None,
        errors_log_path: None,
        activity_log_path: None,
        prompt_template_path: None,
        max_iterations,
        max_failures: Some(3),
        pause_on_overbake: false,
        no_commit: true,
        agent: "fake-agent".to_string(),
        stale_seconds: 60,
        cwd: dir.to_path_buf(),
        worktree: None,
        run_id: Some("e2e-run".to_string()),
    }
}

fn caps_with_agent(agent: Arc<dyn AgentInvoker>) -> Capabilities {
    Capabilities {
        agent_invoker: agent,
        operator_prompter: Arc::new(NonInteractivePrompter),
        ..Capabilities::default()
    }
}

#[tokio::test]
async fn single_story_completes_and_persists_artifacts() {
    let dir = setup_repo_root();
    let plan_path = write_plan(
        dir.path(),
        "version: 1\nproject: demo\nstories:\n  - id: US-001\n    title: Do the thing\n",
    );
    let options = base_options(dir.path(), plan_path.clone(), 3);
    let agent = Arc::new(ScriptedAgent {
        responses: Mutex::new(vec![(
            "<promise>COMPLETE</promise>".to_string(),
            String::new(),
            Some(0),
        )]),
    });
    let caps = caps_with_agent(agent);

    let result = ralph::run(options, &caps).await.unwrap();

    assert_eq!(result.iterations_completed, 1);
    assert_eq!(result.stories_done, vec!["US-001".to_string()]);
    assert_eq!(result.run_id, "e2e-run");

    let log = std::fs::read_to_string(&result.iterations[0].log_path).unwrap();
    assert!(log.contains("COMPLETE"));
    let meta = std::fs::read_to_string(&result.iterations[0].meta_path).unwrap();
    assert!(meta.contains("Status: success"));

    let plan_content = std::fs::read_to_string(&plan_path).unwrap();
    assert!(plan_content.contains("status: done"));
}

#[tokio::test]
async fn dependency_ordering_runs_dependency_story_first() {
    let dir = setup_repo_root();
    let plan_path = write_plan(
        dir.path(),
        "version: 1\nproject: demo\nstories:\n  - id: US-002\n    title: Second\n    dependsOn: [US-001]\n  - id: US-001\n    title: First\n",
    );
    let options = base_options(dir.path(), plan_path, 3);
    let agent = Arc::new(ScriptedAgent {
        responses: Mutex::new(vec![(
            "<promise>COMPLETE</promise>".to_string(),
            String::new(),
            Some(0),
        )]),
    });
    let caps = caps_with_agent(agent);

    let result = ralph::run(options, &caps).await.unwrap();

    assert_eq!(result.stories_done, vec!["US-001".to_string(), "US-002".to_string()]);
}

#[tokio::test]
async fn repeated_failures_land_in_the_errors_log() {
    let dir = setup_repo_root();
    let plan_path = write_plan(
        dir.path(),
        "version: 1\nproject: demo\nstories:\n  - id: US-001\n    title: Do the thing\n",
    );
    let options = base_options(dir.path(), plan_path.clone(), 1);
    let agent = Arc::new(ScriptedAgent {
        responses: Mutex::new(vec![("crash".to_string(), "boom\n".to_string(), Some(1))]),
    });
    let caps = caps_with_agent(agent);

    let result = ralph::run(options, &caps).await.unwrap();

    assert!(result.stories_done.is_empty());
    let errors_log = dir.path().join(".poe-code-ralph").join("errors.log");
    let content = std::fs::read_to_string(errors_log).unwrap();
    assert!(content.contains("boom"));

    let plan = ralph::plan_store::read_under_lock(&plan_path, &caps.lock_policy).unwrap();
    assert_eq!(plan.story("US-001").unwrap().status, StoryStatus::Open);
}
