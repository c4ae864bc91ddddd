//! Sequences iterations, ties all components together, honors termination
//! rules.
//!
//! Every external collaborator (fs already lives behind the plan store and
//! artifact writer; spawn, clock, entropy, and the operator prompt) is
//! injected through `Capabilities`, per the teacher's capability-injection
//! pattern (`domain::services::WorkflowClock`) generalized to the full set
//! this spec names. Production wires them to the OS; tests wire them to
//! in-memory fakes.

use crate::agent_invoker::{InvocationOutput, InvocationRequest};
use crate::clock::Clock;
use crate::completion;
use crate::error::RalphError;
use crate::overbake::{IterationStatus, OverbakingDetector};
use crate::plan::StoryStatus;
use crate::plan_store::{self, LockPolicy};
use crate::prompt;
use crate::run_id::{self, EntropySource};
use crate::scheduler;
use crate::worktree;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(
        &self,
        request: InvocationRequest<'_>,
    ) -> Result<InvocationOutput, RalphError>;
}

pub struct ProcessAgentInvoker;

#[async_trait]
impl AgentInvoker for ProcessAgentInvoker {
    async fn invoke(
        &self,
        request: InvocationRequest<'_>,
    ) -> Result<InvocationOutput, RalphError> {
        crate::agent_invoker::invoke(request).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverbakeDecision {
    Continue,
    Skip,
    Abort,
}

/// Returns one of the three decision values; the default implementation
/// degrades to `Continue` on non-interactive stdio.
pub trait OperatorPrompter: Send + Sync {
    fn prompt(&self, story_id: &str, story_title: &str) -> OverbakeDecision;
}

pub struct NonInteractivePrompter;

impl OperatorPrompter for NonInteractivePrompter {
    fn prompt(&self, _story_id: &str, _story_title: &str) -> OverbakeDecision {
        OverbakeDecision::Continue
    }
}

pub struct Capabilities {
    pub clock: Arc<dyn Clock>,
    pub entropy: Arc<dyn EntropySource>,
    pub agent_invoker: Arc<dyn AgentInvoker>,
    pub operator_prompter: Arc<dyn OperatorPrompter>,
    pub lock_policy: LockPolicy,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            clock: Arc::new(crate::clock::SystemClock),
            entropy: Arc::new(crate::run_id::OsEntropy),
            agent_invoker: Arc::new(ProcessAgentInvoker),
            operator_prompter: Arc::new(NonInteractivePrompter),
            lock_policy: LockPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WorktreeOptions {
    pub enabled: bool,
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BuildLoopOptions {
    pub plan_path: PathBuf,
    pub progress_path: Option<PathBuf>,
    pub guardrails_path: Option<PathBuf>,
    pub errors_log_path: Option<PathBuf>,
    pub activity_log_path: Option<PathBuf>,
    pub prompt_template_path: Option<PathBuf>,
    pub max_iterations: u32,
    pub max_failures: Option<u32>,
    pub pause_on_overbake: bool,
    pub no_commit: bool,
    pub agent: String,
    pub stale_seconds: i64,
    pub cwd: PathBuf,
    pub worktree: Option<WorktreeOptions>,
    pub run_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    NoActionableStories,
    MaxIterations,
    OverbakeAbort,
}

#[derive(Debug, Clone)]
pub struct IterationResult {
    pub iteration: u32,
    pub story_id: String,
    pub story_title: String,
    pub status: IterationStatus,
    pub log_path: PathBuf,
    pub meta_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct BuildResult {
    pub run_id: String,
    pub iterations_completed: u32,
    pub stories_done: Vec<String>,
    pub iterations: Vec<IterationResult>,
    pub stop_reason: StopReason,
    pub worktree_branch: Option<String>,
}

fn default_errors_log(repo_root: &Path) -> PathBuf {
    repo_root.join(".poe-code-ralph").join("errors.log")
}

fn default_prompt_template(repo_root: &Path) -> PathBuf {
    repo_root.join(".agents").join("poe-code-ralph").join("PROMPT_build.md")
}

/// Inputs to [`render_variables`], grouped into one struct rather than a long
/// parameter list since every field maps straight onto a template variable.
struct PromptContext<'a> {
    plan_path: &'a Path,
    progress_path: &'a Path,
    guardrails_path: &'a Path,
    errors_log_path: &'a Path,
    activity_log_path: &'a Path,
    repo_root: &'a Path,
    no_commit: bool,
    run_id: &'a str,
    iteration: u32,
    run_log_path: &'a Path,
    run_meta_path: &'a Path,
    story_id: &'a str,
    story_title: &'a str,
    story_block: &'a str,
    quality_gates: &'a str,
}

fn render_variables(ctx: &PromptContext<'_>) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    vars.insert("PLAN_PATH".to_string(), ctx.plan_path.display().to_string());
    vars.insert("PROGRESS_PATH".to_string(), ctx.progress_path.display().to_string());
    vars.insert("GUARDRAILS_PATH".to_string(), ctx.guardrails_path.display().to_string());
    vars.insert("ERRORS_LOG_PATH".to_string(), ctx.errors_log_path.display().to_string());
    vars.insert("ACTIVITY_LOG_PATH".to_string(), ctx.activity_log_path.display().to_string());
    vars.insert("REPO_ROOT".to_string(), ctx.repo_root.display().to_string());
    vars.insert("GUARDRAILS_REF".to_string(), ctx.guardrails_path.display().to_string());
    vars.insert("CONTEXT_REF".to_string(), ctx.progress_path.display().to_string());
    vars.insert("ACTIVITY_CMD".to_string(), ctx.activity_log_path.display().to_string());
    vars.insert("NO_COMMIT".to_string(), ctx.no_commit.to_string());
    vars.insert("RUN_ID".to_string(), ctx.run_id.to_string());
    vars.insert("ITERATION".to_string(), ctx.iteration.to_string());
    vars.insert("RUN_LOG_PATH".to_string(), ctx.run_log_path.display().to_string());
    vars.insert("RUN_META_PATH".to_string(), ctx.run_meta_path.display().to_string());
    vars.insert("STORY_ID".to_string(), ctx.story_id.to_string());
    vars.insert("STORY_TITLE".to_string(), ctx.story_title.to_string());
    vars.insert("STORY_BLOCK".to_string(), ctx.story_block.to_string());
    vars.insert("QUALITY_GATES".to_string(), ctx.quality_gates.to_string());
    vars
}

/// Runs the build loop to completion. Honors termination precedence
/// `overbake_abort > no_actionable_stories > max_iterations`.
pub async fn run(
    options: BuildLoopOptions,
    caps: &Capabilities,
) -> Result<BuildResult, RalphError> {
    let lock_policy = caps.lock_policy;
    let max_failures = options.max_failures.unwrap_or(3);
    let mut overbake = OverbakingDetector::new(max_failures)
        .map_err(|message| RalphError::InvalidPlan {
            path: options.plan_path.clone(),
            message,
        })?;

    let mut repo_root = options.cwd.clone();
    let mut plan_path = options.plan_path.clone();
    let mut worktree_name: Option<String> = None;
    let mut worktree_branch: Option<String> = None;

    if let Some(wt) = &options.worktree {
        if wt.enabled {
            let setup = worktree::setup(
                &options.cwd,
                &options.plan_path,
                wt.name.as_deref(),
                &options.agent,
                &lock_policy,
                caps.clock.now(),
            )?;
            repo_root = setup.path.clone();
            plan_path = setup.plan_path.clone();
            worktree_branch = Some(setup.branch.clone());
            worktree_name = Some(setup.name);
        }
    }

    let progress_path = options.progress_path.clone().unwrap_or_else(|| repo_root.join("PROGRESS.md"));
    let guardrails_path = options
        .guardrails_path
        .clone()
        .unwrap_or_else(|| repo_root.join("GUARDRAILS.md"));
    let errors_log_path = options
        .errors_log_path
        .clone()
        .unwrap_or_else(|| default_errors_log(&repo_root));
    let activity_log_path = options
        .activity_log_path
        .clone()
        .unwrap_or_else(|| repo_root.join(".poe-code-ralph").join("activity.log"));
    let template_path = options
        .prompt_template_path
        .clone()
        .unwrap_or_else(|| default_prompt_template(&repo_root));

    let template = std::fs::read_to_string(&template_path).map_err(|e| RalphError::MissingTemplate {
        path: template_path.clone(),
        message: e.to_string(),
    })?;

    let run_id = options
        .run_id
        .clone()
        .unwrap_or_else(|| run_id::generate(caps.clock.now(), caps.entropy.as_ref()));

    let mut iterations: Vec<IterationResult> = Vec::new();
    let mut stories_done: Vec<String> = Vec::new();
    let mut ignore_story_ids: HashSet<String> = HashSet::new();
    let mut stop_reason = StopReason::MaxIterations;

    'outer: for iteration in 1..=options.max_iterations {
        // SelectStory
        let plan = plan_store::read_under_lock(&plan_path, &lock_policy)?;
        let selected = scheduler::select_next(&plan, caps.clock.now(), options.stale_seconds, &ignore_story_ids);
        let Some(story_id) = selected else {
            stop_reason = StopReason::NoActionableStories;
            break 'outer;
        };

        let started_at = caps.clock.now();
        plan_store::mutate_under_lock(&plan_path, &lock_policy, |mut plan| {
            if let Some(story) = plan.story_mut(&story_id) {
                story.status = StoryStatus::InProgress;
                if story.started_at.is_none() {
                    story.started_at = Some(started_at.to_rfc3339());
                }
                story.completed_at = None;
                story.updated_at = Some(started_at.to_rfc3339());
            }
            plan
        })?;

        let plan = plan_store::read_under_lock(&plan_path, &lock_policy)?;
        let story = plan
            .story(&story_id)
            .expect("story selected by the scheduler must exist in the plan")
            .clone();

        // RenderPrompt
        let run_log_path = repo_root
            .join(".poe-code-ralph")
            .join("runs")
            .join(format!("run-{run_id}-iter-{iteration}.log"));
        let run_meta_path = repo_root
            .join(".poe-code-ralph")
            .join("runs")
            .join(format!("run-{run_id}-iter-{iteration}.md"));

        let story_block = prompt::story_block(&story);
        let quality_gates = prompt::quality_gates_block(&plan);
        let vars = render_variables(&PromptContext {
            plan_path: &plan_path,
            progress_path: &progress_path,
            guardrails_path: &guardrails_path,
            errors_log_path: &errors_log_path,
            activity_log_path: &activity_log_path,
            repo_root: &repo_root,
            no_commit: options.no_commit,
            run_id: &run_id,
            iteration,
            run_log_path: &run_log_path,
            run_meta_path: &run_meta_path,
            story_id: &story.id,
            story_title: &story.title,
            story_block: &story_block,
            quality_gates: &quality_gates,
        });
        let rendered = prompt::render(&template, &vars);

        let tmp_dir = repo_root.join(".poe-code-ralph").join(".tmp");
        std::fs::create_dir_all(&tmp_dir).map_err(|e| RalphError::Io {
            context: format!("creating {}", tmp_dir.display()),
            message: e.to_string(),
        })?;
        let rendered_prompt_path = tmp_dir.join(format!("prompt-build-{run_id}-iter-{iteration}.md"));
        std::fs::write(&rendered_prompt_path, &rendered).map_err(|e| RalphError::Io {
            context: format!("writing {}", rendered_prompt_path.display()),
            message: e.to_string(),
        })?;

        // InvokeAgent
        let head_before = worktree::head(&repo_root);
        let invocation = caps
            .agent_invoker
            .invoke(InvocationRequest {
                agent_id: &options.agent,
                prompt: rendered,
                cwd: &repo_root,
                use_stdin: true,
            })
            .await;

        let (stdout, stderr, exit_code, failure_class) = match invocation {
            Ok(output) => {
                let class = if output.exit_code != Some(0) {
                    Some(crate::artifacts::FailureClass::Exit(output.exit_code.unwrap_or(-1)))
                } else {
                    None
                };
                (output.stdout, output.stderr, output.exit_code, class)
            }
            Err(RalphError::AgentSpawnFailure { message, .. }) => (
                String::new(),
                message,
                None,
                Some(crate::artifacts::FailureClass::SpawnError),
            ),
            Err(RalphError::AgentRuntimeError { message, .. }) => (
                String::new(),
                message,
                None,
                Some(crate::artifacts::FailureClass::IoError),
            ),
            Err(other) => return Err(other),
        };

        // Classify
        let status = if exit_code != Some(0) {
            IterationStatus::Failure
        } else if completion::is_complete(&stdout) {
            IterationStatus::Success
        } else {
            IterationStatus::Incomplete
        };

        let ended_at = caps.clock.now();
        let git = head_before.and_then(|before| worktree::activity_since(&repo_root, &before));

        // PersistArtifacts
        let artifact_paths = crate::artifacts::write_iteration_artifacts(
            &repo_root,
            &crate::artifacts::IterationArtifactInput {
                run_id: &run_id,
                iteration,
                story_id: &story.id,
                story_title: &story.title,
                status,
                stdout: &stdout,
                stderr: &stderr,
                failure_class: failure_class.clone(),
                started_at,
                ended_at,
                git,
            },
        )
        .map_err(|e| RalphError::Io {
            context: "writing iteration artifacts".to_string(),
            message: e.to_string(),
        })?;

        // RecordOverbake
        let overbake_event = overbake.record(&story.id, status);
        let mut decision = OverbakeDecision::Continue;
        if overbake_event.should_warn {
            tracing::warn!(story = %story.id, failures = overbake_event.consecutive_failures, "overbaking detected");
        }
        if status == IterationStatus::Failure && !stderr.is_empty() {
            crate::artifacts::append_errors_log(
                &errors_log_path,
                &story.id,
                &story.title,
                &stderr,
                overbake_event.should_warn,
            )
            .map_err(|e| RalphError::Io {
                context: "appending errors log".to_string(),
                message: e.to_string(),
            })?;
        } else if overbake_event.should_warn {
            crate::artifacts::append_errors_log(&errors_log_path, &story.id, &story.title, "", true)
                .map_err(|e| RalphError::Io {
                    context: "appending errors log".to_string(),
                    message: e.to_string(),
                })?;
        }
        if overbake_event.overbaked && options.pause_on_overbake {
            decision = caps.operator_prompter.prompt(&story.id, &story.title);
        }

        // UpdatePlan
        if status == IterationStatus::Success {
            plan_store::update_story_status(&plan_path, &lock_policy, &story.id, StoryStatus::Done, caps.clock.as_ref())?;
            stories_done.push(story.id.clone());
        } else {
            plan_store::mutate_under_lock(&plan_path, &lock_policy, |mut plan| {
                if let Some(s) = plan.story_mut(&story.id) {
                    s.status = StoryStatus::Open;
                    s.updated_at = Some(caps.clock.now().to_rfc3339());
                }
                plan
            })?;
        }

        iterations.push(IterationResult {
            iteration,
            story_id: story.id.clone(),
            story_title: story.title.clone(),
            status,
            log_path: artifact_paths.log_path,
            meta_path: artifact_paths.meta_path,
        });

        // Decide
        match decision {
            OverbakeDecision::Abort => {
                stop_reason = StopReason::OverbakeAbort;
                break 'outer;
            }
            OverbakeDecision::Skip => {
                ignore_story_ids.insert(story.id.clone());
            }
            OverbakeDecision::Continue => {}
        }

        if iteration == options.max_iterations {
            // The budget is exhausted, but `max_iterations` only applies if
            // a story would still be selectable on a hypothetical next
            // iteration; otherwise this run simply finished exactly on the
            // boundary and `no_actionable_stories` takes precedence.
            let latest_plan = plan_store::read_under_lock(&plan_path, &lock_policy)?;
            let still_actionable = scheduler::select_next(
                &latest_plan,
                caps.clock.now(),
                options.stale_seconds,
                &ignore_story_ids,
            )
            .is_some();
            stop_reason = if still_actionable {
                StopReason::MaxIterations
            } else {
                StopReason::NoActionableStories
            };
        }
    }

    if let Some(name) = &worktree_name {
        let hint = worktree::finalize(&repo_root, name, !stories_done.is_empty(), &lock_policy)?;
        println!("{hint}");
    }

    Ok(BuildResult {
        run_id,
        iterations_completed: iterations.len() as u32,
        stories_done,
        iterations,
        stop_reason,
        worktree_branch,
    })
}
