//! Error taxonomy for the build loop and its collaborators.
//!
//! Mirrors the shape of a hand-written domain error enum: plain variants,
//! manual `Display`, no `thiserror`. Only the kinds that can surface as an
//! immediate failure of the whole run are represented here; failures that
//! occur mid-iteration (agent spawn, agent runtime) are recorded into that
//! iteration's artifacts instead of propagating as a `RalphError`, per the
//! propagation policy: they still carry a variant so the artifact writer and
//! tests can name them precisely.

use std::fmt;
use std::path::PathBuf;

/// A kind, not a type name: each variant names one of the failure classes a
/// caller needs to distinguish.
#[derive(Debug)]
pub enum RalphError {
    /// Plan file failed to parse or violated a structural invariant.
    InvalidPlan { path: PathBuf, message: String },
    /// Plan or worktree-registry lock could not be acquired within budget.
    LockUnavailable { path: PathBuf, attempts: u32 },
    /// Prompt template missing or unreadable.
    MissingTemplate { path: PathBuf, message: String },
    /// Launcher could not be started.
    AgentSpawnFailure { agent: String, message: String },
    /// Launcher started but the runtime around it failed unexpectedly.
    AgentRuntimeError { agent: String, message: String },
    /// Worktree could not be created or registered.
    WorktreeSetupFailure { message: String },
    /// Generic IO failure that doesn't fit a more specific variant.
    Io { context: String, message: String },
}

impl fmt::Display for RalphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RalphError::InvalidPlan { path, message } => {
                write!(f, "invalid plan at {}: {}", path.display(), message)
            }
            RalphError::LockUnavailable { path, attempts } => write!(
                f,
                "could not acquire lock on {} after {} attempts",
                path.display(),
                attempts
            ),
            RalphError::MissingTemplate { path, message } => {
                write!(f, "missing prompt template at {}: {}", path.display(), message)
            }
            RalphError::AgentSpawnFailure { agent, message } => {
                write!(f, "failed to spawn agent '{}': {}", agent, message)
            }
            RalphError::AgentRuntimeError { agent, message } => {
                write!(f, "agent '{}' runtime error: {}", agent, message)
            }
            RalphError::WorktreeSetupFailure { message } => {
                write!(f, "worktree setup failed: {}", message)
            }
            RalphError::Io { context, message } => write!(f, "{}: {}", context, message),
        }
    }
}

impl std::error::Error for RalphError {}

pub type Result<T> = std::result::Result<T, RalphError>;
