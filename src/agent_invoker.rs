//! Spawns the agent subprocess with a prompt and captures
//! stdout/stderr/exit.
//!
//! Adapted from the teacher's synchronous `ClaudeInvocation::execute`: same
//! spawn-capture-wait shape, but the prompt travels over stdin instead of a
//! `-p` CLI argument, and the result is a plain value type rather than a
//! JSON-decoded agent-specific struct, since the core does not interpret
//! agent output beyond the completion marker.

use crate::error::RalphError;
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Request to invoke an agent for one iteration.
pub struct InvocationRequest<'a> {
    pub agent_id: &'a str,
    pub prompt: String,
    pub cwd: &'a Path,
    pub use_stdin: bool,
}

/// Captured result of running the agent to completion.
#[derive(Debug, Clone)]
pub struct InvocationOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

/// Launches the external agent executable identified by `agent_id`, delivers
/// the prompt over stdin when `use_stdin` is true, and waits for it to run
/// to completion. No timeout is enforced here; cancellation is the caller's
/// responsibility.
pub async fn invoke(request: InvocationRequest<'_>) -> Result<InvocationOutput, RalphError> {
    let mut cmd = Command::new(request.agent_id);
    cmd.current_dir(request.cwd);
    cmd.stdin(if request.use_stdin {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| RalphError::AgentSpawnFailure {
        agent: request.agent_id.to_string(),
        message: e.to_string(),
    })?;

    if request.use_stdin {
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(request.prompt.as_bytes())
                .await
                .map_err(|e| RalphError::AgentRuntimeError {
                    agent: request.agent_id.to_string(),
                    message: format!("failed to write prompt to stdin: {e}"),
                })?;
            stdin
                .flush()
                .await
                .map_err(|e| RalphError::AgentRuntimeError {
                    agent: request.agent_id.to_string(),
                    message: e.to_string(),
                })?;
            // Dropping closes stdin so the agent sees EOF.
        }
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| RalphError::AgentRuntimeError {
            agent: request.agent_id.to_string(),
            message: e.to_string(),
        })?;

    Ok(InvocationOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code(),
    })
}

/// Test double matching the production `invoke` signature without spawning
/// a real process. Writes its canned stdout/stderr and reports the given
/// exit code, mirroring exactly what `invoke` would return for a subprocess
/// that behaved identically.
#[cfg(test)]
pub struct FakeAgent {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

#[cfg(test)]
impl FakeAgent {
    pub fn respond(self) -> InvocationOutput {
        InvocationOutput {
            stdout: self.stdout,
            stderr: self.stderr,
            exit_code: self.exit_code,
        }
    }
}
