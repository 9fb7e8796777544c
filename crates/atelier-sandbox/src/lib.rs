//! Command execution against a run's workspace: a host directory or a remote
//! sandbox. One command at a time, policy-checked, with output streamed to
//! the caller as it arrives and failures reported as structured results
//! instead of errors thrown past the gateway.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use atelier_policy::{validate_command, ApprovedCommand, PolicyViolation};

mod cleanup;
mod host;
mod remote;

pub use cleanup::{build_process_patterns, recover_stale_build, BUILD_LOCK_FILE};
pub use host::HostWorkspace;
pub use remote::{RemoteSandbox, SandboxServiceConfig};

/// Fixed project root inside a sandbox; the default working directory for
/// every command.
pub const PROJECT_ROOT: &str = "/app";

#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Receives output chunks as the process produces them. Called from the pump
/// tasks, so it must be cheap and non-blocking.
pub type ChunkSink = Arc<dyn Fn(OutputStream, &str) + Send + Sync>;

pub fn null_sink() -> ChunkSink {
    Arc::new(|_, _| {})
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecResult {
    pub fn from_exit(exit_code: i32, stdout: String, stderr: String) -> Self {
        Self {
            ok: exit_code == 0,
            exit_code: Some(exit_code),
            error: if exit_code == 0 {
                None
            } else {
                Some(format!("command exited with status {exit_code}"))
            },
            stdout,
            stderr,
        }
    }

    /// Transport-level failure: no exit code is known.
    pub fn transport_error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(message.into()),
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.error
            .as_deref()
            .map(|e| e.contains("timed out"))
            .unwrap_or(false)
    }
}

/// An execution environment bound to one run. Implementations execute exactly
/// what they are given; policy runs in the gateway above.
#[async_trait]
pub trait Workspace: Send + Sync {
    fn sandbox_id(&self) -> Option<String> {
        None
    }

    async fn exec(
        &self,
        program: &str,
        args: &[String],
        opts: &ExecOptions,
        sink: ChunkSink,
    ) -> ExecResult;

    /// Releases the underlying environment. Not necessarily destruction; a
    /// remote sandbox may be kept warm by the service.
    async fn release(&self) {}
}

/// Policy-checked entry point for all run command execution.
pub struct ExecutionGateway {
    workspace: Arc<dyn Workspace>,
}

impl ExecutionGateway {
    pub fn new(workspace: Arc<dyn Workspace>) -> Self {
        Self { workspace }
    }

    pub fn workspace(&self) -> &Arc<dyn Workspace> {
        &self.workspace
    }

    pub fn sandbox_id(&self) -> Option<String> {
        self.workspace.sandbox_id()
    }

    /// Validates the raw command line, then executes it. Build commands get a
    /// best-effort cleanup pass before starting and again after a timeout,
    /// recovering workspaces wedged by a previously killed build.
    pub async fn execute(
        &self,
        raw: &str,
        opts: &ExecOptions,
        sink: ChunkSink,
    ) -> Result<ExecResult, PolicyViolation> {
        let approved = validate_command(raw)?;
        self.execute_approved(&approved, opts, sink).await
    }

    pub async fn execute_approved(
        &self,
        approved: &ApprovedCommand,
        opts: &ExecOptions,
        sink: ChunkSink,
    ) -> Result<ExecResult, PolicyViolation> {
        if approved.is_build {
            recover_stale_build(self.workspace.as_ref(), opts).await;
        }
        let result = self
            .workspace
            .exec(&approved.program, &approved.argv[1..], opts, sink)
            .await;
        if approved.is_build && result.is_timeout() {
            tracing::warn!(
                target: "atelier.obs",
                component = "sandbox.gateway",
                command = %approved.raw,
                "build timed out, running stale-build cleanup"
            );
            recover_stale_build(self.workspace.as_ref(), opts).await;
        }
        Ok(result)
    }
}
