//! HTTP and SSE surface for the run-orchestration engine, plus the
//! background tasks that drive runs to completion.

mod download;
mod http;
mod runner;

pub use http::router;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use atelier_core::{CancellationRegistry, EventLog, RunActivity, Storage};
use atelier_providers::ProviderRegistry;
use atelier_sandbox::SandboxServiceConfig;
use atelier_types::WorkspaceBackendKind;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// When unset, authentication is disabled (local development).
    pub api_key: Option<String>,
    pub state_dir: PathBuf,
    /// Root under which host-backend project workspaces live.
    pub workspaces_dir: PathBuf,
    pub default_backend: WorkspaceBackendKind,
    /// Remote sandbox service; required for the remote-sandbox backend.
    pub sandbox: Option<SandboxServiceConfig>,
    /// A run whose execution task is silent for this long is failed by the
    /// reaper.
    pub run_stale_ms: u64,
    pub heartbeat_interval: Duration,
    pub command_timeout: Duration,
}

impl ServerConfig {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        let state_dir = state_dir.into();
        let workspaces_dir = state_dir.join("workspaces");
        Self {
            api_key: None,
            state_dir,
            workspaces_dir,
            default_backend: WorkspaceBackendKind::Host,
            sandbox: None,
            run_stale_ms: 120_000,
            heartbeat_interval: Duration::from_secs(15),
            command_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<Storage>,
    pub events: Arc<EventLog>,
    pub providers: Arc<ProviderRegistry>,
    pub cancellations: CancellationRegistry,
    pub activity: RunActivity,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub async fn new(config: ServerConfig, providers: ProviderRegistry) -> anyhow::Result<Self> {
        let storage = Arc::new(Storage::new(&config.state_dir).await?);
        let events = Arc::new(EventLog::new(&config.state_dir).await?);
        let state = Self {
            storage,
            events,
            providers: Arc::new(providers),
            cancellations: CancellationRegistry::new(),
            activity: RunActivity::new(),
            config: Arc::new(config),
        };
        state.fail_orphaned_runs().await;
        Ok(state)
    }

    /// Runs persisted as queued or running have no execution task after a
    /// restart and would otherwise stay in flight forever; fail them before
    /// the server starts taking requests.
    async fn fail_orphaned_runs(&self) {
        for run in self.storage.non_terminal_runs().await {
            tracing::warn!(
                target: "atelier.obs",
                component = "server",
                run_id = %run.id,
                status = run.status.as_str(),
                "run has no execution task after restart, failing it"
            );
            runner::fail_run(self, &run.id, "engine restarted while the run was in flight").await;
        }
    }
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let reaper = tokio::spawn(reap_stale_runs(state.clone()));
    let app = http::router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    tracing::info!(
        target: "atelier.obs",
        component = "server",
        addr = %addr,
        "listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve")?;
    reaper.abort();
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!(target: "atelier.obs", component = "server", "shutdown requested");
}

/// Fails runs whose execution task has stopped heartbeating. This is the
/// backstop that keeps a crashed task from leaving a run `running` forever.
async fn reap_stale_runs(state: AppState) {
    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        for run_id in state.activity.reap_stale(state.config.run_stale_ms).await {
            let Some(run) = state.storage.get_run(&run_id).await else {
                continue;
            };
            if run.status.is_terminal() {
                continue;
            }
            tracing::warn!(
                target: "atelier.obs",
                component = "server.reaper",
                run_id = %run_id,
                status = run.status.as_str(),
                "run went silent, failing it"
            );
            state.cancellations.cancel(&run_id).await;
            runner::fail_run(&state, &run_id, "execution task went silent and was reaped").await;
        }
    }
}
