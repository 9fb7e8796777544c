use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use atelier_observability::{emit_event, init_logging, RunObsEvent};
use atelier_providers::CompletionRequest;
use atelier_server::{serve, AppState};

mod config;

use config::EngineOverrides;

#[derive(Parser, Debug)]
#[command(name = "atelier-engine")]
#[command(about = "Headless Atelier run-orchestration engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP/SSE service.
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 4100)]
        port: u16,
        #[arg(long)]
        state_dir: Option<String>,
        /// Inbound API key clients must present; providers keep their own
        /// secrets in the environment or config file.
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        config: Option<String>,
    },
    /// One provider turn from the command line, no server involved.
    Run {
        prompt: String,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            state_dir,
            api_key,
            provider,
            model,
            config,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let (_log_guard, log_info) = init_logging(&state_dir.join("logs"))?;
            emit_event(
                tracing::Level::INFO,
                RunObsEvent {
                    event: "logging.initialized",
                    component: "engine.main",
                    project_id: None,
                    run_id: None,
                    status: Some("ok"),
                    detail: Some(&log_info.logs_dir),
                },
            );

            let overrides = EngineOverrides {
                auth_key: api_key,
                provider,
                model,
            };
            let file = config::load_file(config.as_deref().map(Path::new))?;
            let (server_config, registry) = config::build(state_dir.clone(), overrides, file)?;
            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            info!(
                "starting atelier-engine on http://{addr} (state_dir={})",
                state_dir.display()
            );
            let state = AppState::new(server_config, registry).await?;
            serve(addr, state).await?;
        }
        Command::Run {
            prompt,
            provider,
            model,
            config,
        } => {
            let overrides = EngineOverrides {
                auth_key: None,
                provider,
                model,
            };
            let file = config::load_file(config.as_deref().map(Path::new))?;
            let (_config, registry) = config::build(resolve_state_dir(None), overrides, file)?;
            // Overrides already shaped the registry defaults.
            let resolved = registry.resolve(None, None)?;
            let turn = resolved
                .provider
                .complete(CompletionRequest {
                    model: resolved.model.clone(),
                    prompt,
                    system: None,
                })
                .await?;
            println!("{}", turn.message);
        }
    }

    Ok(())
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("ATELIER_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(".atelier")
}
