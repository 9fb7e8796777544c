//! Engine configuration: CLI flags over `ATELIER_*` environment variables
//! over an optional YAML file over built-in defaults.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;

use atelier_providers::{OpenAiCompatProvider, ProviderRegistry, ScriptedProvider};
use atelier_sandbox::SandboxServiceConfig;
use atelier_server::ServerConfig;
use atelier_types::WorkspaceBackendKind;

pub const SUPPORTED_PROVIDER_IDS: [&str; 6] = [
    "openai",
    "openrouter",
    "groq",
    "mistral",
    "together",
    "scripted",
];

const DEFAULT_SANDBOX_TEMPLATE: &str = "node-22";

/// Values taken from the command line; everything is optional and falls
/// through to the environment and the config file.
#[derive(Debug, Clone, Default)]
pub struct EngineOverrides {
    /// Inbound API key for the HTTP surface, not a provider secret.
    pub auth_key: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub api_key: Option<String>,
    pub default_backend: Option<WorkspaceBackendKind>,
    pub provider: Option<ProviderSection>,
    pub sandbox: Option<SandboxSection>,
    pub run_stale_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProviderSection {
    pub id: Option<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SandboxSection {
    pub base_url: String,
    pub token: Option<String>,
    pub template: Option<String>,
}

pub fn load_file(path: Option<&Path>) -> anyhow::Result<FileConfig> {
    let Some(path) = path else {
        return Ok(FileConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config file {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parse config file {}", path.display()))
}

pub fn normalize_provider(provider: Option<String>) -> anyhow::Result<Option<String>> {
    let Some(provider) = provider else {
        return Ok(None);
    };
    let normalized = provider.trim().to_lowercase();
    if normalized.is_empty() {
        anyhow::bail!(
            "provider cannot be empty. supported providers: {}",
            SUPPORTED_PROVIDER_IDS.join(", ")
        );
    }
    if SUPPORTED_PROVIDER_IDS.contains(&normalized.as_str()) {
        return Ok(Some(normalized));
    }
    anyhow::bail!(
        "unsupported provider `{provider}`. supported providers: {}",
        SUPPORTED_PROVIDER_IDS.join(", ")
    );
}

fn default_base_url(provider: &str) -> &'static str {
    match provider {
        "openrouter" => "https://openrouter.ai/api/v1",
        "groq" => "https://api.groq.com/openai/v1",
        "mistral" => "https://api.mistral.ai/v1",
        "together" => "https://api.together.xyz/v1",
        _ => "https://api.openai.com/v1",
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_backend(raw: &str) -> anyhow::Result<WorkspaceBackendKind> {
    match raw {
        "host" => Ok(WorkspaceBackendKind::Host),
        "remote-sandbox" => Ok(WorkspaceBackendKind::RemoteSandbox),
        other => anyhow::bail!("unknown workspace backend `{other}` (host, remote-sandbox)"),
    }
}

/// Builds the server configuration and the provider registry. Fatal when the
/// default backend is remote-sandbox but no sandbox service is configured;
/// every run would fail at workspace setup otherwise.
pub fn build(
    state_dir: PathBuf,
    overrides: EngineOverrides,
    file: FileConfig,
) -> anyhow::Result<(ServerConfig, ProviderRegistry)> {
    let mut config = ServerConfig::new(state_dir);
    config.api_key = overrides
        .auth_key
        .or_else(|| env_var("ATELIER_API_KEY"))
        .or(file.api_key);

    if let Some(stale_ms) = env_var("ATELIER_RUN_STALE_MS")
        .and_then(|v| v.parse().ok())
        .or(file.run_stale_ms)
    {
        config.run_stale_ms = stale_ms;
    }

    let file_provider = file.provider.unwrap_or_default();
    let provider_id = normalize_provider(
        overrides
            .provider
            .or_else(|| env_var("ATELIER_PROVIDER"))
            .or(file_provider.id),
    )?;
    let provider_key = env_var("ATELIER_PROVIDER_KEY").or(file_provider.api_key);

    let mut registry;
    match (&provider_id, &provider_key) {
        (Some(id), Some(key)) if id != "scripted" => {
            let base_url = env_var("ATELIER_PROVIDER_BASE_URL")
                .or(file_provider.base_url)
                .unwrap_or_else(|| default_base_url(id).to_string());
            let model = overrides
                .model
                .or_else(|| env_var("ATELIER_MODEL"))
                .or(file_provider.model)
                .unwrap_or_else(|| "gpt-4.1-mini".to_string());
            registry = ProviderRegistry::new(id.clone(), model);
            registry.register(
                id.clone(),
                Arc::new(OpenAiCompatProvider::new(id.clone(), base_url, key.clone())),
            );
        }
        (Some(id), None) if id != "scripted" => {
            anyhow::bail!(
                "provider `{id}` selected but no key found; set ATELIER_PROVIDER_KEY or \
                 provider.api_key in the config file"
            );
        }
        _ => {
            let model = overrides
                .model
                .or_else(|| env_var("ATELIER_MODEL"))
                .unwrap_or_else(|| "scripted-1".to_string());
            registry = ProviderRegistry::new("scripted", model);
        }
    }
    // The scripted provider is always available as a deterministic fallback.
    registry.register("scripted", Arc::new(ScriptedProvider));

    config.default_backend = match env_var("ATELIER_DEFAULT_BACKEND") {
        Some(raw) => parse_backend(&raw)?,
        None => file.default_backend.unwrap_or_default(),
    };

    let sandbox_url = env_var("ATELIER_SANDBOX_URL")
        .or_else(|| file.sandbox.as_ref().map(|s| s.base_url.clone()));
    if let Some(base_url) = sandbox_url {
        let token = env_var("ATELIER_SANDBOX_TOKEN")
            .or_else(|| file.sandbox.as_ref().and_then(|s| s.token.clone()))
            .context("sandbox service configured without a token; set ATELIER_SANDBOX_TOKEN")?;
        let template = env_var("ATELIER_SANDBOX_TEMPLATE")
            .or_else(|| file.sandbox.as_ref().and_then(|s| s.template.clone()))
            .unwrap_or_else(|| DEFAULT_SANDBOX_TEMPLATE.to_string());
        config.sandbox = Some(SandboxServiceConfig {
            base_url,
            token,
            template,
        });
    }
    if config.default_backend == WorkspaceBackendKind::RemoteSandbox && config.sandbox.is_none() {
        anyhow::bail!(
            "default backend is remote-sandbox but no sandbox service is configured; \
             set ATELIER_SANDBOX_URL and ATELIER_SANDBOX_TOKEN"
        );
    }

    Ok((config, registry))
}
