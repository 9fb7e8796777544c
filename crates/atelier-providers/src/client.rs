use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};

/// One completion request against a model provider.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    pub system: Option<String>,
}

/// One provider turn: assistant text plus the raw usage object, if the
/// provider reported one. Usage stays opaque here; normalization happens in
/// the usage module.
#[derive(Debug, Clone)]
pub struct ProviderTurn {
    pub message: String,
    pub usage: Option<Value>,
}

#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn id(&self) -> &str;
    async fn complete(&self, request: CompletionRequest) -> anyhow::Result<ProviderTurn>;
}

/// Round-trip bound for one completion request. Long generations finish
/// well inside this; a dead connection does not hang the run task.
const COMPLETION_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(300);

/// OpenAI-compatible chat-completion client. Works against any endpoint
/// speaking the `/chat/completions` dialect.
pub struct OpenAiCompatProvider {
    id: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(id: impl Into<String>, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ModelProvider for OpenAiCompatProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn complete(&self, request: CompletionRequest) -> anyhow::Result<ProviderTurn> {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": request.prompt}));

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({"model": request.model, "messages": messages}))
            .timeout(COMPLETION_TIMEOUT)
            .send()
            .await
            .context("provider request failed")?;
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .context("provider returned a non-JSON body")?;
        if !status.is_success() {
            let detail = body
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("unknown provider error");
            anyhow::bail!("provider returned {status}: {detail}");
        }

        let message = body
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let usage = body.get("usage").cloned();
        Ok(ProviderTurn { message, usage })
    }
}

/// Deterministic local provider used when no API key is configured and in
/// tests. Echoes an acknowledgement and reports a small usage block so the
/// accounting path stays exercised.
pub struct ScriptedProvider;

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn id(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: CompletionRequest) -> anyhow::Result<ProviderTurn> {
        let prompt_tokens = (request.prompt.split_whitespace().count() as u64).max(1);
        Ok(ProviderTurn {
            message: format!(
                "Acknowledged. Planned work for: {}",
                request.prompt.lines().next().unwrap_or("").trim()
            ),
            usage: Some(json!({
                "input_tokens": prompt_tokens,
                "output_tokens": 12,
                "total_tokens": prompt_tokens + 12,
            })),
        })
    }
}

/// Where the (provider, model) pair for a run came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSource {
    Request,
    Default,
}

impl ModelSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelSource::Request => "request",
            ModelSource::Default => "default",
        }
    }
}

#[derive(Clone)]
pub struct ResolvedModel {
    pub provider: Arc<dyn ModelProvider>,
    pub provider_id: String,
    pub model: String,
    pub source: ModelSource,
}

/// Registry of configured providers with a default (provider, model) pair.
#[derive(Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ModelProvider>>,
    default_provider: String,
    default_model: String,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .field("default_provider", &self.default_provider)
            .field("default_model", &self.default_model)
            .finish()
    }
}

impl ProviderRegistry {
    pub fn new(default_provider: impl Into<String>, default_model: impl Into<String>) -> Self {
        Self {
            providers: HashMap::new(),
            default_provider: default_provider.into(),
            default_model: default_model.into(),
        }
    }

    pub fn register(&mut self, id: impl Into<String>, provider: Arc<dyn ModelProvider>) {
        self.providers.insert(id.into(), provider);
    }

    pub fn provider_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Resolves the provider and model for a run, preferring what the request
    /// asked for and falling back to the registry defaults.
    pub fn resolve(
        &self,
        requested_provider: Option<&str>,
        requested_model: Option<&str>,
    ) -> anyhow::Result<ResolvedModel> {
        let source = if requested_provider.is_some() || requested_model.is_some() {
            ModelSource::Request
        } else {
            ModelSource::Default
        };
        let provider_id = requested_provider.unwrap_or(&self.default_provider).to_string();
        let model = requested_model.unwrap_or(&self.default_model).to_string();
        let provider = self
            .providers
            .get(&provider_id)
            .cloned()
            .with_context(|| format!("provider {provider_id:?} is not configured"))?;
        Ok(ResolvedModel {
            provider,
            provider_id,
            model,
            source,
        })
    }
}
