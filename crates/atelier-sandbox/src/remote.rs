use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::{ChunkSink, ExecOptions, ExecResult, OutputStream, Workspace, PROJECT_ROOT};

/// Round-trip bound for control-plane calls (provision, destroy).
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);
/// Archives can be large; give the download its own generous bound.
const ARCHIVE_TIMEOUT: Duration = Duration::from_secs(120);
/// Exec round trip when the caller sets no process timeout.
const EXEC_DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);
/// Slack on top of the remote process timeout, so the service reports the
/// timeout itself before the HTTP round trip is abandoned.
const EXEC_HTTP_MARGIN: Duration = Duration::from_secs(15);

fn bounded_client() -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(CONTROL_TIMEOUT)
        .build()?)
}

fn exec_http_timeout(opts: &ExecOptions) -> Duration {
    match opts.timeout {
        Some(process_timeout) => process_timeout + EXEC_HTTP_MARGIN,
        None => EXEC_DEFAULT_TIMEOUT,
    }
}

/// Connection settings for the remote sandbox provisioning service.
#[derive(Debug, Clone)]
pub struct SandboxServiceConfig {
    pub base_url: String,
    pub token: String,
    pub template: String,
}

#[derive(Debug, Deserialize)]
struct ProvisionResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteExecResponse {
    exit_code: i32,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
}

/// Handle to one sandbox in the remote execution service. Bound to at most
/// one run at a time; the execution task owns it for the run's lifetime.
pub struct RemoteSandbox {
    client: reqwest::Client,
    base_url: String,
    token: String,
    id: String,
}

impl RemoteSandbox {
    /// Creates a fresh sandbox from the configured template.
    pub async fn provision(config: &SandboxServiceConfig) -> anyhow::Result<Self> {
        let client = bounded_client()?;
        let response = client
            .post(format!("{}/v1/sandboxes", config.base_url.trim_end_matches('/')))
            .bearer_auth(&config.token)
            .json(&json!({"template": config.template}))
            .send()
            .await?
            .error_for_status()?;
        let provisioned: ProvisionResponse = response.json().await?;
        tracing::info!(
            target: "atelier.obs",
            component = "sandbox.remote",
            sandbox_id = %provisioned.id,
            "sandbox provisioned"
        );
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            id: provisioned.id,
        })
    }

    /// Reattaches to an already-provisioned sandbox, e.g. for workspace
    /// downloads while a run is still active.
    pub fn attach(config: &SandboxServiceConfig, id: impl Into<String>) -> anyhow::Result<Self> {
        Ok(Self {
            client: bounded_client()?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            id: id.into(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Streams the sandbox workspace as a zip archive.
    pub async fn download_archive(&self) -> anyhow::Result<Vec<u8>> {
        let response = self
            .client
            .get(format!("{}/v1/sandboxes/{}/archive", self.base_url, self.id))
            .bearer_auth(&self.token)
            .timeout(ARCHIVE_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }

    pub async fn destroy(&self) -> anyhow::Result<()> {
        self.client
            .delete(format!("{}/v1/sandboxes/{}", self.base_url, self.id))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl Workspace for RemoteSandbox {
    fn sandbox_id(&self) -> Option<String> {
        Some(self.id.clone())
    }

    async fn exec(
        &self,
        program: &str,
        args: &[String],
        opts: &ExecOptions,
        sink: ChunkSink,
    ) -> ExecResult {
        let body = json!({
            "command": program,
            "args": args,
            "cwd": opts.cwd.as_deref().unwrap_or(PROJECT_ROOT),
            "env": opts.env,
            "timeoutMs": opts.timeout.map(|t| t.as_millis() as u64),
        });
        let request = self
            .client
            .post(format!("{}/v1/sandboxes/{}/exec", self.base_url, self.id))
            .bearer_auth(&self.token)
            .json(&body)
            .timeout(exec_http_timeout(opts))
            .send()
            .await;

        let response = match request {
            Ok(response) => response,
            Err(err) => return ExecResult::transport_error(format!("sandbox exec failed: {err}")),
        };
        if !response.status().is_success() {
            return ExecResult::transport_error(format!(
                "sandbox service returned {}",
                response.status()
            ));
        }
        let parsed: RemoteExecResponse = match response.json().await {
            Ok(parsed) => parsed,
            Err(err) => {
                return ExecResult::transport_error(format!("sandbox exec response invalid: {err}"))
            }
        };

        // The exec endpoint returns buffered output; forward it to the sink
        // so callers observe the same chunk protocol as host execution.
        if !parsed.stdout.is_empty() {
            sink(OutputStream::Stdout, &parsed.stdout);
        }
        if !parsed.stderr.is_empty() {
            sink(OutputStream::Stderr, &parsed.stderr);
        }
        ExecResult::from_exit(parsed.exit_code, parsed.stdout, parsed.stderr)
    }

    async fn release(&self) {
        if let Err(err) = self.destroy().await {
            tracing::warn!(
                target: "atelier.obs",
                component = "sandbox.remote",
                sandbox_id = %self.id,
                "sandbox destroy failed: {err:#}"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn opts(timeout: Option<Duration>) -> ExecOptions {
        ExecOptions {
            cwd: None,
            env: HashMap::new(),
            timeout,
        }
    }

    #[test]
    fn exec_round_trip_outlives_the_remote_process_timeout() {
        assert_eq!(
            exec_http_timeout(&opts(Some(Duration::from_secs(300)))),
            Duration::from_secs(315)
        );
        assert_eq!(exec_http_timeout(&opts(None)), EXEC_DEFAULT_TIMEOUT);
    }

    #[test]
    fn attach_builds_a_bounded_client() {
        let config = SandboxServiceConfig {
            base_url: "http://127.0.0.1:1/".to_string(),
            token: "t".to_string(),
            template: "node-22".to_string(),
        };
        let sandbox = RemoteSandbox::attach(&config, "sb-1").unwrap();
        assert_eq!(sandbox.id(), "sb-1");
        assert_eq!(sandbox.base_url, "http://127.0.0.1:1");
    }
}
