use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::{ChunkSink, ExecOptions, ExecResult, OutputStream, Workspace, PROJECT_ROOT};

/// Workspace backed by a directory on the host. A command's `/app`-rooted
/// working directory is remapped under the workspace root.
pub struct HostWorkspace {
    root: PathBuf,
}

impl HostWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub async fn prepare(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve_cwd(&self, opts: &ExecOptions) -> PathBuf {
        match opts.cwd.as_deref() {
            None => self.root.clone(),
            Some(cwd) => match cwd.strip_prefix(PROJECT_ROOT) {
                Some(rest) => self.root.join(rest.trim_start_matches('/')),
                None => self.root.join(cwd.trim_start_matches('/')),
            },
        }
    }
}

#[async_trait]
impl Workspace for HostWorkspace {
    async fn exec(
        &self,
        program: &str,
        args: &[String],
        opts: &ExecOptions,
        sink: ChunkSink,
    ) -> ExecResult {
        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(self.resolve_cwd(opts))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &opts.env {
            command.env(key, value);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                return ExecResult::transport_error(format!("failed to spawn {program}: {err}"))
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_pump = tokio::spawn(pump(stdout, OutputStream::Stdout, sink.clone()));
        let err_pump = tokio::spawn(pump(stderr, OutputStream::Stderr, sink));

        let status = match opts.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, child.wait()).await {
                Ok(result) => result,
                Err(_) => {
                    let _ = child.kill().await;
                    let stdout = out_pump.await.unwrap_or_default();
                    let stderr = err_pump.await.unwrap_or_default();
                    return ExecResult {
                        ok: false,
                        exit_code: None,
                        stdout,
                        stderr,
                        error: Some(format!(
                            "command timed out after {}s",
                            timeout.as_secs()
                        )),
                    };
                }
            },
            None => child.wait().await,
        };

        let stdout = out_pump.await.unwrap_or_default();
        let stderr = err_pump.await.unwrap_or_default();
        match status {
            Ok(status) => ExecResult::from_exit(status.code().unwrap_or(-1), stdout, stderr),
            Err(err) => ExecResult::transport_error(format!("wait on {program} failed: {err}")),
        }
    }
}

async fn pump(
    source: Option<impl tokio::io::AsyncRead + Unpin>,
    stream: OutputStream,
    sink: ChunkSink,
) -> String {
    let Some(mut source) = source else {
        return String::new();
    };
    let mut collected = String::new();
    let mut buf = [0u8; 8192];
    loop {
        match source.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                sink(stream, &chunk);
                collected.push_str(&chunk);
            }
        }
    }
    collected
}
