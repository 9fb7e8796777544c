//! Background execution of runs: workspace setup, policy-checked command
//! execution with streamed tool events, one provider turn, and accounting.
//! A task failure never escapes the task boundary; it becomes a run error
//! with a `done` event, so streams always close.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use atelier_core::{CoreError, RunActivity};
use atelier_providers::{accumulate_raw, pricing, CompletionRequest};
use atelier_sandbox::{
    ChunkSink, ExecOptions, ExecutionGateway, HostWorkspace, OutputStream, RemoteSandbox, Workspace,
};
use atelier_types::{event_type, Run, RunCost, RunStatus, WorkspaceBackendKind};

use crate::AppState;

const SYSTEM_PROMPT: &str = "You are a coding agent working inside a project workspace. \
Respond with a concise plan and the result of the requested work.";

pub(crate) async fn spawn_run_task(state: AppState, run: Run) {
    // Register the token before the task exists, so a cancel racing the
    // task's first poll still finds something to signal.
    let cancel = state.cancellations.register(&run.id).await;
    state.activity.touch(&run.id).await;
    tokio::spawn(async move {
        let run_id = run.id.clone();
        let driven = with_heartbeat(&state.activity, &run_id, drive(&state, &run, &cancel)).await;
        if let Err(err) = driven {
            tracing::error!(
                target: "atelier.obs",
                component = "server.runner",
                run_id = %run_id,
                "run execution failed: {err:#}"
            );
            fail_run(&state, &run_id, &format!("{err:#}")).await;
        }
        state.cancellations.remove(&run_id).await;
        state.activity.finish(&run_id).await;
    });
}

/// Drives `work` while ticking the run's activity record. The heartbeat is
/// part of the task's own future: when the task dies, including a panic
/// unwinding through `work`, the heartbeats stop with it and the reaper
/// surfaces the run as an error.
async fn with_heartbeat<T>(
    activity: &RunActivity,
    run_id: &str,
    work: impl std::future::Future<Output = T>,
) -> T {
    tokio::pin!(work);
    let mut ticker = tokio::time::interval(Duration::from_secs(2));
    loop {
        tokio::select! {
            out = &mut work => return out,
            _ = ticker.tick() => activity.touch(run_id).await,
        }
    }
}

async fn drive(state: &AppState, run: &Run, cancel: &CancellationToken) -> anyhow::Result<()> {
    let run_id = run.id.as_str();
    if cancel.is_cancelled() {
        return finish_cancelled(state, run_id, None).await;
    }

    state
        .storage
        .transition_run(run_id, RunStatus::Running, |_| {})
        .await?;
    state
        .events
        .append(run_id, event_type::STATUS, json!({"status": "running"}))
        .await?;

    let workspace: Arc<dyn Workspace> = match run.workspace_backend {
        WorkspaceBackendKind::Host => {
            let root = state.config.workspaces_dir.join(&run.project_id);
            Arc::new(HostWorkspace::prepare(root).await?)
        }
        WorkspaceBackendKind::RemoteSandbox => {
            let config = state.config.sandbox.as_ref().context(
                "remote-sandbox backend requested but no sandbox service is configured",
            )?;
            Arc::new(RemoteSandbox::provision(config).await?)
        }
    };
    let gateway = ExecutionGateway::new(workspace.clone());
    if let Some(sandbox_id) = gateway.sandbox_id() {
        state
            .storage
            .mutate_run(run_id, |r| r.sandbox_id = Some(sandbox_id.clone()))
            .await?;
        state
            .events
            .append(
                run_id,
                event_type::STATUS,
                json!({"status": "running", "sandboxId": sandbox_id}),
            )
            .await?;
    }

    let commands: Vec<String> = run
        .input
        .get("commands")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let mut transcript = String::new();
    for command in &commands {
        if cancel.is_cancelled() {
            workspace.release().await;
            return finish_cancelled(state, run_id, nonempty(transcript)).await;
        }
        match run_tool_command(state, run_id, &gateway, command, &mut transcript).await? {
            StepOutcome::Continue => {}
            StepOutcome::Fail(reason) => {
                workspace.release().await;
                if let Some(partial) = nonempty(transcript) {
                    state
                        .storage
                        .mutate_run(run_id, |r| r.output = Some(partial))
                        .await?;
                }
                fail_run(state, run_id, &reason).await;
                return Ok(());
            }
        }
    }

    let resolved = match state
        .providers
        .resolve(run.provider.as_deref(), run.model.as_deref())
    {
        Ok(resolved) => resolved,
        Err(err) => {
            workspace.release().await;
            fail_run(state, run_id, &format!("{err:#}")).await;
            return Ok(());
        }
    };
    state
        .storage
        .mutate_run(run_id, |r| {
            r.provider = Some(resolved.provider_id.clone());
            r.model = Some(resolved.model.clone());
            r.model_source = Some(resolved.source.as_str().to_string());
        })
        .await?;

    let request = CompletionRequest {
        model: resolved.model.clone(),
        prompt: run.prompt.clone(),
        system: Some(SYSTEM_PROMPT.to_string()),
    };
    let turn = tokio::select! {
        _ = cancel.cancelled() => {
            workspace.release().await;
            return finish_cancelled(state, run_id, nonempty(transcript)).await;
        }
        turn = resolved.provider.complete(request) => turn,
    };
    let turn = match turn {
        Ok(turn) => turn,
        Err(err) => {
            workspace.release().await;
            if let Some(partial) = nonempty(transcript.clone()) {
                state
                    .storage
                    .mutate_run(run_id, |r| r.output = Some(partial))
                    .await?;
            }
            fail_run(state, run_id, &format!("provider turn failed: {err:#}")).await;
            return Ok(());
        }
    };

    state
        .events
        .append(
            run_id,
            event_type::MESSAGE,
            json!({"role": "assistant", "content": turn.message}),
        )
        .await?;

    let usage_records: Vec<Value> = turn.usage.clone().into_iter().collect();
    let usage = accumulate_raw(usage_records.iter());
    let usage_source = if turn.usage.is_some() { "provider" } else { "none" };
    let (cost, pricing_source) = match pricing::lookup(&resolved.provider_id, &resolved.model) {
        Some(row) => (pricing::estimate_cost(&usage, row), "table"),
        None => (RunCost::default(), "none"),
    };

    let output = match nonempty(transcript) {
        Some(transcript) => format!("{}\n\n{}", transcript.trim_end(), turn.message),
        None => turn.message.clone(),
    };

    workspace.release().await;

    let cost_for_run = cost.clone();
    state
        .storage
        .transition_run(run_id, RunStatus::Completed, |r| {
            r.output = Some(output);
            r.usage = usage;
            r.cost = cost_for_run;
            r.usage_source = Some(usage_source.to_string());
            r.pricing_source = Some(pricing_source.to_string());
        })
        .await?;
    state
        .events
        .append(run_id, event_type::STATUS, json!({"status": "completed"}))
        .await?;
    state
        .events
        .append(
            run_id,
            event_type::DONE,
            json!({"status": "completed", "usage": usage, "cost": cost}),
        )
        .await?;
    Ok(())
}

enum StepOutcome {
    Continue,
    Fail(String),
}

/// Executes one command through the policy gateway, forwarding output chunks
/// as `tool` events in arrival order. The forwarder is joined before the
/// `end` event is appended so output never lands after it.
async fn run_tool_command(
    state: &AppState,
    run_id: &str,
    gateway: &ExecutionGateway,
    command: &str,
    transcript: &mut String,
) -> anyhow::Result<StepOutcome> {
    state
        .events
        .append(
            run_id,
            event_type::TOOL,
            json!({"phase": "start", "command": command}),
        )
        .await?;

    let (tx, mut rx) = mpsc::unbounded_channel::<(OutputStream, String)>();
    let forwarder = {
        let events = state.events.clone();
        let run_id = run_id.to_string();
        let command = command.to_string();
        tokio::spawn(async move {
            while let Some((stream, chunk)) = rx.recv().await {
                let _ = events
                    .append(
                        &run_id,
                        event_type::TOOL,
                        json!({
                            "phase": "output",
                            "command": command,
                            "stream": stream,
                            "chunk": chunk,
                        }),
                    )
                    .await;
            }
        })
    };
    let sink: ChunkSink = Arc::new(move |stream, chunk: &str| {
        let _ = tx.send((stream, chunk.to_string()));
    });

    let opts = ExecOptions {
        cwd: None,
        env: HashMap::new(),
        timeout: Some(state.config.command_timeout),
    };
    let executed = gateway.execute(command, &opts, sink).await;
    let _ = forwarder.await;

    match executed {
        Err(violation) => {
            state
                .events
                .append(
                    run_id,
                    event_type::TOOL,
                    json!({
                        "phase": "denied",
                        "command": command,
                        "reason": violation.to_string(),
                    }),
                )
                .await?;
            Ok(StepOutcome::Fail(format!("command rejected: {violation}")))
        }
        Ok(result) => {
            transcript.push_str(&result.stdout);
            if !result.stderr.is_empty() {
                transcript.push_str(&result.stderr);
            }
            state
                .events
                .append(
                    run_id,
                    event_type::TOOL,
                    json!({
                        "phase": "end",
                        "command": command,
                        "ok": result.ok,
                        "exitCode": result.exit_code,
                        "error": result.error,
                    }),
                )
                .await?;
            if result.ok {
                Ok(StepOutcome::Continue)
            } else {
                Ok(StepOutcome::Fail(
                    result
                        .error
                        .unwrap_or_else(|| format!("command failed: {command}")),
                ))
            }
        }
    }
}

fn nonempty(text: String) -> Option<String> {
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

async fn finish_cancelled(
    state: &AppState,
    run_id: &str,
    output: Option<String>,
) -> anyhow::Result<()> {
    let transitioned = state
        .storage
        .transition_run(run_id, RunStatus::Cancelled, |r| {
            if output.is_some() {
                r.output = output;
            }
        })
        .await;
    match transitioned {
        Ok(_) => {
            state
                .events
                .append(run_id, event_type::STATUS, json!({"status": "cancelled"}))
                .await?;
            state
                .events
                .append(run_id, event_type::DONE, json!({"status": "cancelled"}))
                .await?;
            Ok(())
        }
        // The run reached a terminal state first; the cancel simply lost.
        Err(CoreError::IllegalTransition { .. }) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Marks a run as failed and closes its event stream. Safe to call from any
/// state; terminal runs are left untouched.
pub(crate) async fn fail_run(state: &AppState, run_id: &str, message: &str) {
    let Some(run) = state.storage.get_run(run_id).await else {
        return;
    };
    if run.status.is_terminal() {
        return;
    }
    let transitioned = state
        .storage
        .transition_run(run_id, RunStatus::Error, |r| {
            r.error = Some(message.to_string());
        })
        .await;
    match transitioned {
        Ok(_) => {
            let _ = state
                .events
                .append(
                    run_id,
                    event_type::STATUS,
                    json!({"status": "error", "error": message}),
                )
                .await;
            let _ = state
                .events
                .append(
                    run_id,
                    event_type::DONE,
                    json!({"status": "error", "error": message}),
                )
                .await;
        }
        Err(CoreError::IllegalTransition { .. }) => {}
        Err(err) => {
            tracing::error!(
                target: "atelier.obs",
                component = "server.runner",
                run_id = %run_id,
                "failed to record run error: {err}"
            );
        }
    }
}
