use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_PREFIX: &str = "atelier-engine";

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub logs_dir: String,
    pub prefix: String,
    pub initialized_at: DateTime<Utc>,
}

/// Initializes process-wide logging: env-filtered stdout plus a daily-rolling
/// file in `logs_dir`. The returned guard must stay alive for the lifetime of
/// the process or buffered lines are lost.
pub fn init_logging(logs_dir: &Path) -> anyhow::Result<(WorkerGuard, LoggingInitInfo)> {
    fs::create_dir_all(logs_dir)?;
    let appender = tracing_appender::rolling::daily(logs_dir, format!("{LOG_FILE_PREFIX}.log"));
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_env("ATELIER_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .try_init()
        .map_err(|err| anyhow::anyhow!("logging already initialized: {err}"))?;

    Ok((
        guard,
        LoggingInitInfo {
            logs_dir: logs_dir.to_string_lossy().to_string(),
            prefix: LOG_FILE_PREFIX.to_string(),
            initialized_at: Utc::now(),
        },
    ))
}

#[derive(Debug, Clone, Serialize)]
pub struct RunObsEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub project_id: Option<&'a str>,
    pub run_id: Option<&'a str>,
    pub status: Option<&'a str>,
    pub detail: Option<&'a str>,
}

pub fn emit_event(level: Level, event: RunObsEvent<'_>) {
    match level {
        Level::ERROR => tracing::error!(
            target: "atelier.obs",
            component = event.component,
            event = event.event,
            project_id = event.project_id.unwrap_or(""),
            run_id = event.run_id.unwrap_or(""),
            status = event.status.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "run_event"
        ),
        Level::WARN => tracing::warn!(
            target: "atelier.obs",
            component = event.component,
            event = event.event,
            project_id = event.project_id.unwrap_or(""),
            run_id = event.run_id.unwrap_or(""),
            status = event.status.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "run_event"
        ),
        _ => tracing::info!(
            target: "atelier.obs",
            component = event.component,
            event = event.event,
            project_id = event.project_id.unwrap_or(""),
            run_id = event.run_id.unwrap_or(""),
            status = event.status.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "run_event"
        ),
    }
}

/// Replaces secret-bearing text with a length marker so prompts and keys
/// never land in logs verbatim.
pub fn redact_text(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    format!("[redacted len={}]", trimmed.len())
}
