//! Workspace download as a zip archive. Host workspaces are walked and
//! zipped on a blocking thread; active remote-sandbox runs stream the
//! archive straight from the sandbox service.

use std::io::{Cursor, Write};
use std::path::Path;

use axum::extract::{Path as UrlPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use ignore::WalkBuilder;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use atelier_sandbox::RemoteSandbox;
use atelier_types::WorkspaceBackendKind;

use crate::http::{fetch_run, ApiError};
use crate::AppState;

/// Directories never shipped to the client.
const EXCLUDED_DIRS: &[&str] = &["node_modules", ".git", "dist", ".next", "target"];

fn is_secret_file(name: &str) -> bool {
    name.starts_with(".env") || name.ends_with(".pem") || name.ends_with(".key")
}

pub(crate) async fn download_workspace(
    State(state): State<AppState>,
    UrlPath((project_id, run_id)): UrlPath<(String, String)>,
) -> Result<Response, ApiError> {
    let run = fetch_run(&state, &project_id, &run_id).await?;

    // An in-flight remote run's files only exist inside the sandbox.
    if run.workspace_backend == WorkspaceBackendKind::RemoteSandbox && !run.status.is_terminal() {
        let config = state.config.sandbox.as_ref().ok_or_else(|| {
            ApiError::new(
                StatusCode::CONFLICT,
                "no sandbox service configured",
                "SANDBOX_UNAVAILABLE",
            )
        })?;
        let sandbox_id = run
            .sandbox_id
            .clone()
            .ok_or_else(|| ApiError::not_found(format!("sandbox for run {run_id}")))?;
        let sandbox = RemoteSandbox::attach(config, sandbox_id).map_err(|err| {
            ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("sandbox client failed: {err:#}"),
                "SANDBOX_ERROR",
            )
        })?;
        let bytes = sandbox.download_archive().await.map_err(|err| {
            ApiError::new(
                StatusCode::BAD_GATEWAY,
                format!("sandbox archive failed: {err:#}"),
                "SANDBOX_ERROR",
            )
        })?;
        return Ok(zip_response(bytes, &run_id));
    }

    let root = state.config.workspaces_dir.join(&project_id);
    if !root.is_dir() {
        return Err(ApiError::not_found(format!(
            "workspace for project {project_id}"
        )));
    }
    let bytes = tokio::task::spawn_blocking(move || build_zip(&root))
        .await
        .map_err(|err| {
            ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("archive task failed: {err}"),
                "ARCHIVE_ERROR",
            )
        })?
        .map_err(|err| {
            ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("archive failed: {err:#}"),
                "ARCHIVE_ERROR",
            )
        })?;
    Ok(zip_response(bytes, &run_id))
}

fn zip_response(bytes: Vec<u8>, run_id: &str) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"workspace-{run_id}.zip\""),
            ),
        ],
        bytes,
    )
        .into_response()
}

fn build_zip(root: &Path) -> anyhow::Result<Vec<u8>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    let walk = WalkBuilder::new(root)
        .standard_filters(false)
        .filter_entry(|entry| {
            entry
                .file_name()
                .to_str()
                .map_or(true, |name| !EXCLUDED_DIRS.contains(&name))
        })
        .build();
    for entry in walk {
        let entry = entry?;
        if entry.depth() == 0 || !entry.file_type().map_or(false, |t| t.is_file()) {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if is_secret_file(&name) {
            continue;
        }
        let relative = entry.path().strip_prefix(root)?;
        writer.start_file(relative.to_string_lossy(), options)?;
        writer.write_all(&std::fs::read(entry.path())?)?;
    }
    Ok(writer.finish()?.into_inner())
}
