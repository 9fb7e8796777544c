use std::convert::Infallible;

use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;

use atelier_core::CoreError;
use atelier_core::CreateRunParams;
use atelier_policy::COMMAND_ALLOW_LIST;
use atelier_types::event_type;
use atelier_types::{
    CreateMessageRequest, CreateProjectRequest, CreateRunRequest, ErrorEnvelope, EventRecord, Run,
};

use crate::{download, runner, AppState};

const RUN_ID_HEADER: &str = "x-atelier-run-id";
const API_KEY_HEADER: &str = "x-atelier-key";

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/capabilities", get(capabilities))
        .route("/v1/projects", post(create_project).get(list_projects))
        .route("/v1/projects/{project_id}", get(get_project))
        .route(
            "/v1/projects/{project_id}/runs",
            post(create_run).get(list_runs),
        )
        .route("/v1/projects/{project_id}/messages", post(create_message))
        .route("/v1/projects/{project_id}/runs/{run_id}", get(get_run))
        .route(
            "/v1/projects/{project_id}/runs/{run_id}/messages",
            get(list_messages),
        )
        .route(
            "/v1/projects/{project_id}/runs/{run_id}/stream",
            get(stream_run),
        )
        .route(
            "/v1/projects/{project_id}/runs/{run_id}/cancel",
            post(cancel_run),
        )
        .route(
            "/v1/projects/{project_id}/runs/{run_id}/download.zip",
            get(download::download_workspace),
        )
        .layer(middleware::from_fn_with_state(state.clone(), auth_gate))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Rejects unauthenticated requests to `/v1` routes. The key travels either
/// in `x-atelier-key` or as a bearer token; with no key configured the
/// gate is open (local development).
async fn auth_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return next.run(request).await;
    }
    if !request.uri().path().starts_with("/v1/") {
        return next.run(request).await;
    }
    let Some(expected) = state.config.api_key.as_deref() else {
        return next.run(request).await;
    };
    if request_token(request.headers()).as_deref() == Some(expected) {
        return next.run(request).await;
    }
    ApiError::new(
        StatusCode::UNAUTHORIZED,
        "missing or invalid API key",
        "AUTH_REQUIRED",
    )
    .into_response()
}

fn request_token(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        let value = value.trim();
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) struct ApiError {
    status: StatusCode,
    message: String,
    code: &'static str,
}

impl ApiError {
    pub(crate) fn new(status: StatusCode, message: impl Into<String>, code: &'static str) -> Self {
        Self {
            status,
            message: message.into(),
            code,
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message, "INVALID_REQUEST")
    }

    pub(crate) fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message, "NOT_FOUND")
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidRequest(msg) => ApiError::invalid(msg),
            CoreError::NotFound(what) => ApiError::not_found(what),
            CoreError::IllegalTransition { .. } => {
                ApiError::new(StatusCode::CONFLICT, err.to_string(), "ILLEGAL_TRANSITION")
            }
            CoreError::Io(_) => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                err.to_string(),
                "STORAGE_ERROR",
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorEnvelope::new(self.message, self.code)),
        )
            .into_response()
    }
}

async fn root() -> Json<serde_json::Value> {
    Json(json!({
        "name": "atelier-engine",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn capabilities(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "providers": state.providers.provider_ids(),
        "workspaceBackends": ["host", "remote-sandbox"],
        "commandAllowList": COMMAND_ALLOW_LIST,
    }))
}

async fn create_project(
    State(state): State<AppState>,
    Json(request): Json<CreateProjectRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let project = state.storage.get_or_create_project(&request.key).await?;
    Ok(Json(json!({"project": project})))
}

async fn list_projects(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({"projects": state.storage.list_projects().await}))
}

async fn get_project(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let project = state
        .storage
        .get_project(&project_id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("project {project_id}")))?;
    Ok(Json(json!({"project": project})))
}

#[derive(Debug, Default, Deserialize)]
struct ListRunsQuery {
    limit: Option<usize>,
}

/// Runs of a project, newest first.
async fn list_runs(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .storage
        .get_project(&project_id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("project {project_id}")))?;
    let mut runs = state.storage.list_runs(&project_id).await;
    if let Some(limit) = query.limit {
        runs.truncate(limit);
    }
    Ok(Json(json!({"runs": runs})))
}

fn idempotency_key(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::invalid("Idempotency-Key header is required"))
}

fn run_response(run: &Run, created: bool) -> Response {
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    (
        status,
        [(RUN_ID_HEADER, run.id.clone())],
        Json(json!({"run": run, "created": created})),
    )
        .into_response()
}

async fn create_run(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<CreateRunRequest>,
) -> Result<Response, ApiError> {
    let key = idempotency_key(&headers)?;
    let params = CreateRunParams {
        project_id,
        idempotency_key: key,
        prompt: request.prompt,
        input: request.input.unwrap_or_else(|| json!({})),
        provider: request.provider,
        model: request.model,
        workspace_backend: request
            .workspace_backend
            .unwrap_or(state.config.default_backend),
        max_attempts: 1,
    };
    schedule_outcome(&state, state.storage.create_run(params).await?).await
}

/// Follow-up message on a project: creates the next run, seeded with the
/// conversation so far. The new run becomes the writable one.
async fn create_message(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<CreateMessageRequest>,
) -> Result<Response, ApiError> {
    let key = idempotency_key(&headers)?;
    let (prompt, backend) = match state.storage.writable_run(&project_id).await {
        Some(previous) => (
            followup_prompt(&previous, &request.content),
            previous.workspace_backend,
        ),
        None => (request.content.clone(), state.config.default_backend),
    };
    let params = CreateRunParams {
        project_id,
        idempotency_key: key,
        prompt,
        input: request.input.unwrap_or_else(|| json!({})),
        provider: None,
        model: None,
        workspace_backend: backend,
        max_attempts: 1,
    };
    schedule_outcome(&state, state.storage.create_run(params).await?).await
}

async fn schedule_outcome(
    state: &AppState,
    outcome: atelier_core::CreateOutcome,
) -> Result<Response, ApiError> {
    match outcome {
        atelier_core::CreateOutcome::Created(run) => {
            runner::spawn_run_task(state.clone(), run.clone()).await;
            Ok(run_response(&run, true))
        }
        atelier_core::CreateOutcome::Existing(run) => Ok(run_response(&run, false)),
    }
}

fn followup_prompt(previous: &Run, content: &str) -> String {
    let mut prompt = String::new();
    prompt.push_str("Previous request:\n");
    prompt.push_str(&previous.prompt);
    if let Some(output) = previous.output.as_deref() {
        prompt.push_str("\n\nPrevious result:\n");
        prompt.push_str(output);
    }
    prompt.push_str("\n\nFollow-up:\n");
    prompt.push_str(content);
    prompt
}

pub(crate) async fn fetch_run(
    state: &AppState,
    project_id: &str,
    run_id: &str,
) -> Result<Run, ApiError> {
    let run = state
        .storage
        .get_run(run_id)
        .await
        .filter(|run| run.project_id == project_id)
        .ok_or_else(|| ApiError::not_found(format!("run {run_id} in project {project_id}")))?;
    Ok(run)
}

async fn get_run(
    State(state): State<AppState>,
    Path((project_id, run_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let run = fetch_run(&state, &project_id, &run_id).await?;
    Ok(Json(json!({"run": run})))
}

/// Conversation view of a run: the user prompt followed by assistant
/// messages drawn from the event log.
async fn list_messages(
    State(state): State<AppState>,
    Path((project_id, run_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let run = fetch_run(&state, &project_id, &run_id).await?;
    let mut messages = vec![json!({
        "role": "user",
        "content": run.prompt,
        "timestamp": run.created_at,
    })];
    for event in state.events.events(&run_id).await {
        if event.event_type != event_type::MESSAGE {
            continue;
        }
        messages.push(json!({
            "role": event.payload.get("role").and_then(|r| r.as_str()).unwrap_or("assistant"),
            "content": event.payload.get("content").cloned().unwrap_or_default(),
            "timestamp": event.timestamp,
        }));
    }
    Ok(Json(json!({"messages": messages})))
}

/// Cancellation is cooperative and only applies to the writable run while it
/// is still in flight. Everything else is a no-op that echoes current state,
/// so retried cancels and cancels racing completion never error.
async fn cancel_run(
    State(state): State<AppState>,
    Path((project_id, run_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let run = fetch_run(&state, &project_id, &run_id).await?;
    let is_writable = state
        .storage
        .get_project(&project_id)
        .await
        .and_then(|p| p.writable_run_id().map(str::to_string))
        .as_deref()
        == Some(run.id.as_str());
    if !is_writable || run.status.is_terminal() {
        return Ok(Json(json!({"run": run, "cancelRequested": false})));
    }
    let requested = state.cancellations.cancel(&run_id).await;
    let run = state.storage.get_run(&run_id).await.unwrap_or(run);
    Ok(Json(json!({"run": run, "cancelRequested": requested})))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamQuery {
    last_event_id: Option<u64>,
}

fn cursor_from(headers: &HeaderMap, query: &StreamQuery) -> u64 {
    headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .or(query.last_event_id)
        .unwrap_or(0)
}

fn sse_event(record: &EventRecord) -> Event {
    Event::default()
        .id(record.sequence_id.to_string())
        .event(record.event_type.clone())
        .data(serde_json::to_string(record).unwrap_or_else(|_| "{}".to_string()))
}

fn ping_event() -> Event {
    Event::default()
        .event(event_type::PING)
        .data(json!({"ts": chrono::Utc::now()}).to_string())
}

/// SSE stream for a run: replay everything after the client's cursor, then
/// follow live. Heartbeat pings are synthesized here and never persisted.
/// The stream closes itself once the `done` event has been delivered.
async fn stream_run(
    State(state): State<AppState>,
    Path((project_id, run_id)): Path<(String, String)>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let run = fetch_run(&state, &project_id, &run_id).await?;
    let mut cursor = cursor_from(&headers, &query);
    let events = state.events.clone();
    let heartbeat = state.config.heartbeat_interval;
    let run_terminal = run.status.is_terminal();

    let stream = async_stream::stream! {
        let mut sub = events.subscribe(&run_id, cursor).await;
        let backlog = std::mem::take(&mut sub.backlog);
        let mut finished = false;
        for record in backlog {
            if record.sequence_id <= cursor {
                continue;
            }
            cursor = record.sequence_id;
            let done = record.event_type == event_type::DONE;
            yield Ok(sse_event(&record));
            if done {
                finished = true;
                break;
            }
        }
        // A terminal run whose log the client has already drained gets no
        // live tail; close instead of pinging forever.
        if !finished && run_terminal && events.event_count(&run_id).await <= cursor {
            finished = true;
        }

        if !finished {
            let mut ticker = tokio::time::interval(heartbeat);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // the first tick fires immediately
            'live: loop {
                let step = tokio::select! {
                    _ = ticker.tick() => None,
                    received = sub.receiver.recv() => match received {
                        Ok(record) if record.sequence_id == cursor + 1 => Some(vec![record]),
                        Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                            // Fell behind the channel; re-sync from the log.
                            let mut fresh = events.subscribe(&run_id, cursor).await;
                            let backlog = std::mem::take(&mut fresh.backlog);
                            sub = fresh;
                            Some(backlog)
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break 'live,
                    },
                };
                match step {
                    None => yield Ok(ping_event()),
                    Some(records) => {
                        for record in records {
                            if record.sequence_id <= cursor {
                                continue;
                            }
                            cursor = record.sequence_id;
                            let done = record.event_type == event_type::DONE;
                            yield Ok(sse_event(&record));
                            if done {
                                break 'live;
                            }
                        }
                        ticker.reset();
                    }
                }
            }
        }
    };

    Ok(Sse::new(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_providers::{ProviderRegistry, ScriptedProvider};
    use atelier_types::RunStatus;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    use crate::ServerConfig;

    async fn test_state(dir: &std::path::Path) -> AppState {
        let mut registry = ProviderRegistry::new("scripted", "scripted-1");
        registry.register("scripted", Arc::new(ScriptedProvider));
        let mut config = ServerConfig::new(dir);
        config.heartbeat_interval = Duration::from_millis(200);
        AppState::new(config, registry).await.unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> HttpRequest<Body> {
        HttpRequest::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn post_run(uri: &str, key: &str, body: serde_json::Value) -> HttpRequest<Body> {
        HttpRequest::post(uri)
            .header("content-type", "application/json")
            .header("idempotency-key", key)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn wait_terminal(state: &AppState, run_id: &str) -> atelier_types::Run {
        for _ in 0..200 {
            if let Some(run) = state.storage.get_run(run_id).await {
                if run.status.is_terminal() {
                    return run;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("run {run_id} never reached a terminal state");
    }

    #[tokio::test]
    async fn health_and_capabilities_are_public() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = test_state(dir.path()).await;
        let mut config = (*state.config).clone();
        config.api_key = Some("secret".to_string());
        state.config = Arc::new(config);
        let app = router(state);

        let response = app
            .clone()
            .oneshot(HttpRequest::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(
                HttpRequest::get("/capabilities")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert!(body["commandAllowList"]
            .as_array()
            .unwrap()
            .iter()
            .any(|v| v == "bun"));

        // /v1 without a key is rejected.
        let response = app
            .oneshot(HttpRequest::get("/v1/projects").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn bearer_token_passes_the_gate() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = test_state(dir.path()).await;
        let mut config = (*state.config).clone();
        config.api_key = Some("secret".to_string());
        state.config = Arc::new(config);
        let app = router(state);

        let response = app
            .oneshot(
                HttpRequest::get("/v1/projects")
                    .header("authorization", "Bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn run_creation_requires_idempotency_key() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()).await);
        let response = app
            .oneshot(post_json(
                "/v1/projects/demo/runs",
                json!({"prompt": "build"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["code"], "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn duplicate_run_creation_returns_existing() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let app = router(state.clone());

        let response = app
            .clone()
            .oneshot(post_run(
                "/v1/projects/demo/runs",
                "key-1",
                json!({"prompt": "build a landing page"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let run_id = response
            .headers()
            .get(RUN_ID_HEADER)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();

        let response = app
            .oneshot(post_run(
                "/v1/projects/demo/runs",
                "key-1",
                json!({"prompt": "something else entirely"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["created"], false);
        assert_eq!(body["run"]["id"], run_id.as_str());
        wait_terminal(&state, &run_id).await;
    }

    #[tokio::test]
    async fn run_completes_and_stream_replays_to_done() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let app = router(state.clone());

        let response = app
            .clone()
            .oneshot(post_run(
                "/v1/projects/demo/runs",
                "key-1",
                json!({"prompt": "write hello world"}),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        let run_id = body["run"]["id"].as_str().unwrap().to_string();

        let run = wait_terminal(&state, &run_id).await;
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.usage.total_tokens > 0);

        // The finished stream replays everything and then closes.
        let response = app
            .oneshot(
                HttpRequest::get(format!("/v1/projects/demo/runs/{run_id}/stream"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("event: status"));
        assert!(text.contains("event: done"));
    }

    struct SilentProvider;

    #[async_trait::async_trait]
    impl atelier_providers::ModelProvider for SilentProvider {
        fn id(&self) -> &str {
            "silent"
        }

        async fn complete(
            &self,
            _request: atelier_providers::CompletionRequest,
        ) -> anyhow::Result<atelier_providers::ProviderTurn> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(atelier_providers::ProviderTurn {
                message: "too late".to_string(),
                usage: None,
            })
        }
    }

    #[tokio::test]
    async fn stream_pings_while_the_run_is_quiet() {
        use futures::StreamExt;

        let dir = tempfile::tempdir().unwrap();
        let mut registry = ProviderRegistry::new("silent", "silent-1");
        registry.register("silent", Arc::new(SilentProvider));
        let mut config = ServerConfig::new(dir.path());
        config.heartbeat_interval = Duration::from_millis(200);
        let state = AppState::new(config, registry).await.unwrap();
        let app = router(state.clone());

        let response = app
            .clone()
            .oneshot(post_run(
                "/v1/projects/demo/runs",
                "key-1",
                json!({"prompt": "sit quietly"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        let run_id = body["run"]["id"].as_str().unwrap().to_string();

        for _ in 0..200 {
            if let Some(run) = state.storage.get_run(&run_id).await {
                if run.status == RunStatus::Running {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let response = app
            .oneshot(
                HttpRequest::get(format!("/v1/projects/demo/runs/{run_id}/stream"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // The provider never answers, so after the backlog the only frames
        // are synthesized pings.
        let mut frames = response.into_body().into_data_stream();
        let mut text = String::new();
        let saw_ping = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(chunk) = frames.next().await {
                text.push_str(&String::from_utf8_lossy(&chunk.unwrap()));
                if text.contains("event: ping") {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        assert!(saw_ping, "no ping frame during provider silence: {text}");

        state.cancellations.cancel(&run_id).await;
        wait_terminal(&state, &run_id).await;
    }

    #[tokio::test]
    async fn cancel_after_completion_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let app = router(state.clone());

        let response = app
            .clone()
            .oneshot(post_run(
                "/v1/projects/demo/runs",
                "key-1",
                json!({"prompt": "quick job"}),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        let run_id = body["run"]["id"].as_str().unwrap().to_string();
        wait_terminal(&state, &run_id).await;
        let events_before = state.events.event_count(&run_id).await;

        let response = app
            .oneshot(post_json(
                &format!("/v1/projects/demo/runs/{run_id}/cancel"),
                json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["cancelRequested"], false);
        assert_eq!(body["run"]["status"], "completed");
        assert_eq!(state.events.event_count(&run_id).await, events_before);
    }

    #[tokio::test]
    async fn messages_endpoint_returns_prompt_and_assistant_turn() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let app = router(state.clone());

        let response = app
            .clone()
            .oneshot(post_run(
                "/v1/projects/demo/runs",
                "key-1",
                json!({"prompt": "make a counter"}),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        let run_id = body["run"]["id"].as_str().unwrap().to_string();
        wait_terminal(&state, &run_id).await;

        let response = app
            .oneshot(
                HttpRequest::get(format!("/v1/projects/demo/runs/{run_id}/messages"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[0]["content"], "make a counter");
        assert!(messages
            .iter()
            .any(|m| m["role"] == "assistant"));
    }

    #[tokio::test]
    async fn followup_message_creates_next_writable_run() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let app = router(state.clone());

        let response = app
            .clone()
            .oneshot(post_run(
                "/v1/projects/demo/runs",
                "key-1",
                json!({"prompt": "make a counter"}),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        let first_id = body["run"]["id"].as_str().unwrap().to_string();
        wait_terminal(&state, &first_id).await;

        let response = app
            .oneshot(post_run(
                "/v1/projects/demo/messages",
                "key-2",
                json!({"content": "now make it count down"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        let second_id = body["run"]["id"].as_str().unwrap().to_string();
        assert_ne!(second_id, first_id);
        assert!(body["run"]["prompt"]
            .as_str()
            .unwrap()
            .contains("now make it count down"));
        wait_terminal(&state, &second_id).await;

        let first = state.storage.get_run(&first_id).await.unwrap();
        let second = state.storage.get_run(&second_id).await.unwrap();
        assert!(!first.writable);
        assert!(second.writable);
        assert_eq!(second.parent_run_id.as_deref(), Some(first_id.as_str()));
    }
}
