use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use serde_json::Value;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use atelier_types::{Project, Run, RunCost, RunStatus, RunUsage, WorkspaceBackendKind};

#[derive(Debug)]
pub enum CoreError {
    InvalidRequest(String),
    NotFound(String),
    IllegalTransition {
        run_id: String,
        from: RunStatus,
        to: RunStatus,
    },
    Io(anyhow::Error),
}

impl std::fmt::Display for CoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoreError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            CoreError::NotFound(what) => write!(f, "not found: {what}"),
            CoreError::IllegalTransition { run_id, from, to } => write!(
                f,
                "illegal transition for run {run_id}: {} -> {}",
                from.as_str(),
                to.as_str()
            ),
            CoreError::Io(err) => write!(f, "storage error: {err:#}"),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<anyhow::Error> for CoreError {
    fn from(err: anyhow::Error) -> Self {
        CoreError::Io(err)
    }
}

#[derive(Debug, Clone)]
pub struct CreateRunParams {
    pub project_id: String,
    pub idempotency_key: String,
    pub prompt: String,
    pub input: Value,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub workspace_backend: WorkspaceBackendKind,
    pub max_attempts: u32,
}

#[derive(Debug, Clone)]
pub enum CreateOutcome {
    /// A new run was created; background execution should be scheduled.
    Created(Run),
    /// The idempotency key already mapped to a run; no side effects occurred.
    Existing(Run),
}

impl CreateOutcome {
    pub fn run(&self) -> &Run {
        match self {
            CreateOutcome::Created(run) | CreateOutcome::Existing(run) => run,
        }
    }
}

/// Durable store for projects, runs and idempotency records: JSON files
/// behind in-memory maps, flushed on every mutation.
pub struct Storage {
    base: PathBuf,
    projects: RwLock<HashMap<String, Project>>,
    runs: RwLock<HashMap<String, Run>>,
    idempotency: RwLock<HashMap<String, String>>,
    /// Serializes run creation so the idempotency check, writable-run
    /// transfer and run-index allocation behave as one atomic step.
    create_lock: Mutex<()>,
}

fn idempotency_map_key(project_id: &str, key: &str) -> String {
    format!("{project_id}\u{1f}{key}")
}

impl Storage {
    pub async fn new(base: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base)
            .await
            .with_context(|| format!("create state dir {}", base.display()))?;
        let projects = load_map::<Project>(&base.join("projects.json")).await?;
        let runs = load_map::<Run>(&base.join("runs.json")).await?;
        let idempotency = load_map::<String>(&base.join("idempotency.json")).await?;
        Ok(Self {
            base,
            projects: RwLock::new(projects),
            runs: RwLock::new(runs),
            idempotency: RwLock::new(idempotency),
            create_lock: Mutex::new(()),
        })
    }

    pub async fn get_or_create_project(&self, id: &str) -> Result<Project, CoreError> {
        let id = id.trim();
        if id.is_empty() {
            return Err(CoreError::InvalidRequest("project id is empty".into()));
        }
        {
            let projects = self.projects.read().await;
            if let Some(project) = projects.get(id) {
                return Ok(project.clone());
            }
        }
        let mut projects = self.projects.write().await;
        let project = projects
            .entry(id.to_string())
            .or_insert_with(|| Project::new(id))
            .clone();
        drop(projects);
        self.flush_projects().await?;
        Ok(project)
    }

    pub async fn get_project(&self, id: &str) -> Option<Project> {
        self.projects.read().await.get(id).cloned()
    }

    pub async fn list_projects(&self) -> Vec<Project> {
        let mut projects: Vec<Project> = self.projects.read().await.values().cloned().collect();
        projects.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        projects
    }

    pub async fn get_run(&self, id: &str) -> Option<Run> {
        self.runs.read().await.get(id).cloned()
    }

    /// Runs of a project, newest first.
    pub async fn list_runs(&self, project_id: &str) -> Vec<Run> {
        let mut runs: Vec<Run> = self
            .runs
            .read()
            .await
            .values()
            .filter(|run| run.project_id == project_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.run_index.cmp(&a.run_index));
        runs
    }

    /// Runs not yet in a terminal state, across all projects.
    pub async fn non_terminal_runs(&self) -> Vec<Run> {
        self.runs
            .read()
            .await
            .values()
            .filter(|run| !run.status.is_terminal())
            .cloned()
            .collect()
    }

    /// The project's current writable run, if it has any runs.
    pub async fn writable_run(&self, project_id: &str) -> Option<Run> {
        let run_id = self
            .projects
            .read()
            .await
            .get(project_id)?
            .writable_run_id()?
            .to_string();
        self.get_run(&run_id).await
    }

    /// Idempotent run creation. Under the creation lock: resolve the key,
    /// demote the current writable run, allocate the next run index, record
    /// the idempotency mapping and persist, all before anyone else can
    /// observe intermediate state.
    pub async fn create_run(&self, params: CreateRunParams) -> Result<CreateOutcome, CoreError> {
        if params.idempotency_key.trim().is_empty() {
            return Err(CoreError::InvalidRequest("idempotency key is required".into()));
        }
        if params.prompt.trim().is_empty() {
            return Err(CoreError::InvalidRequest("prompt is required".into()));
        }

        let _guard = self.create_lock.lock().await;

        let map_key = idempotency_map_key(&params.project_id, &params.idempotency_key);
        if let Some(existing_id) = self.idempotency.read().await.get(&map_key).cloned() {
            let run = self
                .get_run(&existing_id)
                .await
                .ok_or_else(|| CoreError::NotFound(format!("run {existing_id}")))?;
            return Ok(CreateOutcome::Existing(run));
        }

        self.get_or_create_project(&params.project_id).await?;

        let now = Utc::now();
        let run_id = Uuid::new_v4().to_string();
        let (run_index, parent_run_id) = {
            let mut projects = self.projects.write().await;
            let project = projects
                .get_mut(&params.project_id)
                .ok_or_else(|| CoreError::NotFound(format!("project {}", params.project_id)))?;
            let parent = project.writable_run_id().map(str::to_string);
            project.run_index += 1;
            project.run_ids.push(run_id.clone());
            (project.run_index, parent)
        };

        {
            let mut runs = self.runs.write().await;
            if let Some(parent_id) = &parent_run_id {
                if let Some(parent) = runs.get_mut(parent_id) {
                    parent.writable = false;
                    parent.updated_at = now;
                }
            }
            runs.insert(
                run_id.clone(),
                Run {
                    id: run_id.clone(),
                    project_id: params.project_id.clone(),
                    run_index,
                    parent_run_id,
                    writable: true,
                    status: RunStatus::Queued,
                    created_at: now,
                    started_at: None,
                    completed_at: None,
                    updated_at: now,
                    prompt: params.prompt,
                    input: params.input,
                    output: None,
                    error: None,
                    usage: RunUsage::default(),
                    cost: RunCost::default(),
                    provider: params.provider,
                    model: params.model,
                    model_source: None,
                    usage_source: None,
                    pricing_source: None,
                    attempt: 1,
                    max_attempts: params.max_attempts,
                    sandbox_id: None,
                    idempotency_key: params.idempotency_key.clone(),
                    workspace_backend: params.workspace_backend,
                },
            );
        }

        self.idempotency.write().await.insert(map_key, run_id.clone());
        self.flush_all().await?;

        let run = self
            .get_run(&run_id)
            .await
            .ok_or_else(|| CoreError::NotFound(format!("run {run_id}")))?;
        Ok(CreateOutcome::Created(run))
    }

    /// Applies a mutation to a run and persists it. `updated_at` is bumped.
    pub async fn mutate_run<F>(&self, run_id: &str, mutate: F) -> Result<Run, CoreError>
    where
        F: FnOnce(&mut Run),
    {
        let updated = {
            let mut runs = self.runs.write().await;
            let run = runs
                .get_mut(run_id)
                .ok_or_else(|| CoreError::NotFound(format!("run {run_id}")))?;
            mutate(run);
            run.updated_at = Utc::now();
            run.clone()
        };
        self.flush_runs().await?;
        Ok(updated)
    }

    /// Status transition guarded by the run state machine.
    pub async fn transition_run<F>(
        &self,
        run_id: &str,
        next: RunStatus,
        mutate: F,
    ) -> Result<Run, CoreError>
    where
        F: FnOnce(&mut Run),
    {
        let updated = {
            let mut runs = self.runs.write().await;
            let run = runs
                .get_mut(run_id)
                .ok_or_else(|| CoreError::NotFound(format!("run {run_id}")))?;
            if !run.status.can_transition(next) {
                return Err(CoreError::IllegalTransition {
                    run_id: run_id.to_string(),
                    from: run.status,
                    to: next,
                });
            }
            run.status = next;
            let now = Utc::now();
            match next {
                RunStatus::Running => run.started_at = Some(now),
                status if status.is_terminal() => run.completed_at = Some(now),
                _ => {}
            }
            mutate(run);
            run.updated_at = now;
            run.clone()
        };
        self.flush_runs().await?;
        Ok(updated)
    }

    async fn flush_projects(&self) -> Result<(), CoreError> {
        let payload = {
            let projects = self.projects.read().await;
            serde_json::to_string_pretty(&*projects).context("serialize projects")?
        };
        fs::write(self.base.join("projects.json"), payload)
            .await
            .context("write projects.json")?;
        Ok(())
    }

    async fn flush_runs(&self) -> Result<(), CoreError> {
        let payload = {
            let runs = self.runs.read().await;
            serde_json::to_string_pretty(&*runs).context("serialize runs")?
        };
        fs::write(self.base.join("runs.json"), payload)
            .await
            .context("write runs.json")?;
        Ok(())
    }

    async fn flush_idempotency(&self) -> Result<(), CoreError> {
        let payload = {
            let idempotency = self.idempotency.read().await;
            serde_json::to_string_pretty(&*idempotency).context("serialize idempotency")?
        };
        fs::write(self.base.join("idempotency.json"), payload)
            .await
            .context("write idempotency.json")?;
        Ok(())
    }

    async fn flush_all(&self) -> Result<(), CoreError> {
        self.flush_projects().await?;
        self.flush_runs().await?;
        self.flush_idempotency().await
    }
}

async fn load_map<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> anyhow::Result<HashMap<String, T>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let raw = fs::read_to_string(path)
        .await
        .with_context(|| format!("read {}", path.display()))?;
    Ok(serde_json::from_str(&raw).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn params(project: &str, key: &str, prompt: &str) -> CreateRunParams {
        CreateRunParams {
            project_id: project.to_string(),
            idempotency_key: key.to_string(),
            prompt: prompt.to_string(),
            input: json!({}),
            provider: None,
            model: None,
            workspace_backend: WorkspaceBackendKind::Host,
            max_attempts: 1,
        }
    }

    #[tokio::test]
    async fn rejects_missing_key_and_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path()).await.unwrap();
        assert!(matches!(
            storage.create_run(params("p", "", "build an app")).await,
            Err(CoreError::InvalidRequest(_))
        ));
        assert!(matches!(
            storage.create_run(params("p", "k-1", "  ")).await,
            Err(CoreError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_key_returns_same_run_without_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path()).await.unwrap();
        let first = storage
            .create_run(params("p", "k-1", "build an app"))
            .await
            .unwrap();
        let second = storage
            .create_run(params("p", "k-1", "a different body"))
            .await
            .unwrap();
        assert!(matches!(first, CreateOutcome::Created(_)));
        match second {
            CreateOutcome::Existing(run) => {
                assert_eq!(run.id, first.run().id);
                assert_eq!(run.prompt, "build an app");
            }
            CreateOutcome::Created(_) => panic!("duplicate key must not create a run"),
        }
        assert_eq!(storage.list_runs("p").await.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_duplicates_create_exactly_one_run() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::new(dir.path()).await.unwrap());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let storage = storage.clone();
            handles.push(tokio::spawn(async move {
                storage.create_run(params("p", "same-key", "build")).await
            }));
        }
        let mut created = 0;
        let mut ids = std::collections::HashSet::new();
        for handle in handles {
            let outcome = handle.await.unwrap().unwrap();
            if matches!(outcome, CreateOutcome::Created(_)) {
                created += 1;
            }
            ids.insert(outcome.run().id.clone());
        }
        assert_eq!(created, 1);
        assert_eq!(ids.len(), 1);
        assert_eq!(storage.list_runs("p").await.len(), 1);
    }

    #[tokio::test]
    async fn single_writable_run_after_sequential_creations() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path()).await.unwrap();
        for i in 0..5 {
            storage
                .create_run(params("p", &format!("k-{i}"), "next iteration"))
                .await
                .unwrap();
        }
        let runs = storage.list_runs("p").await;
        assert_eq!(runs.len(), 5);
        let writable: Vec<&Run> = runs.iter().filter(|r| r.writable).collect();
        assert_eq!(writable.len(), 1);
        assert_eq!(writable[0].run_index, 5);
        let max_index = runs.iter().map(|r| r.run_index).max().unwrap();
        assert_eq!(writable[0].run_index, max_index);
        // Parent chain follows creation order.
        let newest = writable[0];
        let parent = storage
            .get_run(newest.parent_run_id.as_deref().unwrap())
            .await
            .unwrap();
        assert_eq!(parent.run_index, 4);
    }

    #[tokio::test]
    async fn transition_guard_rejects_illegal_moves() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path()).await.unwrap();
        let run = match storage.create_run(params("p", "k", "go")).await.unwrap() {
            CreateOutcome::Created(run) => run,
            CreateOutcome::Existing(_) => unreachable!(),
        };
        assert!(matches!(
            storage
                .transition_run(&run.id, RunStatus::Completed, |_| {})
                .await,
            Err(CoreError::IllegalTransition { .. })
        ));
        let running = storage
            .transition_run(&run.id, RunStatus::Running, |_| {})
            .await
            .unwrap();
        assert!(running.started_at.is_some());
        let done = storage
            .transition_run(&run.id, RunStatus::Completed, |r| {
                r.output = Some("ok".into())
            })
            .await
            .unwrap();
        assert!(done.completed_at.is_some());
        assert!(matches!(
            storage
                .transition_run(&run.id, RunStatus::Cancelled, |_| {})
                .await,
            Err(CoreError::IllegalTransition { .. })
        ));
    }

    #[tokio::test]
    async fn state_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = Storage::new(dir.path()).await.unwrap();
            storage.create_run(params("p", "k", "persist me")).await.unwrap();
        }
        let reloaded = Storage::new(dir.path()).await.unwrap();
        let runs = reloaded.list_runs("p").await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].prompt, "persist me");
        // Idempotency mapping survives too.
        let again = reloaded.create_run(params("p", "k", "other")).await.unwrap();
        assert!(matches!(again, CreateOutcome::Existing(_)));
    }
}
