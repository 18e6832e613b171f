use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio::time::interval;

use crate::error::{OrchestratorError, Result};
use crate::models::{ClientRecipe, ClientRun, OrchestratorConfig, RunStatus, ServiceStatus};
use crate::services::apptainer::ContainerRuntime;
use crate::services::registry::{RunRegistry, ServiceRegistry};
use crate::services::slurm::{JobRequest, JobScheduler, JobState};
use crate::services::state::StateStore;

/// Drives benchmark runs: Pending -> Scheduling -> Running ->
/// {Completed | Failed | Cancelled}. A run may target a service; the
/// target is verified once, before submission, and referenced by id only
/// afterwards — the run outlives the service it tested.
pub struct ClientManager {
    registry: Arc<RunRegistry>,
    services: Arc<ServiceRegistry>,
    scheduler: Arc<dyn JobScheduler>,
    runtime: Arc<dyn ContainerRuntime>,
    state_store: Option<Arc<StateStore>>,
    work_dir: PathBuf,
    poll_interval: Duration,
    unknown_grace_polls: u32,
    poll_tasks: Arc<RwLock<HashMap<String, tokio::task::JoinHandle<()>>>>,
}

impl ClientManager {
    pub fn new(
        registry: Arc<RunRegistry>,
        services: Arc<ServiceRegistry>,
        scheduler: Arc<dyn JobScheduler>,
        runtime: Arc<dyn ContainerRuntime>,
        state_store: Option<Arc<StateStore>>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            services,
            scheduler,
            runtime,
            state_store,
            work_dir: config.work_dir.clone(),
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            unknown_grace_polls: config.unknown_grace_polls,
            poll_tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Shorten the poll tick, mainly for tests driving scripted adapters.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub async fn load_state(&self) -> Result<()> {
        let Some(store) = &self.state_store else {
            return Ok(());
        };
        for mut run in store.load_runs().await? {
            if !run.status.is_terminal() {
                run.status = RunStatus::Failed;
                run.error = Some("orchestrator restarted while run was live".into());
            }
            self.registry.insert(run).await?;
        }
        Ok(())
    }

    /// Launch a benchmark run. With a target, the service must exist and
    /// be Running *before* anything is submitted; its endpoints are handed
    /// to the client container through the environment.
    pub async fn run(
        &self,
        recipe: &ClientRecipe,
        target_service_id: Option<&str>,
    ) -> Result<ClientRun> {
        let mut target_env: Vec<(String, String)> = Vec::new();
        if let Some(target) = target_service_id {
            let service = self.services.get(target).await.map_err(|_| {
                OrchestratorError::TargetUnavailable(format!("service '{target}' not found"))
            })?;
            if service.status != ServiceStatus::Running {
                return Err(OrchestratorError::TargetUnavailable(format!(
                    "service '{target}' is {:?}, not running",
                    service.status
                )));
            }
            let mut endpoints: Vec<_> = service.endpoints.iter().collect();
            endpoints.sort();
            for (name, url) in &endpoints {
                target_env.push((
                    format!("UBENCH_TARGET_{}_URL", name.to_ascii_uppercase()),
                    (*url).clone(),
                ));
            }
            if let Some(url) = service
                .endpoints
                .get("api")
                .or_else(|| endpoints.first().map(|(_, url)| *url))
            {
                target_env.push(("UBENCH_TARGET_URL".into(), url.clone()));
            }
        }

        let run = ClientRun::new(
            recipe.name.clone(),
            target_service_id.map(str::to_string),
        );
        let id = run.id.clone();
        self.registry.insert(run).await?;
        self.persist().await;
        tracing::info!(run = id, recipe = %recipe.name, ?target_service_id, "starting run");

        let results_path = self.resolve_results_path(&recipe.results_path);

        let image_ref = match self.runtime.build(&recipe.container).await {
            Ok(image_ref) => image_ref,
            Err(e) => return Err(self.fail_submit(&id, e).await),
        };

        let mut container = recipe.container.clone();
        container.env.extend(target_env);
        container.env.insert(
            "UBENCH_RESULTS_PATH".into(),
            results_path.to_string_lossy().to_string(),
        );
        let command = self.runtime.launch_command(&container, &image_ref, &[]);
        let request = JobRequest {
            name: recipe.name.clone(),
            resources: recipe.resources.clone(),
            command,
        };

        let job_id = match self.scheduler.submit(&request).await {
            Ok(job_id) => job_id,
            Err(e) => return Err(self.fail_submit(&id, e).await),
        };

        let updated = self
            .transition(&id, RunStatus::Scheduling, |r| {
                r.job_id = Some(job_id.clone());
                r.results_path = Some(results_path.to_string_lossy().to_string());
            })
            .await?;

        self.spawn_poll_task(id).await;
        Ok(updated)
    }

    /// Explicit operator cancellation, distinct from failure. No-op on
    /// runs that already reached a terminal state.
    pub async fn cancel(&self, id: &str) -> Result<()> {
        let current = self.registry.get(id).await?;
        if current.status.is_terminal() {
            return Ok(());
        }
        if let Some(job_id) = &current.job_id {
            self.scheduler.cancel(job_id).await?;
        }
        self.transition(id, RunStatus::Cancelled, |r| {
            r.finished_at = Some(Utc::now());
        })
        .await?;
        Ok(())
    }

    /// Parsed results artifact of a completed run. An unknown id and a run
    /// that has not completed fail with distinct errors.
    pub async fn get_results(&self, id: &str) -> Result<serde_json::Value> {
        let run = self.registry.get(id).await?;
        if run.status != RunStatus::Completed {
            return Err(OrchestratorError::RunNotCompleted(format!(
                "run '{id}' is {:?}",
                run.status
            )));
        }
        let path = run.results_path.ok_or_else(|| {
            OrchestratorError::RunNotCompleted(format!("run '{id}' recorded no results path"))
        })?;
        let contents = tokio::fs::read_to_string(&path).await?;
        let results = serde_json::from_str(&contents)?;
        Ok(results)
    }

    pub async fn get_status(&self, id: &str) -> Result<ClientRun> {
        self.registry.get(id).await
    }

    pub async fn list(&self, status: Option<RunStatus>) -> Vec<ClientRun> {
        self.registry
            .list(|r| status.is_none() || status == Some(r.status))
            .await
    }

    pub async fn shutdown(&self) {
        let mut tasks = self.poll_tasks.write().await;
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
    }

    fn resolve_results_path(&self, results_path: &str) -> PathBuf {
        let path = PathBuf::from(results_path);
        if path.is_absolute() {
            path
        } else {
            self.work_dir.join(path)
        }
    }

    async fn fail_submit(&self, id: &str, e: OrchestratorError) -> OrchestratorError {
        let message = e.to_string();
        tracing::warn!(run = id, "{message}");
        let _ = self
            .transition(id, RunStatus::Failed, |r| {
                r.error = Some(message);
                r.finished_at = Some(Utc::now());
            })
            .await;
        e
    }

    async fn transition<F: FnOnce(&mut ClientRun)>(
        &self,
        id: &str,
        next: RunStatus,
        mutate: F,
    ) -> Result<ClientRun> {
        let updated = self
            .registry
            .update(id, |r| {
                if r.status.can_transition_to(next) {
                    tracing::debug!(run = id, from = ?r.status, to = ?next, "transition");
                    r.status = next;
                    mutate(r);
                } else if r.status != next {
                    tracing::warn!(run = id, from = ?r.status, to = ?next, "refusing illegal transition");
                }
            })
            .await?;
        self.persist().await;
        Ok(updated)
    }

    async fn persist(&self) {
        if let Some(store) = &self.state_store {
            let runs = self.registry.list_all().await;
            if let Err(e) = store.save_runs(&runs).await {
                tracing::warn!("failed to persist runs: {e}");
            }
        }
    }

    async fn spawn_poll_task(&self, id: String) {
        let registry = Arc::clone(&self.registry);
        let scheduler = Arc::clone(&self.scheduler);
        let state_store = self.state_store.clone();
        let poll_tasks = Arc::clone(&self.poll_tasks);
        let poll_interval = self.poll_interval;
        let unknown_grace_polls = self.unknown_grace_polls;

        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            poll_run(
                registry,
                scheduler,
                state_store,
                task_id.clone(),
                poll_interval,
                unknown_grace_polls,
            )
            .await;
            poll_tasks.write().await.remove(&task_id);
        });
        self.poll_tasks.write().await.insert(id, handle);
    }
}

/// Per-run reconciliation loop. Cancellation shows up as a terminal
/// registry status and is observed before any scheduler work each tick.
async fn poll_run(
    registry: Arc<RunRegistry>,
    scheduler: Arc<dyn JobScheduler>,
    state_store: Option<Arc<StateStore>>,
    id: String,
    poll_interval: Duration,
    unknown_grace_polls: u32,
) {
    let mut tick = interval(poll_interval);
    tick.tick().await;

    let mut unknown_polls: u32 = 0;

    loop {
        tick.tick().await;

        let Ok(current) = registry.get(&id).await else {
            return;
        };
        if current.status.is_terminal() {
            break;
        }
        let Some(job_id) = current.job_id.clone() else {
            break;
        };

        let job_state = match scheduler.poll(&job_id).await {
            Ok(job_state) => job_state,
            Err(e) => {
                let _ = scheduler.cancel(&job_id).await;
                fail(&registry, &state_store, &id, format!("scheduler poll failed: {e}")).await;
                break;
            }
        };

        if job_state != JobState::Unknown {
            unknown_polls = 0;
        }

        match job_state {
            JobState::Pending => {}
            JobState::Running => {
                apply(&registry, &state_store, &id, RunStatus::Running, |_| {}).await;
            }
            JobState::Completed => {
                // A short job can finish between polls; pass through
                // Running so the recorded path stays legal.
                if current.status == RunStatus::Scheduling {
                    apply(&registry, &state_store, &id, RunStatus::Running, |_| {}).await;
                }
                let artifact_exists = current
                    .results_path
                    .as_ref()
                    .map(|p| std::path::Path::new(p).exists())
                    .unwrap_or(false);
                if artifact_exists {
                    apply(&registry, &state_store, &id, RunStatus::Completed, |r| {
                        r.finished_at = Some(Utc::now());
                    })
                    .await;
                    tracing::info!(run = id, "run completed");
                } else {
                    fail(
                        &registry,
                        &state_store,
                        &id,
                        "job succeeded but results artifact is missing".to_string(),
                    )
                    .await;
                }
                break;
            }
            JobState::Failed => {
                fail(&registry, &state_store, &id, format!("job {job_id} failed")).await;
                break;
            }
            JobState::Cancelled => {
                apply(&registry, &state_store, &id, RunStatus::Cancelled, |r| {
                    r.finished_at = Some(Utc::now());
                })
                .await;
                break;
            }
            JobState::Unknown => {
                unknown_polls += 1;
                if unknown_polls > unknown_grace_polls {
                    fail(
                        &registry,
                        &state_store,
                        &id,
                        format!("job {job_id} disappeared from the scheduler"),
                    )
                    .await;
                    break;
                }
            }
        }
    }
}

async fn apply<F: FnOnce(&mut ClientRun)>(
    registry: &RunRegistry,
    state_store: &Option<Arc<StateStore>>,
    id: &str,
    next: RunStatus,
    mutate: F,
) {
    let result = registry
        .update(id, |r| {
            if r.status.can_transition_to(next) {
                r.status = next;
                mutate(r);
            }
        })
        .await;
    if result.is_ok() {
        if let Some(store) = state_store {
            let runs = registry.list_all().await;
            if let Err(e) = store.save_runs(&runs).await {
                tracing::warn!("failed to persist runs: {e}");
            }
        }
    }
}

async fn fail(
    registry: &RunRegistry,
    state_store: &Option<Arc<StateStore>>,
    id: &str,
    message: String,
) {
    tracing::warn!(run = id, "{message}");
    apply(registry, state_store, id, RunStatus::Failed, |r| {
        r.error = Some(message);
        r.finished_at = Some(Utc::now());
    })
    .await;
}
