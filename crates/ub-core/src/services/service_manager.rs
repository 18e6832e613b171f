use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio::time::interval;

use crate::error::{OrchestratorError, Result};
use crate::models::{OrchestratorConfig, ServerRecipe, ServiceInstance, ServiceStatus};
use crate::services::apptainer::{ContainerRuntime, PortBinding};
use crate::services::health::HealthProbe;
use crate::services::registry::ServiceRegistry;
use crate::services::slurm::{JobRequest, JobScheduler, JobState};
use crate::services::state::StateStore;

/// Drives the service state machine: Pending -> Scheduling -> Starting ->
/// Running -> {Stopping -> Stopped | Failed}. One poll task per service;
/// the registry is the only shared state and the manager its only writer.
pub struct ServiceManager {
    registry: Arc<ServiceRegistry>,
    scheduler: Arc<dyn JobScheduler>,
    runtime: Arc<dyn ContainerRuntime>,
    probe: Arc<dyn HealthProbe>,
    state_store: Option<Arc<StateStore>>,
    poll_interval: Duration,
    unknown_grace_polls: u32,
    poll_tasks: Arc<RwLock<HashMap<String, tokio::task::JoinHandle<()>>>>,
}

impl ServiceManager {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        scheduler: Arc<dyn JobScheduler>,
        runtime: Arc<dyn ContainerRuntime>,
        probe: Arc<dyn HealthProbe>,
        state_store: Option<Arc<StateStore>>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            scheduler,
            runtime,
            probe,
            state_store,
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

    /// Load persisted services. Entries that were live when the previous
    /// process exited cannot be re-attached to their poll loops, so they
    /// are recorded as failed rather than left looking healthy.
    pub async fn load_state(&self) -> Result<()> {
        let Some(store) = &self.state_store else {
            return Ok(());
        };
        for mut instance in store.load_services().await? {
            if !instance.status.is_terminal() {
                instance.status = ServiceStatus::Failed;
                instance.error = Some("orchestrator restarted while service was live".into());
            }
            self.registry.insert(instance).await?;
        }
        Ok(())
    }

    /// Deploy a server recipe: register the instance, build the image,
    /// submit the job, then hand the instance to its poll task.
    pub async fn start(&self, recipe: &ServerRecipe) -> Result<ServiceInstance> {
        let instance = ServiceInstance::new(recipe.name.clone());
        let id = instance.id.clone();
        self.registry.insert(instance).await?;
        self.persist().await;
        tracing::info!(service = id, recipe = %recipe.name, "starting service");

        let image_ref = match self.runtime.build(&recipe.container).await {
            Ok(image_ref) => image_ref,
            Err(e) => return Err(self.fail_start(&id, format!("image build failed: {e}")).await),
        };

        let ports: Vec<PortBinding> = recipe
            .ports
            .iter()
            .map(|p| PortBinding {
                name: p.name.clone(),
                port: p.container_port,
            })
            .collect();
        let command = self.runtime.launch_command(&recipe.container, &image_ref, &ports);
        let request = JobRequest {
            name: recipe.name.clone(),
            resources: recipe.resources.clone(),
            command,
        };

        let job_id = match self.scheduler.submit(&request).await {
            Ok(job_id) => job_id,
            Err(e) => return Err(self.fail_start(&id, format!("job submission failed: {e}")).await),
        };

        let updated = self
            .transition(&id, ServiceStatus::Scheduling, |s| {
                s.job_id = Some(job_id.clone());
            })
            .await?;

        self.spawn_poll_task(id, recipe.clone()).await;
        Ok(updated)
    }

    /// Request a stop. Idempotent: stopping a service that already reached
    /// a terminal state is a no-op success. The live poll task observes
    /// `Stopping` on its next tick and cancels the job; if no task is
    /// live, the cancellation happens here.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let current = self.registry.get(id).await?;
        if current.status.is_terminal() || current.status == ServiceStatus::Stopping {
            return Ok(());
        }
        tracing::info!(service = id, "stop requested");
        self.transition(id, ServiceStatus::Stopping, |_| {}).await?;

        if !self.poll_tasks.read().await.contains_key(id) {
            if let Some(job_id) = &current.job_id {
                if let Err(e) = self.scheduler.cancel(job_id).await {
                    self.transition(id, ServiceStatus::Failed, |s| {
                        s.error = Some(format!("job cancellation failed: {e}"));
                    })
                    .await?;
                    return Err(OrchestratorError::ServiceStop(e.to_string()));
                }
            }
            self.transition(id, ServiceStatus::Stopped, |_| {}).await?;
        }
        Ok(())
    }

    /// Registry snapshot; never touches the scheduler.
    pub async fn get_status(&self, id: &str) -> Result<ServiceInstance> {
        self.registry.get(id).await
    }

    pub async fn list(&self, status: Option<ServiceStatus>) -> Vec<ServiceInstance> {
        self.registry
            .list(|s| status.is_none() || status == Some(s.status))
            .await
    }

    /// Operator delete of a terminal service. Existing client runs keep
    /// their `target_service_id` untouched.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let current = self.registry.get(id).await?;
        if !current.status.is_terminal() {
            return Err(OrchestratorError::ServiceStop(format!(
                "service '{id}' is {:?}; stop it before removing",
                current.status
            )));
        }
        self.registry.remove(id).await?;
        self.persist().await;
        Ok(())
    }

    /// Abort all poll tasks, for process teardown.
    pub async fn shutdown(&self) {
        let mut tasks = self.poll_tasks.write().await;
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
    }

    async fn fail_start(&self, id: &str, message: String) -> OrchestratorError {
        tracing::warn!(service = id, "{message}");
        let _ = self
            .transition(id, ServiceStatus::Failed, |s| {
                s.error = Some(message.clone());
            })
            .await;
        OrchestratorError::ServiceStart(message)
    }

    /// Apply a guarded transition: the status only moves if the state
    /// machine allows it, so no interleaving can move a service backward.
    async fn transition<F: FnOnce(&mut ServiceInstance)>(
        &self,
        id: &str,
        next: ServiceStatus,
        mutate: F,
    ) -> Result<ServiceInstance> {
        let updated = self
            .registry
            .update(id, |s| {
                if s.status.can_transition_to(next) {
                    tracing::debug!(service = id, from = ?s.status, to = ?next, "transition");
                    s.status = next;
                    mutate(s);
                } else if s.status != next {
                    tracing::warn!(
                        service = id,
                        from = ?s.status,
                        to = ?next,
                        "refusing illegal transition"
                    );
                }
            })
            .await?;
        self.persist().await;
        Ok(updated)
    }

    async fn persist(&self) {
        if let Some(store) = &self.state_store {
            let services = self.registry.list_all().await;
            if let Err(e) = store.save_services(&services).await {
                tracing::warn!("failed to persist services: {e}");
            }
        }
    }

    async fn spawn_poll_task(&self, id: String, recipe: ServerRecipe) {
        let registry = Arc::clone(&self.registry);
        let scheduler = Arc::clone(&self.scheduler);
        let probe = Arc::clone(&self.probe);
        let state_store = self.state_store.clone();
        let poll_tasks = Arc::clone(&self.poll_tasks);
        let poll_interval = self.poll_interval;
        let unknown_grace_polls = self.unknown_grace_polls;

        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            poll_service(
                registry,
                scheduler,
                probe,
                state_store,
                recipe,
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

/// Per-service reconciliation loop. Each tick observes the registry first
/// (so a stop request is honored within one interval), then the scheduler,
/// then — once the job runs — the health endpoint.
#[allow(clippy::too_many_arguments)]
async fn poll_service(
    registry: Arc<ServiceRegistry>,
    scheduler: Arc<dyn JobScheduler>,
    probe: Arc<dyn HealthProbe>,
    state_store: Option<Arc<StateStore>>,
    recipe: ServerRecipe,
    id: String,
    poll_interval: Duration,
    unknown_grace_polls: u32,
) {
    let mut tick = interval(poll_interval);
    tick.tick().await; // first tick completes immediately

    let probe_timeout = Duration::from_secs(recipe.health_check.timeout_secs.max(1) as u64);
    let threshold = recipe.health_check.failure_threshold;
    let mut probe_failures: i64 = 0;
    let mut unknown_polls: u32 = 0;
    let mut job_cancelled = false;

    loop {
        tick.tick().await;

        let Ok(current) = registry.get(&id).await else {
            return; // removed by an operator
        };
        if current.status.is_terminal() {
            break;
        }
        let Some(job_id) = current.job_id.clone() else {
            break;
        };

        if current.status == ServiceStatus::Stopping {
            if !job_cancelled {
                job_cancelled = true;
                if let Err(e) = scheduler.cancel(&job_id).await {
                    tracing::warn!(service = id, "cancel during stop failed: {e}");
                    fail(&registry, &state_store, &id, format!("job cancellation failed: {e}"))
                        .await;
                    break;
                }
            }
            apply(&registry, &state_store, &id, ServiceStatus::Stopped, |_| {}).await;
            break;
        }

        let job_state = match scheduler.poll(&job_id).await {
            Ok(job_state) => job_state,
            Err(e) => {
                // The adapter already exhausted its retry budget.
                if !job_cancelled {
                    job_cancelled = true;
                    let _ = scheduler.cancel(&job_id).await;
                }
                fail(&registry, &state_store, &id, format!("scheduler poll failed: {e}")).await;
                break;
            }
        };

        if job_state != JobState::Unknown {
            unknown_polls = 0;
        }

        match job_state {
            JobState::Pending => {}
            JobState::Running => match current.status {
                ServiceStatus::Scheduling => {
                    let nodes = scheduler.nodes(&job_id).await.unwrap_or_default();
                    let host = recipe
                        .network
                        .hostname
                        .clone()
                        .or_else(|| nodes.first().cloned())
                        .unwrap_or_else(|| "localhost".to_string());
                    let endpoints: HashMap<String, String> = recipe
                        .ports
                        .iter()
                        .map(|p| (p.name.clone(), format!("http://{host}:{}", p.container_port)))
                        .collect();
                    apply(&registry, &state_store, &id, ServiceStatus::Starting, |s| {
                        s.nodes = nodes;
                        s.endpoints = endpoints;
                    })
                    .await;
                }
                ServiceStatus::Starting | ServiceStatus::Running => {
                    let Some(base) = current.endpoints.get(&recipe.health_check.port) else {
                        fail(
                            &registry,
                            &state_store,
                            &id,
                            format!("no endpoint for health port '{}'", recipe.health_check.port),
                        )
                        .await;
                        break;
                    };
                    let url = format!("{base}{}", recipe.health_check.path);
                    if probe.probe(&url, probe_timeout).await {
                        probe_failures = 0;
                        if current.status == ServiceStatus::Starting {
                            apply(&registry, &state_store, &id, ServiceStatus::Running, |s| {
                                s.started_at = Some(Utc::now());
                            })
                            .await;
                            tracing::info!(service = id, "service is healthy");
                        }
                    } else {
                        probe_failures += 1;
                        if probe_failures >= threshold {
                            if !job_cancelled {
                                job_cancelled = true;
                                let _ = scheduler.cancel(&job_id).await;
                            }
                            fail(
                                &registry,
                                &state_store,
                                &id,
                                format!("health check failed {threshold} consecutive times"),
                            )
                            .await;
                            break;
                        }
                    }
                }
                _ => {}
            },
            JobState::Completed | JobState::Failed | JobState::Cancelled => {
                fail(
                    &registry,
                    &state_store,
                    &id,
                    format!("job {job_id} ended unexpectedly ({job_state:?})"),
                )
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

async fn apply<F: FnOnce(&mut ServiceInstance)>(
    registry: &ServiceRegistry,
    state_store: &Option<Arc<StateStore>>,
    id: &str,
    next: ServiceStatus,
    mutate: F,
) {
    let result = registry
        .update(id, |s| {
            if s.status.can_transition_to(next) {
                s.status = next;
                mutate(s);
            }
        })
        .await;
    if result.is_ok() {
        if let Some(store) = state_store {
            let services = registry.list_all().await;
            if let Err(e) = store.save_services(&services).await {
                tracing::warn!("failed to persist services: {e}");
            }
        }
    }
}

async fn fail(
    registry: &ServiceRegistry,
    state_store: &Option<Arc<StateStore>>,
    id: &str,
    message: String,
) {
    tracing::warn!(service = id, "{message}");
    apply(registry, state_store, id, ServiceStatus::Failed, |s| {
        s.error = Some(message);
    })
    .await;
}
