use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::interval;

use crate::error::{OrchestratorError, Result};
use crate::models::{MonitorInstance, MonitorRecipe, OrchestratorConfig, ServiceStatus};
use crate::services::apptainer::{ContainerRuntime, PortBinding};
use crate::services::registry::MonitorRegistry;
use crate::services::slurm::{JobRequest, JobScheduler, JobState};

/// Deploys metrics/dashboard stacks. Same lifecycle shape as services,
/// minus health probing: the monitor is Running as soon as its job is.
pub struct MonitorManager {
    registry: Arc<MonitorRegistry>,
    scheduler: Arc<dyn JobScheduler>,
    runtime: Arc<dyn ContainerRuntime>,
    poll_interval: Duration,
    unknown_grace_polls: u32,
    poll_tasks: Arc<RwLock<HashMap<String, tokio::task::JoinHandle<()>>>>,
}

impl MonitorManager {
    pub fn new(
        registry: Arc<MonitorRegistry>,
        scheduler: Arc<dyn JobScheduler>,
        runtime: Arc<dyn ContainerRuntime>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            scheduler,
            runtime,
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            unknown_grace_polls: config.unknown_grace_polls,
            poll_tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub async fn deploy(&self, recipe: &MonitorRecipe) -> Result<MonitorInstance> {
        let instance = MonitorInstance::new(recipe.name.clone());
        let id = instance.id.clone();
        self.registry.insert(instance).await?;
        tracing::info!(monitor = id, recipe = %recipe.name, "deploying monitor");

        let image_ref = match self.runtime.build(&recipe.container).await {
            Ok(image_ref) => image_ref,
            Err(e) => return Err(self.fail_deploy(&id, format!("image build failed: {e}")).await),
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
            Err(e) => {
                return Err(self.fail_deploy(&id, format!("job submission failed: {e}")).await)
            }
        };

        let updated = self
            .registry
            .update(&id, |m| {
                m.status = ServiceStatus::Scheduling;
                m.job_id = Some(job_id.clone());
            })
            .await?;

        self.spawn_poll_task(id, recipe.clone()).await;
        Ok(updated)
    }

    pub async fn stop(&self, id: &str) -> Result<()> {
        let current = self.registry.get(id).await?;
        if current.status.is_terminal() || current.status == ServiceStatus::Stopping {
            return Ok(());
        }
        self.registry
            .update(id, |m| {
                if m.status.can_transition_to(ServiceStatus::Stopping) {
                    m.status = ServiceStatus::Stopping;
                }
            })
            .await?;
        if !self.poll_tasks.read().await.contains_key(id) {
            if let Some(job_id) = &current.job_id {
                self.scheduler
                    .cancel(job_id)
                    .await
                    .map_err(|e| OrchestratorError::ServiceStop(e.to_string()))?;
            }
            self.registry
                .update(id, |m| m.status = ServiceStatus::Stopped)
                .await?;
        }
        Ok(())
    }

    pub async fn get_status(&self, id: &str) -> Result<MonitorInstance> {
        self.registry.get(id).await
    }

    pub async fn list(&self) -> Vec<MonitorInstance> {
        self.registry.list_all().await
    }

    pub async fn shutdown(&self) {
        let mut tasks = self.poll_tasks.write().await;
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
    }

    async fn fail_deploy(&self, id: &str, message: String) -> OrchestratorError {
        tracing::warn!(monitor = id, "{message}");
        let _ = self
            .registry
            .update(id, |m| {
                m.status = ServiceStatus::Failed;
                m.error = Some(message.clone());
            })
            .await;
        OrchestratorError::ServiceStart(message)
    }

    async fn spawn_poll_task(&self, id: String, recipe: MonitorRecipe) {
        let registry = Arc::clone(&self.registry);
        let scheduler = Arc::clone(&self.scheduler);
        let poll_tasks = Arc::clone(&self.poll_tasks);
        let poll_interval = self.poll_interval;
        let unknown_grace_polls = self.unknown_grace_polls;

        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            poll_monitor(
                registry,
                scheduler,
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

async fn poll_monitor(
    registry: Arc<MonitorRegistry>,
    scheduler: Arc<dyn JobScheduler>,
    recipe: MonitorRecipe,
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

        if current.status == ServiceStatus::Stopping {
            if let Err(e) = scheduler.cancel(&job_id).await {
                tracing::warn!(monitor = id, "cancel during stop failed: {e}");
            }
            let _ = registry
                .update(&id, |m| {
                    if m.status.can_transition_to(ServiceStatus::Stopped) {
                        m.status = ServiceStatus::Stopped;
                    }
                })
                .await;
            break;
        }

        let job_state = match scheduler.poll(&job_id).await {
            Ok(job_state) => job_state,
            Err(e) => {
                fail(&registry, &id, format!("scheduler poll failed: {e}")).await;
                break;
            }
        };

        if job_state != JobState::Unknown {
            unknown_polls = 0;
        }

        match job_state {
            JobState::Pending => {}
            JobState::Running => {
                if current.status == ServiceStatus::Scheduling {
                    let nodes = scheduler.nodes(&job_id).await.unwrap_or_default();
                    let host = nodes
                        .first()
                        .cloned()
                        .unwrap_or_else(|| "localhost".to_string());
                    let endpoint = recipe
                        .ports
                        .first()
                        .map(|p| format!("http://{host}:{}", p.container_port));
                    let _ = registry
                        .update(&id, |m| {
                            // No health probe gates a monitor: step through
                            // Starting to Running as soon as the job is up.
                            if m.status.can_transition_to(ServiceStatus::Starting) {
                                m.status = ServiceStatus::Starting;
                            }
                            if m.status.can_transition_to(ServiceStatus::Running) {
                                m.status = ServiceStatus::Running;
                                m.endpoint = endpoint.clone();
                            }
                        })
                        .await;
                    tracing::info!(monitor = id, "monitor is up");
                }
            }
            JobState::Completed | JobState::Failed | JobState::Cancelled => {
                fail(&registry, &id, format!("job {job_id} ended unexpectedly")).await;
                break;
            }
            JobState::Unknown => {
                unknown_polls += 1;
                if unknown_polls > unknown_grace_polls {
                    fail(&registry, &id, format!("job {job_id} disappeared from the scheduler"))
                        .await;
                    break;
                }
            }
        }
    }
}

async fn fail(registry: &MonitorRegistry, id: &str, message: String) {
    tracing::warn!(monitor = id, "{message}");
    let _ = registry
        .update(id, |m| {
            if m.status.can_transition_to(ServiceStatus::Failed) {
                m.status = ServiceStatus::Failed;
                m.error = Some(message);
            }
        })
        .await;
}
