use std::sync::Arc;

use crate::error::{OrchestratorError, Result};
use crate::models::OrchestratorConfig;
use crate::services::apptainer::ApptainerRuntime;
use crate::services::client_manager::ClientManager;
use crate::services::health::HttpProbe;
use crate::services::log_manager::LogManager;
use crate::services::monitor_manager::MonitorManager;
use crate::services::recipe_loader::RecipeStore;
use crate::services::registry::{MonitorRegistry, Registry, RunRegistry, ServiceRegistry};
use crate::services::service_manager::ServiceManager;
use crate::services::slurm::SlurmClient;
use crate::services::state::StateStore;

/// Process-scoped wiring of the orchestration core. Built once at startup
/// and torn down explicitly; presentation layers hold this and nothing
/// else. There are no global accessors — tests construct managers
/// directly with their own adapter doubles.
pub struct OrchestratorContext {
    pub config: OrchestratorConfig,
    pub recipes: Arc<RecipeStore>,
    pub service_registry: Arc<ServiceRegistry>,
    pub run_registry: Arc<RunRegistry>,
    pub monitor_registry: Arc<MonitorRegistry>,
    pub services: Arc<ServiceManager>,
    pub runs: Arc<ClientManager>,
    pub monitors: Arc<MonitorManager>,
    pub logs: Arc<LogManager>,
}

impl OrchestratorContext {
    pub fn new(config: OrchestratorConfig) -> Self {
        let scheduler = Arc::new(SlurmClient::new(&config));
        let runtime = Arc::new(ApptainerRuntime::new(&config.work_dir));
        let probe = Arc::new(HttpProbe::new());
        let state_store = Arc::new(StateStore::new(&config.work_dir));

        let recipes = Arc::new(RecipeStore::new(config.recipes_dir.clone()));
        let service_registry: Arc<ServiceRegistry> =
            Arc::new(Registry::new(OrchestratorError::ServiceNotFound));
        let run_registry: Arc<RunRegistry> =
            Arc::new(Registry::new(OrchestratorError::ClientNotFound));
        let monitor_registry: Arc<MonitorRegistry> =
            Arc::new(Registry::new(OrchestratorError::MonitorNotFound));

        let services = Arc::new(ServiceManager::new(
            Arc::clone(&service_registry),
            scheduler.clone(),
            runtime.clone(),
            probe,
            Some(Arc::clone(&state_store)),
            &config,
        ));
        let runs = Arc::new(ClientManager::new(
            Arc::clone(&run_registry),
            Arc::clone(&service_registry),
            scheduler.clone(),
            runtime.clone(),
            Some(state_store),
            &config,
        ));
        let monitors = Arc::new(MonitorManager::new(
            Arc::clone(&monitor_registry),
            scheduler,
            runtime,
            &config,
        ));
        let logs = Arc::new(LogManager::new(&config.work_dir));

        Self {
            config,
            recipes,
            service_registry,
            run_registry,
            monitor_registry,
            services,
            runs,
            monitors,
            logs,
        }
    }

    /// Restore persisted registry snapshots from the work dir.
    pub async fn load_state(&self) -> Result<()> {
        self.services.load_state().await?;
        self.runs.load_state().await?;
        Ok(())
    }

    /// Stop all poll loops. Registry contents stay persisted on disk.
    pub async fn shutdown(&self) {
        self.services.shutdown().await;
        self.runs.shutdown().await;
        self.monitors.shutdown().await;
    }
}
