pub mod config;
pub mod monitor;
pub mod recipe;
pub mod run;
pub mod service;

pub use config::{OrchestratorConfig, SlurmConfig};
pub use monitor::MonitorInstance;
pub use recipe::{
    ClientRecipe, ContainerSpec, HealthCheckSpec, MetricsSpec, MonitorRecipe, NetworkSpec,
    PortSpec, Recipe, RecipeType, ResourceSpec, ServerRecipe,
};
pub use run::{ClientRun, RunStatus};
pub use service::{ServiceInstance, ServiceStatus};
