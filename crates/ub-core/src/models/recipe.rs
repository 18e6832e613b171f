use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipeType {
    Server,
    Client,
    Monitor,
}

/// Cluster resource request for one job. Values are signed so that a
/// negative number in a recipe file reaches `validate` instead of being
/// rejected as a deserialization error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(default = "default_cpus")]
    pub cpus: i64,
    #[serde(default)]
    pub gpus: i64,
    #[serde(default = "default_memory_gb")]
    pub memory_gb: i64,
    #[serde(default = "default_nodes")]
    pub nodes: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit: Option<String>,
}

fn default_cpus() -> i64 {
    1
}

fn default_memory_gb() -> i64 {
    4
}

fn default_nodes() -> i64 {
    1
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self {
            cpus: default_cpus(),
            gpus: 0,
            memory_gb: default_memory_gb(),
            nodes: default_nodes(),
            time_limit: None,
        }
    }
}

/// A named port exposed by the container, e.g. `api` -> 8000.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortSpec {
    pub name: String,
    pub container_port: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// Preferred interconnect interface, e.g. `ib0`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interconnect: Option<String>,
    /// Hostname override for endpoint URLs; defaults to the assigned node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    pub path: String,
    /// Name of the `PortSpec` the probe connects to.
    pub port: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: i64,
    #[serde(default = "default_probe_timeout_secs")]
    pub timeout_secs: i64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: i64,
}

fn default_interval_secs() -> i64 {
    5
}

fn default_probe_timeout_secs() -> i64 {
    10
}

fn default_failure_threshold() -> i64 {
    3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSpec {
    #[serde(default = "default_metrics_path")]
    pub path: String,
    pub port: String,
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Image reference, e.g. `docker://vllm/vllm-openai:latest`.
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Bind mounts as `host:container` pairs.
    #[serde(default)]
    pub mounts: Vec<String>,
    #[serde(default)]
    pub gpu: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecipe {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub resources: ResourceSpec,
    pub container: ContainerSpec,
    pub ports: Vec<PortSpec>,
    #[serde(default)]
    pub network: NetworkSpec,
    pub health_check: HealthCheckSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRecipe {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub resources: ResourceSpec,
    pub container: ContainerSpec,
    /// Where the client writes its results artifact (JSON). Relative paths
    /// are resolved against the orchestrator work directory.
    pub results_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorRecipe {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub resources: ResourceSpec,
    pub container: ContainerSpec,
    #[serde(default)]
    pub ports: Vec<PortSpec>,
}

/// An immutable, validated workload template. A `Recipe` value only exists
/// in validated form: the loader runs `validate` before handing one out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Recipe {
    Server(ServerRecipe),
    Client(ClientRecipe),
    Monitor(MonitorRecipe),
}

impl Recipe {
    pub fn name(&self) -> &str {
        match self {
            Recipe::Server(r) => &r.name,
            Recipe::Client(r) => &r.name,
            Recipe::Monitor(r) => &r.name,
        }
    }

    pub fn version(&self) -> &str {
        match self {
            Recipe::Server(r) => &r.version,
            Recipe::Client(r) => &r.version,
            Recipe::Monitor(r) => &r.version,
        }
    }

    pub fn recipe_type(&self) -> RecipeType {
        match self {
            Recipe::Server(_) => RecipeType::Server,
            Recipe::Client(_) => RecipeType::Client,
            Recipe::Monitor(_) => RecipeType::Monitor,
        }
    }

    pub fn resources(&self) -> &ResourceSpec {
        match self {
            Recipe::Server(r) => &r.resources,
            Recipe::Client(r) => &r.resources,
            Recipe::Monitor(r) => &r.resources,
        }
    }

    pub fn container(&self) -> &ContainerSpec {
        match self {
            Recipe::Server(r) => &r.container,
            Recipe::Client(r) => &r.container,
            Recipe::Monitor(r) => &r.container,
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_common(self.name(), self.version(), self.resources(), self.container())?;
        match self {
            Recipe::Server(r) => {
                validate_ports(&r.name, &r.ports)?;
                if r.ports.is_empty() {
                    return invalid(&r.name, "server recipe must expose at least one port");
                }
                let hc = &r.health_check;
                if hc.path.is_empty() {
                    return invalid(&r.name, "health check path is required");
                }
                if hc.interval_secs <= 0 {
                    return invalid(&r.name, "health check interval must be positive");
                }
                if hc.timeout_secs <= 0 {
                    return invalid(&r.name, "health check timeout must be positive");
                }
                if hc.failure_threshold < 1 {
                    return invalid(&r.name, "health check failure threshold must be at least 1");
                }
                if !r.ports.iter().any(|p| p.name == hc.port) {
                    return invalid(
                        &r.name,
                        &format!("health check references unknown port '{}'", hc.port),
                    );
                }
                if let Some(metrics) = &r.metrics {
                    if !r.ports.iter().any(|p| p.name == metrics.port) {
                        return invalid(
                            &r.name,
                            &format!("metrics references unknown port '{}'", metrics.port),
                        );
                    }
                }
            }
            Recipe::Client(r) => {
                if r.results_path.is_empty() {
                    return invalid(&r.name, "client recipe must declare results_path");
                }
            }
            Recipe::Monitor(r) => {
                validate_ports(&r.name, &r.ports)?;
            }
        }
        Ok(())
    }
}

fn invalid(name: &str, message: &str) -> Result<()> {
    Err(OrchestratorError::RecipeValidation(format!(
        "recipe '{name}': {message}"
    )))
}

fn validate_common(
    name: &str,
    version: &str,
    resources: &ResourceSpec,
    container: &ContainerSpec,
) -> Result<()> {
    if name.is_empty() {
        return invalid(name, "name is required");
    }
    if version.is_empty() {
        return invalid(name, "version is required");
    }
    if container.image.is_empty() {
        return invalid(name, "container image is required");
    }
    if resources.cpus < 1 {
        return invalid(name, "cpus must be at least 1");
    }
    if resources.gpus < 0 {
        return invalid(name, "gpus must not be negative");
    }
    if resources.memory_gb < 1 {
        return invalid(name, "memory_gb must be at least 1");
    }
    if resources.nodes < 1 {
        return invalid(name, "nodes must be at least 1");
    }
    for mount in &container.mounts {
        if !mount.contains(':') {
            return invalid(name, &format!("mount '{mount}' must be host:container"));
        }
    }
    Ok(())
}

fn validate_ports(name: &str, ports: &[PortSpec]) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for port in ports {
        if port.name.is_empty() {
            return invalid(name, "port name is required");
        }
        if !(1..=65535).contains(&port.container_port) {
            return invalid(
                name,
                &format!("port '{}' must be in 1..=65535", port.name),
            );
        }
        if !seen.insert(port.name.as_str()) {
            return invalid(name, &format!("duplicate port name '{}'", port.name));
        }
    }
    Ok(())
}
