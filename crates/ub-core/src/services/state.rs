use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{OrchestratorError, Result};
use crate::models::{ClientRun, ServiceInstance};

/// Optional on-disk snapshots of registry contents, so a restarted
/// orchestrator can show what it was tracking. Registries stay the source
/// of truth while the process runs.
pub struct StateStore {
    state_dir: PathBuf,
}

impl StateStore {
    pub fn new(work_dir: &Path) -> Self {
        Self {
            state_dir: work_dir.join("state"),
        }
    }

    pub async fn load_services(&self) -> Result<Vec<ServiceInstance>> {
        self.load_file("services.json").await
    }

    pub async fn save_services(&self, services: &[ServiceInstance]) -> Result<()> {
        self.save_file("services.json", services).await
    }

    pub async fn load_runs(&self) -> Result<Vec<ClientRun>> {
        self.load_file("runs.json").await
    }

    pub async fn save_runs(&self, runs: &[ClientRun]) -> Result<()> {
        self.save_file("runs.json", runs).await
    }

    async fn load_file<T: DeserializeOwned>(&self, filename: &str) -> Result<Vec<T>> {
        let path = self.state_dir.join(filename);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let json = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| OrchestratorError::State(format!("failed to read {filename}: {e}")))?;
        let entities: Vec<T> = serde_json::from_str(&json)?;
        Ok(entities)
    }

    async fn save_file<T: Serialize>(&self, filename: &str, entities: &[T]) -> Result<()> {
        tokio::fs::create_dir_all(&self.state_dir)
            .await
            .map_err(|e| OrchestratorError::State(format!("failed to create state dir: {e}")))?;
        let json = serde_json::to_string_pretty(entities)?;
        tokio::fs::write(self.state_dir.join(filename), json)
            .await
            .map_err(|e| OrchestratorError::State(format!("failed to write {filename}: {e}")))?;
        Ok(())
    }
}
