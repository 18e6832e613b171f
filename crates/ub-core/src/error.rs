use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("recipe '{0}' not found")]
    RecipeNotFound(String),

    #[error("recipe parse failed: {0}")]
    RecipeParse(String),

    #[error("recipe validation failed: {0}")]
    RecipeValidation(String),

    #[error("service '{0}' not found")]
    ServiceNotFound(String),

    #[error("client run '{0}' not found")]
    ClientNotFound(String),

    #[error("monitor '{0}' not found")]
    MonitorNotFound(String),

    #[error("service start failed: {0}")]
    ServiceStart(String),

    #[error("service stop failed: {0}")]
    ServiceStop(String),

    #[error("target service unavailable: {0}")]
    TargetUnavailable(String),

    #[error("run has not completed: {0}")]
    RunNotCompleted(String),

    #[error("'{0}' already exists")]
    AlreadyExists(String),

    #[error("config file not found at {0}")]
    ConfigNotFound(PathBuf),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("slurm operation failed: {0}")]
    Slurm(String),

    #[error("container operation failed: {0}")]
    Container(String),

    #[error("state persistence failed: {0}")]
    State(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
