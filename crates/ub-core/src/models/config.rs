use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    pub recipes_dir: PathBuf,
    pub work_dir: PathBuf,
    /// Seconds between poll-loop ticks.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Bound on each individual scheduler CLI call.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// How many consecutive `Unknown` polls to tolerate for a job that was
    /// previously observed by the scheduler, before failing the entity.
    #[serde(default = "default_unknown_grace_polls")]
    pub unknown_grace_polls: u32,
    #[serde(default)]
    pub slurm: SlurmConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SlurmConfig {
    #[serde(default)]
    pub partition: Option<String>,
    #[serde(default)]
    pub account: Option<String>,
    /// Default job time limit when a recipe does not set one.
    #[serde(default)]
    pub time_limit: Option<String>,
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_unknown_grace_polls() -> u32 {
    1
}
