use std::path::Path;

use crate::error::{OrchestratorError, Result};
use crate::models::OrchestratorConfig;

const CONFIG_FILENAME: &str = "ubench.yaml";

pub fn load(base_dir: &Path) -> Result<OrchestratorConfig> {
    let config_path = base_dir.join(CONFIG_FILENAME);
    if !config_path.exists() {
        return Err(OrchestratorError::ConfigNotFound(config_path));
    }
    let contents = std::fs::read_to_string(&config_path)?;
    let config: OrchestratorConfig = serde_yaml::from_str(&contents)
        .map_err(|e| OrchestratorError::InvalidConfig(e.to_string()))?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &OrchestratorConfig) -> Result<()> {
    if config.poll_interval_secs == 0 {
        return Err(OrchestratorError::InvalidConfig(
            "poll_interval_secs must be positive".into(),
        ));
    }
    if config.call_timeout_secs == 0 {
        return Err(OrchestratorError::InvalidConfig(
            "call_timeout_secs must be positive".into(),
        ));
    }
    if config.retry_attempts == 0 {
        return Err(OrchestratorError::InvalidConfig(
            "retry_attempts must be positive".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn parse_full_config() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = r#"
recipes_dir: /data/recipes
work_dir: /scratch/ubench
poll_interval_secs: 10
unknown_grace_polls: 2
slurm:
  partition: gpu
  account: bench
  time_limit: "02:00:00"
"#;
        fs::write(dir.path().join(CONFIG_FILENAME), yaml).unwrap();
        let config = load(dir.path()).unwrap();
        assert_eq!(config.recipes_dir, Path::new("/data/recipes"));
        assert_eq!(config.poll_interval_secs, 10);
        assert_eq!(config.unknown_grace_polls, 2);
        assert_eq!(config.slurm.partition.as_deref(), Some("gpu"));
        assert_eq!(config.slurm.time_limit.as_deref(), Some("02:00:00"));
    }

    #[test]
    fn parse_minimal_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = "recipes_dir: ./recipes\nwork_dir: ./work\n";
        fs::write(dir.path().join(CONFIG_FILENAME), yaml).unwrap();
        let config = load(dir.path()).unwrap();
        assert_eq!(config.poll_interval_secs, 5);
        assert_eq!(config.call_timeout_secs, 30);
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.unknown_grace_polls, 1);
        assert!(config.slurm.partition.is_none());
    }

    #[test]
    fn missing_config_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load(dir.path()),
            Err(OrchestratorError::ConfigNotFound(_))
        ));
    }

    #[test]
    fn zero_poll_interval_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = "recipes_dir: ./r\nwork_dir: ./w\npoll_interval_secs: 0\n";
        fs::write(dir.path().join(CONFIG_FILENAME), yaml).unwrap();
        assert!(matches!(
            load(dir.path()),
            Err(OrchestratorError::InvalidConfig(_))
        ));
    }
}
