use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{OrchestratorError, Result};
use crate::models::ContainerSpec;

/// A port resolved for one concrete deployment: port name -> number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub name: String,
    pub port: i64,
}

/// Translation layer over the external container build/launch mechanism.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Materialize the image and return a runnable reference. Build
    /// failures are non-retryable: a bad recipe should fail fast instead
    /// of consuming scheduler capacity.
    async fn build(&self, spec: &ContainerSpec) -> Result<String>;

    /// Construct the command executed inside a scheduled job.
    fn launch_command(
        &self,
        spec: &ContainerSpec,
        image_ref: &str,
        ports: &[PortBinding],
    ) -> Vec<String>;
}

/// `ContainerRuntime` over the `apptainer` CLI. Remote references
/// (`docker://...`) are pulled into `.sif` files under the work dir;
/// identical specs are served from a fingerprint-keyed cache.
pub struct ApptainerRuntime {
    images_dir: PathBuf,
    build_cache: Mutex<HashMap<u64, String>>,
}

impl ApptainerRuntime {
    pub fn new(work_dir: &std::path::Path) -> Self {
        Self {
            images_dir: work_dir.join("images"),
            build_cache: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ContainerRuntime for ApptainerRuntime {
    async fn build(&self, spec: &ContainerSpec) -> Result<String> {
        // Local .sif images are used as-is.
        if spec.image.ends_with(".sif") {
            if !std::path::Path::new(&spec.image).exists() {
                return Err(OrchestratorError::Container(format!(
                    "image file '{}' does not exist",
                    spec.image
                )));
            }
            return Ok(spec.image.clone());
        }

        let key = fingerprint(spec);
        if let Some(cached) = self.build_cache.lock().unwrap().get(&key) {
            tracing::debug!(image = %spec.image, "image already built, using cache");
            return Ok(cached.clone());
        }

        tokio::fs::create_dir_all(&self.images_dir)
            .await
            .map_err(|e| OrchestratorError::Container(format!("creating images dir: {e}")))?;
        let sif_path = self.images_dir.join(format!("{key:016x}.sif"));
        let sif_arg = sif_path.to_string_lossy().to_string();

        if !sif_path.exists() {
            tracing::info!(image = %spec.image, "pulling container image");
            let output = Command::new("apptainer")
                .args(["pull", "--force", &sif_arg, &spec.image])
                .output()
                .await
                .map_err(|e| {
                    OrchestratorError::Container(format!("failed to run apptainer: {e}"))
                })?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(OrchestratorError::Container(format!(
                    "apptainer pull of '{}' failed (exit {}): {stderr}",
                    spec.image,
                    output.status.code().unwrap_or(-1)
                )));
            }
        }

        self.build_cache.lock().unwrap().insert(key, sif_arg.clone());
        Ok(sif_arg)
    }

    fn launch_command(
        &self,
        spec: &ContainerSpec,
        image_ref: &str,
        ports: &[PortBinding],
    ) -> Vec<String> {
        let mut command = vec!["apptainer".to_string(), "exec".to_string()];
        if spec.gpu {
            command.push("--nv".to_string());
        }
        for mount in &spec.mounts {
            command.push("--bind".to_string());
            command.push(mount.clone());
        }
        // Recipe env first, then resolved port env vars on top.
        let mut env: Vec<(&str, String)> = spec
            .env
            .iter()
            .map(|(k, v)| (k.as_str(), v.clone()))
            .collect();
        env.sort_by(|a, b| a.0.cmp(b.0));
        for (key, value) in env {
            command.push("--env".to_string());
            command.push(format!("{key}={value}"));
        }
        for binding in ports {
            command.push("--env".to_string());
            command.push(format!(
                "UBENCH_PORT_{}={}",
                binding.name.to_ascii_uppercase(),
                binding.port
            ));
        }
        command.push(image_ref.to_string());
        command.extend(spec.command.iter().cloned());
        command
    }
}

/// Content fingerprint of a container spec, used as the build-cache key.
fn fingerprint(spec: &ContainerSpec) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    spec.image.hash(&mut hasher);
    spec.command.hash(&mut hasher);
    spec.mounts.hash(&mut hasher);
    spec.gpu.hash(&mut hasher);
    let mut env: Vec<_> = spec.env.iter().collect();
    env.sort();
    env.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            image: "docker://vllm/vllm-openai:latest".into(),
            command: vec!["--model".into(), "mistral-7b".into()],
            env: HashMap::from([("HF_HOME".into(), "/cache".into())]),
            mounts: vec!["/data:/data".into()],
            gpu: true,
        }
    }

    #[test]
    fn launch_command_shape() {
        let runtime = ApptainerRuntime::new(std::path::Path::new("/tmp/work"));
        let ports = vec![PortBinding {
            name: "api".into(),
            port: 8000,
        }];
        let command = runtime.launch_command(&spec(), "/tmp/work/images/x.sif", &ports);
        assert_eq!(command[0], "apptainer");
        assert_eq!(command[1], "exec");
        assert!(command.contains(&"--nv".to_string()));
        let bind_at = command.iter().position(|a| a == "--bind").unwrap();
        assert_eq!(command[bind_at + 1], "/data:/data");
        assert!(command.contains(&"HF_HOME=/cache".to_string()));
        assert!(command.contains(&"UBENCH_PORT_API=8000".to_string()));
        // Image before the recipe command.
        let image_at = command
            .iter()
            .position(|a| a == "/tmp/work/images/x.sif")
            .unwrap();
        assert_eq!(command[image_at + 1], "--model");
        assert_eq!(command[image_at + 2], "mistral-7b");
    }

    #[test]
    fn launch_command_without_gpu_omits_nv() {
        let runtime = ApptainerRuntime::new(std::path::Path::new("/tmp/work"));
        let mut plain = spec();
        plain.gpu = false;
        let command = runtime.launch_command(&plain, "x.sif", &[]);
        assert!(!command.contains(&"--nv".to_string()));
    }

    #[test]
    fn fingerprint_is_stable_and_spec_sensitive() {
        let a = fingerprint(&spec());
        let b = fingerprint(&spec());
        assert_eq!(a, b);
        let mut changed = spec();
        changed.image = "docker://other:latest".into();
        assert_ne!(a, fingerprint(&changed));
    }

    #[tokio::test]
    async fn missing_local_sif_fails_fast() {
        let runtime = ApptainerRuntime::new(std::path::Path::new("/tmp/work"));
        let mut local = spec();
        local.image = "/does/not/exist.sif".into();
        assert!(matches!(
            runtime.build(&local).await,
            Err(OrchestratorError::Container(_))
        ));
    }

    #[tokio::test]
    async fn existing_local_sif_used_as_is() {
        let dir = tempfile::tempdir().unwrap();
        let sif = dir.path().join("model.sif");
        std::fs::write(&sif, b"sif").unwrap();
        let runtime = ApptainerRuntime::new(dir.path());
        let mut local = spec();
        local.image = sif.to_string_lossy().to_string();
        let image_ref = runtime.build(&local).await.unwrap();
        assert_eq!(image_ref, local.image);
    }
}
