use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tokio::time::{sleep, timeout};

use crate::error::{OrchestratorError, Result};
use crate::models::{OrchestratorConfig, ResourceSpec, SlurmConfig};

/// Internal job status vocabulary. `Unknown` means the scheduler has no
/// record of the job (e.g. purged after completion) — it is a value, never
/// an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Unknown,
}

/// Everything the scheduler needs to run one workload.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub name: String,
    pub resources: ResourceSpec,
    /// The command executed inside the allocation (already containerized).
    pub command: Vec<String>,
}

/// Translation layer over the external cluster scheduler. Lifecycle
/// coordinators only ever speak this vocabulary.
#[async_trait]
pub trait JobScheduler: Send + Sync {
    async fn submit(&self, request: &JobRequest) -> Result<String>;
    async fn poll(&self, job_id: &str) -> Result<JobState>;
    async fn cancel(&self, job_id: &str) -> Result<()>;
    async fn nodes(&self, job_id: &str) -> Result<Vec<String>>;
}

static JOB_ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)").unwrap());

/// `JobScheduler` over the Slurm CLIs (`sbatch`/`squeue`/`sacct`/`scancel`).
///
/// Every call runs under a bounded timeout; transient failures are retried
/// with doubling backoff before surfacing as `OrchestratorError::Slurm`.
pub struct SlurmClient {
    jobs_dir: PathBuf,
    logs_dir: PathBuf,
    slurm: SlurmConfig,
    call_timeout: Duration,
    retry_attempts: u32,
    retry_backoff: Duration,
}

impl SlurmClient {
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self {
            jobs_dir: config.work_dir.join("jobs"),
            logs_dir: config.work_dir.join("logs"),
            slurm: config.slurm.clone(),
            call_timeout: Duration::from_secs(config.call_timeout_secs),
            retry_attempts: config.retry_attempts,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }

    async fn run_once(&self, program: &str, args: &[&str]) -> Result<String> {
        let output = timeout(self.call_timeout, Command::new(program).args(args).output())
            .await
            .map_err(|_| {
                OrchestratorError::Slurm(format!(
                    "{program} timed out after {}s",
                    self.call_timeout.as_secs()
                ))
            })?
            .map_err(|e| OrchestratorError::Slurm(format!("failed to run {program}: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // A purged/unknown job id is a normal answer, not a failure.
            if stderr.contains("Invalid job id specified") {
                return Ok(String::new());
            }
            return Err(OrchestratorError::Slurm(format!(
                "{program} {} failed (exit {}): {stderr}",
                args.join(" "),
                output.status.code().unwrap_or(-1)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        let mut backoff = self.retry_backoff;
        let mut last_err = None;
        for attempt in 1..=self.retry_attempts {
            match self.run_once(program, args).await {
                Ok(output) => return Ok(output),
                Err(e) => {
                    tracing::warn!(%program, attempt, "scheduler call failed: {e}");
                    last_err = Some(e);
                    if attempt < self.retry_attempts {
                        sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            OrchestratorError::Slurm(format!("{program} failed with no attempts made"))
        }))
    }
}

#[async_trait]
impl JobScheduler for SlurmClient {
    async fn submit(&self, request: &JobRequest) -> Result<String> {
        tokio::fs::create_dir_all(&self.jobs_dir)
            .await
            .map_err(|e| OrchestratorError::Slurm(format!("creating jobs dir: {e}")))?;
        tokio::fs::create_dir_all(&self.logs_dir)
            .await
            .map_err(|e| OrchestratorError::Slurm(format!("creating logs dir: {e}")))?;

        let script = batch_script(request, &self.slurm, &self.logs_dir);
        let script_path = self
            .jobs_dir
            .join(format!("{}-{}.sbatch", request.name, uuid::Uuid::new_v4()));
        tokio::fs::write(&script_path, script)
            .await
            .map_err(|e| OrchestratorError::Slurm(format!("writing batch script: {e}")))?;

        let script_arg = script_path.to_string_lossy().to_string();
        let output = self.run("sbatch", &["--parsable", &script_arg]).await?;
        let job_id = output
            .split(';')
            .next()
            .and_then(|s| JOB_ID_RE.captures(s))
            .map(|caps| caps[1].to_string())
            .ok_or_else(|| {
                OrchestratorError::Slurm(format!("could not parse sbatch output: '{output}'"))
            })?;
        tracing::info!(job_id, name = %request.name, "submitted batch job");
        Ok(job_id)
    }

    async fn poll(&self, job_id: &str) -> Result<JobState> {
        // squeue only knows queued/running jobs; fall back to sacct for
        // jobs that already left the queue.
        let queued = self
            .run("squeue", &["-h", "-j", job_id, "-o", "%T"])
            .await?;
        if let Some(state) = queued.lines().next().filter(|l| !l.is_empty()) {
            return Ok(parse_job_state(state));
        }

        let finished = self
            .run("sacct", &["-n", "-X", "-j", job_id, "-o", "State"])
            .await?;
        match finished.lines().next().map(str::trim).filter(|l| !l.is_empty()) {
            Some(state) => Ok(parse_job_state(state)),
            None => Ok(JobState::Unknown),
        }
    }

    async fn cancel(&self, job_id: &str) -> Result<()> {
        self.run("scancel", &[job_id]).await?;
        tracing::info!(job_id, "cancelled job");
        Ok(())
    }

    async fn nodes(&self, job_id: &str) -> Result<Vec<String>> {
        let nodelist = self
            .run("squeue", &["-h", "-j", job_id, "-o", "%N"])
            .await?;
        let nodelist = nodelist.lines().next().unwrap_or("").trim().to_string();
        if nodelist.is_empty() {
            return Ok(Vec::new());
        }
        // Expand compact forms like `node[01-04]`.
        let expanded = self
            .run("scontrol", &["show", "hostnames", &nodelist])
            .await?;
        Ok(expanded
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// Map a native Slurm state string into the internal vocabulary. sacct may
/// append detail ("CANCELLED by 1234"), so match on the leading token.
pub fn parse_job_state(raw: &str) -> JobState {
    let state = raw
        .trim()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();
    if state.starts_with("CANCELLED") {
        return JobState::Cancelled;
    }
    match state.as_str() {
        "PENDING" | "CONFIGURING" | "REQUEUED" => JobState::Pending,
        "RUNNING" | "COMPLETING" => JobState::Running,
        "COMPLETED" => JobState::Completed,
        "FAILED" | "TIMEOUT" | "NODE_FAIL" | "OUT_OF_MEMORY" | "PREEMPTED" | "BOOT_FAIL"
        | "DEADLINE" => JobState::Failed,
        _ => JobState::Unknown,
    }
}

/// Render the batch script for a job request. Pure so it can be tested
/// without a cluster.
pub fn batch_script(request: &JobRequest, slurm: &SlurmConfig, logs_dir: &std::path::Path) -> String {
    let mut script = String::from("#!/bin/bash\n");
    let mut directive = |line: String| {
        script.push_str("#SBATCH ");
        script.push_str(&line);
        script.push('\n');
    };

    directive(format!("--job-name={}", request.name));
    directive(format!("--output={}/%j.out", logs_dir.display()));
    directive(format!("--nodes={}", request.resources.nodes));
    directive(format!("--cpus-per-task={}", request.resources.cpus));
    directive(format!("--mem={}G", request.resources.memory_gb));
    if request.resources.gpus > 0 {
        directive(format!("--gres=gpu:{}", request.resources.gpus));
    }
    if let Some(time_limit) = request.resources.time_limit.as_ref().or(slurm.time_limit.as_ref()) {
        directive(format!("--time={time_limit}"));
    }
    if let Some(partition) = &slurm.partition {
        directive(format!("--partition={partition}"));
    }
    if let Some(account) = &slurm.account {
        directive(format!("--account={account}"));
    }

    script.push('\n');
    let command: Vec<String> = request.command.iter().map(|a| shell_quote(a)).collect();
    script.push_str(&command.join(" "));
    script.push('\n');
    script
}

fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%,".contains(c))
    {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn state_mapping_covers_native_vocabulary() {
        assert_eq!(parse_job_state("PENDING"), JobState::Pending);
        assert_eq!(parse_job_state("CONFIGURING"), JobState::Pending);
        assert_eq!(parse_job_state("RUNNING"), JobState::Running);
        assert_eq!(parse_job_state("COMPLETING"), JobState::Running);
        assert_eq!(parse_job_state("COMPLETED"), JobState::Completed);
        assert_eq!(parse_job_state("FAILED"), JobState::Failed);
        assert_eq!(parse_job_state("TIMEOUT"), JobState::Failed);
        assert_eq!(parse_job_state("NODE_FAIL"), JobState::Failed);
        assert_eq!(parse_job_state("OUT_OF_MEMORY"), JobState::Failed);
        assert_eq!(parse_job_state("CANCELLED"), JobState::Cancelled);
        assert_eq!(parse_job_state("CANCELLED by 1234"), JobState::Cancelled);
        assert_eq!(parse_job_state("CANCELLED+"), JobState::Cancelled);
        assert_eq!(parse_job_state(""), JobState::Unknown);
        assert_eq!(parse_job_state("SOMETHING_NEW"), JobState::Unknown);
    }

    #[test]
    fn batch_script_renders_resource_directives() {
        let request = JobRequest {
            name: "vllm-inference".into(),
            resources: ResourceSpec {
                cpus: 8,
                gpus: 1,
                memory_gb: 64,
                nodes: 1,
                time_limit: None,
            },
            command: vec!["apptainer".into(), "exec".into(), "image.sif".into()],
        };
        let slurm = SlurmConfig {
            partition: Some("gpu".into()),
            account: None,
            time_limit: Some("01:00:00".into()),
        };
        let script = batch_script(&request, &slurm, Path::new("/scratch/logs"));
        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("#SBATCH --job-name=vllm-inference\n"));
        assert!(script.contains("#SBATCH --output=/scratch/logs/%j.out\n"));
        assert!(script.contains("#SBATCH --cpus-per-task=8\n"));
        assert!(script.contains("#SBATCH --mem=64G\n"));
        assert!(script.contains("#SBATCH --gres=gpu:1\n"));
        assert!(script.contains("#SBATCH --time=01:00:00\n"));
        assert!(script.contains("#SBATCH --partition=gpu\n"));
        assert!(!script.contains("--account"));
        assert!(script.ends_with("apptainer exec image.sif\n"));
    }

    #[test]
    fn recipe_time_limit_overrides_config_default() {
        let request = JobRequest {
            name: "j".into(),
            resources: ResourceSpec {
                time_limit: Some("04:00:00".into()),
                ..ResourceSpec::default()
            },
            command: vec!["true".into()],
        };
        let slurm = SlurmConfig {
            time_limit: Some("01:00:00".into()),
            ..SlurmConfig::default()
        };
        let script = batch_script(&request, &slurm, Path::new("/logs"));
        assert!(script.contains("--time=04:00:00"));
        assert!(!script.contains("--time=01:00:00"));
    }

    #[test]
    fn gpu_directive_omitted_without_gpus() {
        let request = JobRequest {
            name: "j".into(),
            resources: ResourceSpec::default(),
            command: vec!["true".into()],
        };
        let script = batch_script(&request, &SlurmConfig::default(), Path::new("/logs"));
        assert!(!script.contains("--gres"));
    }

    #[test]
    fn shell_quote_wraps_special_characters() {
        assert_eq!(shell_quote("plain-arg_1.0"), "plain-arg_1.0");
        assert_eq!(shell_quote("--model=x"), "--model=x");
        assert_eq!(shell_quote("has space"), "'has space'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn job_id_regex_parses_parsable_output() {
        let caps = JOB_ID_RE.captures("12345678;cluster").unwrap();
        assert_eq!(&caps[1], "12345678");
    }
}
