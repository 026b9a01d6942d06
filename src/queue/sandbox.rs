use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::SandboxConfig;
use crate::queue::executor::{ExecutorError, MarkOutcome, MarkingExecutor};
use crate::queue::job::Job;

/// Exit code docker itself uses when the container could not be run.
const DOCKER_RUN_FAILURE: i32 = 125;

/// Runs a job's `command` payload in a Docker container.
///
/// Containers run with:
/// - Network isolation (disabled by default)
/// - Dropped capabilities
/// - Read-only root filesystem
/// - Memory and CPU limits
///
/// A zero exit status marks the submission as passing (100), anything else as
/// failing (0). Failures to start the container are transient.
#[derive(Debug, Clone)]
pub struct SandboxExecutor {
    config: SandboxConfig,
}

impl SandboxExecutor {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn docker_args(&self, command: &str) -> Vec<String> {
        let mut args = vec!["run".to_string(), "--rm".to_string()];

        if self.config.network_disabled {
            args.push("--network=none".to_string());
        }
        if let Some(ref limit) = self.config.memory_limit {
            args.push(format!("--memory={}", limit));
        }
        if let Some(ref limit) = self.config.cpu_limit {
            args.push(format!("--cpus={}", limit));
        }

        args.push("--cap-drop=ALL".to_string());
        args.push("--security-opt=no-new-privileges".to_string());
        args.push("--read-only".to_string());

        args.push(self.config.image.clone());
        args.push("sh".to_string());
        args.push("-c".to_string());
        args.push(command.to_string());
        args
    }

    pub(crate) fn process_output(
        job_id: i64,
        result: Result<std::process::Output, std::io::Error>,
    ) -> Result<MarkOutcome, ExecutorError> {
        let output = result.map_err(|e| {
            tracing::error!(job_id, error = %e, "Failed to launch sandbox");
            ExecutorError::Transient(format!("failed to launch sandbox: {}", e))
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code();

        if exit_code == Some(DOCKER_RUN_FAILURE) {
            return Err(ExecutorError::Transient(if stderr.is_empty() {
                "docker could not start the container".to_string()
            } else {
                stderr
            }));
        }

        let passed = output.status.success();
        let feedback = match (passed, stdout.is_empty(), stderr.is_empty()) {
            (true, true, _) => None,
            (true, false, _) => Some(stdout),
            (false, _, false) => Some(stderr),
            (false, true, true) => Some(format!("Exit code: {:?}", exit_code)),
            (false, false, true) => Some(stdout),
        };

        tracing::info!(job_id, passed, exit_code = ?exit_code, "Sandbox run finished");

        Ok(MarkOutcome {
            mark: if passed { 100 } else { 0 },
            feedback,
            exit_code,
        })
    }
}

#[async_trait]
impl MarkingExecutor for SandboxExecutor {
    async fn execute(&self, job: &Job) -> Result<MarkOutcome, ExecutorError> {
        let command = job
            .payload
            .get("command")
            .and_then(|c| c.as_str())
            .ok_or_else(|| ExecutorError::Permanent("payload has no 'command' string".into()))?;

        tracing::info!(job_id = job.id, kind = %job.kind, image = %self.config.image, "Running sandbox");

        let result = Command::new("docker")
            .args(self.docker_args(command))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        Self::process_output(job.id, result)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::{ExitStatus, Output};

    fn output(code: i32, stdout: &str, stderr: &str) -> Output {
        Output {
            status: ExitStatus::from_raw(code << 8),
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[test]
    fn docker_args_apply_isolation() {
        let exec = SandboxExecutor::new(SandboxConfig::default());
        let args = exec.docker_args("java Main");
        assert!(args.contains(&"--network=none".to_string()));
        assert!(args.contains(&"--memory=256m".to_string()));
        assert!(args.contains(&"--cpus=0.5".to_string()));
        assert!(args.contains(&"--read-only".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("java Main"));
    }

    #[test]
    fn passing_run_scores_full_marks() {
        let outcome =
            SandboxExecutor::process_output(1, Ok(output(0, "all tests passed\n", ""))).unwrap();
        assert_eq!(outcome.mark, 100);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.feedback.as_deref(), Some("all tests passed\n"));
    }

    #[test]
    fn failing_run_is_a_mark_not_an_error() {
        let outcome =
            SandboxExecutor::process_output(1, Ok(output(1, "", "assertion failed"))).unwrap();
        assert_eq!(outcome.mark, 0);
        assert_eq!(outcome.feedback.as_deref(), Some("assertion failed"));
    }

    #[test]
    fn docker_failure_is_transient() {
        let err = SandboxExecutor::process_output(1, Ok(output(125, "", "daemon not running")))
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn launch_failure_is_transient() {
        let err = SandboxExecutor::process_output(
            1,
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "docker")),
        )
        .unwrap_err();
        assert!(err.is_transient());
    }
}
