// src/sandbox/docker.rs
// Container-backed execution: one fresh container per call, resource
// limits applied, removal guaranteed on every exit path.

use crate::config::DockerConfig;
use crate::error::{AgentError, Result};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Raw output of one sandboxed execution
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Stateless sandbox executor driving the docker CLI. Safe to share across
/// turns; every call launches and removes its own container.
pub struct DockerSandbox {
    config: DockerConfig,
}

impl DockerSandbox {
    pub fn new(config: DockerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DockerConfig {
        &self.config
    }

    fn container_name() -> String {
        format!("ba-sbx-{}", uuid::Uuid::new_v4().simple())
    }

    /// Build the `docker run` argument list. The workspace mount, when
    /// present, is read-only; there are no writable bind mounts.
    fn run_args(
        &self,
        name: &str,
        memory_limit: &str,
        workspace: Option<&PathBuf>,
        command: &[String],
    ) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--memory".to_string(),
            memory_limit.to_string(),
            "--cpus".to_string(),
            format!("{}", self.config.cpu_limit),
        ];
        if self.config.network_disabled {
            args.push("--network".to_string());
            args.push("none".to_string());
        }
        if let Some(dir) = workspace {
            args.push("-v".to_string());
            args.push(format!("{}:/workspace:ro", dir.display()));
        }
        args.push(self.config.image.clone());
        args.extend(command.iter().cloned());
        args
    }

    /// Execute validated Python code in a fresh container. The source is
    /// written to a temp workspace mounted read-only at `/workspace`.
    pub async fn execute_code(&self, code: &str, timeout_secs: Option<u64>) -> Result<ExecOutput> {
        let workspace =
            std::env::temp_dir().join(format!("ba-sandbox-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::create_dir_all(&workspace).await?;
        tokio::fs::write(workspace.join("main.py"), code).await?;

        let result = self
            .run_container(
                &self.config.code_memory_limit,
                Some(&workspace),
                &[
                    "python".to_string(),
                    "/workspace/main.py".to_string(),
                ],
                timeout_secs.unwrap_or(self.config.timeout_secs),
            )
            .await;

        if let Err(e) = tokio::fs::remove_dir_all(&workspace).await {
            warn!("Failed to remove sandbox workspace {:?}: {}", workspace, e);
        }
        result
    }

    /// Execute a validated command line in a fresh container.
    pub async fn execute_command(
        &self,
        command: &str,
        timeout_secs: Option<u64>,
    ) -> Result<ExecOutput> {
        self.run_container(
            &self.config.command_memory_limit,
            None,
            &["sh".to_string(), "-c".to_string(), command.to_string()],
            timeout_secs.unwrap_or(self.config.timeout_secs),
        )
        .await
    }

    async fn run_container(
        &self,
        memory_limit: &str,
        workspace: Option<&PathBuf>,
        command: &[String],
        timeout_secs: u64,
    ) -> Result<ExecOutput> {
        let name = Self::container_name();
        let args = self.run_args(&name, memory_limit, workspace.map(|w| w.to_owned()).as_ref(), command);
        debug!("Sandbox launch: docker {}", args.join(" "));

        let mut child = Command::new("docker")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::Internal(format!("failed to launch docker: {}", e)))?;

        let waited =
            tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait_with_output()).await;

        match waited {
            Ok(Ok(output)) => {
                // --rm removes the container; force-remove covers daemon
                // hiccups so nothing lingers.
                Self::force_remove(&name).await;
                Ok(ExecOutput {
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                    exit_code: output.status.code().unwrap_or(-1),
                })
            }
            Ok(Err(e)) => {
                Self::force_remove(&name).await;
                Err(AgentError::Internal(format!("docker wait failed: {}", e)))
            }
            Err(_) => {
                // Timeout: the child handle was consumed by wait_with_output's
                // future being dropped, which kills the CLI process; the
                // container itself still needs to go.
                Self::force_remove(&name).await;
                Err(AgentError::Timeout(timeout_secs))
            }
        }
    }

    /// Best-effort container removal, used on every exit path.
    async fn force_remove(name: &str) {
        let _ = Command::new("docker")
            .args(["rm", "-f", name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
    }

    /// Probe whether the container runtime works at all.
    pub async fn health_check(&self) -> bool {
        let status = Command::new("docker")
            .args(["version", "--format", "{{.Server.Version}}"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        matches!(status, Ok(s) if s.success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox() -> DockerSandbox {
        DockerSandbox::new(DockerConfig::default())
    }

    #[test]
    fn test_run_args_include_limits() {
        let sb = sandbox();
        let args = sb.run_args("ba-sbx-1", "128m", None, &["sh".into(), "-c".into(), "echo hi".into()]);
        let joined = args.join(" ");
        assert!(joined.contains("--rm"));
        assert!(joined.contains("--memory 128m"));
        assert!(joined.contains("--cpus 0.5"));
        assert!(joined.contains("--network none"));
        assert!(joined.contains("python:3.12-slim"));
        assert!(joined.ends_with("sh -c echo hi"));
    }

    #[test]
    fn test_run_args_workspace_is_read_only() {
        let sb = sandbox();
        let dir = PathBuf::from("/tmp/ws");
        let args = sb.run_args(
            "ba-sbx-2",
            "512m",
            Some(&dir),
            &["python".into(), "/workspace/main.py".into()],
        );
        assert!(args.iter().any(|a| a == "/tmp/ws:/workspace:ro"));
        // No writable mounts anywhere
        assert!(!args.iter().any(|a| a.contains(":rw")));
    }

    #[test]
    fn test_run_args_network_enabled_when_configured() {
        let mut config = DockerConfig::default();
        config.network_disabled = false;
        let sb = DockerSandbox::new(config);
        let args = sb.run_args("n", "128m", None, &["true".into()]);
        assert!(!args.iter().any(|a| a == "--network"));
    }

    #[test]
    fn test_container_names_are_unique() {
        let a = DockerSandbox::container_name();
        let b = DockerSandbox::container_name();
        assert_ne!(a, b);
        assert!(a.starts_with("ba-sbx-"));
    }
}
