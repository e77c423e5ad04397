//! Process control for a self-managed backing store.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::Config;
use crate::error::LifecycleError;

/// Port the store listens on inside its container.
pub const CONTAINER_PORT: u16 = 6333;

/// Label attached to containers launched by anchorage.
pub const MANAGED_LABEL: &str = "anchorage.managed=true";

/// Starts and stops the backing store process.
#[async_trait]
pub trait Provisioner: Send + Sync + fmt::Debug {
    /// Host port of an instance that is already running, if any.
    async fn find_running(&self) -> Result<Option<u16>, LifecycleError>;

    /// Launch an instance listening on `port` with its storage at `data_dir`.
    ///
    /// Returns [`LifecycleError::PortInUse`] when the port was taken after
    /// it was allocated, so the caller can pick another one.
    async fn launch(&self, port: u16, data_dir: &Path) -> Result<(), LifecycleError>;

    /// Stop the instance, force-killing it once `grace` has elapsed.
    async fn terminate(&self, grace: Duration) -> Result<(), LifecycleError>;
}

/// Drives the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerProvisioner {
    container_name: String,
    image: String,
}

/// Captured result of one `docker` invocation.
struct DockerOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

impl DockerProvisioner {
    #[must_use]
    pub fn new(container_name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            container_name: container_name.into(),
            image: image.into(),
        }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.container_name, &config.image)
    }

    #[must_use]
    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    async fn docker(&self, args: &[&str]) -> Result<DockerOutput, LifecycleError> {
        log::debug!("docker {}", args.join(" "));
        let output = Command::new("docker")
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| LifecycleError::Launch {
                message: format!("could not run docker: {e}"),
            })?;
        Ok(DockerOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    fn run_args(&self, port: u16, data_dir: &Path) -> Vec<String> {
        vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            self.container_name.clone(),
            "--label".to_string(),
            MANAGED_LABEL.to_string(),
            "-p".to_string(),
            format!("127.0.0.1:{port}:{CONTAINER_PORT}"),
            "-v".to_string(),
            format!("{}:/qdrant/storage:z", data_dir.display()),
            self.image.clone(),
        ]
    }

    async fn run_container(&self, port: u16, data_dir: &Path) -> Result<DockerOutput, LifecycleError> {
        let args = self.run_args(port, data_dir);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.docker(&args).await
    }
}

/// Map a failed `docker run` to a lifecycle error.
fn classify_run_failure(port: u16, stderr: &str) -> LifecycleError {
    let lower = stderr.to_lowercase();
    if lower.contains("port is already allocated") || lower.contains("address already in use") {
        LifecycleError::PortInUse { port }
    } else {
        LifecycleError::Launch {
            message: stderr.to_string(),
        }
    }
}

/// Parse the host port from `docker port` output such as
/// `127.0.0.1:6334` or `0.0.0.0:6334\n[::]:6334`.
fn parse_host_port(output: &str) -> Option<u16> {
    output
        .lines()
        .filter_map(|line| line.trim().rsplit(':').next())
        .find_map(|port| port.parse().ok())
}

#[async_trait]
impl Provisioner for DockerProvisioner {
    async fn find_running(&self) -> Result<Option<u16>, LifecycleError> {
        let inspect = self
            .docker(&["inspect", "-f", "{{.State.Running}}", &self.container_name])
            .await?;
        if !inspect.success || inspect.stdout != "true" {
            return Ok(None);
        }

        let port_spec = format!("{CONTAINER_PORT}/tcp");
        let port = self
            .docker(&["port", &self.container_name, &port_spec])
            .await?;
        if !port.success {
            log::warn!(
                "Container '{}' is running but publishes no port: {}",
                self.container_name,
                port.stderr
            );
            return Ok(None);
        }
        Ok(parse_host_port(&port.stdout))
    }

    async fn launch(&self, port: u16, data_dir: &Path) -> Result<(), LifecycleError> {
        std::fs::create_dir_all(data_dir).map_err(|e| LifecycleError::Launch {
            message: format!("could not create data directory {}: {e}", data_dir.display()),
        })?;

        log::info!(
            "Starting container '{}' from {} on port {}",
            self.container_name,
            self.image,
            port
        );
        let mut output = self.run_container(port, data_dir).await?;

        if !output.success && output.stderr.contains("is already in use") {
            // A stopped container with our name is left over from a previous run.
            log::info!("Removing stale container '{}'", self.container_name);
            self.docker(&["rm", "-f", &self.container_name]).await?;
            output = self.run_container(port, data_dir).await?;
        }

        if output.success {
            Ok(())
        } else {
            Err(classify_run_failure(port, &output.stderr))
        }
    }

    async fn terminate(&self, grace: Duration) -> Result<(), LifecycleError> {
        let secs = grace.as_secs().to_string();
        log::info!("Stopping container '{}'", self.container_name);
        let stop = self
            .docker(&["stop", "-t", &secs, &self.container_name])
            .await?;
        if stop.success {
            return Ok(());
        }

        log::warn!(
            "docker stop failed for '{}', killing it: {}",
            self.container_name,
            stop.stderr
        );
        let kill = self.docker(&["kill", &self.container_name]).await?;
        if kill.success || kill.stderr.contains("No such container") {
            Ok(())
        } else {
            Err(LifecycleError::Terminate {
                message: kill.stderr,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_run_args() {
        let provisioner = DockerProvisioner::new("anchorage_qdrant", "qdrant/qdrant");
        let args = provisioner.run_args(6400, &PathBuf::from("/data/qdrant"));
        assert_eq!(args[0], "run");
        assert!(args.contains(&"127.0.0.1:6400:6333".to_string()));
        assert!(args.contains(&"/data/qdrant:/qdrant/storage:z".to_string()));
        assert!(args.contains(&MANAGED_LABEL.to_string()));
        assert_eq!(args.last().map(String::as_str), Some("qdrant/qdrant"));
    }

    #[test]
    fn test_parse_host_port() {
        assert_eq!(parse_host_port("127.0.0.1:6334"), Some(6334));
        assert_eq!(parse_host_port("0.0.0.0:6340\n[::]:6340"), Some(6340));
        assert_eq!(parse_host_port(""), None);
    }

    #[test]
    fn test_port_conflict_is_port_in_use() {
        let err = classify_run_failure(
            6333,
            "Error response from daemon: driver failed programming external connectivity: Bind for 127.0.0.1:6333 failed: port is already allocated",
        );
        assert_eq!(err, LifecycleError::PortInUse { port: 6333 });
    }

    #[test]
    fn test_other_failures_are_launch_errors() {
        let err = classify_run_failure(6333, "Unable to find image 'qdrant/nope:latest'");
        assert!(matches!(err, LifecycleError::Launch { .. }));
        assert!(err.is_fatal());
    }
}
