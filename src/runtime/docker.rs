//! Docker-backed worker runtime.
//!
//! Drives the `docker` CLI rather than the Engine API so the binary has no
//! extra client dependency and works wherever `docker` is on `PATH`
//! (including rootless and remote contexts).

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use super::WorkerRuntime;
use crate::cluster::{RuntimeHandle, WorkerSpec};
use crate::error::{Error, Result};

/// Worker runtime that manages one container per worker.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    program: String,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the `docker` CLI is missing or the daemon
    /// does not answer.
    pub async fn connect() -> Result<Self> {
        Self::with_program("docker").await
    }

    /// Connect using a specific CLI binary (e.g. `podman`).
    pub async fn with_program(program: impl Into<String>) -> Result<Self> {
        let runtime = Self {
            program: program.into(),
        };
        let version = runtime
            .run(&["version", "--format", "{{.Server.Version}}"])
            .await
            .map_err(|reason| {
                Error::config(format!(
                    "'{}' is not available: {reason}. Please install Docker and make sure the daemon is running.",
                    runtime.program
                ))
            })?;
        info!(program = %runtime.program, server_version = %version, "Connected to container runtime");
        Ok(runtime)
    }

    /// Run a CLI command, returning trimmed stdout or trimmed stderr.
    async fn run(&self, args: &[&str]) -> std::result::Result<String, String> {
        debug!(program = %self.program, args = ?args, "Running container command");

        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("failed to execute '{}': {e}", self.program))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.is_empty() {
                Err(format!("exited with {}", output.status))
            } else {
                Err(stderr)
            }
        }
    }
}

/// Arguments for `docker create`.
fn create_args(spec: &WorkerSpec) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "--publish".to_string(),
        format!("{}:{}/tcp", spec.host_port, spec.container_port),
    ];
    if let Some(mount) = &spec.mount {
        args.push("--mount".to_string());
        args.push(format!(
            "type=bind,source={},target={},readonly",
            mount.source.display(),
            mount.target
        ));
    }
    args.push(spec.image.clone());
    args
}

#[async_trait]
impl WorkerRuntime for DockerRuntime {
    async fn pull_base_image(&self, image: &str) -> Result<()> {
        self.run(&["pull", "--quiet", image])
            .await
            .map(|_| ())
            .map_err(|reason| Error::image_pull(image, reason))
    }

    async fn provision(&self, spec: &WorkerSpec) -> Result<RuntimeHandle> {
        let args = create_args(spec);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let id = self
            .run(&args)
            .await
            .map_err(|reason| Error::provision(&spec.name, reason))?;
        Ok(RuntimeHandle::new(id))
    }

    async fn start(&self, handle: &RuntimeHandle) -> Result<()> {
        self.run(&["start", handle.as_str()])
            .await
            .map(|_| ())
            .map_err(|reason| Error::start(handle.to_string(), reason))
    }

    async fn stop(&self, handle: &RuntimeHandle, timeout: Duration) -> Result<()> {
        let secs = timeout.as_secs().to_string();
        let stopped = self.run(&["stop", "--time", &secs, handle.as_str()]).await;

        // Remove the container so its name is free for the replacement,
        // even if the graceful stop failed.
        let removed = self.run(&["rm", "--force", handle.as_str()]).await;

        match (stopped, removed) {
            (_, Ok(_)) => Ok(()),
            (Err(reason), Err(_)) | (Ok(_), Err(reason)) => {
                Err(Error::stop(handle.to_string(), reason))
            },
        }
    }
}
