//! Configuration for the mini-cluster.
//!
//! Values come from three layers, highest precedence first: command-line
//! flags, an optional TOML file with a `[cluster]` table, and the defaults
//! below (which match the original `nginx-mini-cluster` CLI).
//!
//! ```toml
//! [cluster]
//! site = "./site"
//! count = 3
//! port = 3001
//! server_port = 3000
//! image_version = "1.27"
//! probe_attempts = 20
//! ```

use serde::Deserialize;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cluster::{BindMount, ProbeConfig, WorkerSpec};
use crate::error::{Error, Result};

/// Default backend image (without tag).
pub const DEFAULT_IMAGE: &str = "docker.io/library/nginx";
/// Directory nginx serves static files from inside the container.
pub const DEFAULT_MOUNT_TARGET: &str = "/usr/share/nginx/html";
/// First worker port.
pub const DEFAULT_WORKER_PORT: u16 = 3001;
/// Public listener port.
pub const DEFAULT_SERVER_PORT: u16 = 3000;
pub const DEFAULT_COUNT: usize = 2;

/// Result of configuration validation.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Non-fatal warnings that should be logged but don't prevent operation.
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if there are any warnings.
    #[must_use]
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Cluster configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterConfig {
    /// Directory with the static content every worker serves.
    pub site: PathBuf,
    /// Number of workers in the pool.
    pub count: usize,
    /// Host port of the first worker; workers occupy `port..port + count`.
    pub port: u16,
    /// Public listener port.
    pub server_port: u16,
    /// Public listener address.
    pub bind: IpAddr,
    /// Backend image without tag.
    pub image: String,
    /// Backend image tag.
    pub image_version: String,
    /// Port the backend listens on inside each worker.
    pub container_port: u16,
    /// Bind-mount target for `site` inside each worker.
    pub mount_target: String,
    /// Readiness probe attempts before startup is abandoned.
    pub probe_attempts: u32,
    pub probe_interval_ms: u64,
    /// Timeout for each readiness probe request.
    pub probe_timeout_ms: u64,
    /// Path requested by the readiness probe.
    pub probe_path: String,
    /// Deadline for a single proxied request.
    pub request_timeout_secs: u64,
    /// Deadline for each runtime call during repair.
    pub step_timeout_secs: u64,
    /// Grace period given to a worker when it is stopped.
    pub stop_timeout_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let site = std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("site");

        Self {
            site,
            count: DEFAULT_COUNT,
            port: DEFAULT_WORKER_PORT,
            server_port: DEFAULT_SERVER_PORT,
            bind: IpAddr::from([0, 0, 0, 0]),
            image: DEFAULT_IMAGE.to_string(),
            image_version: "latest".to_string(),
            container_port: 80,
            mount_target: DEFAULT_MOUNT_TARGET.to_string(),
            probe_attempts: 30,
            probe_interval_ms: 500,
            probe_timeout_ms: 1000,
            probe_path: "/".to_string(),
            request_timeout_secs: 30,
            step_timeout_secs: 60,
            stop_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    cluster: ClusterConfig,
}

impl ClusterConfig {
    /// Load configuration from a TOML file.
    ///
    /// Missing keys fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid TOML.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| Error::io(format!("reading {}", path.display()), e))?;

        toml::from_str::<ConfigFile>(&content)
            .map(|file| file.cluster)
            .map_err(|e| Error::config(format!("{}: {e}", path.display())))
    }

    /// Parse configuration from TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        let file: ConfigFile =
            toml::from_str(content).map_err(|e| Error::config(e.to_string()))?;
        Ok(file.cluster)
    }

    /// Validate configuration with comprehensive checks.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` listing every problem found:
    /// - `count` below 1
    /// - a worker port range that does not fit in `u16`
    /// - a public port inside the worker port range
    /// - zero probe attempts
    pub fn validate(&self) -> Result<ValidationResult> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if self.count < 1 {
            errors.push("at least 1 worker must be specified".to_string());
        }

        let last_port = u16::try_from(self.count.saturating_sub(1))
            .ok()
            .and_then(|offset| self.port.checked_add(offset));
        match last_port {
            None => errors.push(format!(
                "{} workers starting at port {} exceed the port range",
                self.count, self.port
            )),
            Some(last) if self.count >= 1 => {
                if (self.port..=last).contains(&self.server_port) {
                    errors.push(format!(
                        "server port {} collides with worker ports {}-{}",
                        self.server_port, self.port, last
                    ));
                }
            },
            Some(_) => {},
        }

        if self.port == 0 {
            errors.push("worker port must be non-zero".to_string());
        }

        if self.probe_attempts == 0 {
            errors.push("probe_attempts must be at least 1".to_string());
        }

        if self.probe_timeout_ms == 0 {
            errors.push("probe_timeout_ms must be non-zero".to_string());
        }

        if self.image.trim().is_empty() {
            errors.push("image cannot be empty".to_string());
        }

        if !self.site.is_dir() {
            warnings.push(format!(
                "site directory {} does not exist; workers will serve nothing",
                self.site.display()
            ));
        }

        if !errors.is_empty() {
            return Err(Error::config(errors.join("; ")));
        }

        Ok(ValidationResult { warnings })
    }

    /// Full image reference, `image:tag`.
    pub fn image_ref(&self) -> String {
        format!("{}:{}", self.image, self.image_version)
    }

    /// Public listen address.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.server_port)
    }

    /// One spec per slot, in slot order.
    ///
    /// Call after [`validate`](Self::validate); ports past `u16::MAX` are
    /// not representable and are skipped.
    pub fn worker_specs(&self) -> Vec<WorkerSpec> {
        let image = self.image_ref();
        (0..self.count)
            .filter_map(|i| {
                let host_port = u16::try_from(i).ok()?.checked_add(self.port)?;
                Some(WorkerSpec {
                    name: format!("nginx-{host_port}"),
                    host_port,
                    container_port: self.container_port,
                    image: image.clone(),
                    mount: Some(BindMount {
                        source: self.site.clone(),
                        target: self.mount_target.clone(),
                    }),
                })
            })
            .collect()
    }

    pub fn probe_config(&self) -> ProbeConfig {
        ProbeConfig {
            attempts: self.probe_attempts,
            interval: Duration::from_millis(self.probe_interval_ms),
            path: self.probe_path.clone(),
            timeout: Duration::from_millis(self.probe_timeout_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}
