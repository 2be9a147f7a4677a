//! Worker specifications and the per-slot instance record.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use super::proxy::ForwardingHandler;

/// Lifecycle state of the worker occupying a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// The runtime is creating or starting the worker.
    Provisioning,
    /// The worker is started and its handler is installed.
    Running,
    /// The last repair cycle could not bring the worker back.
    Failed,
    /// The worker is being stopped for shutdown.
    Terminating,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Terminating => "terminating",
        };
        f.write_str(s)
    }
}

/// Host directory mounted into a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: String,
}

/// Immutable description of a worker slot.
///
/// The same spec is reused for every replacement, so a repaired slot keeps
/// its port, image and mounts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    /// Human-readable name, also used as the container name.
    pub name: String,
    /// Port published on the host; the proxy connects here.
    pub host_port: u16,
    /// Port the backend listens on inside the worker.
    pub container_port: u16,
    /// Runtime image reference.
    pub image: String,
    pub mount: Option<BindMount>,
}

impl WorkerSpec {
    /// Address the proxy forwards to (e.g., "127.0.0.1:3001").
    pub fn origin(&self) -> String {
        format!("127.0.0.1:{}", self.host_port)
    }

    /// Get the full URL for a given path.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.origin(), path)
    }
}

/// Opaque identifier the runtime hands back for a provisioned worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuntimeHandle(String);

impl RuntimeHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RuntimeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Container ids are long; the short form is what `docker ps` shows.
        f.write_str(self.0.get(..12).unwrap_or(&self.0))
    }
}

/// The record held in a pool slot.
///
/// Cloning is cheap and yields a snapshot; the pool replaces instances
/// wholesale rather than mutating them.
#[derive(Debug, Clone)]
pub struct WorkerInstance {
    pub spec: Arc<WorkerSpec>,
    pub handle: RuntimeHandle,
    pub proxy: Arc<ForwardingHandler>,
    pub state: WorkerState,
}

impl WorkerInstance {
    /// A freshly started worker.
    pub fn running(
        spec: Arc<WorkerSpec>,
        handle: RuntimeHandle,
        proxy: Arc<ForwardingHandler>,
    ) -> Self {
        Self {
            spec,
            handle,
            proxy,
            state: WorkerState::Running,
        }
    }

    #[must_use]
    pub fn with_state(mut self, state: WorkerState) -> Self {
        self.state = state;
        self
    }
}
