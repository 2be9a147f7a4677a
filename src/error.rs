//! Error types for the mini-cluster.
//!
//! Errors are split by where they surface: bootstrap errors abort the
//! process, request-path errors become a single failed HTTP response, and
//! repair/shutdown errors are logged and never cross into the serving path.

use std::time::Duration;

/// Result type for cluster operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Cluster errors with structured context.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed or inconsistent configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The base image could not be pulled.
    #[error("failed to pull image '{image}': {reason}")]
    ImagePull { image: String, reason: String },

    /// The runtime could not create a worker.
    #[error("failed to provision worker '{worker}': {reason}")]
    Provision { worker: String, reason: String },

    /// The runtime created a worker but could not start it.
    #[error("failed to start worker '{worker}': {reason}")]
    Start { worker: String, reason: String },

    /// The runtime could not stop a worker.
    #[error("failed to stop worker '{worker}': {reason}")]
    Stop { worker: String, reason: String },

    /// A runtime operation exceeded its deadline.
    #[error("{operation} of worker '{worker}' timed out after {}s", timeout.as_secs())]
    Timeout {
        operation: &'static str,
        worker: String,
        timeout: Duration,
    },

    /// The bootstrap health probe never got an answer.
    #[error("no answer from {address} after {attempts} probe attempts")]
    ReadinessExhausted { address: String, attempts: u32 },

    /// A proxied request could not reach its worker.
    #[error("worker '{worker}' unreachable: {source}")]
    Forward {
        worker: String,
        #[source]
        source: reqwest::Error,
    },

    /// Traffic arrived before the readiness gate opened.
    #[error("cluster is not ready")]
    NotReady,

    /// A forwarding handler could not be built.
    #[error("failed to build proxy for worker '{worker}': {reason}")]
    ProxyBuild { worker: String, reason: String },

    /// IO error with context.
    #[error("IO error in {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Create a configuration error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config(reason.into())
    }

    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn image_pull(image: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ImagePull {
            image: image.into(),
            reason: reason.into(),
        }
    }

    pub fn provision(worker: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Provision {
            worker: worker.into(),
            reason: reason.into(),
        }
    }

    pub fn start(worker: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Start {
            worker: worker.into(),
            reason: reason.into(),
        }
    }

    pub fn stop(worker: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Stop {
            worker: worker.into(),
            reason: reason.into(),
        }
    }

    /// Create a timeout error for a named runtime operation.
    pub fn timeout(operation: &'static str, worker: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation,
            worker: worker.into(),
            timeout,
        }
    }

    /// HTTP status code used when this error ends a client request.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Forward { .. } | Self::NotReady => 503,
            Self::Timeout { .. } => 504,
            Self::Config(_)
            | Self::ImagePull { .. }
            | Self::Provision { .. }
            | Self::Start { .. }
            | Self::Stop { .. }
            | Self::ReadinessExhausted { .. }
            | Self::ProxyBuild { .. }
            | Self::Io { .. } => 500,
        }
    }

    /// Whether this error must abort startup when it happens during bootstrap.
    ///
    /// Worker-level errors are only fatal during bootstrap; during repair the
    /// same errors degrade a single slot.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::ImagePull { .. } | Self::ReadinessExhausted { .. }
        )
    }
}
