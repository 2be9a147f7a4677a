//! Worker runtime abstraction.
//!
//! The cluster never creates processes itself; it asks a [`WorkerRuntime`]
//! to provision, start and stop workers. [`DockerRuntime`] is the production
//! implementation. Tests plug in their own.
//!
//! # Example
//!
//! ```ignore
//! use nmc::runtime::{DockerRuntime, WorkerRuntime};
//!
//! let runtime = DockerRuntime::connect().await?;
//! runtime.pull_base_image("docker.io/library/nginx:latest").await?;
//! let handle = runtime.provision(&spec).await?;
//! runtime.start(&handle).await?;
//! ```

mod docker;

pub use docker::DockerRuntime;

use async_trait::async_trait;
use std::time::Duration;

use crate::cluster::{RuntimeHandle, WorkerSpec};
use crate::error::Result;

/// Creates, starts and stops backend workers.
///
/// All implementations must be thread-safe (`Send + Sync`): the bootstrap
/// sequence, repair tasks and the shutdown controller call into the same
/// runtime concurrently.
#[async_trait]
pub trait WorkerRuntime: Send + Sync + 'static {
    /// Make the base image available locally.
    ///
    /// Called once during bootstrap, not per worker.
    ///
    /// # Errors
    ///
    /// Returns `Error::ImagePull` if the image cannot be fetched.
    async fn pull_base_image(&self, image: &str) -> Result<()>;

    /// Create (but do not start) a worker for `spec`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Provision` if the runtime refuses the worker.
    async fn provision(&self, spec: &WorkerSpec) -> Result<RuntimeHandle>;

    /// Start a provisioned worker.
    ///
    /// # Errors
    ///
    /// Returns `Error::Start` if the worker cannot be started.
    async fn start(&self, handle: &RuntimeHandle) -> Result<()>;

    /// Stop a worker, giving it `timeout` to exit gracefully.
    ///
    /// Stopping a worker that is already gone is not an error for callers to
    /// act on; implementations may still report it.
    ///
    /// # Errors
    ///
    /// Returns `Error::Stop` if the runtime could not stop the worker.
    async fn stop(&self, handle: &RuntimeHandle, timeout: Duration) -> Result<()>;
}
