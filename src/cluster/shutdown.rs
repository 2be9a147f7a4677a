//! Orderly shutdown on SIGINT/SIGTERM.
//!
//! The first signal closes the pool and stops every worker concurrently,
//! each under its own deadline, while repair cycles still in flight finish
//! and stop their replacements. A second signal during that drain exits the
//! process immediately.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use tracing::{error, info, warn};

use super::pool::Pool;
use super::repair::RepairOrchestrator;
use super::with_deadline;
use crate::error::{Error, Result};
use crate::runtime::WorkerRuntime;

/// Extra time allowed on top of the worker's stop grace period before a
/// stop call is abandoned.
const STOP_SLACK: Duration = Duration::from_secs(5);

/// Exit status used when a second signal interrupts shutdown.
const FORCED_EXIT_CODE: i32 = 130;

/// Result of a shutdown run.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Workers stopped cleanly.
    pub stopped: Vec<String>,
    /// Workers whose stop failed or timed out.
    pub failed: Vec<(String, Error)>,
    /// Repair cycles still running when the wait for them expired.
    pub repairs_pending: usize,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.repairs_pending == 0
    }
}

/// Stops every worker in the pool, once.
pub struct ShutdownController {
    runtime: Arc<dyn WorkerRuntime>,
    pool: Arc<Pool>,
    repair: Arc<RepairOrchestrator>,
    stop_timeout: Duration,
    started: AtomicBool,
}

impl ShutdownController {
    pub fn new(
        runtime: Arc<dyn WorkerRuntime>,
        pool: Arc<Pool>,
        repair: Arc<RepairOrchestrator>,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            pool,
            repair,
            stop_timeout,
            started: AtomicBool::new(false),
        }
    }

    /// Close the pool, stop every worker in it and wait for in-flight
    /// repairs.
    ///
    /// Runs at most once; later calls return `None` without touching any
    /// worker. A worker that fails to stop is logged and skipped. Repairs get
    /// one full cycle's worth of time to finish; a cycle that finishes after
    /// the close stops its own replacement.
    pub async fn shutdown(&self) -> Option<ShutdownReport> {
        if self.started.swap(true, Ordering::AcqRel) {
            warn!("Shutdown already in progress");
            return None;
        }

        let instances = self.pool.close();
        info!(workers = instances.len(), "Stopping workers");

        let deadline = self.stop_timeout + STOP_SLACK;
        let stops = instances.iter().map(|instance| async move {
            let name = instance.spec.name.as_str();
            info!(worker = %name, port = instance.spec.host_port, handle = %instance.handle, "Stopping worker");
            let result = with_deadline(
                "stop",
                name,
                deadline,
                self.runtime.stop(&instance.handle, self.stop_timeout),
            )
            .await;
            (name.to_string(), result)
        });

        let repairs = self.repair.in_flight();
        if repairs > 0 {
            info!(repairs, "Waiting for in-flight repairs");
        }
        let (results, drained) = tokio::join!(
            join_all(stops),
            self.repair.drain(self.repair.config().cycle_bound())
        );

        let mut report = ShutdownReport::default();
        if !drained {
            report.repairs_pending = self.repair.in_flight();
            error!(
                repairs = report.repairs_pending,
                "Repairs did not finish, their workers may be left running"
            );
        }
        for (name, result) in results {
            match result {
                Ok(()) => report.stopped.push(name),
                Err(e) => {
                    error!(worker = %name, error = %e, "Worker did not stop cleanly");
                    report.failed.push((name, e));
                },
            }
        }

        info!(
            stopped = report.stopped.len(),
            failed = report.failed.len(),
            "All workers stopped"
        );
        Some(report)
    }
}

/// Wait for SIGINT or SIGTERM. Returns the signal name.
///
/// # Errors
///
/// Returns `Error::Io` if the signal handlers cannot be installed.
#[cfg(unix)]
pub async fn wait_for_signal() -> Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())
        .map_err(|e| Error::io("installing SIGTERM handler", e))?;

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.map_err(|e| Error::io("installing SIGINT handler", e))?;
            Ok("SIGINT")
        },
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

/// Wait for Ctrl+C. Returns the signal name.
#[cfg(not(unix))]
pub async fn wait_for_signal() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| Error::io("installing Ctrl+C handler", e))?;
    Ok("SIGINT")
}

/// Exit immediately if another signal arrives while workers are draining.
pub fn force_exit_on_second_signal() {
    tokio::spawn(async {
        if let Ok(signal) = wait_for_signal().await {
            warn!(signal, "Second signal received, exiting without waiting for workers");
            std::process::exit(FORCED_EXIT_CODE);
        }
    });
}
