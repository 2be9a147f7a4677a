//! Repair cycles for failed workers.
//!
//! A repair cycle replaces the worker in one slot with a like-for-like
//! restart: stop the old worker, provision and start a new one from the
//! same spec, bind a fresh forwarding handler and install it in place.
//! Each step runs at most once per cycle; a cycle that fails leaves the slot
//! `Failed` and the next request failure on that slot starts a new cycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::pool::{Pool, PoolClosed, RepairClaim};
use super::proxy::ProxyFactory;
use super::with_deadline;
use super::worker::{WorkerInstance, WorkerState};
use crate::error::Error;
use crate::runtime::WorkerRuntime;

/// Timeouts applied to runtime calls during repair.
#[derive(Debug, Clone)]
pub struct RepairConfig {
    /// Deadline for provision and start.
    pub step_timeout: Duration,
    /// Grace period passed to the runtime when stopping the old worker.
    /// The stop step's deadline is this plus `step_timeout`.
    pub stop_timeout: Duration,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(60),
        }
    }
}

impl RepairConfig {
    /// Longest a single cycle can run: two stops (the old worker and, after
    /// close, the orphaned replacement) plus provision and start.
    pub fn cycle_bound(&self) -> Duration {
        (self.stop_timeout + self.step_timeout) * 2 + self.step_timeout * 2
    }
}

/// Step at which a repair cycle was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairStep {
    Provision,
    Start,
    BuildProxy,
}

/// How a repair cycle ended.
#[derive(Debug)]
pub enum RepairOutcome {
    /// A new worker is installed and running.
    Repaired,
    /// A step failed; the slot is left `Failed`.
    Abandoned { step: RepairStep, error: Error },
    /// The pool closed for shutdown mid-cycle; the new worker was stopped
    /// instead of installed.
    Discarded,
}

impl RepairOutcome {
    pub fn is_repaired(&self) -> bool {
        matches!(self, Self::Repaired)
    }
}

/// Replaces failed workers without blocking the request path.
pub struct RepairOrchestrator {
    runtime: Arc<dyn WorkerRuntime>,
    factory: ProxyFactory,
    pool: Arc<Pool>,
    config: RepairConfig,
    /// Cycles spawned and not yet finished.
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Counts a spawned cycle until its task ends, including by abort or panic.
struct InFlight(Arc<RepairOrchestrator>);

impl InFlight {
    fn enter(orchestrator: Arc<RepairOrchestrator>) -> Self {
        orchestrator.in_flight.fetch_add(1, Ordering::AcqRel);
        Self(orchestrator)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl RepairOrchestrator {
    pub fn new(
        runtime: Arc<dyn WorkerRuntime>,
        factory: ProxyFactory,
        pool: Arc<Pool>,
        config: RepairConfig,
    ) -> Self {
        Self {
            runtime,
            factory,
            pool,
            config,
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    pub fn config(&self) -> &RepairConfig {
        &self.config
    }

    /// Number of spawned cycles that have not finished yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Wait until every spawned cycle has finished, for at most `bound`.
    ///
    /// Returns `false` if cycles were still running when the bound expired.
    /// Used after the pool is closed, when each remaining cycle is about to
    /// stop whatever it provisioned.
    pub async fn drain(&self, bound: Duration) -> bool {
        let idle = async {
            loop {
                let notified = self.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.in_flight() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(bound, idle).await.is_ok()
    }

    /// Start a background repair of `index` unless one is already running.
    ///
    /// Returns the task handle when a new cycle was launched, `None` when the
    /// slot already has a repair in flight.
    pub fn trigger(self: &Arc<Self>, index: usize) -> Option<JoinHandle<RepairOutcome>> {
        let claim = self.pool.try_begin_repair(index)?;
        Some(self.spawn(claim))
    }

    /// Run a repair cycle for a claimed slot on a background task.
    ///
    /// The claim is released when the cycle ends. The task is counted by
    /// [`drain`](Self::drain) from the moment this returns.
    pub fn spawn(self: &Arc<Self>, claim: RepairClaim) -> JoinHandle<RepairOutcome> {
        let this = Arc::clone(self);
        let in_flight = InFlight::enter(Arc::clone(self));
        tokio::spawn(async move {
            let outcome = this.repair(claim.index()).await;
            drop(claim);
            drop(in_flight);
            outcome
        })
    }

    /// Run one repair cycle for the slot at `index`.
    ///
    /// Callers are responsible for holding the slot's [`RepairClaim`];
    /// [`trigger`](Self::trigger) does this.
    pub async fn repair(&self, index: usize) -> RepairOutcome {
        let Some(current) = self.pool.get(index) else {
            return RepairOutcome::Discarded;
        };
        if self.pool.is_closed() {
            return RepairOutcome::Discarded;
        }

        let spec = Arc::clone(&current.spec);
        let worker = spec.name.as_str();
        info!(slot = index, worker = %worker, handle = %current.handle, "Repairing worker");
        self.pool.set_state(index, WorkerState::Provisioning);

        // 1. Stop the old worker. It is usually already dead, which is why
        //    we are here, so a failure does not stop the cycle.
        let stop_deadline = self.config.stop_timeout + self.config.step_timeout;
        let stopped = with_deadline(
            "stop",
            worker,
            stop_deadline,
            self.runtime.stop(&current.handle, self.config.stop_timeout),
        )
        .await;
        if let Err(e) = stopped {
            warn!(slot = index, worker = %worker, error = %e, "Could not stop worker, continuing");
        }

        // 2. Provision a replacement from the unchanged spec.
        let handle = match with_deadline(
            "provision",
            worker,
            self.config.step_timeout,
            self.runtime.provision(&spec),
        )
        .await
        {
            Ok(handle) => handle,
            Err(e) => {
                self.pool.set_state(index, WorkerState::Failed);
                return self.abandon(index, RepairStep::Provision, e);
            },
        };

        // 3. Start it. From here on the slot records the new handle, so the
        //    next cycle stops the new container rather than the old one.
        let started = with_deadline(
            "start",
            worker,
            self.config.step_timeout,
            self.runtime.start(&handle),
        )
        .await;
        if let Err(e) = started {
            let failed = WorkerInstance {
                handle,
                ..current
            }
            .with_state(WorkerState::Failed);
            self.park(index, failed).await;
            return self.abandon(index, RepairStep::Start, e);
        }

        // 4. Bind a new forwarding handler to the slot's fixed port.
        let proxy = match self.factory.build(&spec) {
            Ok(proxy) => proxy,
            Err(e) => {
                let failed = WorkerInstance {
                    handle,
                    ..current
                }
                .with_state(WorkerState::Failed);
                self.park(index, failed).await;
                return self.abandon(index, RepairStep::BuildProxy, e);
            },
        };

        // 5. Install.
        let replacement = WorkerInstance::running(Arc::clone(&spec), handle, proxy);
        match self.pool.replace(index, replacement) {
            Ok(_) => {
                info!(slot = index, worker = %worker, "Proxy available");
                RepairOutcome::Repaired
            },
            Err(PoolClosed(orphan)) => {
                self.stop_orphan(&orphan).await;
                RepairOutcome::Discarded
            },
        }
    }

    /// Record a half-repaired instance in the slot, or stop it if the pool
    /// already closed.
    async fn park(&self, index: usize, instance: WorkerInstance) {
        if let Err(PoolClosed(orphan)) = self.pool.replace(index, instance) {
            self.stop_orphan(&orphan).await;
        }
    }

    async fn stop_orphan(&self, orphan: &WorkerInstance) {
        warn!(
            worker = %orphan.spec.name,
            handle = %orphan.handle,
            "Pool closed during repair, stopping replacement"
        );
        let stopped = with_deadline(
            "stop",
            &orphan.spec.name,
            self.config.stop_timeout + self.config.step_timeout,
            self.runtime.stop(&orphan.handle, self.config.stop_timeout),
        )
        .await;
        if let Err(e) = stopped {
            error!(worker = %orphan.spec.name, error = %e, "Could not stop replacement worker");
        }
    }

    fn abandon(&self, index: usize, step: RepairStep, error: Error) -> RepairOutcome {
        error!(
            slot = index,
            step = ?step,
            error = %error,
            "Repair abandoned, slot left failed until the next failure"
        );
        RepairOutcome::Abandoned { step, error }
    }
}
