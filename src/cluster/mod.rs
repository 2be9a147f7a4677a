//! The worker pool and the reverse proxy in front of it.
//!
//! [`Cluster::bootstrap`] brings up every worker, waits for the first one to
//! answer, and returns a cluster ready to serve. [`Cluster::run`] then owns
//! the public listener until a shutdown signal arrives.
//!
//! ```text
//! request ──► Router ──► RoundRobin ──► Pool[slot] ──► ForwardingHandler ──► worker
//!                │                         ▲
//!                └── on failure ──► RepairOrchestrator (background)
//! ```

mod pool;
mod proxy;
mod readiness;
mod repair;
mod router;
mod selection;
mod server;
mod shutdown;
mod worker;


pub use pool::{Pool, PoolClosed, RepairClaim};
pub use proxy::{ForwardingHandler, ProxyFactory, is_hop_by_hop_header};
pub use readiness::{ProbeConfig, ReadinessGate, ReadinessState, ReadinessView, probe};
pub use repair::{RepairConfig, RepairOrchestrator, RepairOutcome, RepairStep};
pub use router::Router;
pub use selection::RoundRobin;
pub use server::{bind, serve};
pub use shutdown::{
    ShutdownController, ShutdownReport, force_exit_on_second_signal, wait_for_signal,
};
pub use worker::{BindMount, RuntimeHandle, WorkerInstance, WorkerSpec, WorkerState};

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::config::ClusterConfig;
use crate::error::{Error, Result};
use crate::runtime::WorkerRuntime;

/// Run a runtime call under a deadline; a timeout is a failure of the call.
pub(crate) async fn with_deadline<T>(
    operation: &'static str,
    worker: &str,
    deadline: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(deadline, fut)
        .await
        .unwrap_or_else(|_| Err(Error::timeout(operation, worker, deadline)))
}

/// A running pool of workers behind a round-robin proxy.
pub struct Cluster {
    pool: Arc<Pool>,
    router: Arc<Router>,
    repair: Arc<RepairOrchestrator>,
    shutdown: ShutdownController,
    gate: ReadinessGate,
    listen_addr: SocketAddr,
}

impl Cluster {
    /// Start every worker and wait until the cluster can take traffic.
    ///
    /// Steps, in order: pull the image, provision and start each worker,
    /// bind one forwarding handler per worker, then probe worker 0 until it
    /// answers. Any failure is fatal; workers started before the failure are
    /// stopped before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns the first runtime error, or `Error::ReadinessExhausted` if the
    /// probe never gets an answer.
    pub async fn bootstrap(config: &ClusterConfig, runtime: Arc<dyn WorkerRuntime>) -> Result<Self> {
        config.validate()?;

        let gate = ReadinessGate::new();
        let step_timeout = config.step_timeout();
        let stop_timeout = config.stop_timeout();

        let image = config.image_ref();
        info!(image = %image, "Pulling base image");
        with_deadline(
            "pull",
            &image,
            step_timeout,
            runtime.pull_base_image(&image),
        )
        .await?;

        let factory = ProxyFactory::new(config.request_timeout());
        let mut instances = Vec::with_capacity(config.count);
        for spec in config.worker_specs() {
            match start_worker(runtime.as_ref(), factory, spec, step_timeout, stop_timeout).await {
                Ok(instance) => instances.push(instance),
                Err(e) => {
                    error!(error = %e, "Worker failed to start, stopping the rest");
                    stop_all(runtime.as_ref(), &instances, stop_timeout).await;
                    return Err(e);
                },
            }
        }

        let pool = Arc::new(Pool::new(instances));

        gate.advance(ReadinessState::Probing);
        let Some(first) = pool.get(0) else {
            return Err(Error::config("at least 1 worker must be specified"));
        };
        if let Err(e) = probe(&first.spec.origin(), &config.probe_config()).await {
            error!(error = %e, "Cluster did not become ready");
            stop_all(runtime.as_ref(), &pool.close(), stop_timeout).await;
            return Err(e);
        }
        gate.advance(ReadinessState::Ready);

        let repair = Arc::new(RepairOrchestrator::new(
            Arc::clone(&runtime),
            factory,
            Arc::clone(&pool),
            RepairConfig {
                step_timeout,
                stop_timeout,
            },
        ));
        let router = Arc::new(Router::new(
            Arc::clone(&pool),
            gate.view(),
            Arc::clone(&repair),
        ));
        let shutdown = ShutdownController::new(
            runtime,
            Arc::clone(&pool),
            Arc::clone(&repair),
            stop_timeout,
        );

        Ok(Self {
            pool,
            router,
            repair,
            shutdown,
            gate,
            listen_addr: config.listen_addr(),
        })
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn repair(&self) -> &Arc<RepairOrchestrator> {
        &self.repair
    }

    pub fn readiness(&self) -> ReadinessState {
        self.gate.state()
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Serve on the configured address until SIGINT or SIGTERM, then stop
    /// every worker.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the listener cannot be bound. Workers are
    /// stopped in that case too.
    pub async fn run(self) -> Result<ShutdownReport> {
        let listener = match bind(self.listen_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.shutdown.shutdown().await;
                return Err(e);
            },
        };

        let signal = async {
            match wait_for_signal().await {
                Ok(signal) => info!(signal, "Shutting down"),
                Err(e) => error!(error = %e, "Signal handling failed, shutting down"),
            }
            force_exit_on_second_signal();
        };

        self.serve(listener, signal).await
    }

    /// Serve on `listener` until `shutdown` resolves, then stop every worker
    /// and wait for repairs already in flight.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<ShutdownReport> {
        let served = serve(listener, Arc::clone(&self.router), shutdown).await;
        let report = self.shutdown.shutdown().await.unwrap_or_default();
        served.map(|()| report)
    }

    /// Stop every worker without serving.
    pub async fn shutdown(&self) -> Option<ShutdownReport> {
        self.shutdown.shutdown().await
    }
}

/// Provision, start and bind one worker. A worker that was provisioned but
/// failed to start is removed again.
async fn start_worker(
    runtime: &dyn WorkerRuntime,
    factory: ProxyFactory,
    spec: WorkerSpec,
    step_timeout: Duration,
    stop_timeout: Duration,
) -> Result<WorkerInstance> {
    let spec = Arc::new(spec);
    info!(worker = %spec.name, port = spec.host_port, "Starting worker");

    let handle = with_deadline(
        "provision",
        &spec.name,
        step_timeout,
        runtime.provision(&spec),
    )
    .await?;

    let ready = async {
        with_deadline("start", &spec.name, step_timeout, runtime.start(&handle)).await?;
        factory.build(&spec)
    };
    match ready.await {
        Ok(proxy) => Ok(WorkerInstance::running(spec, handle, proxy)),
        Err(e) => {
            if let Err(stop_err) = with_deadline(
                "stop",
                &spec.name,
                stop_timeout + step_timeout,
                runtime.stop(&handle, stop_timeout),
            )
            .await
            {
                warn!(worker = %spec.name, error = %stop_err, "Could not remove half-started worker");
            }
            Err(e)
        },
    }
}

/// Best-effort concurrent stop used when bootstrap fails.
async fn stop_all(runtime: &dyn WorkerRuntime, instances: &[WorkerInstance], stop_timeout: Duration) {
    let deadline = stop_timeout + Duration::from_secs(5);
    let stops = instances.iter().map(|instance| async move {
        let stopped = with_deadline(
            "stop",
            &instance.spec.name,
            deadline,
            runtime.stop(&instance.handle, stop_timeout),
        )
        .await;
        if let Err(e) = stopped {
            warn!(worker = %instance.spec.name, error = %e, "Could not stop worker");
        }
    });
    join_all(stops).await;
}
