//! Shared test harness.
//!
//! [`FakeRuntime`] stands in for Docker: `start` binds a real HTTP server on
//! the worker's host port and `stop` tears it down, so the proxy, probe and
//! repair paths run against live sockets.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::net::TcpListener as StdTcpListener;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};

use nmc::cluster::{RuntimeHandle, WorkerSpec};
use nmc::config::ClusterConfig;
use nmc::error::{Error, Result};
use nmc::runtime::WorkerRuntime;

struct Container {
    spec: WorkerSpec,
    server: Option<JoinHandle<()>>,
}

/// In-process worker runtime with failure injection.
#[derive(Default)]
pub struct FakeRuntime {
    next_id: AtomicUsize,
    containers: Mutex<HashMap<String, Container>>,
    pulls: AtomicUsize,
    provisions: AtomicUsize,
    starts: AtomicUsize,
    stops: AtomicUsize,
    served: Arc<AtomicUsize>,
    fail_pull: AtomicBool,
    silent: AtomicBool,
    fail_provision_ports: Mutex<HashSet<u16>>,
    fail_start_ports: Mutex<HashSet<u16>>,
    fail_stop_ports: Mutex<HashSet<u16>>,
    provision_gate: Mutex<Option<Arc<Semaphore>>>,
    start_gate: Mutex<Option<Arc<Semaphore>>>,
    stopped: Mutex<Vec<RuntimeHandle>>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_pull(&self) {
        self.fail_pull.store(true, Ordering::SeqCst);
    }

    /// Workers start without listening, so nothing ever answers.
    pub fn silent(&self) {
        self.silent.store(true, Ordering::SeqCst);
    }

    pub fn fail_provision(&self, port: u16) {
        self.fail_provision_ports.lock().insert(port);
    }

    /// `start` fails for `port`; the provisioned container stays behind.
    pub fn fail_start(&self, port: u16) {
        self.fail_start_ports.lock().insert(port);
    }

    pub fn fail_stop(&self, port: u16) {
        self.fail_stop_ports.lock().insert(port);
    }

    /// Block every later `provision` call until [`release_provisions`](Self::release_provisions).
    pub fn hold_provisions(&self) {
        *self.provision_gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_provisions(&self) {
        if let Some(gate) = self.provision_gate.lock().take() {
            gate.add_permits(Semaphore::MAX_PERMITS);
        }
    }

    /// Block every later `start` call until [`release_starts`](Self::release_starts).
    pub fn hold_starts(&self) {
        *self.start_gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_starts(&self) {
        if let Some(gate) = self.start_gate.lock().take() {
            gate.add_permits(Semaphore::MAX_PERMITS);
        }
    }

    /// Crash the worker listening on `port` without telling anyone.
    pub async fn kill(&self, port: u16) {
        let server = self
            .containers
            .lock()
            .values_mut()
            .find(|c| c.spec.host_port == port)
            .and_then(|c| c.server.take());
        if let Some(server) = server {
            server.abort();
            let _ = server.await;
        }
    }

    /// Containers whose server is still up.
    pub fn running(&self) -> usize {
        self.containers
            .lock()
            .values()
            .filter(|c| c.server.as_ref().is_some_and(|s| !s.is_finished()))
            .count()
    }

    /// Containers that exist, running or not.
    pub fn containers(&self) -> usize {
        self.containers.lock().len()
    }

    pub fn has_container(&self, handle: &RuntimeHandle) -> bool {
        self.containers.lock().contains_key(handle.as_str())
    }

    /// Handles passed to `stop`, in call order.
    pub fn stopped_handles(&self) -> Vec<RuntimeHandle> {
        self.stopped.lock().clone()
    }

    pub fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    pub fn provisions(&self) -> usize {
        self.provisions.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Requests answered by any worker.
    pub fn served(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerRuntime for FakeRuntime {
    async fn pull_base_image(&self, image: &str) -> Result<()> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        if self.fail_pull.load(Ordering::SeqCst) {
            return Err(Error::image_pull(image, "manifest unknown"));
        }
        Ok(())
    }

    async fn provision(&self, spec: &WorkerSpec) -> Result<RuntimeHandle> {
        self.provisions.fetch_add(1, Ordering::SeqCst);

        let gate = self.provision_gate.lock().clone();
        if let Some(gate) = gate {
            gate.acquire()
                .await
                .map_err(|e| Error::provision(&spec.name, e.to_string()))?
                .forget();
        }

        if self.fail_provision_ports.lock().contains(&spec.host_port) {
            return Err(Error::provision(&spec.name, "port is already allocated"));
        }

        let id = format!("fake{:012}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers.lock().insert(
            id.clone(),
            Container {
                spec: spec.clone(),
                server: None,
            },
        );
        Ok(RuntimeHandle::new(id))
    }

    async fn start(&self, handle: &RuntimeHandle) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);

        let gate = self.start_gate.lock().clone();
        if let Some(gate) = gate {
            gate.acquire()
                .await
                .map_err(|e| Error::start(handle.to_string(), e.to_string()))?
                .forget();
        }

        let spec = self
            .containers
            .lock()
            .get(handle.as_str())
            .map(|c| c.spec.clone())
            .ok_or_else(|| Error::start(handle.to_string(), "no such container"))?;

        if self.fail_start_ports.lock().contains(&spec.host_port) {
            return Err(Error::start(handle.to_string(), "port is already allocated"));
        }

        if self.silent.load(Ordering::SeqCst) {
            return Ok(());
        }

        let listener = bind_with_retry(spec.host_port)
            .await
            .map_err(|e| Error::start(handle.to_string(), e.to_string()))?;
        let server = tokio::spawn(serve_worker(
            listener,
            spec.name.clone(),
            handle.to_string(),
            Arc::clone(&self.served),
        ));

        if let Some(container) = self.containers.lock().get_mut(handle.as_str()) {
            container.server = Some(server);
        }
        Ok(())
    }

    async fn stop(&self, handle: &RuntimeHandle, _timeout: Duration) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.stopped.lock().push(handle.clone());

        let removed = self.containers.lock().remove(handle.as_str());
        let Some(container) = removed else {
            return Ok(());
        };
        if let Some(server) = container.server {
            server.abort();
            let _ = server.await;
        }

        if self.fail_stop_ports.lock().contains(&container.spec.host_port) {
            return Err(Error::stop(handle.to_string(), "container did not exit"));
        }
        Ok(())
    }
}

async fn bind_with_retry(port: u16) -> std::io::Result<TcpListener> {
    let mut attempts = 0;
    loop {
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) if attempts >= 50 => return Err(e),
            Err(_) => {
                attempts += 1;
                tokio::time::sleep(Duration::from_millis(20)).await;
            },
        }
    }
}

/// Answer every request with the worker name. Connections live in a
/// `JoinSet` so aborting the server also drops its keep-alive connections.
async fn serve_worker(
    listener: TcpListener,
    name: String,
    handle: String,
    served: Arc<AtomicUsize>,
) {
    let name: Arc<str> = name.into();
    let handle: Arc<str> = handle.into();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let Ok((stream, _)) = accepted else { continue };
                let (name, handle, served) = (name.clone(), handle.clone(), served.clone());
                connections.spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let (name, handle, served) = (name.clone(), handle.clone(), served.clone());
                        async move {
                            served.fetch_add(1, Ordering::SeqCst);
                            let forwarded = req
                                .headers()
                                .get("x-forwarded-host")
                                .and_then(|v| v.to_str().ok())
                                .unwrap_or_default()
                                .to_string();
                            let response = Response::builder()
                                .header("x-worker", &*name)
                                .header("x-handle", &*handle)
                                .header("x-seen-forwarded-host", forwarded)
                                .body(Full::new(Bytes::from(name.to_string())))
                                .unwrap();
                            Ok::<_, Infallible>(response)
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {},
        }
    }
}

/// First of `count` consecutive free ports on loopback.
pub fn free_ports(count: u16) -> u16 {
    static NEXT: AtomicU16 = AtomicU16::new(0);

    let seed = 20_000 + (std::process::id() % 400) as u16 * 50;
    let _ = NEXT.compare_exchange(0, seed, Ordering::SeqCst, Ordering::SeqCst);

    loop {
        let base = NEXT.fetch_add(count, Ordering::SeqCst);
        if base < 20_000 || base > 60_000 {
            NEXT.store(20_000, Ordering::SeqCst);
            continue;
        }
        let all_free = (base..base + count).all(|p| StdTcpListener::bind(("127.0.0.1", p)).is_ok());
        if all_free {
            return base;
        }
    }
}

/// Config for `count` workers on fresh ports with fast probing.
pub fn test_config(site: &Path, count: usize) -> ClusterConfig {
    let port = free_ports(count as u16);
    ClusterConfig {
        site: site.to_path_buf(),
        count,
        port,
        server_port: 0,
        probe_attempts: 40,
        probe_interval_ms: 50,
        request_timeout_secs: 5,
        step_timeout_secs: 5,
        stop_timeout_secs: 1,
        ..ClusterConfig::default()
    }
}

pub fn get(path: &str) -> Request<Bytes> {
    Request::builder()
        .uri(path)
        .header("host", "example.test")
        .body(Bytes::new())
        .unwrap()
}

pub async fn body_text(response: Response<Full<Bytes>>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
