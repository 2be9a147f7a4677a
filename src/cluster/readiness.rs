//! Readiness gate and the bootstrap health probe.
//!
//! The gate moves `Starting -> Probing -> Ready` and never goes back. The
//! bootstrap sequence owns the only [`ReadinessGate`]; the router and the
//! listener hold [`ReadinessView`]s and take snapshot reads.

use std::fmt;
use std::time::{Duration, Instant};

use backon::{ConstantBuilder, Retryable};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Startup state of the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadinessState {
    /// Workers are being provisioned.
    Starting,
    /// Every worker is provisioned; the health probe is running.
    Probing,
    /// The probe succeeded. Terminal.
    Ready,
}

impl fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Probing => "probing",
            Self::Ready => "ready",
        };
        f.write_str(s)
    }
}

/// Writer side of the readiness state. Not `Clone`: there is one writer.
#[derive(Debug)]
pub struct ReadinessGate {
    tx: watch::Sender<ReadinessState>,
    started_at: Instant,
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ReadinessState::Starting);
        Self {
            tx,
            started_at: Instant::now(),
        }
    }

    /// Get a read handle.
    pub fn view(&self) -> ReadinessView {
        ReadinessView {
            rx: self.tx.subscribe(),
        }
    }

    pub fn state(&self) -> ReadinessState {
        *self.tx.borrow()
    }

    /// Move forward to `next`.
    ///
    /// Returns `false` and leaves the state alone if `next` is not strictly
    /// ahead of the current state.
    pub fn advance(&self, next: ReadinessState) -> bool {
        let advanced = self.tx.send_if_modified(|current| {
            if next > *current {
                *current = next;
                true
            } else {
                false
            }
        });
        if advanced {
            info!(
                state = %next,
                elapsed_ms = self.started_at.elapsed().as_millis() as u64,
                "Readiness transition"
            );
        }
        advanced
    }
}

/// Read handle on the readiness state.
#[derive(Debug, Clone)]
pub struct ReadinessView {
    rx: watch::Receiver<ReadinessState>,
}

impl ReadinessView {
    pub fn state(&self) -> ReadinessState {
        *self.rx.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ReadinessState::Ready
    }

    /// Wait until the gate reaches `Ready`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotReady` if the gate is dropped before becoming ready,
    /// which happens when bootstrap fails.
    pub async fn wait_ready(&mut self) -> Result<()> {
        self.rx
            .wait_for(|state| *state == ReadinessState::Ready)
            .await
            .map(|_| ())
            .map_err(|_| Error::NotReady)
    }
}

/// Configuration for the bootstrap health probe.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Fixed delay between attempts.
    pub interval: Duration,
    /// Path requested on the probed worker.
    pub path: String,
    /// Timeout for each probe request.
    pub timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            attempts: 30,
            interval: Duration::from_millis(500),
            path: "/".to_string(),
            timeout: Duration::from_secs(1),
        }
    }
}

/// Poll `origin` (`host:port`) until it answers an HTTP GET.
///
/// Any HTTP response counts as an answer: a static server with no index
/// page may legitimately reply 403 or 404.
///
/// # Errors
///
/// Returns `Error::ReadinessExhausted` when every attempt fails.
pub async fn probe(origin: &str, config: &ProbeConfig) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(config.timeout)
        .no_proxy()
        .build()
        .map_err(|e| Error::ProxyBuild {
            worker: origin.to_string(),
            reason: e.to_string(),
        })?;
    let url = format!("http://{}{}", origin, config.path);

    let retries = config.attempts.saturating_sub(1) as usize;
    let backoff = ConstantBuilder::default()
        .with_delay(config.interval)
        .with_max_times(retries);

    let mut attempt = 1u32;
    let notify = |err: &reqwest::Error, _dur: Duration| {
        debug!(
            url = %url,
            attempt = attempt,
            max_attempts = config.attempts,
            error = %err,
            "Readiness probe failed, will retry"
        );
        attempt += 1;
    };

    let (client_ref, url_ref) = (&client, url.as_str());
    let status = (move || async move { client_ref.get(url_ref).send().await.map(|r| r.status()) })
        .retry(backoff)
        .notify(notify)
        .await
        .map_err(|_| Error::ReadinessExhausted {
            address: origin.to_string(),
            attempts: config.attempts,
        })?;

    info!(url = %url, %status, "Readiness probe answered");
    Ok(())
}
