//! Round-robin request dispatch.

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Request, Response, StatusCode};
use tracing::{debug, info, warn};

use super::pool::Pool;
use super::readiness::ReadinessView;
use super::repair::RepairOrchestrator;
use super::selection::RoundRobin;
use crate::error::Error;

/// Dispatches each request to the next slot in the pool.
///
/// A failed forward is answered immediately with a 503 and hands the slot to
/// the repair orchestrator in the background. Slots under repair are not
/// skipped: until the replacement is installed, requests that land on the
/// slot still go to the broken handler and fail fast. This keeps dispatch
/// lock-free and predictable at the cost of a few extra failed requests
/// while a worker restarts.
pub struct Router {
    pool: Arc<Pool>,
    cursor: RoundRobin,
    readiness: ReadinessView,
    repair: Arc<RepairOrchestrator>,
}

impl Router {
    pub fn new(
        pool: Arc<Pool>,
        readiness: ReadinessView,
        repair: Arc<RepairOrchestrator>,
    ) -> Self {
        let cursor = RoundRobin::new(pool.size());
        Self {
            pool,
            cursor,
            readiness,
            repair,
        }
    }

    /// Forward `req` to the next slot and return the worker's response.
    ///
    /// Never waits on repair work.
    pub async fn dispatch(&self, req: Request<Bytes>) -> Response<Full<Bytes>> {
        if !self.readiness.is_ready() {
            debug!(state = %self.readiness.state(), "Rejecting request before readiness");
            return error_response(&Error::NotReady);
        }

        let Some(index) = self.cursor.advance() else {
            return error_response(&Error::NotReady);
        };
        let Some(instance) = self.pool.get(index) else {
            return error_response(&Error::NotReady);
        };

        debug!(
            slot = index,
            worker = %instance.spec.name,
            port = instance.spec.host_port,
            method = %req.method(),
            path = %req.uri().path(),
            "Forwarding request"
        );

        match instance.proxy.forward(req).await {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    slot = index,
                    worker = %instance.spec.name,
                    port = instance.spec.host_port,
                    error = %e,
                    "Handling error for worker"
                );
                if self.repair.trigger(index).is_some() {
                    info!(slot = index, worker = %instance.spec.name, "Re-creating worker");
                } else {
                    debug!(slot = index, "Repair already in flight");
                }
                error_response(&e)
            },
        }
    }
}

/// Plain-text error response for a request that could not be served.
pub(crate) fn error_response(error: &Error) -> Response<Full<Bytes>> {
    let status =
        StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
    let reason = status.canonical_reason().unwrap_or("Error");

    let mut response = Response::new(Full::new(Bytes::from(format!("{reason}\n"))));
    *response.status_mut() = status;
    response
}
