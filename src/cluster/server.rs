//! Public HTTP listener.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use super::router::Router;
use crate::error::{Error, Result};

/// Bind the public listener.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| Error::io(format!("binding {addr}"), e))
}

/// Accept connections and dispatch every request through `router` until
/// `shutdown` resolves.
///
/// All paths are forwarded; there is no routing by path.
pub async fn serve(
    listener: TcpListener,
    router: Arc<Router>,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Proxy listening on http://{}", addr);
    }
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => {
                info!("Listener closed");
                return Ok(());
            },
            accepted = listener.accept() => {
                let (stream, remote_addr) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        // Typically fd exhaustion; back off instead of spinning.
                        warn!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    },
                };
                let io = TokioIo::new(stream);
                let router = router.clone();

                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let router = router.clone();
                        async move { Ok::<_, Infallible>(handle(&router, req, remote_addr).await) }
                    });

                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await
                        && !e.to_string().contains("connection closed")
                    {
                        error!("Connection error: {}", e);
                    }
                });
            },
        }
    }
}

async fn handle(
    router: &Router,
    req: Request<Incoming>,
    remote_addr: SocketAddr,
) -> Response<Full<Bytes>> {
    let (parts, body) = req.into_parts();
    debug!(method = %parts.method, path = %parts.uri.path(), remote = %remote_addr, "Received request");

    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(remote = %remote_addr, error = %e, "Failed to read request body");
            let mut response = Response::new(Full::new(Bytes::from("Bad Request\n")));
            *response.status_mut() = StatusCode::BAD_REQUEST;
            return response;
        },
    };

    router.dispatch(Request::from_parts(parts, body)).await
}
