//! Health endpoint.
//!
//! Serves `GET /v1/health` with a small JSON body; this is the URL the
//! self-registration health check points Consul at. All other paths
//! return 404.

use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, serde::Serialize)]
struct HealthResponse {
    healthy: bool,
    id: String,
}

async fn health_handler(
    req: Request<Body>,
    instance_id: String,
) -> Result<Response<Body>, hyper::Error> {
    if req.uri().path() != "/v1/health" {
        return Ok(Response::builder()
            .status(404)
            .body(Body::from("not found"))
            .unwrap());
    }

    let body = serde_json::to_string(&HealthResponse {
        healthy: true,
        id: instance_id,
    })
    .unwrap_or_else(|_| "{}".to_string());

    Ok(Response::builder()
        .status(200)
        .header("Content-Type", "application/json")
        .body(Body::from(body))
        .unwrap())
}

/// Runs the health server until cancelled.
pub async fn serve(port: u16, instance_id: String, cancel: CancellationToken) {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();

    let make_svc = make_service_fn(move |_conn| {
        let id = instance_id.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let id_inner = id.clone();
                async move { health_handler(req, id_inner).await }
            }))
        }
    });

    let server = Server::bind(&addr)
        .serve(make_svc)
        .with_graceful_shutdown(async move { cancel.cancelled().await });

    info!(addr = %addr, "Health endpoint started — GET /v1/health");
    if let Err(e) = server.await {
        error!(error = %e, "Health server error");
    }
}
