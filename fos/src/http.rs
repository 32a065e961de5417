//! HTTP surface: one POST endpoint for RPC, one GET endpoint for health.
//!
//! Transport-level failures (unknown path, wrong method, oversized body)
//! use HTTP status codes; everything protocol-level rides in a 200 response
//! body per JSON-RPC convention.

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use dist_lock::LockClient;
use file_ops::RootDir;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Incoming};
use hyper::header::{CACHE_CONTROL, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

use crate::rpc::RpcHandler;

/// Bodies above this are rejected with 413 before being read.
pub const MAX_BODY_SIZE: u64 = 32 * 1024 * 1024;

const CONTENT_TYPE_JSON: &str = "application/json; charset=utf-8";

/// State shared by all request handlers.
pub struct AppState {
    pub rpc: RpcHandler,
    pub locks: LockClient,
    pub root: RootDir,
    pub rpc_path: String,
}

/// Accept loop. Runs until `cancel` trips; each connection is served on its
/// own task and in-flight requests drain past cancellation (the caller
/// bounds the drain).
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "failed to accept connection");
                continue;
            }
        };

        let state = Arc::clone(&state);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let service = service_fn(|request: Request<Incoming>| {
                let state = Arc::clone(&state);
                let cancel = cancel.clone();
                async move { Ok::<_, Infallible>(route(request, &state, &cancel).await) }
            });
            let connection = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service);
            if let Err(e) = connection.await {
                debug!(%peer, error = %e, "connection error");
            }
        });
    }
    Ok(())
}

pub async fn route<B>(
    request: Request<B>,
    state: &AppState,
    cancel: &CancellationToken,
) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let path = request.uri().path().to_owned();
    match (request.method(), path.as_str()) {
        (&Method::POST, p) if p == state.rpc_path => handle_rpc(request, state, cancel).await,
        (&Method::GET, "/health") => handle_health(state).await,
        (_, p) if p == state.rpc_path || p == "/health" => {
            status_response(StatusCode::METHOD_NOT_ALLOWED)
        }
        _ => status_response(StatusCode::NOT_FOUND),
    }
}

async fn handle_rpc<B>(
    request: Request<B>,
    state: &AppState,
    cancel: &CancellationToken,
) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let request_id = Uuid::new_v4();
    let span = info_span!("rpc_request", %request_id);
    async {
        if body_too_large(request.body().size_hint().upper()) {
            return status_response(StatusCode::PAYLOAD_TOO_LARGE);
        }
        let body = match request.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                debug!(error = %e, "could not read request body");
                return status_response(StatusCode::BAD_REQUEST);
            }
        };

        match state.rpc.handle(&body, cancel).await {
            Some(output) => json_body_response(StatusCode::OK, output),
            // Notifications only: a well-formed exchange with nothing to say.
            None => json_body_response(StatusCode::OK, String::new()),
        }
    }
    .instrument(span)
    .await
}

/// Probes both collaborators the service depends on: the root directory and
/// the lock coordinator.
async fn handle_health(state: &AppState) -> Response<Full<Bytes>> {
    let request_id = Uuid::new_v4();

    let root_ok = tokio::fs::metadata(state.root.path())
        .await
        .map(|meta| meta.is_dir())
        .unwrap_or(false);
    let coordinator = state.locks.ping().await;
    let up = root_ok && coordinator.is_ok();

    let body = json!({
        "status": if up { "UP" } else { "DOWN" },
        "details": {
            "rootDir": {
                "status": if root_ok { "UP" } else { "DOWN" },
                "path": state.root.path().as_str(),
            },
            "lockCoordinator": {
                "status": if coordinator.is_ok() { "UP" } else { "DOWN" },
                "error": coordinator.err().map(|e| e.to_string()),
            },
        },
        "requestId": request_id.to_string(),
    });

    let status = if up {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let mut response = json_body_response(status, body.to_string());
    response.headers_mut().insert(
        CACHE_CONTROL,
        hyper::header::HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    response
}

fn body_too_large(upper_bound: Option<u64>) -> bool {
    // A body of unknown extent counts as too large; there is no streaming
    // path that could bound it later.
    upper_bound.map_or(true, |bound| bound > MAX_BODY_SIZE)
}

fn json_body_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, CONTENT_TYPE_JSON)
        .body(Full::new(Bytes::from(body)))
        // Only fails on invalid status/headers, all static here.
        .expect("building response should not fail")
}

fn status_response(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .expect("building response should not fail")
}
