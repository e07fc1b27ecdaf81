//! Ephemera HTTP control plane.
//!
//! Routes (all `POST`, JSON body `{client, task, flag}`):
//! - `/run`    start `task` for `client`
//! - `/stop`   stop it now
//! - `/status` pod of `task`/`client`
//! - `/active` pod of `client`, optionally narrowed to `task`
//!
//! Every route sits behind the `X-Service-Key` check.

#![forbid(unsafe_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use ephemera_api::{WorkloadControl, WorkloadStatus};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

mod error;

pub use error::ApiError;

pub const SERVICE_KEY_HEADER: &str = "x-service-key";

/// `{"msg": "..."}` envelope used by run/stop and every error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Msg {
    pub msg: String,
}

impl Msg {
    pub fn new(msg: impl Into<String>) -> Self { Self { msg: msg.into() } }

    pub fn ok() -> Self { Self::new("ok") }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WorkloadRequest {
    client: String,
    task: String,
    flag: String,
}

impl WorkloadRequest {
    fn parse(body: &[u8]) -> Result<Self, ApiError> {
        let req: Self = serde_json::from_slice(body).map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
        if req.client.is_empty() {
            return Err(ApiError::InvalidRequest("client is required".into()));
        }
        Ok(req)
    }

    fn require_task(self) -> Result<Self, ApiError> {
        if self.task.is_empty() {
            return Err(ApiError::InvalidRequest("task is required".into()));
        }
        Ok(self)
    }
}

#[derive(Clone)]
pub struct AppState {
    control: Arc<dyn WorkloadControl>,
    service_key: Arc<str>,
}

impl AppState {
    pub fn new(control: Arc<dyn WorkloadControl>, service_key: impl Into<Arc<str>>) -> Self {
        Self { control, service_key: service_key.into() }
    }
}

/// Build the router with auth and request logging applied.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/run", post(run))
        .route("/stop", post(stop))
        .route("/status", post(status))
        .route("/active", post(active))
        .layer(middleware::from_fn_with_state(state.clone(), require_service_key))
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

/// Serve `router` until `shutdown` resolves. Peer addresses are made available to the auth layer.
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown)
        .await
}

async fn require_service_key(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let presented = req.headers().get(SERVICE_KEY_HEADER).and_then(|v| v.to_str().ok());
    if presented != Some(&*state.service_key) {
        let remote_ip = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".into());
        counter!("http_unauthorized_total", 1u64);
        warn!(remote_ip = %remote_ip, path = %req.uri().path(), "service key mismatch");
        return (StatusCode::UNAUTHORIZED, Json(Msg::new("invalid api key"))).into_response();
    }
    next.run(req).await
}

async fn log_request(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let t0 = Instant::now();
    let resp = next.run(req).await;
    let latency_ms = t0.elapsed().as_secs_f64() * 1000.0;
    counter!("http_requests_total", 1u64);
    histogram!("http_latency_ms", latency_ms);
    info!(method = %method, path = %path, status = resp.status().as_u16(), latency_ms, "request");
    resp
}

async fn run(State(state): State<AppState>, body: Bytes) -> Result<Json<Msg>, ApiError> {
    let req = WorkloadRequest::parse(&body)?.require_task()?;
    state.control.start(&req.task, &req.client, &req.flag).await?;
    Ok(Json(Msg::ok()))
}

async fn stop(State(state): State<AppState>, body: Bytes) -> Result<Json<Msg>, ApiError> {
    let req = WorkloadRequest::parse(&body)?.require_task()?;
    state.control.stop(&req.task, &req.client, &req.flag).await?;
    Ok(Json(Msg::ok()))
}

/// No matching pod answers with an all-empty status.
async fn status(State(state): State<AppState>, body: Bytes) -> Result<Json<WorkloadStatus>, ApiError> {
    let req = WorkloadRequest::parse(&body)?.require_task()?;
    let found = state.control.status(&req.task, &req.client).await?;
    Ok(Json(found.unwrap_or_default()))
}

async fn active(State(state): State<AppState>, body: Bytes) -> Result<Json<WorkloadStatus>, ApiError> {
    let req = WorkloadRequest::parse(&body)?;
    let task = Some(req.task.as_str()).filter(|t| !t.is_empty());
    let found = state.control.active(&req.client, task).await?;
    Ok(Json(found.unwrap_or_default()))
}
