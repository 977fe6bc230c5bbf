use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use cachesync_core::{CacheService, ConsumerState, DynEventBroker};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::error::ApiError;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<CacheService>,
    pub broker: DynEventBroker,
    pub consumer: Arc<ConsumerState>,
    pub default_ttl_seconds: i64,
}

#[derive(Debug, Deserialize)]
pub struct SetEntryRequest {
    pub value: String,
    #[serde(default)]
    pub ttl: Option<i64>,
}

pub fn build_app(state: AppState, body_limit: usize) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/cache/{topic}/{key}", get(get_entry).post(set_entry))
        .route("/invalidate/{topic}/{key}", post(invalidate_entry))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http().make_span_with(
                        |req: &axum::http::Request<_>| {
                            tracing::info_span!(
                                "http.request",
                                http.method = %req.method(),
                                http.target = %req.uri(),
                            )
                        },
                    ),
                )
                .layer(axum::extract::DefaultBodyLimit::max(body_limit)),
        )
        .with_state(state)
}

async fn get_entry(
    State(state): State<AppState>,
    Path((topic, key)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    match state.cache.get(&topic, &key).await? {
        Some(value) => Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            Bytes::from(value),
        )),
        None => Err(ApiError::not_found(format!("{topic}/{key}"))),
    }
}

async fn set_entry(
    State(state): State<AppState>,
    Path((topic, key)): Path<(String, String)>,
    payload: Result<Json<SetEntryRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = payload?;
    let ttl = request.ttl.unwrap_or(state.default_ttl_seconds);
    state
        .cache
        .set(&topic, &key, request.value.as_bytes(), ttl)
        .await?;
    Ok((StatusCode::OK, Json(json!({ "status": "ok" }))))
}

/// Drop the local entry, then tell every peer.
async fn invalidate_entry(
    State(state): State<AppState>,
    Path((topic, key)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    state.cache.invalidate(&topic, &key).await?;
    state.broker.publish(&topic, &key).await?;
    tracing::info!(topic = %topic, key = %key, "invalidation published");
    Ok((StatusCode::OK, Json(json!({ "status": "ok" }))))
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    match state.cache.backend().ping().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok" }))),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable", "error": e.to_string() })),
        ),
    }
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    if state.consumer.is_ready() {
        (StatusCode::OK, Json(json!({ "status": "ready" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not-ready",
                "consecutive_failures": state.consumer.consecutive_failures(),
            })),
        )
    }
}

pub struct CachesyncServer {
    addr: SocketAddr,
    app: Router,
}

pub struct ServerBuilder {
    addr: SocketAddr,
    body_limit: usize,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self::from_config(&AppConfig::default())
    }

    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            addr: cfg.addr(),
            body_limit: cfg.server.body_limit_bytes,
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn build(self, state: AppState) -> CachesyncServer {
        CachesyncServer {
            addr: self.addr,
            app: build_app(state, self.body_limit),
        }
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CachesyncServer {
    /// Serve until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        axum::serve(listener, self.app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }
}

/// Resolves on Ctrl+C.
pub async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
