//! # Server — Health, Metrics, and Task Endpoints
//!
//! | Method | Path | Response |
//! |--------|------|----------|
//! | GET | `/healthz` | liveness, always `ok` |
//! | GET | `/readyz` | 200 once the storage backend answers, 503 otherwise |
//! | GET | `/metrics` | Prometheus text exposition |
//! | GET | `/api/backend` | selected storage and KV backends |
//! | GET | `/api/tasks?limit=N` | recent execution records, newest first |
//! | POST | `/api/tasks/{task}/run` | run a task now, return its record |
//! | GET | `/api/channels` | tracked channels |
//! | GET | `/api/channels/{id}/stats?start=&end=` | per-day stats (cached) |
//!
//! Manual runs execute on their own task: a client that disconnects or a
//! request that times out stops waiting, but the batch still finishes,
//! releases its lock and records its outcome.
//!
//! Authentication is handled in front of this service.

use crate::context::AppContext;
use crate::stats;
use crate::storage::{Storage, TaskType};
use crate::tasks;
use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 500;

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/healthz", get(handler_healthz))
        .route("/readyz", get(handler_readyz))
        .route("/metrics", get(handler_metrics))
        .route("/api/backend", get(handler_backend))
        .route("/api/tasks", get(handler_tasks))
        .route("/api/tasks/{task}/run", post(handler_run_task))
        .route("/api/channels", get(handler_channels))
        .route("/api/channels/{id}/stats", get(handler_channel_stats))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        // Manual task runs can take a while; the timeout bounds everything else.
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(900),
        ))
        .with_state(ctx)
}

/// Serve on `port` until SIGINT or SIGTERM.
pub async fn serve(ctx: Arc<AppContext>, port: u16) -> Result<()> {
    let app = build_router(ctx);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(port, "server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("server shut down gracefully");
    Ok(())
}

fn error_response(status: StatusCode, err: &anyhow::Error) -> Response {
    (status, Json(json!({ "error": format!("{err:#}") }))).into_response()
}

async fn handler_healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn handler_readyz(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    let storage = ctx.store().await;
    let Storage::Postgres(pg) = storage else {
        return (StatusCode::OK, "ok");
    };
    match tokio::time::timeout(Duration::from_secs(2), pg.health_check()).await {
        Ok(Ok(())) => (StatusCode::OK, "ok"),
        Ok(Err(_)) => (StatusCode::SERVICE_UNAVAILABLE, "database unreachable"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "database timeout"),
    }
}

async fn handler_metrics(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            "content-type",
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        ctx.metrics.encode(),
    )
}

async fn handler_backend(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    let storage = ctx.store().await;
    Json(json!({
        "storage": storage.kind(),
        "durable": storage.is_durable(),
        "kv": ctx.kv.kind(),
        "kv_process_local": ctx.kv.is_process_local(),
    }))
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn handler_tasks(
    State(ctx): State<Arc<AppContext>>,
    Query(q): Query<HistoryQuery>,
) -> Response {
    let limit = q.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).min(MAX_HISTORY_LIMIT);
    match ctx.store().await.list_task_executions(limit).await {
        Ok(records) => Json(records).into_response(),
        Err(e) => {
            warn!(error = %format!("{e:#}"), "failed to list task executions");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e)
        }
    }
}

async fn handler_run_task(
    State(ctx): State<Arc<AppContext>>,
    Path(task): Path<String>,
) -> Response {
    let task: TaskType = match task.parse() {
        Ok(t) => t,
        Err(e) => return error_response(StatusCode::NOT_FOUND, &e),
    };
    match tasks::spawn_task(ctx, task).await {
        Ok(record) => Json(record).into_response(),
        Err(e) => error_response(StatusCode::CONFLICT, &e),
    }
}

async fn handler_channels(State(ctx): State<Arc<AppContext>>) -> Response {
    match ctx.store().await.list_channels().await {
        Ok(channels) => Json(channels).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e),
    }
}

#[derive(Deserialize)]
struct StatsQuery {
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
}

async fn handler_channel_stats(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Query(q): Query<StatsQuery>,
) -> Response {
    let storage = ctx.store().await;
    match storage.get_channel(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return error_response(
                StatusCode::NOT_FOUND,
                &anyhow::anyhow!("channel '{}' not found", id),
            )
        }
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e),
    }
    match stats::daily_stats(storage, &ctx.cache, ctx.settings.stats_ttl(), &id, q.start, q.end).await {
        Ok(days) => Json(days).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e),
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("received SIGINT, shutting down"),
                    _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
                info!("received SIGINT, shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received SIGINT, shutting down");
    }
}
