//! HTTP and WebSocket API.
//!
//! REST endpoints cover submission, inspection, cancellation, and
//! administration; `/ws` pushes live job events to connected observers.
//! The web layer holds no job state of its own: it reads the store and the
//! in-memory tracker and delegates every mutation to the scheduler.
//!
//! ## Endpoints
//!
//! - `POST /api/builds` - submit a build request
//! - `GET /api/jobs` - list jobs, filterable by status
//! - `GET /api/jobs/{id}` - fetch one job
//! - `GET /api/jobs/{id}/logs` - job logs (live ring or history)
//! - `DELETE /api/jobs/{id}` - request cancellation
//! - `POST /api/admin/purge` - delete old terminal jobs
//! - `GET /api/health` - daemon health summary
//! - `WS /ws` - live event stream

mod websocket;

use std::net::SocketAddr;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;

use crate::context::AppContext;
use crate::core::models::{JobStatus, LogEntry, LogLevel};
use crate::core::scheduler::{BuildRequest, Scheduler, SubmitError};
use crate::db;

/// Shared state for the web server
#[derive(Clone)]
pub struct WebState {
    pub ctx: AppContext,
    pub scheduler: Scheduler,
    pub started_at: Instant,
}

/// API error carrying the status code it should be served with.
struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

impl From<SubmitError> for ApiError {
    fn from(e: SubmitError) -> Self {
        let status = match &e {
            SubmitError::UnknownDevice(_) | SubmitError::UnsupportedOs { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            SubmitError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            SubmitError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self(status, e.to_string())
    }
}

/// Web server for the build API.
pub struct WebServer {
    bind_addr: SocketAddr,
    state: WebState,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebServer {
    /// Create a new web server bound to the given address.
    pub fn new(ctx: AppContext, scheduler: Scheduler, bind_addr: SocketAddr) -> Self {
        let state = WebState {
            ctx,
            scheduler,
            started_at: Instant::now(),
        };
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            bind_addr,
            state,
            shutdown_tx,
        }
    }

    /// Start the web server. Runs until shutdown() is called.
    pub async fn start(&self) -> anyhow::Result<()> {
        let app = Router::new()
            .route("/api/builds", post(submit_build))
            .route("/api/jobs", get(list_jobs))
            .route("/api/jobs/{id}", get(get_job))
            .route("/api/jobs/{id}", delete(cancel_job))
            .route("/api/jobs/{id}/logs", get(job_logs))
            .route("/api/admin/purge", post(purge_jobs))
            .route("/api/health", get(health))
            .route("/ws", get(websocket::ws_handler))
            .with_state(self.state.clone());

        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;
        tracing::info!(addr = %self.bind_addr, "API listening");

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await?;

        Ok(())
    }

    /// Signal the server to shut down gracefully.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

async fn submit_build(
    State(state): State<WebState>,
    Json(request): Json<BuildRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = state.scheduler.submit(request).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "jobId": job_id }))))
}

#[derive(Deserialize)]
struct JobsQuery {
    status: Option<String>,
    #[serde(default)]
    limit: u32,
    #[serde(default)]
    offset: u32,
}

async fn list_jobs(
    State(state): State<WebState>,
    Query(query): Query<JobsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(JobStatus::parse(raw).ok_or_else(|| {
            ApiError(
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("unknown status '{raw}'"),
            )
        })?),
        None => None,
    };
    let filter = db::jobs::JobFilter {
        status,
        limit: query.limit,
        offset: query.offset,
    };
    let jobs = db::jobs::list(&state.ctx.db, filter).await?;
    Ok(Json(jobs))
}

async fn get_job(
    State(state): State<WebState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = db::jobs::get(&state.ctx.db, id.clone())
        .await?
        .ok_or_else(|| ApiError(StatusCode::NOT_FOUND, format!("job '{id}' not found")))?;
    Ok(Json(job))
}

#[derive(Deserialize)]
struct LogsQuery {
    #[serde(default)]
    source: LogSource,
    level: Option<String>,
    #[serde(default)]
    limit: u32,
}

#[derive(Deserialize, Default, Clone, Copy)]
#[serde(rename_all = "lowercase")]
enum LogSource {
    /// In-memory ring of the most recent entries, empty once the job leaves
    /// the tracker.
    Live,
    #[default]
    History,
    Errors,
}

async fn job_logs(
    State(state): State<WebState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if db::jobs::get(&state.ctx.db, id.clone()).await?.is_none() {
        return Err(ApiError(
            StatusCode::NOT_FOUND,
            format!("job '{id}' not found"),
        ));
    }
    let min_level = match query.level.as_deref() {
        Some(raw) => Some(LogLevel::parse(raw).ok_or_else(|| {
            ApiError(
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("unknown level '{raw}'"),
            )
        })?),
        None => None,
    };

    let entries: Vec<LogEntry> = match query.source {
        LogSource::Live => {
            let limit = if query.limit == 0 { 100 } else { query.limit as usize };
            state
                .ctx
                .tracker
                .recent_logs(&id, limit)
                .await
                .into_iter()
                .filter(|e| min_level.is_none_or(|min| e.level >= min))
                .collect()
        }
        LogSource::History => db::logs::for_job(&state.ctx.db, id, min_level, query.limit).await?,
        LogSource::Errors => {
            let floor = match min_level {
                Some(min) if min > LogLevel::Error => min,
                _ => LogLevel::Error,
            };
            db::logs::for_job(&state.ctx.db, id, Some(floor), query.limit).await?
        }
    };
    Ok(Json(entries))
}

async fn cancel_job(
    State(state): State<WebState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if state.scheduler.cancel(&id).await {
        return Ok((StatusCode::ACCEPTED, Json(json!({ "jobId": id }))));
    }
    // No live token: distinguish a finished job from an unknown one.
    match db::jobs::get(&state.ctx.db, id.clone()).await? {
        Some(job) => Err(ApiError(
            StatusCode::CONFLICT,
            format!("job '{id}' is already {}", job.status.as_str()),
        )),
        None => Err(ApiError(
            StatusCode::NOT_FOUND,
            format!("job '{id}' not found"),
        )),
    }
}

#[derive(Deserialize)]
struct PurgeQuery {
    days: u32,
}

async fn purge_jobs(
    State(state): State<WebState>,
    Query(query): Query<PurgeQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let purged = db::jobs::purge_older_than(&state.ctx.db, query.days).await?;
    tracing::info!(purged, days = query.days, "purged terminal jobs");
    Ok(Json(json!({ "purged": purged })))
}

async fn health(State(state): State<WebState>) -> Result<impl IntoResponse, ApiError> {
    let stats = db::jobs::stats(&state.ctx.db).await?;
    Ok(Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "activeJobs": state.ctx.tracker.active_count().await,
        "jobCount": stats.job_count,
        "logCount": stats.log_count,
        "simulation": state.ctx.config.simulation,
    })))
}
