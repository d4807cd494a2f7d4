//! HTTP control surface over the job store.
//!
//! Route layout and error JSON shape follow `dog-axum`'s conventions (a
//! single `ApiError` with a sanitized JSON body, a request-id middleware
//! layered ahead of tracing) scaled down to the one domain service this
//! crate has, rather than routed through `dog-axum`'s generic
//! `DogApp`/`DogService` machinery. Endpoint behavior is ported from the
//! original agent's `ui_server.py`.

use crate::store::{JobOutcome, JobStats, SqliteStore, SqlResult};
use crate::types::{JobRecord, JobStatus};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderName, HeaderValue, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, message: message.into() }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self { status: StatusCode::NOT_FOUND, message: message.into() }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self { status: StatusCode::INTERNAL_SERVER_ERROR, message: message.into() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}

impl From<crate::store::JobStoreError> for ApiError {
    fn from(e: crate::store::JobStoreError) -> Self {
        use crate::store::JobStoreError::*;
        match e {
            NotFound(name) => ApiError::not_found(format!("job not found: {name}")),
            Validation(msg) => ApiError::bad_request(msg),
            Transient(err) => ApiError::internal(format!("database error: {err}")),
            Orphan(msg) => ApiError::internal(msg),
            Operational(msg) => ApiError::internal(msg),
        }
    }
}

/// Builds the full Control API router over a store handle, with request-id,
/// tracing and CORS layered on.
pub fn router(store: SqliteStore) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/queue", get(list_queue))
        .route("/api/queue/:name", get(get_job))
        .route("/api/queue/:name/priority", put(set_priority))
        .route("/api/queue/:name/retry", post(retry_job))
        .route("/api/queue/:name/god-mode", post(god_mode_job))
        .route("/api/stats", get(stats))
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/export", get(export_jobs_csv))
        .route("/api/jobs/retry-failed", post(retry_all_failed))
        .route("/api/jobs/cancel-all", post(cancel_all_pending))
        .route("/api/jobs/bulk-retry", post(bulk_retry))
        .route("/api/jobs/bulk-delete", post(bulk_delete))
        .route("/api/sql", post(execute_sql))
        .layer(middleware::from_fn(ensure_request_id))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(store)
}

async fn ensure_request_id(mut req: Request<axum::body::Body>, next: Next) -> Response {
    let header = HeaderName::from_static("x-request-id");
    let request_id = req
        .headers()
        .get(&header)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if req.headers().get(&header).is_none() {
        if let Ok(v) = HeaderValue::from_str(&request_id) {
            req.headers_mut().insert(header.clone(), v);
        }
    }

    let mut res = next.run(req).await;
    if res.headers().get(&header).is_none() {
        if let Ok(v) = HeaderValue::from_str(&request_id) {
            res.headers_mut().insert(header, v);
        }
    }
    res
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    status: Option<String>,
}

async fn list_queue(
    State(store): State<SqliteStore>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<Vec<JobRecord>>, ApiError> {
    let status = match query.status {
        Some(raw) => Some(
            JobStatus::from_str(&raw)
                .map_err(|_| ApiError::bad_request(format!("unknown status '{raw}'")))?,
        ),
        None => None,
    };
    let jobs = store.list_by_status(status).await?;
    Ok(Json(jobs))
}

async fn get_job(
    State(store): State<SqliteStore>,
    Path(name): Path<String>,
) -> Result<Json<JobRecord>, ApiError> {
    let job = store
        .get_by_config_name(&name)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("job not found: {name}")))?;
    Ok(Json(job))
}

#[derive(Debug, Deserialize)]
struct PriorityBody {
    priority: i32,
}

async fn set_priority(
    State(store): State<SqliteStore>,
    Path(name): Path<String>,
    Json(body): Json<PriorityBody>,
) -> Result<Json<JobRecord>, ApiError> {
    let job = store.set_priority(&name, body.priority).await?;
    Ok(Json(job))
}

/// Resets a single `failed` job back to `pending` with a fresh retry
/// budget. Rejects jobs that aren't currently failed, matching the
/// original control panel's "can only retry failed jobs" rule.
async fn retry_job(
    State(store): State<SqliteStore>,
    Path(name): Path<String>,
) -> Result<Json<JobRecord>, ApiError> {
    let job = store
        .get_by_config_name(&name)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("job not found: {name}")))?;
    if job.status != JobStatus::Failed {
        return Err(ApiError::bad_request(format!(
            "job '{name}' is not failed (status: {})",
            job.status
        )));
    }
    let job = store.reset_to_pending(&name, true).await?;
    Ok(Json(job))
}

/// "God mode": a shorthand for setting a job's priority to the minimum,
/// so it leases next once the queue reaches it. Does not touch status or
/// lease fields, and therefore never preempts a currently running job or
/// regresses a `done` row back to `pending`.
async fn god_mode_job(
    State(store): State<SqliteStore>,
    Path(name): Path<String>,
) -> Result<Json<JobRecord>, ApiError> {
    let job = store.set_priority(&name, crate::types::Priority::MIN).await?;
    Ok(Json(job))
}

async fn stats(State(store): State<SqliteStore>) -> Result<Json<JobStats>, ApiError> {
    Ok(Json(store.stats().await?))
}

async fn list_jobs(State(store): State<SqliteStore>) -> Result<Json<Vec<JobRecord>>, ApiError> {
    Ok(Json(store.list_by_status(None).await?))
}

/// Streams every job row as CSV. Column list and ordering mirror
/// `ui_server.py`'s `export_jobs_csv`.
async fn export_jobs_csv(State(store): State<SqliteStore>) -> Result<Response, ApiError> {
    let jobs = store.list_by_status(None).await?;

    let mut writer = csv::Writer::from_writer(vec![]);
    writer
        .write_record([
            "ID",
            "Config Name",
            "Job Type",
            "Workflow",
            "Priority",
            "Status",
            "Retries",
            "Retry Limit",
            "Error",
            "Worker",
            "Created",
            "Started",
            "Ended",
            "Duration",
        ])
        .map_err(|e| ApiError::internal(format!("csv write failed: {e}")))?;

    for job in &jobs {
        writer
            .write_record([
                job.id.to_string(),
                job.config_name.clone(),
                job.job_type.clone(),
                job.workflow_id.clone(),
                job.priority.to_string(),
                job.status.as_str().to_string(),
                job.retries_attempted.to_string(),
                job.retry_limit.to_string(),
                job.error_trace.clone().unwrap_or_default(),
                job.worker_id.clone().unwrap_or_default(),
                job.created_at.to_rfc3339(),
                job.start_time.map(|t| t.to_rfc3339()).unwrap_or_default(),
                job.end_time.map(|t| t.to_rfc3339()).unwrap_or_default(),
                job.duration.map(|d| d.to_string()).unwrap_or_default(),
            ])
            .map_err(|e| ApiError::internal(format!("csv write failed: {e}")))?;
    }

    let body = writer
        .into_inner()
        .map_err(|e| ApiError::internal(format!("csv flush failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [
            ("content-type", "text/csv"),
            ("content-disposition", "attachment; filename=\"jobs.csv\""),
        ],
        body,
    )
        .into_response())
}

#[derive(Debug, Serialize)]
struct CountResponse {
    affected: u64,
}

async fn retry_all_failed(State(store): State<SqliteStore>) -> Result<Json<CountResponse>, ApiError> {
    let affected = store.retry_all_failed().await?;
    Ok(Json(CountResponse { affected }))
}

async fn cancel_all_pending(State(store): State<SqliteStore>) -> Result<Json<CountResponse>, ApiError> {
    let affected = store.cancel_all_pending().await?;
    Ok(Json(CountResponse { affected }))
}

#[derive(Debug, Deserialize)]
struct BulkIdsBody {
    ids: Vec<i64>,
}

async fn bulk_retry(
    State(store): State<SqliteStore>,
    Json(body): Json<BulkIdsBody>,
) -> Result<Json<CountResponse>, ApiError> {
    let affected = store.bulk_retry(&body.ids).await?;
    Ok(Json(CountResponse { affected }))
}

async fn bulk_delete(
    State(store): State<SqliteStore>,
    Json(body): Json<BulkIdsBody>,
) -> Result<Json<CountResponse>, ApiError> {
    let affected = store.bulk_delete(&body.ids).await?;
    Ok(Json(CountResponse { affected }))
}

#[derive(Debug, Deserialize)]
struct SqlBody {
    query: String,
}

/// Raw SQL escape hatch. No query-shape restriction beyond what
/// `SqliteStore::execute_sql` already applies — this is an operator tool,
/// not a public endpoint, and the Control API carries no auth layer of
/// its own (see DESIGN.md).
async fn execute_sql(
    State(store): State<SqliteStore>,
    Json(body): Json<SqlBody>,
) -> Result<Json<SqlResult>, ApiError> {
    let result = store.execute_sql(&body.query).await?;
    Ok(Json(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn test_store() -> SqliteStore {
        SqliteStore::connect_memory().await.unwrap()
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let app = router(test_store().await);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn list_queue_rejects_unknown_status() {
        let app = router(test_store().await);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/queue?status=bogus")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_job_404s_when_missing() {
        let app = router(test_store().await);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/queue/does_not_exist.yaml")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn retry_job_rejects_non_failed_job() {
        let store = test_store().await;
        store
            .upsert(crate::store::UpsertInput {
                config_name: "T2I_1_1_a.yaml".to_string(),
                job_type: "T2I".to_string(),
                workflow_id: "wf".to_string(),
                priority: 50,
                retry_limit: 2,
            })
            .await
            .unwrap();

        let app = router(store);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/queue/T2I_1_1_a.yaml/retry")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
