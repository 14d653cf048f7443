//! Administrative HTTP API.
//!
//! Serves the job/task/node/queue surface from within the
//! coordinator process. Job templates are accepted as JSON or YAML
//! (by `Content-Type`). Every error renders as
//! `{"message": "..."}` with a mapped status code.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{MethodFilter, delete, get, on, post, put};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use drover_broker::Broker;
use drover_core::input::{JobInput, ScheduledJobInput};
use drover_core::{Job, JobState, ScheduledJobState};
use drover_datastore::{Datastore, DatastoreError};

use crate::error::CoordinatorError;
use crate::{Coordinator, CustomEndpoint};

const DEFAULT_PAGE_SIZE: u32 = 10;
const MAX_PAGE_SIZE: u32 = 20;

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

pub(crate) struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "message": self.message }))).into_response()
    }
}

impl From<CoordinatorError> for ApiError {
    fn from(err: CoordinatorError) -> Self {
        let status = match &err {
            CoordinatorError::Datastore(DatastoreError::NotFound { .. }) => StatusCode::NOT_FOUND,
            CoordinatorError::Datastore(DatastoreError::Conflict(_))
            | CoordinatorError::Core(_)
            | CoordinatorError::InvalidState(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %err, "internal error serving api request");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<DatastoreError> for ApiError {
    fn from(err: DatastoreError) -> Self {
        ApiError::from(CoordinatorError::Datastore(err))
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub(crate) fn router(
    coordinator: Coordinator,
    endpoints: &[(String, CustomEndpoint)],
) -> crate::error::Result<axum::Router> {
    let mut router = axum::Router::new()
        .route("/health", get(health))
        .route("/queues", get(queues))
        .route("/nodes", get(nodes))
        .route("/jobs", post(create_job).get(list_jobs))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/cancel", put(cancel_job))
        .route("/jobs/{id}/restart", put(restart_job))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/log", get(get_task_log))
        .route(
            "/scheduled-jobs",
            post(create_scheduled_job).get(list_scheduled_jobs),
        )
        .route("/scheduled-jobs/{id}", delete(delete_scheduled_job))
        .route("/scheduled-jobs/{id}/pause", put(pause_scheduled_job))
        .route("/scheduled-jobs/{id}/resume", put(resume_scheduled_job));

    for (spec, handler) in endpoints {
        let (method, path) = spec.split_once(' ').ok_or_else(|| {
            CoordinatorError::Config(format!(
                "custom endpoint `{spec}` is not of the form `METHOD /path`"
            ))
        })?;
        let filter = match method {
            "GET" => MethodFilter::GET,
            "POST" => MethodFilter::POST,
            "PUT" => MethodFilter::PUT,
            "PATCH" => MethodFilter::PATCH,
            "DELETE" => MethodFilter::DELETE,
            other => {
                return Err(CoordinatorError::Config(format!(
                    "custom endpoint `{spec}` uses unsupported method `{other}`"
                )));
            }
        };
        let handler = Arc::clone(handler);
        router = router.route(
            path.trim(),
            on(filter, move |request: Request| {
                let handler = Arc::clone(&handler);
                async move { handler(request).await }
            }),
        );
    }

    Ok(router
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(coordinator))
}

/// Bind and serve until `stop` fires.
pub(crate) async fn serve(
    coordinator: Coordinator,
    endpoints: &[(String, CustomEndpoint)],
    address: &str,
    stop: CancellationToken,
) -> crate::error::Result<()> {
    let router = router(coordinator, endpoints)?;
    let listener = tokio::net::TcpListener::bind(address)
        .await
        .map_err(|e| CoordinatorError::Config(format!("cannot bind {address}: {e}")))?;
    info!(address = %address, "api listening");
    tokio::spawn(async move {
        let shutdown = async move { stop.cancelled().await };
        if let Err(err) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!(error = %err, "api server exited with error");
        }
    });
    Ok(())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health(State(c): State<Coordinator>) -> impl IntoResponse {
    let up = c.datastore().health_check().await.is_ok()
        && c.broker().health_check().await.is_ok();
    if up {
        (StatusCode::OK, Json(json!({"status": "UP"})))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"status": "DOWN"})))
    }
}

async fn queues(State(c): State<Coordinator>) -> ApiResult<impl IntoResponse> {
    let queues = c
        .broker()
        .queues()
        .await
        .map_err(CoordinatorError::Broker)?;
    Ok(Json(queues))
}

async fn nodes(State(c): State<Coordinator>) -> ApiResult<impl IntoResponse> {
    let cutoff = chrono::Utc::now()
        - chrono::Duration::from_std(crate::health::ACTIVE_WINDOW)
            .unwrap_or_else(|_| chrono::Duration::seconds(150));
    Ok(Json(c.datastore().get_active_nodes(cutoff).await?))
}

#[derive(Deserialize)]
struct PageQuery {
    page: Option<u32>,
    size: Option<u32>,
}

impl PageQuery {
    fn resolve(&self) -> (u32, u32) {
        let page = self.page.unwrap_or(1).max(1);
        let size = self
            .size
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);
        (page, size)
    }
}

/// Parse a job template as YAML or JSON based on the content type.
fn parse_body<T: serde::de::DeserializeOwned>(headers: &HeaderMap, body: &Bytes) -> ApiResult<T> {
    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json");
    if content_type.contains("yaml") {
        serde_yaml::from_slice(body).map_err(|e| ApiError::bad_request(e.to_string()))
    } else {
        serde_json::from_slice(body).map_err(|e| ApiError::bad_request(e.to_string()))
    }
}

async fn create_job(
    State(c): State<Coordinator>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let input: JobInput = parse_body(&headers, &body)?;
    input
        .validate_input()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    let wait = input.wait.as_ref().map(|w| w.timeout);
    let job = input.to_job();

    // Register interest before the job can possibly finish.
    let waiter = wait.map(|_| c.flow().register_waiter(&job.id));

    c.datastore().create_job(&job).await?;
    c.broker()
        .publish_job(&job)
        .await
        .map_err(CoordinatorError::Broker)?;
    info!(job_id = %job.id, job_name = %job.name, "job submitted");

    match (wait, waiter) {
        (Some(timeout), Some(rx)) => match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(finished)) => Ok(Json(finished.redacted()).into_response()),
            _ => Ok(ApiError {
                status: StatusCode::REQUEST_TIMEOUT,
                message: format!("job `{}` did not finish in time", job.id),
            }
            .into_response()),
        },
        _ => Ok(Json(job.redacted()).into_response()),
    }
}

async fn list_jobs(
    State(c): State<Coordinator>,
    Query(query): Query<PageQuery>,
) -> ApiResult<impl IntoResponse> {
    let (page, size) = query.resolve();
    let mut jobs = c.datastore().get_jobs(page, size).await?;
    jobs.items = jobs.items.into_iter().map(Job::redacted).collect();
    Ok(Json(jobs))
}

async fn get_job(
    State(c): State<Coordinator>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(c.datastore().get_job(&id).await?.redacted()))
}

async fn cancel_job(
    State(c): State<Coordinator>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    // Existence check first so unknown ids are 404, not no-ops.
    c.datastore().get_job(&id).await?;
    c.flow().cancel_job(&id).await?;
    Ok(Json(json!({"status": "OK"})))
}

async fn restart_job(
    State(c): State<Coordinator>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let job = c.datastore().get_job(&id).await?;
    if !matches!(job.state, JobState::Cancelled | JobState::Failed) {
        return Err(CoordinatorError::InvalidState(format!(
            "cannot restart a job in state {}",
            job.state
        ))
        .into());
    }
    if job.is_exhausted() {
        return Err(
            CoordinatorError::InvalidState("job has no more tasks to run".into()).into(),
        );
    }
    let mut candidate = job;
    candidate.state = JobState::Restart;
    c.flow().dispatch(&mut candidate).await?;
    Ok(Json(json!({"status": "OK"})))
}

async fn get_task(
    State(c): State<Coordinator>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(c.datastore().get_task(&id).await?))
}

async fn get_task_log(
    State(c): State<Coordinator>,
    Path(id): Path<String>,
    Query(query): Query<PageQuery>,
) -> ApiResult<impl IntoResponse> {
    let (page, size) = query.resolve();
    Ok(Json(c.datastore().get_task_log_parts(&id, page, size).await?))
}

async fn create_scheduled_job(
    State(c): State<Coordinator>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let input: ScheduledJobInput = parse_body(&headers, &body)?;
    input
        .validate_input()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    let scheduled = input.to_scheduled_job();
    c.datastore().create_scheduled_job(&scheduled).await?;
    c.scheduler().register(&scheduled).await?;
    info!(scheduled_job_id = %scheduled.id, cron = %scheduled.cron, "scheduled job created");
    Ok(Json(scheduled))
}

async fn list_scheduled_jobs(
    State(c): State<Coordinator>,
    Query(query): Query<PageQuery>,
) -> ApiResult<impl IntoResponse> {
    let (page, size) = query.resolve();
    Ok(Json(c.datastore().get_scheduled_jobs(page, size).await?))
}

async fn delete_scheduled_job(
    State(c): State<Coordinator>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    c.datastore().delete_scheduled_job(&id).await?;
    c.scheduler().unregister(&id).await;
    Ok(Json(json!({"status": "OK"})))
}

async fn pause_scheduled_job(
    State(c): State<Coordinator>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    c.datastore()
        .update_scheduled_job(
            &id,
            Box::new(|s| {
                s.state = ScheduledJobState::Paused;
                Ok(())
            }),
        )
        .await?;
    Ok(Json(json!({"status": "OK"})))
}

async fn resume_scheduled_job(
    State(c): State<Coordinator>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let resumed = c
        .datastore()
        .update_scheduled_job(
            &id,
            Box::new(|s| {
                s.state = ScheduledJobState::Active;
                Ok(())
            }),
        )
        .await?;
    // Re-arm the timer: the entry is gone if the coordinator was
    // restarted while this entry was paused.
    c.scheduler().register(&resumed).await?;
    Ok(Json(json!({"status": "OK"})))
}
