//! HTTP handlers for the export endpoints under `/engine`.

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use rulestream_api::ApiError;
use rulestream_core::{CsvParameters, FactId, FactParameters, SearchSpec};
use serde::Deserialize;
use uuid::Uuid;

use crate::identity::{Caller, permissions};
use crate::server::AppState;

use super::error::ExportError;
use super::queue::{Admission, DeleteOutcome, SearchTarget};

fn default_streaming() -> bool {
    true
}

/// Body of `POST /engine/facts/streamedexport` and `POST /engine/exports/fact`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactExportBody {
    #[serde(rename = "factIDs", alias = "factIds", default)]
    pub fact_ids: Vec<FactId>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub csv_parameters: CsvParameters,
    #[serde(default)]
    pub fact_parameters: FactParameters,
    #[serde(default = "default_streaming")]
    pub streaming: bool,
}

/// Body of `POST /engine/exports/custom`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomExportBody {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub indices: String,
    #[serde(default)]
    pub search_requests: Vec<SearchSpec>,
    /// Name of the configured search backend
    #[serde(default)]
    pub elastic_name: String,
    #[serde(default)]
    pub csv_parameters: CsvParameters,
    #[serde(default = "default_streaming")]
    pub streaming: bool,
}

pub fn export_routes() -> Router<AppState> {
    Router::new()
        .route("/engine/facts/streamedexport", post(streamed_export))
        .route("/engine/exports", get(list_exports))
        .route("/engine/exports/fact", post(queue_fact_export))
        .route("/engine/exports/custom", post(queue_custom_export))
        .route(
            "/engine/exports/{id}",
            get(get_export).delete(delete_export),
        )
        .route("/engine/exports/{id}/download", get(download_export))
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(value)| value).map_err(|rejection| {
        ApiError::bad_request("request.invalid_body", rejection.body_text())
    })
}

fn parse_id(id: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(id).map_err(|_| ApiError::bad_request("request.invalid_id", "Invalid export id"))
}

impl AppState {
    fn export_error(&self, err: ExportError) -> ApiError {
        err.into_api_error(self.verbose_errors)
    }
}

fn admission_response(admission: Admission) -> Result<Response, ApiError> {
    match admission {
        Admission::Added(job) => Ok((StatusCode::CREATED, Json(job)).into_response()),
        Admission::UserAdded(job) => Ok((StatusCode::OK, Json(job)).into_response()),
        Admission::UserExists(job) => Err(ApiError::conflict(
            "export.user_exists",
            format!("Export {} was already requested by this user", job.id),
        )),
        Admission::QueueFull => Err(ApiError::too_many_requests(
            "export.queue_full",
            "Export queue is full, retry later",
        )),
    }
}

/// POST /engine/facts/streamedexport - Stream a fact export as chunked CSV.
pub async fn streamed_export(
    State(state): State<AppState>,
    Caller(caller): Caller,
    body: Result<Json<FactExportBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    caller.require(permissions::EXPORT_STREAM)?;
    let body = json_body(body)?;

    state
        .service
        .stream_fact_export(
            &body.fact_ids,
            &body.title,
            body.csv_parameters,
            body.fact_parameters,
            &caller.user,
        )
        .await
        .map_err(|e| state.export_error(e))
}

/// GET /engine/exports - List the caller's exports.
pub async fn list_exports(
    State(state): State<AppState>,
    Caller(caller): Caller,
) -> Result<impl IntoResponse, ApiError> {
    caller.require(permissions::EXPORT_READ)?;
    Ok(Json(state.service.user_exports(&caller.user)))
}

/// GET /engine/exports/{id} - Read one of the caller's exports.
pub async fn get_export(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    caller.require(permissions::EXPORT_READ)?;
    let id = parse_id(&id)?;
    let job = state
        .service
        .user_export(id, &caller.user)
        .map_err(|e| state.export_error(e))?;
    Ok(Json(job))
}

/// DELETE /engine/exports/{id} - Unsubscribe, delete, or cancel a running export.
pub async fn delete_export(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    caller.require(permissions::EXPORT_DELETE)?;
    let id = parse_id(&id)?;
    match state.service.delete_export(id, &caller.user).await {
        DeleteOutcome::Deleted | DeleteOutcome::UserDeleted => Ok(StatusCode::NO_CONTENT),
        DeleteOutcome::Canceled => Ok(StatusCode::ACCEPTED),
        DeleteOutcome::NotFound => Err(state.export_error(ExportError::NotFound)),
    }
}

/// POST /engine/exports/fact - Queue a fact export.
pub async fn queue_fact_export(
    State(state): State<AppState>,
    Caller(caller): Caller,
    body: Result<Json<FactExportBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    caller.require(permissions::EXPORT_CREATE)?;
    let body = json_body(body)?;

    let admission = state
        .service
        .queue_fact_export(
            &body.fact_ids,
            &body.title,
            body.csv_parameters,
            caller.user,
            body.fact_parameters,
            body.streaming,
        )
        .await
        .map_err(|e| state.export_error(e))?;
    admission_response(admission)
}

/// POST /engine/exports/custom - Queue a custom search export.
pub async fn queue_custom_export(
    State(state): State<AppState>,
    Caller(caller): Caller,
    body: Result<Json<CustomExportBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    caller.require(permissions::EXPORT_CREATE)?;
    let body = json_body(body)?;

    let target = SearchTarget {
        indices: body.indices,
        backend: body.elastic_name,
    };
    let admission = state
        .service
        .queue_custom_export(
            &body.title,
            target,
            body.search_requests,
            body.csv_parameters,
            caller.user,
            body.streaming,
        )
        .await
        .map_err(|e| state.export_error(e))?;
    admission_response(admission)
}

/// GET /engine/exports/{id}/download - Fetch a completed export artifact.
pub async fn download_export(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    caller.require(permissions::EXPORT_READ)?;
    let id = parse_id(&id)?;
    state
        .service
        .download(id, &caller.user)
        .await
        .map_err(|e| state.export_error(e))
}
