//! HTTP handlers for the run API

use crate::auth::IdentityProvider;
use axum::{
    async_trait,
    body::Body,
    extract::{FromRequestParts, Path, Query, State},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use popgen_core::{Error, ErrorKind, GenerationRequest, Identity, Run};
use popgen_runner::RunManager;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::{error, warn};

/// Shared state behind every route.
pub struct AppState {
    pub manager: Arc<RunManager>,
    pub identity: Arc<dyn IdentityProvider>,
}

// ============================================================
// Errors
// ============================================================

/// A domain error rendered as `{ "message": ... }` with a matching status.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        } else {
            warn!("Request rejected ({}): {}", status.as_u16(), self.0);
        }

        let body = Json(serde_json::json!({ "message": self.0.to_string() }));
        if status == StatusCode::UNAUTHORIZED {
            return (status, [(header::WWW_AUTHENTICATE, "Bearer")], body).into_response();
        }
        (status, body).into_response()
    }
}

// ============================================================
// Caller extraction
// ============================================================

/// The authenticated caller of a request.
pub struct Caller(pub Identity);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let credential = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        Ok(Caller(state.identity.resolve(credential)?))
    }
}

// ============================================================
// Handlers
// ============================================================

pub async fn health(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let runs = state.manager.registry().find_all().await?.len();
    Ok(Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "runs": runs,
    })))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    pub message: String,
    pub run_id: String,
}

pub async fn generate(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Json(request): Json<GenerationRequest>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let run = state.manager.start_generation(&caller, &request).await?;
    Ok(Json(GenerateResponse {
        message: "Generating was successful!".to_string(),
        run_id: run.run_id.to_string(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    #[serde(rename = "runID", alias = "runId")]
    pub run_id: String,
    pub format: String,
}

/// Stream the archive for a run and format, building it on first request.
pub async fn download(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, ApiError> {
    let handle = state
        .manager
        .fetch_archive(&caller, &query.run_id, &query.format)
        .await?;

    // A concurrent purge may remove the archive between build and open.
    let file = tokio::fs::File::open(&handle.path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::not_found(format!("{} artifacts of run {}", handle.format, handle.run_id)),
        _ => Error::from(e),
    })?;
    let len = file.metadata().await.map_err(Error::from)?.len();

    let headers = [
        (header::CONTENT_TYPE, "application/zstd".to_string()),
        (header::CONTENT_LENGTH, len.to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", handle.file_name),
        ),
    ];
    Ok((headers, Body::from_stream(ReaderStream::new(file))).into_response())
}

pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
) -> Result<Json<Vec<Run>>, ApiError> {
    Ok(Json(state.manager.list_runs(&caller).await?))
}

pub async fn list_all_runs(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
) -> Result<Json<Vec<Run>>, ApiError> {
    Ok(Json(state.manager.list_all_runs(&caller).await?))
}

pub async fn delete_run(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(run_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.manager.delete_run(&caller, &run_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
