use std::path::PathBuf;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::json;
use tracing::error;

use crate::error::{SchedulingError, ServiceError};
use crate::id::ImportId;
use crate::record::NormalizedRecord;
use crate::scheduler::BatchSize;
use crate::service::{ImportService, StartImport};
use crate::upload::{SourceFile, UploadKind};

const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

#[derive(Debug)]
pub enum ApiError {
    Service(ServiceError),
    BadRequest(String),
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        ApiError::Service(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Service(ServiceError::NoActiveImport | ServiceError::NotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            ApiError::Service(ServiceError::Upload(_))
            | ApiError::Service(ServiceError::Scheduling(SchedulingError::NoFiles)) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Service(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = match self {
            ApiError::Service(err) => err.to_string(),
            ApiError::BadRequest(message) => message,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %message, "Request failed");
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Parses an optional JSON body. An empty body is `None`.
fn optional_json<T: DeserializeOwned>(body: &Bytes) -> ApiResult<Option<T>> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(body)
        .map(Some)
        .map_err(|e| ApiError::BadRequest(e.to_string()))
}

#[derive(Deserialize)]
struct UploadParams {
    #[serde(rename = "type")]
    kind: UploadKind,
    name: String,
}

#[derive(Deserialize)]
struct StartRequest {
    #[serde(default)]
    files: Vec<SourceFile>,
    /// Present for a direct import of already normalized records.
    records: Option<Vec<NormalizedRecord>>,
    batch_size: Option<BatchSize>,
    images_dir: Option<PathBuf>,
    scratch_dir: Option<PathBuf>,
}

#[derive(Deserialize, Default)]
struct TargetRequest {
    import_id: Option<ImportId>,
}

async fn upload(
    State(service): State<ImportService>,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let upload = service
        .upload_file(body.to_vec(), &params.name, params.kind)
        .await?;
    Ok((StatusCode::CREATED, Json(upload)))
}

async fn start(State(service): State<ImportService>, body: Bytes) -> ApiResult<impl IntoResponse> {
    let request: StartRequest = optional_json(&body)?
        .ok_or_else(|| ApiError::BadRequest("missing request body".to_string()))?;

    let id = match request.records {
        Some(records) => service.start_direct(records, request.batch_size).await?,
        None => {
            service
                .start_import(StartImport {
                    files: request.files,
                    batch_size: request.batch_size,
                    images_dir: request.images_dir,
                    scratch_dir: request.scratch_dir,
                })
                .await?
        }
    };
    Ok((StatusCode::ACCEPTED, Json(json!({ "import_id": id }))))
}

async fn list(State(service): State<ImportService>) -> ApiResult<impl IntoResponse> {
    Ok(Json(service.list_imports().await?))
}

async fn progress(
    State(service): State<ImportService>,
    Query(target): Query<TargetRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(service.get_progress(target.import_id.as_ref()).await?))
}

async fn progress_by_id(
    State(service): State<ImportService>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let id = ImportId::from(id);
    Ok(Json(service.get_progress(Some(&id)).await?))
}

async fn cancel(State(service): State<ImportService>, body: Bytes) -> ApiResult<impl IntoResponse> {
    let target: TargetRequest = optional_json(&body)?.unwrap_or_default();
    Ok(Json(service.cancel_import(target.import_id.as_ref()).await?))
}

async fn cleanup(State(service): State<ImportService>, body: Bytes) -> ApiResult<impl IntoResponse> {
    let target: TargetRequest = optional_json(&body)?.unwrap_or_default();
    service.cleanup(target.import_id.as_ref()).await?;
    Ok(Json(json!({ "ok": true })))
}

pub fn router(service: ImportService) -> Router {
    Router::new()
        .route(
            "/uploads",
            post(upload).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/imports", get(list).post(start))
        .route("/imports/progress", get(progress))
        .route("/imports/cancel", post(cancel))
        .route("/imports/cleanup", post(cleanup))
        .route("/imports/{id}", get(progress_by_id))
        .with_state(service)
}
