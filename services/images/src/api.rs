use crate::config::ApiConfig;
use crate::error::{ImageError, StoreError};
use crate::model::{ImageRecord, OwnerId};
use crate::query::{ImageFilter, ListParams};
use crate::service::{parse_image_id, parse_image_ids, ImageService, Upload};
use anyhow::{Context, Result};
use axum::{
    async_trait,
    body::Body,
    extract::{
        rejection::{FormRejection, JsonRejection},
        DefaultBodyLimit, FromRequestParts, Multipart, Path, Query, State,
    },
    http::{header, request::Parts, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument, warn, Instrument};
use uuid::Uuid;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ImageService>,
    pub identity_header: HeaderName,
    pub max_upload_bytes: usize,
}

impl AppState {
    pub fn new(service: Arc<ImageService>, config: &ApiConfig, max_upload_bytes: usize) -> Result<Self> {
        let identity_header = HeaderName::from_bytes(config.identity_header.to_ascii_lowercase().as_bytes())
            .with_context(|| format!("Invalid identity header name: {}", config.identity_header))?;

        Ok(Self {
            service,
            identity_header,
            max_upload_bytes,
        })
    }
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub code: String,
}

impl ErrorResponse {
    fn new(error: impl Into<String>, code: &str) -> Self {
        Self {
            success: false,
            error: error.into(),
            code: code.to_string(),
        }
    }
}

impl ImageError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ImageError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ImageError::NotOwner(_) => StatusCode::FORBIDDEN,
            ImageError::NotFound(_) => StatusCode::NOT_FOUND,
            ImageError::Store(StoreError::InvalidTransition { .. }) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ImageError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, code = self.code(), "Request failed");
        } else {
            debug!(error = %self, code = self.code(), "Request rejected");
        }

        (status, Json(ErrorResponse::new(self.to_string(), self.code()))).into_response()
    }
}

/// The authenticated caller, taken from the identity header
#[derive(Debug, Clone, Copy)]
pub struct Requester(pub OwnerId);

#[async_trait]
impl FromRequestParts<AppState> for Requester {
    type Rejection = (StatusCode, Json<ErrorResponse>);

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let unauthorized = || {
            (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse::new("Missing or invalid user identity", "UNAUTHORIZED")),
            )
        };

        let value = parts
            .headers
            .get(&state.identity_header)
            .ok_or_else(unauthorized)?;
        let id = value
            .to_str()
            .ok()
            .and_then(|v| Uuid::parse_str(v.trim()).ok())
            .ok_or_else(unauthorized)?;

        Ok(Requester(OwnerId(id)))
    }
}

#[derive(Debug, Serialize)]
pub struct RecordResponse {
    pub success: bool,
    pub data: ImageRecord,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub success: bool,
    pub counts: usize,
    pub data: Vec<ImageRecord>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<u64>,
}

impl MessageResponse {
    fn new(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            deleted: None,
        }
    }
}

/// Rename form
#[derive(Debug, Deserialize)]
pub struct RenameForm {
    pub name: Option<String>,
}

/// Body of the batch endpoints
#[derive(Debug, Deserialize)]
pub struct IdsRequest {
    pub ids: Vec<String>,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let body_limit = DefaultBodyLimit::max(state.max_upload_bytes);

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route(
            "/images",
            post(create_image).get(list_images).delete(delete_images),
        )
        .route("/images/downloadManyImages", post(download_many))
        .route("/images/download/:id", get(download_image))
        .route(
            "/images/:id",
            get(get_image).put(rename_image).delete(delete_image),
        )
        .layer(body_limit)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "image-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.service.store().ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

fn bad_request(message: impl std::fmt::Display) -> ImageError {
    ImageError::InvalidInput(message.to_string())
}

/// Upload an image and run detection on it
#[instrument(skip(state, multipart), fields(owner = %owner))]
async fn create_image(
    State(state): State<AppState>,
    Requester(owner): Requester,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<RecordResponse>), ImageError> {
    let mut upload: Option<Upload> = None;
    let mut name: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("Invalid form data: {e}")))?
    {
        match field.name() {
            Some("image") => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| bad_request(format!("Failed to read image: {e}")))?
                    .to_vec();
                upload = Some(Upload { file_name, data });
            }
            Some("name") => {
                name = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| bad_request(format!("Invalid name field: {e}")))?,
                );
            }
            _ => {}
        }
    }

    let upload = upload.ok_or_else(|| bad_request("Image file is required"))?;
    // Detached from the request so a client hanging up cannot cut the workflow short
    let service = state.service.clone();
    let record = tokio::spawn(
        async move { service.create_image(owner, upload, name).await }.in_current_span(),
    )
    .await??;

    Ok((
        StatusCode::CREATED,
        Json(RecordResponse {
            success: true,
            data: record,
        }),
    ))
}

/// List the caller's images
#[instrument(skip(state))]
async fn list_images(
    State(state): State<AppState>,
    Requester(owner): Requester,
    Query(params): Query<ListParams>,
) -> Result<Json<ListResponse>, ImageError> {
    let filter = ImageFilter::from_params(&params, Utc::now())?;
    let data = state.service.list_images(owner, &filter).await?;

    Ok(Json(ListResponse {
        success: true,
        counts: data.len(),
        data,
    }))
}

async fn get_image(
    State(state): State<AppState>,
    Requester(owner): Requester,
    Path(id): Path<String>,
) -> Result<Json<RecordResponse>, ImageError> {
    let id = parse_image_id(&id)?;
    let record = state.service.owned_image(owner, id).await?;

    Ok(Json(RecordResponse {
        success: true,
        data: record,
    }))
}

async fn rename_image(
    State(state): State<AppState>,
    Requester(owner): Requester,
    Path(id): Path<String>,
    form: Result<Form<RenameForm>, FormRejection>,
) -> Result<Json<MessageResponse>, ImageError> {
    let id = parse_image_id(&id)?;
    let Form(form) = form.map_err(bad_request)?;

    state
        .service
        .rename_image(owner, id, form.name.as_deref().unwrap_or_default())
        .await?;

    Ok(Json(MessageResponse::new("Image name updated successfully")))
}

async fn delete_image(
    State(state): State<AppState>,
    Requester(owner): Requester,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>, ImageError> {
    let id = parse_image_id(&id)?;
    state.service.delete_image(owner, id).await?;

    Ok(Json(MessageResponse::new("Image deleted successfully")))
}

async fn delete_images(
    State(state): State<AppState>,
    Requester(owner): Requester,
    body: Result<Json<IdsRequest>, JsonRejection>,
) -> Result<Json<MessageResponse>, ImageError> {
    let Json(request) = body.map_err(bad_request)?;
    let ids = parse_image_ids(&request.ids)?;

    let deleted = state.service.delete_images(owner, &ids).await?;

    Ok(Json(MessageResponse {
        success: true,
        message: format!("{deleted} images deleted successfully"),
        deleted: Some(deleted),
    }))
}

/// `Content-Disposition` for an attachment named `file_name`
///
/// Characters that cannot appear in a quoted header value are replaced.
fn attachment(file_name: &str) -> HeaderValue {
    let safe: String = file_name
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii_graphic() || c == ' ' => c,
            _ => '_',
        })
        .collect();

    HeaderValue::from_str(&format!("attachment; filename=\"{safe}\""))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

/// Stream one record's deliverable
async fn download_image(
    State(state): State<AppState>,
    Requester(owner): Requester,
    Path(id): Path<String>,
) -> Result<Response, ImageError> {
    let id = parse_image_id(&id)?;
    let download = state.service.download_image(owner, id).await?;

    let file = tokio::fs::File::open(&download.path)
        .await
        .map_err(|e| ImageError::storage("open", &download.path, e))?;

    info!(image_id = %id, file_name = %download.file_name, "Serving image");

    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(download.content_type)),
            (header::CONTENT_DISPOSITION, attachment(&download.file_name)),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

/// Zip several records' deliverables into one download
async fn download_many(
    State(state): State<AppState>,
    Requester(owner): Requester,
    body: Result<Json<IdsRequest>, JsonRejection>,
) -> Result<Response, ImageError> {
    let Json(request) = body.map_err(bad_request)?;
    let ids = parse_image_ids(&request.ids)?;

    let archive = state.service.export_images(owner, &ids).await?;
    if archive.entries < ids.len() {
        warn!(
            requested = ids.len(),
            exported = archive.entries,
            "Some requested images were not exported"
        );
    }

    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("application/zip")),
            (header::CONTENT_DISPOSITION, attachment(&archive.file_name)),
        ],
        archive.bytes,
    )
        .into_response())
}

/// Start the API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting image API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
