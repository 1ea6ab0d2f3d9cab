//! HTTP routes
//!
//! | Method | Path                | Body                                             |
//! |--------|---------------------|--------------------------------------------------|
//! | GET    | `/`                 |                                                  |
//! | GET    | `/health`           |                                                  |
//! | POST   | `/remove-bg`        | multipart: files, `return_mask`, `output_format` |
//! | POST   | `/remove-bg-base64` | JSON `{image_base64, return_mask, output_format}` |

use super::error::{ApiError, ApiResult};
use crate::{
    config::{OutputFormat, ServerConfig},
    service::{BatchItem, EncodedResult, RemovalService, SingleEncoding, SingleResponse},
    services::format::decode_base64_payload,
};
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, DefaultBodyLimit, Multipart, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

/// Name of the archive returned for multi-file uploads
pub const ARCHIVE_NAME: &str = "processed_images.zip";

/// Number of inputs that made it into the archive
pub const PROCESSED_COUNT: &str = "x-processed-count";
/// Number of inputs left out of the archive
pub const SKIPPED_COUNT: &str = "x-skipped-count";

/// Shared state of every handler
#[derive(Debug, Clone)]
pub struct AppState {
    service: RemovalService,
    project_name: Arc<str>,
    cuda_available: bool,
}

impl AppState {
    #[must_use]
    pub fn new(service: RemovalService, project_name: &str) -> Self {
        Self {
            service,
            project_name: Arc::from(project_name),
            cuda_available: crate::backends::cuda_available(),
        }
    }
}

/// Build the application router
pub fn router(state: AppState, config: &ServerConfig) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/remove-bg", post(remove_bg))
        .route("/remove-bg-base64", post(remove_bg_base64))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(DefaultBodyLimit::max(config.max_upload_bytes)),
        )
        .with_state(state)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RootResponse {
    pub message: String,
    pub docs: String,
}

async fn root(State(state): State<AppState>) -> Json<RootResponse> {
    Json(RootResponse {
        message: format!("{} is Online", state.project_name),
        docs: "/health".to_string(),
    })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub model: String,
    pub device: String,
    pub cuda_available: bool,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let handle = state.service.handle();
    Json(HealthResponse {
        status: "healthy".to_string(),
        model: handle.model_id().to_string(),
        device: handle.compute_target().to_string(),
        cuda_available: state.cuda_available,
    })
}

/// Form options shared by both removal endpoints
#[derive(Debug)]
struct RemovalOptions {
    return_mask: bool,
    output_format: OutputFormat,
}

fn parse_bool(field: &str, value: &str) -> ApiResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        other => Err(ApiError::BadRequest(format!(
            "Field '{field}' must be a boolean, got '{other}'"
        ))),
    }
}

async fn remove_bg(State(state): State<AppState>, mut multipart: Multipart) -> ApiResult<Response> {
    let mut uploads = Vec::new();
    let mut return_mask = String::new();
    let mut output_format = String::from("png");

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match (field.file_name().map(str::to_string), name.as_str()) {
            (Some(file_name), _) => {
                let bytes = field.bytes().await?;
                uploads.push(BatchItem::new(file_name, bytes.to_vec()));
            },
            (None, "return_mask") => return_mask = field.text().await?,
            (None, "output_format") => output_format = field.text().await?,
            (None, other) => tracing::debug!(field = other, "Ignoring form field"),
        }
    }

    let options = RemovalOptions {
        return_mask: parse_bool("return_mask", &return_mask)?,
        output_format: OutputFormat::parse(&output_format)?,
    };

    match uploads.len() {
        0 => Err(ApiError::BadRequest("No image files uploaded".to_string())),
        1 => {
            let item = uploads.remove(0);
            let response = state
                .service
                .remove_single(
                    item.bytes,
                    options.return_mask,
                    options.output_format,
                    SingleEncoding::Binary,
                    Some(&item.name),
                )
                .await?;
            Ok(single_response(response))
        },
        _ => {
            let archive = state
                .service
                .remove_batch(uploads, options.return_mask, options.output_format)
                .await?;
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/zip")
                .header(
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename={ARCHIVE_NAME}"),
                )
                .header(PROCESSED_COUNT, archive.processed)
                .header(SKIPPED_COUNT, archive.skipped.len())
                .body(Body::from(archive.bytes))
                .map_err(|e| ApiError::Internal(format!("Failed to build response: {e}")))
        },
    }
}

fn single_response(response: SingleResponse) -> Response {
    match response {
        SingleResponse::Binary {
            bytes,
            content_type,
        } => ([(header::CONTENT_TYPE, content_type)], bytes).into_response(),
        SingleResponse::Encoded(encoded) => Json(encoded).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct Base64Request {
    pub image_base64: String,
    #[serde(default)]
    pub return_mask: bool,
    #[serde(default = "default_format")]
    pub output_format: String,
}

fn default_format() -> String {
    "png".to_string()
}

async fn remove_bg_base64(
    State(state): State<AppState>,
    payload: Result<Json<Base64Request>, JsonRejection>,
) -> ApiResult<Json<EncodedResult>> {
    let Json(request) = payload?;
    let output_format = OutputFormat::parse(&request.output_format)?;
    let bytes = decode_base64_payload(&request.image_base64)?;

    match state
        .service
        .remove_single(bytes, request.return_mask, output_format, SingleEncoding::Base64, None)
        .await?
    {
        SingleResponse::Encoded(encoded) => Ok(Json(encoded)),
        SingleResponse::Binary { .. } => Err(ApiError::Internal(
            "Encoder returned binary output for a base64 request".to_string(),
        )),
    }
}
