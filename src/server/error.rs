//! HTTP error responses

use crate::error::BgRemovalError;
use axum::{
    extract::multipart::MultipartError,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt;

/// Result type for handlers
pub type ApiResult<T> = Result<T, ApiError>;

/// Errors surfaced to HTTP clients
#[derive(Debug)]
pub enum ApiError {
    /// 400: unreadable image, unknown format, malformed request
    BadRequest(String),
    /// 413: upload larger than the configured limit
    PayloadTooLarge(String),
    /// 503: model missing or failed to load
    ServiceUnavailable(String),
    /// 504: inference exceeded its bound
    Timeout(String),
    /// 500
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::PayloadTooLarge(_) => "payload_too_large",
            Self::ServiceUnavailable(_) => "service_unavailable",
            Self::Timeout(_) => "timeout",
            Self::Internal(_) => "internal_error",
        }
    }

    fn detail(&self) -> &str {
        match self {
            Self::BadRequest(msg)
            | Self::PayloadTooLarge(msg)
            | Self::ServiceUnavailable(msg)
            | Self::Timeout(msg)
            | Self::Internal(msg) => msg,
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.kind(), self.status().as_u16(), self.detail())
    }
}

impl std::error::Error for ApiError {}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'static str,
    detail: &'a str,
    status: u16,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), "{}", self.detail());
        } else {
            tracing::debug!(status = status.as_u16(), "{}", self.detail());
        }
        let body = ErrorBody {
            error: self.kind(),
            detail: self.detail(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<BgRemovalError> for ApiError {
    fn from(err: BgRemovalError) -> Self {
        let detail = err.to_string();
        if err.is_client_error() {
            return Self::BadRequest(detail);
        }
        match err {
            BgRemovalError::ModelLoad(_) | BgRemovalError::ModelNotReady => {
                Self::ServiceUnavailable(detail)
            },
            BgRemovalError::Timeout(_) => Self::Timeout(detail),
            _ => Self::Internal(detail),
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            Self::PayloadTooLarge(err.body_text())
        } else {
            Self::BadRequest(err.body_text())
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(err: JsonRejection) -> Self {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            Self::PayloadTooLarge(err.body_text())
        } else {
            Self::BadRequest(err.body_text())
        }
    }
}
