//! Error types and HTTP error codes

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use linkstream_core::CoreError;
use linkstream_upstream::UpstreamError;
use serde_json::json;
use thiserror::Error;

/// Retry-After for 429 responses
pub const THROTTLED_RETRY_AFTER_SECS: u64 = 60;
/// Retry-After for 503 responses
pub const UNAVAILABLE_RETRY_AFTER_SECS: u64 = 5;

/// Stable error codes returned in error bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidRange,
    NotFound,
    Forbidden,
    Unauthorized,
    Throttled,
    Unavailable,
    UpstreamFailed,
    InternalError,
}

impl ErrorCode {
    /// Get the error code string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRange => "invalid_range",
            Self::NotFound => "not_found",
            Self::Forbidden => "forbidden",
            Self::Unauthorized => "unauthorized",
            Self::Throttled => "throttled",
            Self::Unavailable => "unavailable",
            Self::UpstreamFailed => "upstream_failed",
            Self::InternalError => "internal_error",
        }
    }

    /// Get the HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRange => StatusCode::RANGE_NOT_SATISFIABLE,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Throttled => StatusCode::TOO_MANY_REQUESTS,
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamFailed => StatusCode::BAD_GATEWAY,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn retry_after(&self) -> Option<u64> {
        match self {
            Self::Throttled => Some(THROTTLED_RETRY_AFTER_SECS),
            Self::Unavailable => Some(UNAVAILABLE_RETRY_AFTER_SECS),
            _ => None,
        }
    }
}

/// API error type
#[derive(Error, Debug)]
#[error("{}: {message}", .code.as_str())]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub request_id: Option<String>,
    /// File size, rendered as `Content-Range: bytes */<size>` on 416
    pub file_size: Option<u64>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            request_id: None,
            file_size: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// Attach the id of the request that failed
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Get the error code
    pub fn error_code(&self) -> ErrorCode {
        self.code
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        let code = match &err {
            CoreError::InvalidRange { size, .. } => {
                let mut api = ApiError::new(ErrorCode::InvalidRange, err.to_string());
                api.file_size = Some(*size);
                return api;
            }
            CoreError::NotFound(_) => ErrorCode::NotFound,
            CoreError::Forbidden(_) => ErrorCode::Forbidden,
            CoreError::Throttled(_) => ErrorCode::Throttled,
            CoreError::ClientUnavailable(_)
            | CoreError::FloodWaited { .. }
            | CoreError::ClientDisabled { .. } => ErrorCode::Unavailable,
            CoreError::UpstreamTransient { .. } => ErrorCode::UpstreamFailed,
            CoreError::Upstream(source) => return source.clone().into(),
            CoreError::Disconnected => ErrorCode::InternalError,
        };
        ApiError::new(code, err.to_string())
    }
}

impl From<UpstreamError> for ApiError {
    fn from(err: UpstreamError) -> Self {
        let code = match &err {
            UpstreamError::NotFound(_) | UpstreamError::FileGone(_) => ErrorCode::NotFound,
            UpstreamError::FloodWait { .. } | UpstreamError::AuthRevoked(_) => {
                ErrorCode::Unavailable
            }
            UpstreamError::Backend(_) => ErrorCode::InternalError,
            _ => ErrorCode::UpstreamFailed,
        };
        ApiError::new(code, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.error_code();
        let status = code.status_code();

        if status.is_server_error() {
            tracing::warn!(code = code.as_str(), request_id = ?self.request_id, "{}", self.message);
        } else {
            tracing::debug!(code = code.as_str(), request_id = ?self.request_id, "{}", self.message);
        }

        let body = json!({
            "code": code.as_str(),
            "message": self.message,
            "request_id": self.request_id,
        });
        let mut response = (status, Json(body)).into_response();

        let headers = response.headers_mut();
        if let Some(id) = self
            .request_id
            .as_deref()
            .and_then(|id| HeaderValue::from_str(id).ok())
        {
            headers.insert("x-request-id", id);
        }
        if let Some(secs) = code.retry_after() {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        if let (ErrorCode::InvalidRange, Some(size)) = (code, self.file_size) {
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{}", size)) {
                headers.insert(header::CONTENT_RANGE, value);
            }
        }
        response
    }
}
