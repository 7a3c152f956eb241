use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use uuid::Uuid;

use crate::db;

/// API error type that converts to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    /// An atomic append lost its race; `current` is the advanced selector URI.
    Conflict { message: String, current: String },
    Unprocessable(String),
    Unavailable(String),
    /// Logged in full; clients only see the correlation reference.
    Internal { reference: String },
}

impl ApiError {
    /// Log the cause and return an opaque correlation reference.
    pub fn internal(err: impl std::fmt::Display) -> ApiError {
        let reference = Uuid::new_v4().simple().to_string();
        tracing::error!(reference = %reference, error = %err, "internal error");
        ApiError::Internal { reference }
    }
}

impl From<crate::Error> for ApiError {
    fn from(err: crate::Error) -> Self {
        match err {
            crate::Error::BadInput(m) => ApiError::BadRequest(m),
            crate::Error::Forbidden(m) => ApiError::Forbidden(m),
            crate::Error::NotFound(m) => ApiError::NotFound(m),
            crate::Error::Unprocessable(m) => ApiError::Unprocessable(m),
            crate::Error::Unavailable(m) => ApiError::Unavailable(m),
            crate::Error::Database(e) => {
                if db::is_connection_error(&e) {
                    ApiError::Unavailable("database unavailable".to_string())
                } else if db::is_syntax_error(&e) {
                    ApiError::BadRequest("invalid selector query".to_string())
                } else {
                    ApiError::internal(e)
                }
            }
            crate::Error::Json(e) => ApiError::internal(e),
            crate::Error::Internal(m) => ApiError::internal(m),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    current: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, current) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m, None),
            ApiError::Unauthorized(m) => (StatusCode::UNAUTHORIZED, m, None),
            ApiError::Forbidden(m) => (StatusCode::FORBIDDEN, m, None),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m, None),
            ApiError::Conflict { message, current } => {
                (StatusCode::CONFLICT, message, Some(current))
            }
            ApiError::Unprocessable(m) => (StatusCode::UNPROCESSABLE_ENTITY, m, None),
            ApiError::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m, None),
            ApiError::Internal { reference } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Unexpected error. ref#{reference}"),
                None,
            ),
        };

        let body = serde_json::to_vec(&ErrorBody { message, current }).unwrap_or_default();
        let mut response = (
            status,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response();
        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                header::HeaderValue::from_static("Bearer realm=\"evently\""),
            );
        }
        response
    }
}
