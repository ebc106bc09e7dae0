use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::services::jobs::{CreateJobError, JobQueryError};
use crate::services::validation::ResolveError;

#[derive(Debug, Serialize)]
struct ErrorResponse {
    status: u16,
    detail: String,
}

#[derive(Debug)]
pub(crate) enum ApiError {
    Unauthorized(&'static str),
    Forbidden(&'static str),
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    TooManyRequests(&'static str),
    Internal(String),
}

impl ApiError {
    /// Log the underlying error with context and return an `Internal` variant.
    pub(crate) fn internal(err: impl std::fmt::Display, context: &str) -> Self {
        tracing::error!(error = %err, "{context}");
        Self::Internal(context.to_string())
    }
}

impl From<CreateJobError> for ApiError {
    fn from(err: CreateJobError) -> Self {
        match err {
            CreateJobError::ExamNotFound(exam_id) => {
                ApiError::NotFound(format!("Exam {exam_id} not found"))
            }
            CreateJobError::Store(err) => ApiError::internal(err, "Failed to create job"),
            other => ApiError::BadRequest(other.to_string()),
        }
    }
}

impl From<JobQueryError> for ApiError {
    fn from(err: JobQueryError) -> Self {
        match err {
            JobQueryError::NotFound => ApiError::NotFound("Job not found".to_string()),
            JobQueryError::Forbidden => ApiError::Forbidden("Job belongs to another user"),
            JobQueryError::Store(err) => ApiError::internal(err, "Failed to load job"),
        }
    }
}

impl From<ResolveError> for ApiError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::NotFound => ApiError::NotFound("Job not found".to_string()),
            ResolveError::Forbidden => ApiError::Forbidden("Job belongs to another user"),
            ResolveError::InvalidState(_) => ApiError::Conflict(err.to_string()),
            ResolveError::UnknownQuestion(_) => ApiError::NotFound(err.to_string()),
            ResolveError::Store(err) => {
                ApiError::internal(err, "Failed to resolve validation item")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized(message) => {
                let status = StatusCode::UNAUTHORIZED;
                let mut response = (
                    status,
                    Json(ErrorResponse { status: status.as_u16(), detail: message.to_string() }),
                )
                    .into_response();
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
                response
            }
            ApiError::Forbidden(message) => {
                let status = StatusCode::FORBIDDEN;
                (
                    status,
                    Json(ErrorResponse { status: status.as_u16(), detail: message.to_string() }),
                )
                    .into_response()
            }
            ApiError::BadRequest(message) => {
                let status = StatusCode::BAD_REQUEST;
                (status, Json(ErrorResponse { status: status.as_u16(), detail: message }))
                    .into_response()
            }
            ApiError::NotFound(message) => {
                let status = StatusCode::NOT_FOUND;
                (status, Json(ErrorResponse { status: status.as_u16(), detail: message }))
                    .into_response()
            }
            ApiError::Conflict(message) => {
                let status = StatusCode::CONFLICT;
                (status, Json(ErrorResponse { status: status.as_u16(), detail: message }))
                    .into_response()
            }
            ApiError::TooManyRequests(message) => {
                let status = StatusCode::TOO_MANY_REQUESTS;
                (
                    status,
                    Json(ErrorResponse { status: status.as_u16(), detail: message.to_string() }),
                )
                    .into_response()
            }
            ApiError::Internal(message) => {
                tracing::error!(error = %message, "Internal server error");
                let status = StatusCode::INTERNAL_SERVER_ERROR;
                (status, Json(ErrorResponse { status: status.as_u16(), detail: message }))
                    .into_response()
            }
        }
    }
}
