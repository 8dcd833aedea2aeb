use application::ApplicationError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code,
                message: message.into(),
            },
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "FORBIDDEN", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<ApplicationError> for ApiError {
    fn from(error: ApplicationError) -> Self {
        use domain::{DomainError, RepositoryError};

        match error {
            ApplicationError::Authentication(message) => ApiError::unauthorized(message),
            ApplicationError::Authorization(message) => ApiError::forbidden(message),
            ApplicationError::Validation(message) => ApiError::bad_request(message),
            ApplicationError::NotFound(message) => ApiError::not_found(message),
            ApplicationError::Domain(DomainError::ValidationError { field, message }) => {
                ApiError::new(
                    StatusCode::BAD_REQUEST,
                    "INVALID_ARGUMENT",
                    format!("{field}: {message}"),
                )
            }
            ApplicationError::Domain(DomainError::PermissionDenied { action }) => {
                ApiError::new(StatusCode::FORBIDDEN, "PERMISSION_DENIED", action)
            }
            ApplicationError::Domain(DomainError::BusinessRuleViolation { rule }) => {
                ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, "RULE_VIOLATION", rule)
            }
            ApplicationError::Domain(DomainError::NotFound {
                resource_type,
                resource_id,
            }) => ApiError::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("{resource_type} {resource_id} not found"),
            ),
            ApplicationError::Repository(RepositoryError::NotFound) => {
                ApiError::not_found("resource not found")
            }
            ApplicationError::Repository(RepositoryError::Conflict) => {
                ApiError::new(StatusCode::CONFLICT, "CONFLICT", "resource already exists")
            }
            ApplicationError::Repository(RepositoryError::Storage { message }) => {
                tracing::error!(error = %message, "storage failure");
                ApiError::internal_server_error("storage failure")
            }
            ApplicationError::Infrastructure(message) => {
                tracing::error!(error = %message, "infrastructure failure");
                ApiError::internal_server_error("internal error")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
