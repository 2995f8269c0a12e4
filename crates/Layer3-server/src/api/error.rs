//! API error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use labterm_foundation::Error;
use serde::Serialize;
use tracing::{debug, error, warn};

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ApiError(#[from] pub Error);

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match &self.0 {
            Error::ValidationRejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Error::OwnerMissing => StatusCode::UNAUTHORIZED,
            Error::Unauthorized(_) => StatusCode::FORBIDDEN,
            Error::SessionNotFound(_) | Error::NotFound(_) | Error::ContainerNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Error::SessionExists(_) => StatusCode::CONFLICT,
            Error::InvalidInput(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
            Error::QueueClosed | Error::Job(_) | Error::EngineUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::ExecutionTimeout { .. } | Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.0.kind();

        if status.is_server_error() {
            if status == StatusCode::SERVICE_UNAVAILABLE {
                warn!(error_code = code, "Service unavailable: {}", self.0);
            } else {
                error!(error_code = code, "API error: {}", self.0);
            }
        } else {
            debug!(error_code = code, "Client error: {}", self.0);
        }

        let body = ErrorResponse {
            error: self.0.to_string(),
            code,
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError(Error::rejected("nope")).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(ApiError(Error::OwnerMissing).status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError(Error::Unauthorized("x".into())).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError(Error::QueueClosed).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError(Error::Internal("boom".into())).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
