//! Error envelope shared by all endpoints.
//!
//! Failures are rendered as `{ "status": "error", "message": "...", "code": "..." }`
//! with an HTTP status derived from the service error.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::service::ServiceError;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub status: &'static str,
    pub message: String,
    pub code: String,
}

/// An error response ready to hand back from a handler.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: String,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        let status = match &err {
            ServiceError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ServiceError::UnsupportedRpm(_) | ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::RetrainInProgress(_) => StatusCode::CONFLICT,
            ServiceError::Processing(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ServiceError::Model(_)
            | ServiceError::Storage(_)
            | ServiceError::Io(_)
            | ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(code = err.code(), error = %err, "Request failed");
        } else {
            tracing::debug!(code = err.code(), error = %err, "Request rejected");
        }
        Self::new(status, err.code(), err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            status: "error",
            message: self.message,
            code: self.code,
        };
        (self.status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_error_response_shape() {
        let resp = ApiError::from(ServiceError::UnsupportedRpm("900".to_string())).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .expect("body");
        let v: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(v["status"], "error");
        assert_eq!(v["code"], "UNSUPPORTED_RPM");
        assert_eq!(v["message"], "Unsupported RPM: 900");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::from(ServiceError::InvalidInput("x".to_string())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(ServiceError::RetrainInProgress("800".to_string())).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(ServiceError::Internal("boom".to_string())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
