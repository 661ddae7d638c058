use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::{error, warn};

use crate::error::{ErrorKind, HubError};

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub status: &'static str,
    pub message: String,
}

/// Transport wrapper turning [`HubError`] into an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub HubError);

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self.0.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match &self.0 {
            HubError::AlreadyRunning(_) => "already_running",
            err => match err.kind() {
                ErrorKind::Validation => "invalid_request",
                ErrorKind::NotFound => "not_found",
                ErrorKind::Conflict => "conflict",
                ErrorKind::Internal => "internal_error",
            },
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            status: self.code(),
            message: self.0.to_string(),
        }
    }
}

impl From<HubError> for ApiError {
    fn from(err: HubError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        } else {
            warn!(error = %self.0, status = status.as_u16(), "Request rejected");
        }
        (status, Json(self.body())).into_response()
    }
}
