use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use smsq_core::errors::Error;

/// Core error rendered as a JSON body with a matching status code.
#[derive(Debug)]
pub struct ApiError(pub Error);

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

pub fn status_for(e: &Error) -> StatusCode {
    match e {
        Error::Validation(_) | Error::EmptyAudience(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::ControlConflict(_) => StatusCode::CONFLICT,
        Error::Gateway(_) => StatusCode::BAD_GATEWAY,
        Error::Config(_) | Error::Storage(_) | Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        } else {
            tracing::debug!(error = %self.0, status = status.as_u16(), "request rejected");
        }
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
