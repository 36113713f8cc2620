use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::error::Error;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        match err {
            Error::Token(rejection) => AppError::Unauthorized(rejection.reason().to_string()),
            Error::Forbidden(msg) => AppError::Forbidden(msg),
            Error::Config(msg) => AppError::BadRequest(msg),
            Error::BackendUnavailable(msg) => AppError::Unavailable(msg),
            Error::Redis(e) => AppError::Unavailable(e.to_string()),
            Error::Serialization(e) => AppError::BadRequest(e.to_string()),
            Error::Internal(msg) => AppError::Internal(msg),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, self.to_string()),
            AppError::Forbidden(_) => (StatusCode::FORBIDDEN, self.to_string()),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        let body = Json(json!({
            "error": error_message,
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TokenRejection;

    #[test]
    fn core_errors_render_through_app_error() {
        let status = |err: Error| AppError::from(err).into_response().status();

        assert_eq!(status(Error::BackendUnavailable("timeout".into())), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status(Error::Token(TokenRejection::Revoked)), StatusCode::UNAUTHORIZED);
        assert_eq!(status(Error::Forbidden("nope".into())), StatusCode::FORBIDDEN);
        assert_eq!(status(Error::Internal("boom".into())), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
