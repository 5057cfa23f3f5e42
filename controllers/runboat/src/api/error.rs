//! API error payloads and HTTP status mapping.

use axum::http::header::WWW_AUTHENTICATE;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::error::ControllerError;

#[derive(Debug, Clone, Serialize)]
pub struct ApiErrorBody {
    pub error: String,
}

/// Errors surfaced over HTTP.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Conflict(String),
    Rejected(String),
    Unauthorized,
    Upstream(String),
    Unavailable,
}

impl From<ControllerError> for ApiError {
    fn from(e: ControllerError) -> Self {
        match e {
            ControllerError::NotFound(msg) => ApiError::NotFound(msg),
            ControllerError::Conflict(msg) => ApiError::Conflict(msg),
            ControllerError::Rejected(msg) => ApiError::Rejected(msg),
            ControllerError::Unavailable => ApiError::Unavailable,
            ControllerError::Gateway(e) if e.is_not_found() => ApiError::NotFound(e.to_string()),
            other => ApiError::Upstream(other.to_string()),
        }
    }
}

impl ApiError {
    fn status_and_message(&self) -> (StatusCode, String) {
        match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            ApiError::Rejected(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "missing or invalid credentials".to_string(),
            ),
            ApiError::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            ApiError::Unavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "controller is still starting".to_string(),
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = self.status_and_message();
        let mut response = (status, axum::Json(ApiErrorBody { error })).into_response();
        if matches!(self, ApiError::Unauthorized) {
            response
                .headers_mut()
                .insert(WWW_AUTHENTICATE, HeaderValue::from_static("Basic"));
        }
        response
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_errors_map_to_the_documented_status_codes() {
        let cases = [
            (ControllerError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (ControllerError::Conflict("x".into()), StatusCode::CONFLICT),
            (ControllerError::Rejected("x".into()), StatusCode::BAD_REQUEST),
            (ControllerError::Unavailable, StatusCode::SERVICE_UNAVAILABLE),
            (
                ControllerError::Watch("x".into()),
                StatusCode::BAD_GATEWAY,
            ),
        ];
        for (error, expected) in cases {
            let response = ApiError::from(error).into_response();
            assert_eq!(response.status(), expected);
        }
    }

    #[test]
    fn unauthorized_carries_a_challenge() {
        let response = ApiError::Unauthorized.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(WWW_AUTHENTICATE).unwrap(),
            "Basic"
        );
    }
}
