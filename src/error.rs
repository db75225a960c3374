//! Error types for proxyrelay.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::dispatch::DispatchError;

/// Main error type for proxyrelay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("The model '{model}' does not exist or is not available")]
    ModelNotFound { model: String },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Too many concurrent requests, try again shortly")]
    Overloaded,

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl Error {
    /// HTTP status, OpenAI error `type`, and error `code` for this error.
    fn parts(&self) -> (StatusCode, &'static str, &'static str) {
        match self {
            Error::BadRequest(_) => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "invalid_request",
            ),
            Error::ModelNotFound { .. } => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "model_not_found",
            ),
            Error::Unauthorized(_) => (
                StatusCode::UNAUTHORIZED,
                "invalid_request_error",
                "invalid_api_key",
            ),
            Error::Overloaded => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limit_error",
                "rate_limit_exceeded",
            ),
            Error::Dispatch(DispatchError::Exhausted { .. }) => (
                StatusCode::BAD_GATEWAY,
                "upstream_error",
                "dispatch_exhausted",
            ),
            Error::Dispatch(DispatchError::Timeout(_)) => {
                (StatusCode::GATEWAY_TIMEOUT, "timeout", "timeout")
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, kind, code) = self.parts();

        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), error = %self, "Request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "Request rejected");
        }

        // Return OpenAI-compatible error format
        let body = serde_json::json!({
            "error": {
                "message": self.to_string(),
                "type": kind,
                "code": code
            }
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn render(err: Error) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_exhausted_renders_502_with_last_error() {
        let err = Error::from(DispatchError::Exhausted {
            attempts: 5,
            last_error: Some("upstream returned 503".to_string()),
        });
        let (status, body) = render(err).await;

        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"]["type"], "upstream_error");
        assert_eq!(body["error"]["code"], "dispatch_exhausted");
        let message = body["error"]["message"].as_str().unwrap();
        assert!(message.contains("5 attempts"), "{}", message);
        assert!(message.contains("upstream returned 503"), "{}", message);
    }

    #[tokio::test]
    async fn test_timeout_renders_504() {
        let (status, body) = render(DispatchError::Timeout(Duration::from_secs(90)).into()).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body["error"]["type"], "timeout");
        assert_eq!(body["error"]["code"], "timeout");
    }

    #[tokio::test]
    async fn test_client_errors() {
        let (status, body) = render(Error::ModelNotFound {
            model: "nope/model".to_string(),
        })
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "model_not_found");
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("nope/model"));

        let (status, body) = render(Error::Unauthorized("missing bearer token".into())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "invalid_api_key");

        let (status, body) = render(Error::Overloaded).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"]["type"], "rate_limit_error");

        let (status, body) = render(Error::BadRequest("messages must not be empty".into())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["type"], "invalid_request_error");
    }
}
