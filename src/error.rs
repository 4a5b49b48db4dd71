//! Unified error type for the gateway.
//!
//! Every fallible operation in `supervisor`, `registry`, and `gateway`
//! returns a `GatewayError`. The `IntoResponse` impl is the single place
//! that decides what a client is allowed to see — internal detail (auth
//! file paths, PIDs, upstream bodies) stays in `tracing` fields and never
//! reaches the response body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("port {0} already in use")]
    PortInUse(u16),

    #[error("worker launch failed: {0}")]
    Launch(String),

    #[error("port {0} did not release within timeout")]
    PortStuck(u16),

    #[error("unknown worker: {0}")]
    UnknownWorker(String),

    #[error("upstream request timed out")]
    UpstreamTimeout,

    #[error("upstream connection error: {0}")]
    UpstreamConnection(String),

    #[error("quota exceeded for model {0}")]
    QuotaExceeded(String),

    #[error("no eligible worker for model {0}")]
    NoEligibleWorker(String),

    #[error("client disconnected")]
    ClientDisconnected,

    #[error("request timed out")]
    RequestTimeout,

    #[error("request queue is full")]
    QueueFull,

    #[error("bad request: {0}")]
    BadRequest(String),
}

impl GatewayError {
    /// HTTP status this error surfaces as.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Config(_) => StatusCode::BAD_REQUEST,
            GatewayError::PortInUse(_)
            | GatewayError::Launch(_)
            | GatewayError::PortStuck(_)
            | GatewayError::UnknownWorker(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::UpstreamConnection(_) => StatusCode::BAD_GATEWAY,
            GatewayError::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::NoEligibleWorker(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::ClientDisconnected => StatusCode::BAD_REQUEST,
            GatewayError::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Client-safe diagnostic message. Never includes file paths or PIDs.
    fn client_message(&self) -> String {
        match self {
            GatewayError::Config(_) => "invalid configuration".to_string(),
            GatewayError::PortInUse(_)
            | GatewayError::Launch(_)
            | GatewayError::PortStuck(_)
            | GatewayError::UnknownWorker(_) => "internal supervisor error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        tracing::warn!(error = %self, status = %status, "request failed");
        let mut body = json!({ "error": self.client_message() });
        if status == StatusCode::SERVICE_UNAVAILABLE || status == StatusCode::TOO_MANY_REQUESTS {
            body["retry_after"] = json!(30);
        }
        (status, axum::Json(body)).into_response()
    }
}
