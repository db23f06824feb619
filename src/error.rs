//! Proxy error types and response handling
//!
//! All pre-stream failures surface as an Anthropic-shaped error envelope:
//!
//! ```json
//! {"type": "error", "error": {"type": "connection_error", "message": "..."}}
//! ```
//!
//! Failures after `message_start` has been emitted never reach this type;
//! the stream translator closes the stream with an inline error block instead.

use axum::{
    body::Body,
    http::{Response, StatusCode},
    response::IntoResponse,
};
use serde_json::json;

/// Errors that can occur before the first byte of an SSE response goes out
#[derive(Debug)]
pub enum ProxyError {
    /// TCP refused, DNS failure, health probe failure, auth refresh failure
    Connection(String),
    /// 401 from upstream after a forced credential refresh
    Authentication(String),
    /// Upstream non-2xx other than 401: pass through status and body
    Upstream { status: u16, body: String },
    /// Missing API key, unknown model spec, unresolvable target
    Configuration(String),
    /// Malformed client request body
    BadRequest(String),
    /// Anything else
    Internal(String),
}

impl ProxyError {
    /// The wire-level `error.type` string for this kind
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::Connection(_) => "connection_error",
            ProxyError::Authentication(_) => "authentication_error",
            ProxyError::Upstream { .. } => "api_error",
            ProxyError::Configuration(_) => "configuration_error",
            ProxyError::BadRequest(_) => "invalid_request_error",
            ProxyError::Internal(_) => "server_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ProxyError::Connection(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Authentication(_) => StatusCode::UNAUTHORIZED,
            ProxyError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ProxyError::Configuration(_) => StatusCode::BAD_REQUEST,
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyError::Upstream { status, body } => {
                write!(f, "upstream returned {}: {}", status, body)
            }
            ProxyError::Connection(msg)
            | ProxyError::Authentication(msg)
            | ProxyError::Configuration(msg)
            | ProxyError::BadRequest(msg)
            | ProxyError::Internal(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for ProxyError {}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response<Body> {
        let status = self.status();

        // Upstream errors pass the original body through untouched so the
        // client sees exactly what the provider said.
        let body = match &self {
            ProxyError::Upstream { body, .. } if !body.is_empty() => body.clone(),
            _ => json!({
                "type": "error",
                "error": { "type": self.kind(), "message": self.to_string() }
            })
            .to_string(),
        };

        tracing::error!("Proxy error: {} - {}", status, self);

        Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap_or_else(|_| Response::new(Body::from("Internal error building error response")))
    }
}

/// Map a reqwest send error onto the taxonomy: connect-level failures become
/// `connection_error` 503, everything else is internal.
pub fn classify_send_error(err: &reqwest::Error) -> ProxyError {
    if err.is_connect() || err.is_timeout() {
        ProxyError::Connection(format!("failed to reach upstream: {}", err))
    } else {
        ProxyError::Internal(format!("upstream request failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings() {
        assert_eq!(ProxyError::Connection("x".into()).kind(), "connection_error");
        assert_eq!(
            ProxyError::Authentication("x".into()).kind(),
            "authentication_error"
        );
        assert_eq!(
            ProxyError::Upstream {
                status: 429,
                body: String::new()
            }
            .kind(),
            "api_error"
        );
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ProxyError::Connection("x".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyError::Upstream {
                status: 429,
                body: String::new()
            }
            .status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }
}
