use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;

/// Request-time errors, each mapped to a terminal response.
///
/// Validation and metering failures are always recovered into one of these —
/// a request handler never crashes, and nothing ever falls through to the
/// upstream on error. Startup configuration problems live in
/// [`crate::config::ConfigError`] and are the only fatal class.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed ingress (bad header encoding, unusable method).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Missing or invalid capability token.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Payment flow failure outside the normal challenge path.
    #[error("payment required: {0}")]
    PaymentRequired(String),

    /// No route, policy deny, or scope mismatch.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Capability quota exhausted. There is no payment to prompt for.
    #[error("quota exhausted: {0}")]
    TooManyRequests(String),

    /// Upstream unreachable or misbehaving.
    #[error("bad gateway: {0}")]
    BadGateway(String),

    /// Upstream exceeded its configured timeout.
    #[error("gateway timeout: {0}")]
    GatewayTimeout(String),

    /// Anything unanticipated. Fail closed, never default-allow.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable machine-readable code for the JSON error body.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::BadRequest(_) => "bad_request",
            GatewayError::Unauthorized(_) => "unauthorized",
            GatewayError::PaymentRequired(_) => "payment_required",
            GatewayError::Forbidden(_) => "forbidden",
            GatewayError::TooManyRequests(_) => "too_many_requests",
            GatewayError::BadGateway(_) => "bad_gateway",
            GatewayError::GatewayTimeout(_) => "gateway_timeout",
            GatewayError::Internal(_) => "internal_error",
        }
    }
}

impl ResponseError for GatewayError {
    fn error_response(&self) -> HttpResponse {
        let (mut builder, message) = match self {
            GatewayError::BadRequest(m) => (HttpResponse::BadRequest(), m.clone()),
            GatewayError::Unauthorized(m) => (HttpResponse::Unauthorized(), m.clone()),
            GatewayError::PaymentRequired(m) => (HttpResponse::PaymentRequired(), m.clone()),
            GatewayError::Forbidden(m) => (HttpResponse::Forbidden(), m.clone()),
            GatewayError::TooManyRequests(m) => (HttpResponse::TooManyRequests(), m.clone()),
            GatewayError::BadGateway(m) => {
                tracing::error!(error = %m, "upstream failure");
                (
                    HttpResponse::BadGateway(),
                    "failed to reach upstream service".to_string(),
                )
            }
            GatewayError::GatewayTimeout(m) => {
                tracing::warn!(error = %m, "upstream timeout");
                (
                    HttpResponse::GatewayTimeout(),
                    "upstream exceeded its deadline".to_string(),
                )
            }
            GatewayError::Internal(m) => {
                tracing::error!(error = %m, "internal gateway error");
                (
                    HttpResponse::InternalServerError(),
                    "an internal error occurred".to_string(),
                )
            }
        };
        builder.json(serde_json::json!({
            "error": self.code(),
            "message": message,
        }))
    }
}
