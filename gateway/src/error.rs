//! Maps [`gateway_core::GatewayError`] to the HTTP status codes and
//! WebSocket close codes §7 assigns to each error kind.
//!
//! Grounded on `shelter::error::http::HTTPResponseError`'s
//! `actix_web::error::ResponseError` impl: a small enum, a hand-written
//! `Display`, and a `From<GatewayError>` conversion done once at the
//! layer boundary rather than scattered through the handlers.

use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use gateway_core::error::GatewayError;

/// Pre-upgrade and plain-HTTP failure, rendered as a small JSON body.
#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    reason: String,
}

impl HttpError {
    pub fn new(status: StatusCode, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }

    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, reason)
    }

    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, reason)
    }

    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, reason)
    }

    pub fn too_many_requests(reason: impl Into<String>) -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, reason)
    }

    pub fn service_unavailable(reason: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, reason)
    }
}

impl std::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reason)
    }
}

impl actix_web::error::ResponseError for HttpError {
    fn status_code(&self) -> StatusCode {
        self.status
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status).json(serde_json::json!({ "error": self.reason }))
    }
}

impl From<GatewayError> for HttpError {
    fn from(err: GatewayError) -> Self {
        let status = match &err {
            GatewayError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            GatewayError::PolicyDenied(_) => StatusCode::FORBIDDEN,
            GatewayError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            GatewayError::ResourceExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        log::warn!("request rejected ({status}): {err}");
        Self::new(status, err.kind())
    }
}

/// Close code a `/tcp` or `/tcp-mux` session should use when tearing
/// down for a reason the peer should be told about.
pub fn ws_close_code(err: &GatewayError) -> u16 {
    match err {
        GatewayError::InvalidInput(_) => 1007,
        GatewayError::PolicyDenied(_) => 1008,
        GatewayError::UpstreamUnavailable(_) => 1011,
        GatewayError::ResourceExhausted(_) => 1013,
        GatewayError::Internal(_) => 1011,
    }
}
