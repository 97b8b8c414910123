//! Error types for the pdfsvc library.
//!
//! A single enum, [`PdfSvcError`], covers every way a request can fail. The
//! variants fall into three groups that callers treat differently:
//!
//! * **Caller-correctable**: [`PdfSvcError::TooLarge`],
//!   [`PdfSvcError::ResourceUnavailable`] and the entry-point rejections
//!   (method, auth, content type, charset). Reported immediately, never
//!   retried by the service.
//!
//! * **Context-driven**: [`PdfSvcError::Cancelled`] and
//!   [`PdfSvcError::DeadlineExceeded`] propagate outward from whichever
//!   suspension point observed them. Retrying is the caller's business.
//!
//! * **Internal**: [`PdfSvcError::ProcessFailure`],
//!   [`PdfSvcError::StorageFailure`] and friends. Logged with full context,
//!   surfaced to the client as a bare `500`.
//!
//! Every variant maps to exactly one HTTP status via
//! [`PdfSvcError::status_code`]. The response body only ever carries the
//! canonical status text.

use axum::http::header::{self, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

/// All errors produced by the pdfsvc library.
#[derive(Debug, Error)]
pub enum PdfSvcError {
    // ── Entry-point rejections ────────────────────────────────────────────
    /// Only `POST` is accepted.
    #[error("method {method} not allowed, only POST is accepted")]
    MethodNotAllowed { method: String },

    /// Bearer token missing or wrong.
    #[error("missing or invalid bearer token")]
    Unauthorized,

    /// `Content-Type` is absent or not `text/html`.
    #[error("unsupported content type {content_type:?}, expected text/html")]
    BadContentType { content_type: Option<String> },

    /// The declared charset has no known decoder.
    #[error("charset '{label}' cannot be decoded")]
    UnsupportedCharset { label: String },

    // ── Spooling ──────────────────────────────────────────────────────────
    /// Request body exceeds the configured or declared limit.
    #[error("request body exceeds the {limit} byte limit")]
    TooLarge { limit: u64 },

    /// No disk spool slot became free within the wait budget.
    #[error("no spool slot available within {wait_ms}ms")]
    ResourceUnavailable { wait_ms: u64 },

    /// Creating, writing or reading spool storage failed.
    #[error("spool storage failure during {context}: {source}")]
    StorageFailure {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    // ── Context ───────────────────────────────────────────────────────────
    /// The caller gave up (shutdown, upstream cancellation).
    #[error("request cancelled")]
    Cancelled,

    /// The effective deadline elapsed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    // ── Renderer ──────────────────────────────────────────────────────────
    /// The renderer could not be started, exited non-zero or was signalled.
    #[error("renderer failed: {reason}")]
    ProcessFailure { reason: String },

    /// The renderer produced more output than allowed.
    #[error("renderer output exceeds the {limit} byte limit")]
    OutputTooLarge { limit: u64 },

    // ── Config ────────────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PdfSvcError {
    /// Shorthand for wrapping an I/O error raised while handling spool storage.
    pub fn storage(context: &'static str, source: std::io::Error) -> Self {
        PdfSvcError::StorageFailure { context, source }
    }

    /// HTTP status this error is reported as.
    pub fn status_code(&self) -> StatusCode {
        match self {
            PdfSvcError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            PdfSvcError::Unauthorized => StatusCode::UNAUTHORIZED,
            PdfSvcError::BadContentType { .. } => StatusCode::BAD_REQUEST,
            PdfSvcError::UnsupportedCharset { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            PdfSvcError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            PdfSvcError::ResourceUnavailable { .. } | PdfSvcError::Cancelled => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            PdfSvcError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            PdfSvcError::StorageFailure { .. }
            | PdfSvcError::ProcessFailure { .. }
            | PdfSvcError::OutputTooLarge { .. }
            | PdfSvcError::InvalidConfig(_)
            | PdfSvcError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True for failures the client cannot fix by changing the request.
    pub fn is_internal(&self) -> bool {
        self.status_code() == StatusCode::INTERNAL_SERVER_ERROR
    }
}

impl IntoResponse for PdfSvcError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if self.is_internal() {
            error!(error = %self, "request failed");
        }

        let text = status.canonical_reason().unwrap_or("Error");
        let mut response = (status, format!("{text}\n")).into_response();
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        headers.insert(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        );
        match status {
            StatusCode::METHOD_NOT_ALLOWED => {
                headers.insert(header::ACCEPT, HeaderValue::from_static("POST"));
            }
            StatusCode::UNAUTHORIZED => {
                headers.insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
            }
            _ => {}
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_statuses() {
        assert_eq!(
            PdfSvcError::TooLarge { limit: 5 }.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            PdfSvcError::ResourceUnavailable { wait_ms: 10 }.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            PdfSvcError::DeadlineExceeded.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            PdfSvcError::ProcessFailure {
                reason: "exit code 1".into()
            }
            .status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            PdfSvcError::UnsupportedCharset {
                label: "klingon".into()
            }
            .status_code(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
    }

    #[test]
    fn response_body_hides_internal_detail() {
        let e = PdfSvcError::ProcessFailure {
            reason: "exit code 137 (killed)".into(),
        };
        let resp = e.into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
    }

    #[test]
    fn unauthorized_carries_challenge() {
        let resp = PdfSvcError::Unauthorized.into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(resp.headers()[header::WWW_AUTHENTICATE], "Bearer");
    }

    #[test]
    fn method_not_allowed_advertises_post() {
        let resp = PdfSvcError::MethodNotAllowed {
            method: "GET".into(),
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(resp.headers()[header::ACCEPT], "POST");
    }

    #[test]
    fn storage_failure_display_names_context() {
        let e = PdfSvcError::storage(
            "temp file create",
            std::io::Error::new(std::io::ErrorKind::Other, "EMFILE"),
        );
        let msg = e.to_string();
        assert!(msg.contains("temp file create"), "got: {msg}");
        assert!(msg.contains("EMFILE"), "got: {msg}");
    }
}
