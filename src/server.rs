//! HTTP entry point.
//!
//! Every path accepts the same request: `POST` an HTML document, get a PDF
//! back. A request passes through three middlewares before the handler, in
//! this order:
//!
//! 1. [`attach_context`] gives it a [`RequestContext`] (request deadline plus
//!    the server's shutdown signal);
//! 2. [`admit`] rejects wrong methods, bad credentials and unsupported
//!    content types before a single body byte is read;
//! 3. [`spool_body`] absorbs the body into a spool.
//!
//! The handler then transcodes the spooled body to UTF-8 and converts it.

use crate::charset::DocumentCharset;
use crate::config::ServiceConfig;
use crate::context::RequestContext;
use crate::error::PdfSvcError;
use crate::render::{Converter, ObserverRef};
use crate::spool::{spool_body, BodySpooler};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, Method};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Extension, Router};
use futures::TryStreamExt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info};

/// Shared state for the entry-point middlewares and handler.
#[derive(Debug, Clone)]
pub struct AppState {
    converter: Converter,
    token: Option<Arc<str>>,
    request_timeout: Duration,
    shutdown: watch::Receiver<bool>,
}

/// Build the service router.
///
/// Flipping `shutdown` to `true` cancels every in-flight request.
pub fn build_router(config: &ServiceConfig, shutdown: watch::Receiver<bool>) -> Router {
    router_with_observer(config, shutdown, None)
}

/// [`build_router`] with an explicit conversion observer, which replaces the
/// default diagnostics logger.
pub fn router_with_observer(
    config: &ServiceConfig,
    shutdown: watch::Receiver<bool>,
    observer: Option<ObserverRef>,
) -> Router {
    let state = AppState {
        converter: Converter::from_config(config, observer),
        token: config.token.as_deref().map(Arc::from),
        request_timeout: config.request_timeout,
        shutdown,
    };
    let spooler = BodySpooler::new(config.spool.clone());

    // Layers run outermost first: context, admission, spooling.
    Router::new()
        .route("/", any(convert_document))
        .fallback(convert_document)
        .layer(middleware::from_fn_with_state(spooler, spool_body))
        .layer(middleware::from_fn_with_state(state.clone(), admit))
        .layer(middleware::from_fn_with_state(state.clone(), attach_context))
        .with_state(state)
}

/// Bind `config.addr` and serve until `shutdown` resolves.
pub async fn serve<F>(config: ServiceConfig, shutdown: F) -> Result<(), PdfSvcError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(&config.addr)
        .await
        .map_err(|e| PdfSvcError::Internal(format!("cannot listen on {}: {e}", config.addr)))?;
    serve_on(listener, config, shutdown).await
}

/// Serve on an already bound listener until `shutdown` resolves.
///
/// On shutdown the server stops accepting connections, cancels in-flight
/// requests (killing their renderers) and waits for them to answer.
pub async fn serve_on<F>(
    listener: TcpListener,
    config: ServiceConfig,
    shutdown: F,
) -> Result<(), PdfSvcError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let router = build_router(&config, cancel_rx);

    let addr = listener.local_addr().ok();
    info!(?addr, procs = config.procs, timeout = ?config.timeout, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("shutdown signal received");
            let _ = cancel_tx.send(true);
        })
        .await
        .map_err(|e| PdfSvcError::Internal(format!("server error: {e}")))?;

    info!("server stopped");
    Ok(())
}

/// Attach the per-request [`RequestContext`].
pub async fn attach_context(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let ctx = RequestContext::background()
        .with_timeout(state.request_timeout)
        .with_cancel(state.shutdown.clone());
    req.extensions_mut().insert(ctx);
    next.run(req).await
}

/// Method, credential and content-type checks.
///
/// On success the request carries its [`DocumentCharset`] in extensions.
pub async fn admit(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    if req.method() != Method::POST {
        return PdfSvcError::MethodNotAllowed {
            method: req.method().to_string(),
        }
        .into_response();
    }
    if let Some(token) = &state.token {
        if !bearer_matches(req.headers(), token) {
            debug!("rejected request with missing or wrong token");
            return PdfSvcError::Unauthorized.into_response();
        }
    }
    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let charset = match DocumentCharset::from_content_type(content_type) {
        Ok(charset) => charset,
        Err(e) => {
            debug!(error = %e, "rejected content type");
            return e.into_response();
        }
    };
    req.extensions_mut().insert(charset);
    next.run(req).await
}

/// Transcode the spooled document and render it.
async fn convert_document(
    State(state): State<AppState>,
    Extension(charset): Extension<DocumentCharset>,
    Extension(ctx): Extension<RequestContext>,
    body: Body,
) -> Result<Response, PdfSvcError> {
    let input = charset.decode(body.into_data_stream().map_err(io::Error::other));
    let pdf = state.converter.convert(input, &ctx).await?;
    debug!(charset = ?charset.name(), bytes = pdf.len(), "document converted");
    Ok(([(header::CONTENT_TYPE, "application/pdf")], pdf).into_response())
}

/// `Authorization` must be exactly `Bearer <token>`.
fn bearer_matches(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.as_bytes().strip_prefix(b"Bearer "))
        .is_some_and(|presented| constant_time_eq(presented, token.as_bytes()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn auth(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn bearer_token_must_match_exactly() {
        assert!(bearer_matches(&auth("Bearer secret"), "secret"));
        assert!(!bearer_matches(&auth("Bearer secret2"), "secret"));
        assert!(!bearer_matches(&auth("Bearer secre"), "secret"));
        assert!(!bearer_matches(&auth("bearer secret"), "secret"));
        assert!(!bearer_matches(&auth("secret"), "secret"));
        assert!(!bearer_matches(&HeaderMap::new(), "secret"));
    }

    #[test]
    fn constant_time_compare() {
        assert!(constant_time_eq(b"", b""));
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
