//! Body spooling middleware.
//!
//! [`BodySpooler`] materializes a request body into a [`Spool`] before the
//! downstream handler runs, enforcing the size limit on the way in. The
//! handler then sees an ordinary request whose body is replayed from the
//! spool. Installed with [`axum::middleware::from_fn_with_state`]:
//!
//! ```rust,no_run
//! use axum::{middleware, routing::post, Router};
//! use pdfsvc::spool::{spool_body, BodySpooler};
//! use pdfsvc::SpoolPolicy;
//!
//! let spooler = BodySpooler::new(SpoolPolicy::default());
//! let app: Router = Router::new()
//!     .route("/", post(|body: String| async move { body }))
//!     .layer(middleware::from_fn_with_state(spooler, spool_body));
//! ```
//!
//! The spool (and its disk slot, if any) lives inside the rewritten request
//! body, so it is released when the handler drops the body, whatever path
//! the handler takes out.

use crate::config::SpoolPolicy;
use crate::context::RequestContext;
use crate::error::PdfSvcError;
use crate::spool::gate::DiskSlotGate;
use crate::spool::reader::BodyReader;
use crate::spool::store::Spool;
use axum::body::HttpBody;
use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tracing::debug;

/// Spools request bodies according to a process-wide [`SpoolPolicy`].
///
/// Cloning shares the policy and the disk-slot pool.
#[derive(Debug, Clone)]
pub struct BodySpooler {
    policy: Arc<SpoolPolicy>,
    gate: DiskSlotGate,
}

impl BodySpooler {
    pub fn new(policy: SpoolPolicy) -> Self {
        let gate = DiskSlotGate::new(policy.max_spool_files, policy.spool_wait);
        Self {
            policy: Arc::new(policy),
            gate,
        }
    }

    /// The disk-slot pool shared by every clone of this spooler.
    pub fn gate(&self) -> &DiskSlotGate {
        &self.gate
    }

    /// Read the whole body of `req` into a spool and return the request with
    /// its body replaced by the spooled copy.
    pub async fn spool(&self, req: Request, ctx: &RequestContext) -> Result<Request, PdfSvcError> {
        let declared = declared_length(&req);
        if declared == Some(0) {
            return Ok(req);
        }

        let max = self.policy.max_body_size;
        if max > 0 && declared.is_some_and(|len| len > max) {
            debug!(?declared, max, "declared length over limit, body not read");
            return Err(PdfSvcError::TooLarge { limit: max });
        }
        let limit = (max > 0).then(|| declared.map_or(max, |len| len.min(max)));

        let (parts, body) = req.into_parts();
        let mut spool = Spool::create(declared, &self.policy, &self.gate, ctx).await?;
        let mut reader = BodyReader::new(body);

        let outcome = tokio::select! {
            res = spool.fill(&mut reader, limit) => {
                res.map_err(|e| PdfSvcError::storage("body copy", e))?
            }
            why = ctx.done() => {
                debug!(?why, "request finished while spooling body");
                return Err(PdfSvcError::Cancelled);
            }
        };
        if outcome.exceeded {
            let limit = limit.unwrap_or(max);
            debug!(limit, "body over limit");
            return Err(PdfSvcError::TooLarge { limit });
        }

        spool.rewind().await?;
        debug!(
            bytes = outcome.copied,
            memory = spool.is_memory(),
            "request body spooled"
        );
        Ok(Request::from_parts(parts, spool.into_body()))
    }
}

/// Length the client declared: `Content-Length`, else an exact size hint.
fn declared_length(req: &Request) -> Option<u64> {
    req.headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .or_else(|| req.body().size_hint().exact())
}

/// Middleware form of [`BodySpooler::spool`].
///
/// Uses the [`RequestContext`] stored in the request extensions, if any.
pub async fn spool_body(State(spooler): State<BodySpooler>, req: Request, next: Next) -> Response {
    let ctx = req
        .extensions()
        .get::<RequestContext>()
        .cloned()
        .unwrap_or_default();
    match spooler.spool(req, &ctx).await {
        Ok(req) => next.run(req).await,
        Err(e) => e.into_response(),
    }
}
