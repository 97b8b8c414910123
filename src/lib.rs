//! # pdfsvc
//!
//! HTTP service that turns HTML documents into PDFs with an external
//! renderer (`wkhtmltopdf` by default).
//!
//! ## Why this crate?
//!
//! The renderer itself is somebody else's problem. What a service around it
//! has to get right is resource control: request bodies of unknown size from
//! slow clients must not exhaust memory or file descriptors, and a handful of
//! heavy renderer processes must be bounded, time-limited, killed when their
//! caller goes away, and reported on afterwards.
//!
//! ## Request Flow
//!
//! ```text
//! POST /
//!  │
//!  ├─ 1. Admit    method, bearer token, Content-Type + charset
//!  ├─ 2. Spool    body → memory or unlinked temp file (size-limited, gated)
//!  ├─ 3. Decode   declared or sniffed charset → UTF-8, streaming
//!  ├─ 4. Gate     wait for one of `procs` renderer permits
//!  ├─ 5. Render   renderer subprocess under the effective deadline
//!  └─ 6. Respond  200 application/pdf, or a bare status on failure
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pdfsvc::{serve, ServiceConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServiceConfig::builder()
//!         .addr("127.0.0.1:8080")
//!         .procs(2)
//!         .timeout(Duration::from_secs(10))
//!         .build()?;
//!     serve(config, async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdfsvc` binary (clap + anyhow + tracing-subscriber) |
//!
//! Disable `cli` when embedding the router in another server:
//! ```toml
//! pdfsvc = { version = "0.1", default-features = false }
//! ```
//!
//! ## Status Codes
//!
//! | Status | Cause |
//! |--------|-------|
//! | 200 | document rendered |
//! | 400 | `Content-Type` is not `text/html` |
//! | 401 | bearer token missing or wrong |
//! | 405 | method other than `POST` |
//! | 413 | body over the size limit |
//! | 415 | charset has no decoder |
//! | 500 | renderer or storage failure |
//! | 503 | no spool slot in time, or request cancelled |
//! | 504 | deadline passed while converting |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod charset;
pub mod config;
pub mod context;
pub mod error;
pub mod render;
pub mod server;
pub mod spool;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use charset::DocumentCharset;
pub use config::{RendererCommand, ServiceConfig, ServiceConfigBuilder, SpoolPolicy};
pub use context::{ContextError, RequestContext};
pub use error::PdfSvcError;
pub use render::{ConversionObserver, ConversionReport, Converter, Renderer};
pub use server::{build_router, router_with_observer, serve, serve_on};
pub use spool::BodySpooler;
