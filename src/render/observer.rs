//! Observer hooks for renderer runs.
//!
//! Inject an [`Arc<dyn ConversionObserver>`] via
//! [`crate::render::Renderer::observer`] to see every renderer process as it
//! starts and finishes. The stock [`TracingObserver`] logs one line per run;
//! tests use their own observers to capture process ids.
//!
//! # Example
//!
//! ```rust
//! use pdfsvc::render::{ConversionObserver, ConversionReport};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct FailureCounter(AtomicUsize);
//!
//! impl ConversionObserver for FailureCounter {
//!     fn on_conversion_finished(&self, report: &ConversionReport) {
//!         if !report.succeeded() {
//!             self.0.fetch_add(1, Ordering::Relaxed);
//!         }
//!     }
//! }
//! ```

use crate::render::diagnostics::ConversionReport;
use std::sync::Arc;
use tracing::{info, warn};

/// Called by the renderer around each process it runs.
///
/// Runs on the request's task, so implementations must not block. Several
/// renderers may report at once; shared state needs synchronisation.
pub trait ConversionObserver: Send + Sync {
    /// The renderer process was spawned.
    fn on_conversion_start(&self, program: &str, pid: Option<u32>) {
        let _ = (program, pid);
    }

    /// The renderer process is gone, for whatever reason.
    fn on_conversion_finished(&self, report: &ConversionReport) {
        let _ = report;
    }
}

/// Observer that ignores everything.
pub struct NoopObserver;

impl ConversionObserver for NoopObserver {}

/// Logs a diagnostic line for every finished run.
pub struct TracingObserver;

impl ConversionObserver for TracingObserver {
    fn on_conversion_finished(&self, report: &ConversionReport) {
        if report.succeeded() {
            info!(
                program = %report.program,
                pid = ?report.pid,
                input_bytes = report.input_bytes,
                output_bytes = report.output_bytes,
                "{report}"
            );
        } else {
            warn!(
                program = %report.program,
                pid = ?report.pid,
                input_bytes = report.input_bytes,
                stderr = %report.stderr.trim_end(),
                "{report}"
            );
        }
    }
}

/// Convenience alias.
pub type ObserverRef = Arc<dyn ConversionObserver>;
