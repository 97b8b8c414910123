//! Admission gate bounding how many spool files are open at once.
//!
//! Every disk-backed spool holds a file descriptor for as long as the request
//! runs. A burst of large uploads would otherwise open one file per request
//! with no upper bound. The gate hands out [`DiskSlot`]s from a fixed pool;
//! a request that cannot get one waits at most `wait` (or indefinitely when
//! `wait` is zero) and gives up as soon as its context finishes.
//!
//! Slots return to the pool when the [`DiskSlot`] is dropped, so every exit
//! path (error, cancellation, panic unwinding) releases exactly once.

use crate::context::RequestContext;
use crate::error::PdfSvcError;
use std::future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Counting gate for disk spool files.
///
/// Cloning shares the same pool.
#[derive(Debug, Clone)]
pub struct DiskSlotGate {
    slots: Option<Arc<Semaphore>>,
    capacity: usize,
    wait: Duration,
}

/// Capacity token for one open spool file. Released on drop.
#[derive(Debug)]
pub struct DiskSlot {
    _permit: Option<OwnedSemaphorePermit>,
}

impl DiskSlotGate {
    /// A gate with `max_files` slots. Zero slots means no limit.
    pub fn new(max_files: usize, wait: Duration) -> Self {
        if max_files == 0 {
            return Self::unlimited();
        }
        Self {
            slots: Some(Arc::new(Semaphore::new(max_files))),
            capacity: max_files,
            wait,
        }
    }

    /// A gate that admits everyone immediately.
    pub fn unlimited() -> Self {
        Self {
            slots: None,
            capacity: 0,
            wait: Duration::ZERO,
        }
    }

    pub fn is_limited(&self) -> bool {
        self.slots.is_some()
    }

    /// Total slots, `None` when unlimited.
    pub fn capacity(&self) -> Option<usize> {
        self.slots.as_ref().map(|_| self.capacity)
    }

    /// Slots currently free, `None` when unlimited.
    pub fn available(&self) -> Option<usize> {
        self.slots.as_ref().map(|s| s.available_permits())
    }

    /// Wait for a free slot.
    ///
    /// Fails with [`PdfSvcError::ResourceUnavailable`] once the wait budget is
    /// spent, or [`PdfSvcError::Cancelled`] when `ctx` finishes first
    /// (whether by deadline or cancellation).
    pub async fn acquire(&self, ctx: &RequestContext) -> Result<DiskSlot, PdfSvcError> {
        let Some(slots) = &self.slots else {
            return Ok(DiskSlot { _permit: None });
        };

        if let Ok(permit) = Arc::clone(slots).try_acquire_owned() {
            return Ok(DiskSlot {
                _permit: Some(permit),
            });
        }
        debug!(capacity = self.capacity, "spool slots exhausted, queueing");

        let budget = async {
            if self.wait.is_zero() {
                future::pending::<()>().await
            } else {
                tokio::time::sleep(self.wait).await
            }
        };

        tokio::select! {
            biased;
            permit = Arc::clone(slots).acquire_owned() => permit
                .map(|p| DiskSlot { _permit: Some(p) })
                .map_err(|_| PdfSvcError::Internal("spool gate closed".into())),
            why = ctx.done() => {
                debug!(?why, "gave up waiting for a spool slot");
                Err(PdfSvcError::Cancelled)
            }
            _ = budget => {
                warn!(wait_ms = self.wait.as_millis() as u64, "no spool slot freed up in time");
                Err(PdfSvcError::ResourceUnavailable {
                    wait_ms: self.wait.as_millis() as u64,
                })
            }
        }
    }
}
