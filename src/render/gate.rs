//! Global bound on concurrent renderer processes.
//!
//! Unlike the spool gate there is no separate wait budget: a request queues
//! here for as long as its own context allows.

use crate::context::RequestContext;
use crate::error::PdfSvcError;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Counting gate handing out [`ConversionPermit`]s.
///
/// Cloning shares the same pool.
#[derive(Debug, Clone)]
pub struct ConversionGate {
    permits: Arc<Semaphore>,
    capacity: usize,
}

/// One renderer slot. Released on drop.
#[derive(Debug)]
pub struct ConversionPermit {
    _permit: OwnedSemaphorePermit,
}

impl ConversionGate {
    /// A gate with `procs` permits (at least one).
    pub fn new(procs: usize) -> Self {
        let capacity = procs.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a permit or for `ctx` to finish.
    pub async fn acquire(&self, ctx: &RequestContext) -> Result<ConversionPermit, PdfSvcError> {
        if let Some(why) = ctx.err() {
            return Err(why.into());
        }
        if let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() {
            return Ok(ConversionPermit { _permit: permit });
        }
        debug!(capacity = self.capacity, "all renderer permits busy, queueing");

        tokio::select! {
            biased;
            permit = Arc::clone(&self.permits).acquire_owned() => permit
                .map(|p| ConversionPermit { _permit: p })
                .map_err(|_| PdfSvcError::Internal("conversion gate closed".into())),
            why = ctx.done() => {
                debug!(?why, "gave up waiting for a renderer permit");
                Err(why.into())
            }
        }
    }
}
