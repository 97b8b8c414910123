//! Per-request deadline and cancellation.
//!
//! Every suspension point in the service (waiting for a spool slot, waiting
//! for a renderer permit, waiting for the renderer itself) races its work
//! against [`RequestContext::done`]. Two things can end a request early:
//!
//! * its deadline passes, which surfaces as [`ContextError::DeadlineExceeded`];
//! * its cancellation signal fires (server shutdown, an upstream giving up),
//!   which surfaces as [`ContextError::Cancelled`].
//!
//! A client that disconnects makes hyper drop the whole request future. That
//! needs no signal at all: every permit, spool file and child process is owned
//! by that future and released as it unwinds.

use crate::error::PdfSvcError;
use std::future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Why a context finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    DeadlineExceeded,
    Cancelled,
}

impl From<ContextError> for PdfSvcError {
    fn from(e: ContextError) -> Self {
        match e {
            ContextError::DeadlineExceeded => PdfSvcError::DeadlineExceeded,
            ContextError::Cancelled => PdfSvcError::Cancelled,
        }
    }
}

/// Deadline plus cancellation signal for one request.
///
/// Cheap to clone; clones observe the same signal.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

impl RequestContext {
    /// A context that never expires and is never cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    /// Narrow the deadline to `deadline` if that is tighter than the current one.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        });
        self
    }

    /// Narrow the deadline to `timeout` from now. A zero timeout leaves the
    /// context unchanged.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        if timeout.is_zero() {
            return self;
        }
        self.with_deadline(Instant::now() + timeout)
    }

    /// Attach a cancellation signal. The context is cancelled once the
    /// channel holds `true`; a dropped sender never cancels.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, if there is one.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Non-blocking check.
    pub fn err(&self) -> Option<ContextError> {
        if self.cancel.as_ref().is_some_and(|rx| *rx.borrow()) {
            return Some(ContextError::Cancelled);
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the context is finished, reporting why.
    ///
    /// Never resolves for a background context.
    pub async fn done(&self) -> ContextError {
        let deadline = async {
            match self.deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => future::pending::<()>().await,
            }
        };
        let cancelled = async {
            match &self.cancel {
                Some(rx) => {
                    let mut rx = rx.clone();
                    let sender_gone = rx.wait_for(|cancelled| *cancelled).await.is_err();
                    if sender_gone {
                        future::pending::<()>().await;
                    }
                }
                None => future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancelled => ContextError::Cancelled,
            _ = deadline => ContextError::DeadlineExceeded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn tighter_deadline_wins() {
        let ctx = RequestContext::background()
            .with_timeout(Duration::from_secs(60))
            .with_timeout(Duration::from_secs(5))
            .with_timeout(Duration::from_secs(30));
        let remaining = ctx.remaining().unwrap();
        assert!(remaining <= Duration::from_secs(5), "got {remaining:?}");
        assert!(remaining > Duration::from_secs(4), "got {remaining:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_is_no_deadline() {
        let ctx = RequestContext::background().with_timeout(Duration::ZERO);
        assert!(ctx.deadline().is_none());
        assert!(ctx.err().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_fires() {
        let ctx = RequestContext::background().with_timeout(Duration::from_millis(50));
        assert_eq!(ctx.done().await, ContextError::DeadlineExceeded);
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_fires_before_deadline() {
        let (tx, rx) = watch::channel(false);
        let ctx = RequestContext::background()
            .with_timeout(Duration::from_secs(60))
            .with_cancel(rx);

        let waiter = tokio::spawn({
            let ctx = ctx.clone();
            async move { ctx.done().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send(true).unwrap();

        assert_eq!(waiter.await.unwrap(), ContextError::Cancelled);
        assert_eq!(ctx.err(), Some(ContextError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_sender_never_cancels() {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        let ctx = RequestContext::background()
            .with_timeout(Duration::from_millis(20))
            .with_cancel(rx);
        assert_eq!(ctx.done().await, ContextError::DeadlineExceeded);
    }

    #[test]
    fn context_errors_map_to_taxonomy() {
        assert!(matches!(
            PdfSvcError::from(ContextError::DeadlineExceeded),
            PdfSvcError::DeadlineExceeded
        ));
        assert!(matches!(
            PdfSvcError::from(ContextError::Cancelled),
            PdfSvcError::Cancelled
        ));
    }
}
