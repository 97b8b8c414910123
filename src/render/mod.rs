//! Document rendering through an external process.
//!
//! - [`gate`]        — bound on concurrently running renderers
//! - [`invoke`]      — spawn, feed, drain, kill and reap one renderer
//! - [`process`]     — renderer child process, reaped with its own usage
//! - [`diagnostics`] — exit reasons, resource usage, report formatting
//! - [`observer`]    — hooks called around each run
//!
//! [`Converter`] is the entry point: it takes a permit, then runs the
//! renderer under the request's deadline.

pub mod diagnostics;
pub mod gate;
pub mod invoke;
pub mod observer;
pub mod process;

pub use diagnostics::{exit_reason, ByteSize, ConversionReport, ResourceUsage, RunOutcome};
pub use gate::{ConversionGate, ConversionPermit};
pub use invoke::Renderer;
pub use observer::{ConversionObserver, NoopObserver, ObserverRef, TracingObserver};

use crate::config::ServiceConfig;
use crate::context::RequestContext;
use crate::error::PdfSvcError;
use bytes::Bytes;
use futures::Stream;
use std::io;
use std::sync::Arc;
use tracing::debug;

/// Gate plus renderer, shared by every request.
#[derive(Debug, Clone)]
pub struct Converter {
    gate: ConversionGate,
    renderer: Arc<Renderer>,
}

impl Converter {
    pub fn new(gate: ConversionGate, renderer: Renderer) -> Self {
        Self {
            gate,
            renderer: Arc::new(renderer),
        }
    }

    /// Build from the service config. With diagnostics on and no explicit
    /// observer, runs are logged through [`TracingObserver`].
    pub fn from_config(config: &ServiceConfig, observer: Option<ObserverRef>) -> Self {
        let mut renderer = Renderer::new(config.renderer.clone())
            .max_duration(config.timeout)
            .max_output(config.max_output_size);
        let observer = observer.or_else(|| {
            config
                .diagnostics
                .then(|| Arc::new(TracingObserver) as ObserverRef)
        });
        if let Some(observer) = observer {
            renderer = renderer.observer(observer);
        }
        Self::new(ConversionGate::new(config.procs), renderer)
    }

    pub fn gate(&self) -> &ConversionGate {
        &self.gate
    }

    /// Wait for a renderer permit, then render `input`.
    pub async fn convert<S>(&self, input: S, ctx: &RequestContext) -> Result<Bytes, PdfSvcError>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + Unpin,
    {
        let permit = self.gate.acquire(ctx).await?;
        debug!(available = self.gate.available(), "renderer permit acquired");
        self.renderer.run(&permit, input, ctx).await
    }
}
