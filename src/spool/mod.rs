//! Request body spooling.
//!
//! Bodies are absorbed in full before conversion starts, so a slow client
//! never holds a renderer permit while it trickles bytes in.
//!
//! - [`copy`]   — size-limited copy with over-limit probe
//! - [`gate`]   — bound on concurrently open spool files
//! - [`store`]  — memory or anonymous temp file storage
//! - [`reader`] — HTTP body as an `AsyncRead`
//! - [`layer`]  — the spooling middleware tying these together

pub mod copy;
pub mod gate;
pub mod layer;
pub mod reader;
pub mod store;

pub use copy::{copy_limited, CopyOutcome, PROBE_SIZE};
pub use gate::{DiskSlot, DiskSlotGate};
pub use layer::{spool_body, BodySpooler};
pub use reader::BodyReader;
pub use store::{Spool, StorageStrategy};
