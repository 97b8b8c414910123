//! Spool storage: a memory buffer or an anonymous temporary file.
//!
//! Small bodies with a declared length go to memory, sized exactly. Anything
//! else (unknown length, large, or memory spooling disabled) goes to a
//! temporary file that is unlinked as soon as it is created. The file has no
//! name to clean up: the OS reclaims it when the last handle closes, even if
//! the process crashes.
//!
//! File creation goes through `spawn_blocking`, like every other blocking
//! filesystem call in this crate.

use crate::config::SpoolPolicy;
use crate::context::RequestContext;
use crate::error::PdfSvcError;
use crate::spool::copy::{copy_limited, CopyOutcome};
use crate::spool::gate::{DiskSlot, DiskSlotGate};
use axum::body::Body;
use bytes::{Bytes, BytesMut};
use std::io::SeekFrom;
use tokio::fs::File;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

/// Read size when streaming a disk spool back out.
const DISK_CHUNK: usize = 64 * 1024;

/// Where a body will be spooled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageStrategy {
    /// In-memory buffer of exactly this many bytes.
    Memory { capacity: usize },
    /// Unlinked temporary file, gated by a [`DiskSlot`].
    Disk,
}

impl StorageStrategy {
    /// Pick storage for a body that declares `declared` bytes (`None` when
    /// the length is unknown).
    pub fn choose(declared: Option<u64>, policy: &SpoolPolicy) -> Self {
        match declared {
            Some(len) if policy.memory_threshold > 0 && len <= policy.memory_threshold => {
                StorageStrategy::Memory {
                    capacity: len as usize,
                }
            }
            _ => StorageStrategy::Disk,
        }
    }
}

/// Transient storage for one request body.
///
/// Written once, rewound once, read once. Dropping it closes the file and
/// frees its spool slot.
#[derive(Debug)]
pub enum Spool {
    Memory(Vec<u8>),
    Disk {
        file: File,
        len: u64,
        slot: DiskSlot,
    },
}

impl Spool {
    /// Allocate storage for a body of `declared` length.
    ///
    /// Disk storage first takes a slot from `gate`, which may queue.
    pub async fn create(
        declared: Option<u64>,
        policy: &SpoolPolicy,
        gate: &DiskSlotGate,
        ctx: &RequestContext,
    ) -> Result<Self, PdfSvcError> {
        match StorageStrategy::choose(declared, policy) {
            StorageStrategy::Memory { capacity } => Ok(Spool::Memory(Vec::with_capacity(capacity))),
            StorageStrategy::Disk => {
                let slot = gate.acquire(ctx).await?;
                let file = anonymous_file(policy).await?;
                Ok(Spool::Disk { file, len: 0, slot })
            }
        }
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, Spool::Memory(_))
    }

    /// Bytes written so far.
    pub fn len(&self) -> u64 {
        match self {
            Spool::Memory(buf) => buf.len() as u64,
            Spool::Disk { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `src` into the spool. With a `limit`, the copy stops there and
    /// reports whether `src` had more.
    pub async fn fill<R>(&mut self, src: &mut R, limit: Option<u64>) -> io::Result<CopyOutcome>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let outcome = match self {
            Spool::Memory(buf) => copy_into(src, buf, limit).await?,
            Spool::Disk { file, len, .. } => {
                let outcome = copy_into(src, file, limit).await?;
                *len += outcome.copied;
                outcome
            }
        };
        Ok(outcome)
    }

    /// Position the spool for reading from the start.
    pub async fn rewind(&mut self) -> Result<(), PdfSvcError> {
        if let Spool::Disk { file, .. } = self {
            file.seek(SeekFrom::Start(0))
                .await
                .map_err(|e| PdfSvcError::storage("file seek", e))?;
        }
        Ok(())
    }

    /// Turn the spool into a request body.
    ///
    /// A disk spool keeps its file and slot inside the body stream; both are
    /// released when the body is dropped.
    pub fn into_body(self) -> Body {
        match self {
            Spool::Memory(buf) => Body::from(Bytes::from(buf)),
            Spool::Disk { file, slot, .. } => {
                let chunks =
                    futures::stream::try_unfold((file, slot), |(mut file, slot)| async move {
                        let mut buf = BytesMut::with_capacity(DISK_CHUNK);
                        if file.read_buf(&mut buf).await? == 0 {
                            return Ok::<_, io::Error>(None);
                        }
                        Ok(Some((buf.freeze(), (file, slot))))
                    });
                Body::from_stream(chunks)
            }
        }
    }
}

async fn copy_into<R, W>(src: &mut R, dst: &mut W, limit: Option<u64>) -> io::Result<CopyOutcome>
where
    R: AsyncRead + Unpin + ?Sized,
    W: io::AsyncWrite + Unpin + ?Sized,
{
    match limit {
        Some(limit) => copy_limited(src, dst, limit).await,
        None => {
            let copied = io::copy(src, dst).await?;
            dst.flush().await?;
            Ok(CopyOutcome {
                copied,
                exceeded: false,
            })
        }
    }
}

/// Create an already-unlinked temporary file in the policy's spool dir.
async fn anonymous_file(policy: &SpoolPolicy) -> Result<File, PdfSvcError> {
    let dir = policy.spool_dir.clone();
    let file = tokio::task::spawn_blocking(move || match dir {
        Some(dir) => tempfile::tempfile_in(dir),
        None => tempfile::tempfile(),
    })
    .await
    .map_err(|e| PdfSvcError::Internal(format!("spool file task panicked: {e}")))?
    .map_err(|e| PdfSvcError::storage("temp file create", e))?;
    debug!("created anonymous spool file");
    Ok(File::from_std(file))
}
