//! Size-limited copying with over-limit detection.
//!
//! Copying exactly `limit` bytes says nothing about whether the source had
//! more. A declared length cannot be trusted for that either (chunked uploads
//! have none), so after the bounded copy we read a small probe: if the probe
//! yields anything the source was over the limit.
//!
//! At most `limit + PROBE_SIZE` bytes are ever pulled from the source.

use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Bytes read past the limit to detect oversized sources.
pub const PROBE_SIZE: usize = 32;

/// Result of a limited copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyOutcome {
    /// Bytes written to the destination.
    pub copied: u64,
    /// The source still had data once `limit` bytes were copied.
    pub exceeded: bool,
}

/// Copy at most `limit` bytes from `src` into `dst`, then probe `src` for
/// leftover data.
///
/// The destination is flushed before probing. Probed bytes are discarded.
pub async fn copy_limited<R, W>(src: &mut R, dst: &mut W, limit: u64) -> io::Result<CopyOutcome>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let copied = io::copy(&mut (&mut *src).take(limit), dst).await?;
    dst.flush().await?;

    let mut probe = [0u8; PROBE_SIZE];
    let extra = src.read(&mut probe).await?;
    Ok(CopyOutcome {
        copied,
        exceeded: extra > 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    /// Counts every byte handed out by the wrapped reader.
    struct Counting<R> {
        inner: R,
        read: u64,
    }

    impl<R: AsyncRead + Unpin> AsyncRead for Counting<R> {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let before = buf.filled().len();
            let res = Pin::new(&mut self.inner).poll_read(cx, buf);
            self.read += (buf.filled().len() - before) as u64;
            res
        }
    }

    #[tokio::test]
    async fn within_limit_copies_everything() {
        let mut src = tokio_test::io::Builder::new()
            .read(b"hello")
            .read(b" world")
            .build();
        let mut dst = Vec::new();
        let out = copy_limited(&mut src, &mut dst, 64).await.unwrap();
        assert_eq!(
            out,
            CopyOutcome {
                copied: 11,
                exceeded: false
            }
        );
        assert_eq!(dst, b"hello world");
    }

    #[tokio::test]
    async fn exactly_at_limit_is_not_exceeded() {
        let mut src = tokio_test::io::Builder::new().read(b"hello world").build();
        let mut dst = Vec::new();
        let out = copy_limited(&mut src, &mut dst, 11).await.unwrap();
        assert!(!out.exceeded);
        assert_eq!(out.copied, 11);
    }

    #[tokio::test]
    async fn over_limit_is_reported_not_truncated() {
        let mut src = tokio_test::io::Builder::new().read(b"hello world").build();
        let mut dst = Vec::new();
        let out = copy_limited(&mut src, &mut dst, 5).await.unwrap();
        assert!(out.exceeded);
        assert_eq!(out.copied, 5);
        assert_eq!(dst, b"hello");
    }

    #[tokio::test]
    async fn endless_source_is_bounded() {
        let mut src = Counting {
            inner: io::repeat(b'x'),
            read: 0,
        };
        let mut dst = Vec::new();
        let out = copy_limited(&mut src, &mut dst, 1000).await.unwrap();
        assert!(out.exceeded);
        assert_eq!(dst.len(), 1000);
        assert!(
            src.read <= 1000 + PROBE_SIZE as u64,
            "read {} bytes from source",
            src.read
        );
    }

    #[tokio::test]
    async fn read_error_propagates() {
        let mut src = tokio_test::io::Builder::new()
            .read(b"abc")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let mut dst = Vec::new();
        let err = copy_limited(&mut src, &mut dst, 64).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }
}
