//! IO helpers shared by the proxy engine.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use bytes::BytesMut;
use n0_error::{Result, StackResultExt};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::trace;

/// A bounded prefetch buffer over an `AsyncRead`.
///
/// Header sections are accumulated here until they parse as a complete
/// message head; everything past the consumed head falls through to normal
/// reads, so the body bytes are never lost to the parser.
pub(crate) struct PeekReader<R> {
    inner: R,
    buf: BytesMut,
    limit: usize,
}

impl<R: AsyncRead + Unpin> PeekReader<R> {
    /// Wraps `inner`, prefetching at most `limit` bytes.
    pub(crate) fn new(inner: R, limit: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(1024),
            limit,
        }
    }

    /// Returns the prefetched bytes that have not been consumed yet.
    pub(crate) fn peeked(&self) -> &[u8] {
        &self.buf[..]
    }

    /// Returns true once the prefetch limit is reached.
    pub(crate) fn is_full(&self) -> bool {
        self.buf.len() >= self.limit
    }

    /// Drops `n` bytes from the front of the prefetch buffer.
    pub(crate) fn consume(&mut self, n: usize) {
        let _ = self.buf.split_to(n);
    }

    /// Reads more data from the inner reader into the prefetch buffer.
    ///
    /// Returns the number of bytes added; `0` means EOF or a full buffer.
    pub(crate) async fn prefetch(&mut self) -> io::Result<usize> {
        let room = self.limit.saturating_sub(self.buf.len());
        if room == 0 {
            return Ok(0);
        }
        let n = (&mut self.inner)
            .take(room as u64)
            .read_buf(&mut self.buf)
            .await?;
        Ok(n)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for PeekReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if out.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        if self.buf.is_empty() {
            return Pin::new(&mut self.inner).poll_read(cx, out);
        }
        let n = self.buf.len().min(out.remaining());
        let chunk = self.buf.split_to(n);
        out.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

/// Copies both directions of a tunnel until each side reaches EOF.
///
/// Shuts down each write side once the opposite read side is drained.
pub(crate) async fn tunnel_bidi(
    client_recv: &mut (impl AsyncRead + Send + Unpin),
    client_send: &mut (impl AsyncWrite + Send + Unpin),
    origin_recv: &mut (impl AsyncRead + Send + Unpin),
    origin_send: &mut (impl AsyncWrite + Send + Unpin),
) -> Result<(u64, u64)> {
    let (up, down) = tokio::join!(
        async {
            let res = tokio::io::copy(client_recv, origin_send).await;
            origin_send.shutdown().await.ok();
            trace!(?res, "tunnel client-to-origin finished");
            res
        },
        async {
            let res = tokio::io::copy(origin_recv, client_send).await;
            client_send.shutdown().await.ok();
            trace!(?res, "tunnel origin-to-client finished");
            res
        }
    );
    let up = up.context("failed to copy client-to-origin")?;
    let down = down.context("failed to copy origin-to-client")?;
    Ok((up, down))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn prefetch_stops_at_limit() {
        let mut r = PeekReader::new(Cursor::new(b"abcdefgh".to_vec()), 4);
        assert_eq!(r.prefetch().await.unwrap(), 4);
        assert_eq!(r.peeked(), b"abcd");
        assert!(r.is_full());
        assert_eq!(r.prefetch().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn consume_then_read_falls_through() {
        let mut r = PeekReader::new(Cursor::new(b"HEAD body".to_vec()), 5);
        r.prefetch().await.unwrap();
        assert_eq!(r.peeked(), b"HEAD ");
        r.consume(5);
        let mut rest = Vec::new();
        r.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"body");
    }

    #[tokio::test]
    async fn read_serves_prefetched_bytes_first() {
        let mut r = PeekReader::new(Cursor::new(b"abcdef".to_vec()), 3);
        r.prefetch().await.unwrap();
        let mut out = Vec::new();
        r.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"abcdef");
        assert_eq!(r.peeked(), b"");
    }

    #[tokio::test]
    async fn prefetch_at_eof_returns_zero() {
        let mut r = PeekReader::new(Cursor::new(Vec::new()), 8);
        assert_eq!(r.prefetch().await.unwrap(), 0);
        assert_eq!(r.peeked(), b"");
    }
}
