//! A manually controllable prebuffer for Tokio `AsyncRead`.
//!
//! [`Prebuffered`] accumulates the preface of a connection so it can be
//! inspected (control line or HTTP head?) without consuming it, and later
//! either replayed verbatim into a peer socket via [`Prebuffered::into_parts`]
//! or read through transparently via the `AsyncRead` impl.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{self, AsyncRead, AsyncReadExt, ReadBuf};

const INITIAL_CAPACITY: usize = 4 * 1024;

/// A prebuffering wrapper around an `AsyncRead`.
///
/// The buffer never grows past `max_len`, which doubles as the preface size
/// cap: once [`Prebuffered::is_full`] returns `true` without the caller
/// having found what it was looking for, the preface is oversized.
pub struct Prebuffered<R> {
    inner: R,
    buf: BytesMut,
    max_len: usize,
}

impl<R> Prebuffered<R> {
    pub(crate) fn new(inner: R, max_len: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_CAPACITY),
            max_len,
        }
    }

    /// Returns the unconsumed buffered bytes.
    pub(crate) fn buffer(&self) -> &[u8] {
        &self.buf[..]
    }

    pub(crate) fn is_full(&self) -> bool {
        self.buf.len() == self.max_len
    }

    /// Discards `n` bytes from the front of the buffer.
    pub(crate) fn discard(&mut self, n: usize) {
        let _ = self.buf.split_to(n);
    }

    /// The wrapped reader, e.g. to write on a duplex stream while the read
    /// side is being prebuffered.
    pub(crate) fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Returns the unconsumed buffer and the inner reader.
    ///
    /// This is how a classified client socket hands its preface to the
    /// pairing engine: the returned bytes are replayed into the exposer
    /// socket before the inner reader is spliced, so no byte is lost or
    /// reordered no matter where TCP chunk boundaries fell.
    pub(crate) fn into_parts(self) -> (Bytes, R) {
        (self.buf.freeze(), self.inner)
    }
}

impl<R: AsyncRead + Unpin> Prebuffered<R> {
    /// Reads more data from the inner reader into the buffer.
    ///
    /// Returns the number of bytes read; `0` means EOF or a full buffer.
    pub(crate) async fn buffer_more(&mut self) -> io::Result<usize> {
        let max = self.max_len.saturating_sub(self.buf.len());
        let n = (&mut self.inner)
            .take(max as u64)
            .read_buf(&mut self.buf)
            .await?;
        Ok(n)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for Prebuffered<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !out.has_remaining_mut() {
            Poll::Ready(Ok(()))
        } else if !self.buf.is_empty() {
            let n = self.buf.len().min(out.remaining_mut());
            let chunk = self.buf.split_to(n);
            out.put_slice(&chunk);
            Poll::Ready(Ok(()))
        } else {
            Pin::new(&mut self.inner).poll_read(cx, out)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tokio::io::AsyncReadExt;

    use super::*;

    fn cursor(data: &'static [u8]) -> Cursor<&'static [u8]> {
        Cursor::new(data)
    }

    #[tokio::test]
    async fn buffer_more_respects_cap() {
        let mut p = Prebuffered::new(cursor(b"hello world"), 5);
        p.buffer_more().await.unwrap();
        assert_eq!(p.buffer(), b"hello");
        assert!(p.is_full());
        assert_eq!(p.buffer_more().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn buffer_more_eof() {
        let mut p = Prebuffered::new(cursor(b""), 1024);
        assert_eq!(p.buffer_more().await.unwrap(), 0);
        assert_eq!(p.buffer(), b"");
    }

    #[tokio::test]
    async fn discard_then_read_through() {
        let mut p = Prebuffered::new(cursor(b"abcdef"), 4);
        p.buffer_more().await.unwrap();
        assert_eq!(p.buffer(), b"abcd");
        p.discard(2);

        // Reads drain the remaining buffer first, then the inner reader.
        let mut out = Vec::new();
        p.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"cdef");
    }

    #[tokio::test]
    async fn into_parts_preserves_unconsumed_preface() {
        let mut p = Prebuffered::new(cursor(b"GET / HTTP/1.1\r\n\r\ntrailing"), 18);
        while !p.is_full() {
            p.buffer_more().await.unwrap();
        }
        let (preface, mut rest) = p.into_parts();
        assert_eq!(&preface[..], b"GET / HTTP/1.1\r\n\r\n");
        let mut out = Vec::new();
        rest.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"trailing");
    }

    #[tokio::test]
    async fn incremental_buffering_keeps_position() {
        let mut p = Prebuffered::new(cursor(b"abcdefghij"), 4);
        p.buffer_more().await.unwrap();
        assert_eq!(p.buffer(), b"abcd");
        p.discard(3);
        assert_eq!(p.buffer(), b"d");

        p.buffer_more().await.unwrap();
        assert_eq!(p.buffer(), b"defg");
        let mut out = Vec::new();
        p.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"defghij");
    }
}
