use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_util::ready;
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::trace;

use super::buffer::HeaderBuffers;

/// The transport the engine drives. The socket-tuning hooks are no-ops by
/// default so any stream works; real TCP gets them via the `tcp` feature.
pub trait Transport: AsyncRead + AsyncWrite {
    fn set_nodelay(&self, _on: bool) -> io::Result<()> {
        Ok(())
    }

    /// Arrange for close to send RST instead of FIN (SO_LINGER 0), for
    /// `reset_timedout_connection`.
    fn reset_on_close(&self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(feature = "tcp")]
impl Transport for tokio::net::TcpStream {
    fn set_nodelay(&self, on: bool) -> io::Result<()> {
        tokio::net::TcpStream::set_nodelay(self, on)
    }

    fn reset_on_close(&self) -> io::Result<()> {
        let sock = socket2::SockRef::from(self);
        sock.set_linger(Some(std::time::Duration::from_secs(0)))
    }
}

pin_project! {
    /// Adapter giving any `AsyncRead + AsyncWrite` stream the default
    /// (no-op) socket hooks.
    pub struct Plain<T> {
        #[pin]
        inner: T,
    }
}

impl<T> Plain<T> {
    pub fn new(inner: T) -> Plain<T> {
        Plain { inner }
    }
}

impl<T: AsyncRead> AsyncRead for Plain<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().inner.poll_read(cx, buf)
    }
}

impl<T: AsyncWrite> AsyncWrite for Plain<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

impl<T: AsyncRead + AsyncWrite> Transport for Plain<T> {}

/// Flattened outgoing buffer: response heads and body frames are copied
/// into one contiguous run and written with single syscalls.
pub(crate) struct WriteBuf {
    buf: BytesMut,
}

impl WriteBuf {
    fn new() -> WriteBuf {
        WriteBuf {
            buf: BytesMut::with_capacity(0),
        }
    }

    pub(crate) fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub(crate) fn buffer(&mut self, data: Bytes) {
        self.buf.extend_from_slice(&data);
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
impl WriteBuf {
    pub(crate) fn for_tests() -> WriteBuf {
        WriteBuf::new()
    }

    pub(crate) fn take_for_tests(&mut self) -> Vec<u8> {
        self.buf.split().to_vec()
    }
}

impl fmt::Debug for WriteBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteBuf")
            .field("remaining", &self.buf.len())
            .finish()
    }
}

pub(crate) struct Buffered<T> {
    io: T,
    pub(crate) read_bufs: HeaderBuffers,
    pub(crate) write_buf: WriteBuf,
    /// Total bytes that reached the socket, for rate limiting and logs.
    pub(crate) total_sent: u64,
}

impl<T> Buffered<T>
where
    T: Transport + Unpin,
{
    pub(crate) fn new(io: T, read_bufs: HeaderBuffers) -> Buffered<T> {
        Buffered {
            io,
            read_bufs,
            write_buf: WriteBuf::new(),
            total_sent: 0,
        }
    }

    pub(crate) fn transport(&self) -> &T {
        &self.io
    }

    /// Reads once into the active header buffer's spare room. `Ok(0)`
    /// either means EOF or a full buffer; the caller tells them apart via
    /// `active_spare`.
    pub(crate) fn poll_read_head(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        self.read_bufs.ensure_input();
        let spare = self.read_bufs.active_spare();
        if spare == 0 {
            return Poll::Ready(Ok(0));
        }

        let buf = self.read_bufs.active_buf_mut();
        let dst = &mut buf.spare_capacity_mut()[..spare];
        let mut read_buf = ReadBuf::uninit(dst);
        ready!(Pin::new(&mut self.io).poll_read(cx, &mut read_buf))?;
        let n = read_buf.filled().len();
        // Safety: `n` bytes were initialized by the read above.
        unsafe { buf.advance_mut(n) };
        trace!("read {} bytes into header buffer", n);
        Poll::Ready(Ok(n))
    }

    /// Reads into a throwaway buffer, for body discards and the lingering
    /// drain.
    pub(crate) fn poll_read_discard(
        &mut self,
        cx: &mut Context<'_>,
        scratch: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let mut read_buf = ReadBuf::new(scratch);
        ready!(Pin::new(&mut self.io).poll_read(cx, &mut read_buf))?;
        Poll::Ready(Ok(read_buf.filled().len()))
    }

    /// Writes up to `allow` buffered bytes to the socket and flushes.
    ///
    /// `total_sent` advances as bytes are accepted, so a `Pending` mid-way
    /// loses no accounting. Returns with bytes still buffered only when
    /// `allow` ran out (rate limiting).
    pub(crate) fn poll_flush(&mut self, cx: &mut Context<'_>, allow: u64) -> Poll<io::Result<()>> {
        let mut allow = allow;
        while !self.write_buf.is_empty() && allow > 0 {
            let n = self.write_buf.remaining().min(allow as usize);
            let wrote = ready!(Pin::new(&mut self.io).poll_write(cx, &self.write_buf.buf[..n]))?;
            if wrote == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            trace!("flushed {} bytes", wrote);
            self.write_buf.buf.advance(wrote);
            self.total_sent += wrote as u64;
            allow -= wrote as u64;
        }
        Pin::new(&mut self.io).poll_flush(cx)
    }

    /// Half-closes the write side for lingering close.
    pub(crate) fn poll_shutdown_write(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

impl<T> fmt::Debug for Buffered<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffered")
            .field("write_buf", &self.write_buf.remaining())
            .field("total_sent", &self.total_sent)
            .finish()
    }
}
