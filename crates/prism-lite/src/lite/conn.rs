use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Bytes, BytesMut};
use pin_project_lite::pin_project;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};
use tokio_util::sync::CancellationToken;

/// A client connection handed to the forwarder and status resolver.
pub trait ClientConn: AsyncRead + AsyncWrite + Send + Unpin {
    fn remote_addr(&self) -> SocketAddr;

    fn local_addr(&self) -> Option<SocketAddr>;

    /// Cancelled when the connection's lifetime ends, including proxy shutdown.
    fn cancellation(&self) -> &CancellationToken;

    /// Takes the bytes already read off the socket while decoding the handshake. They must
    /// reach the backend before anything else read from this connection.
    fn take_buffered(&mut self) -> Bytes;
}

pin_project! {
    /// A stream with read-ahead bytes that are served before the stream itself.
    #[derive(Debug)]
    pub struct BufferedConn<S> {
        #[pin]
        inner: S,
        buffered: Bytes,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        cancel: CancellationToken,
    }
}

impl BufferedConn<TcpStream> {
    pub fn from_tcp(stream: TcpStream, cancel: CancellationToken) -> io::Result<Self> {
        let remote = stream.peer_addr()?;
        let local = stream.local_addr().ok();
        Ok(Self::new(stream, remote, local, cancel))
    }
}

impl<S> BufferedConn<S> {
    pub fn new(
        inner: S,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner,
            buffered: Bytes::new(),
            remote,
            local,
            cancel,
        }
    }

    /// Puts `read_ahead` in front of whatever is already buffered.
    pub fn with_buffered(mut self, read_ahead: BytesMut) -> Self {
        if self.buffered.is_empty() {
            self.buffered = read_ahead.freeze();
        } else if !read_ahead.is_empty() {
            let mut joined = read_ahead;
            joined.extend_from_slice(&self.buffered);
            self.buffered = joined.freeze();
        }
        self
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buffered
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead> AsyncRead for BufferedConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        if !this.buffered.is_empty() {
            let n = this.buffered.len().min(buf.remaining());
            buf.put_slice(&this.buffered.split_to(n));
            return Poll::Ready(Ok(()));
        }
        this.inner.poll_read(cx, buf)
    }
}

impl<S: AsyncWrite> AsyncWrite for BufferedConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, data)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

impl<S> ClientConn for BufferedConn<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    fn take_buffered(&mut self) -> Bytes {
        std::mem::take(&mut self.buffered)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:40000".parse().expect("addr")
    }

    #[tokio::test]
    async fn buffered_bytes_are_read_first() {
        let (a, mut b) = duplex(64);
        let conn = BufferedConn::new(a, addr(), None, CancellationToken::new())
            .with_buffered(BytesMut::from(&b"world"[..]))
            .with_buffered(BytesMut::from(&b"hello "[..]));
        b.write_all(b"!").await.expect("write");
        drop(b);

        let mut conn = conn;
        let mut out = String::new();
        conn.read_to_string(&mut out).await.expect("read");
        assert_eq!(out, "hello world!");
    }

    #[tokio::test]
    async fn take_buffered_drains_read_ahead() {
        let (a, mut b) = duplex(64);
        let mut conn = BufferedConn::new(a, addr(), None, CancellationToken::new())
            .with_buffered(BytesMut::from(&b"early"[..]));
        assert_eq!(conn.take_buffered(), Bytes::from_static(b"early"));
        assert!(conn.take_buffered().is_empty());

        b.write_all(b"late").await.expect("write");
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"late");

        conn.write_all(b"reply").await.expect("write");
        let mut back = [0u8; 5];
        b.read_exact(&mut back).await.expect("read");
        assert_eq!(&back, b"reply");
        assert_eq!(conn.remote_addr(), addr());
    }
}
