//! Connection abstractions shared by the hub and probe.
//!
//! A [`Conn`] is a reliable, ordered, bidirectional byte-stream endpoint
//! with a human-readable name for logs. It is built from two independently
//! usable halves so the duplex engine can copy both directions
//! concurrently, the way `TcpStream::into_split` is used elsewhere.

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, ForwardError, Result};
use crate::trace::TraceId;

/// Buffer size for bulk copy operations.
pub const COPY_BATCH_SIZE: usize = 32 * 1024;

/// The read direction of a connection.
#[async_trait]
pub trait ConnReader: Send {
    /// Reads up to `buf.len()` bytes. `Ok(0)` signals end of stream
    /// (or an empty `buf`).
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Bulk copy: drains this reader into `dst` until end of stream,
    /// returning the number of bytes copied.
    ///
    /// Implementations with an internal framing (see
    /// [`crate::stream`]) override this to avoid the intermediate buffer.
    async fn read_to(&mut self, dst: &mut dyn ConnWriter) -> Result<u64> {
        let mut buf = vec![0u8; COPY_BATCH_SIZE];
        let mut total = 0u64;
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(total);
            }
            dst.write_all(&buf[..n]).await?;
            total += n as u64;
        }
    }
}

/// The write direction of a connection.
#[async_trait]
pub trait ConnWriter: Send {
    /// Writes from `buf`, returning the number of bytes accepted.
    /// Writing an empty `buf` is a no-op returning 0.
    async fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Writes the whole of `buf`.
    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < buf.len() {
            let n = self.write(&buf[written..]).await?;
            if n == 0 {
                return Err(Error::Closed);
            }
            written += n;
        }
        Ok(())
    }

    /// Shuts down the write direction so the peer observes end of stream.
    /// Must be idempotent.
    async fn close(&mut self) -> Result<()>;
}

/// A named bidirectional byte-stream endpoint.
pub struct Conn {
    name: String,
    reader: Box<dyn ConnReader>,
    writer: Box<dyn ConnWriter>,
    closed: bool,
}

impl Conn {
    pub fn new(
        name: impl Into<String>,
        reader: Box<dyn ConnReader>,
        writer: Box<dyn ConnWriter>,
    ) -> Self {
        Self {
            name: name.into(),
            reader,
            writer,
            closed: false,
        }
    }

    /// Builds a Conn from any tokio reader/writer pair, e.g. the halves of
    /// a `TcpStream` or an in-memory duplex stream.
    pub fn from_io<R, W>(name: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::new(
            name,
            Box::new(IoReader { inner: reader }),
            Box::new(IoWriter {
                inner: writer,
                closed: false,
            }),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.closed {
            return Err(Error::Closed);
        }
        self.reader.read(buf).await
    }

    pub async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.closed {
            return Err(Error::Closed);
        }
        self.writer.write(buf).await
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        self.writer.write_all(buf).await
    }

    /// Closes the connection. Idempotent; reads and writes after close
    /// return [`Error::Closed`].
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.writer.close().await
    }

    /// Splits into named halves for concurrent bidirectional copying.
    pub fn into_split(self) -> (ReadHalf, WriteHalf) {
        (
            ReadHalf {
                name: self.name.clone(),
                inner: self.reader,
            },
            WriteHalf {
                name: self.name,
                inner: self.writer,
            },
        )
    }

    /// Decomposes the Conn so wrappers can replace a half.
    pub fn into_parts(self) -> (String, Box<dyn ConnReader>, Box<dyn ConnWriter>) {
        (self.name, self.reader, self.writer)
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("name", &self.name)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Named read half of a [`Conn`].
pub struct ReadHalf {
    name: String,
    inner: Box<dyn ConnReader>,
}

impl ReadHalf {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.inner.read(buf).await
    }

    pub async fn read_to(&mut self, dst: &mut WriteHalf) -> Result<u64> {
        self.inner.read_to(dst.inner.as_mut()).await
    }
}

/// Named write half of a [`Conn`].
pub struct WriteHalf {
    name: String,
    inner: Box<dyn ConnWriter>,
}

impl WriteHalf {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.inner.write_all(buf).await
    }

    pub async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }
}

struct IoReader<R> {
    inner: R,
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> ConnReader for IoReader<R> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = self.inner.read(buf).await?;
        Ok(n)
    }
}

struct IoWriter<W> {
    inner: W,
    closed: bool,
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> ConnWriter for IoWriter<W> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.closed {
            return Err(Error::Closed);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let n = self.inner.write(buf).await?;
        Ok(n)
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Deferred producer of the client-side [`Conn`].
///
/// Called only after the target dial succeeded, so CONNECT handlers can
/// acknowledge the tunnel to the client before handing over the socket.
pub type AcceptFn<'a> =
    Box<dyn FnOnce() -> BoxFuture<'a, std::result::Result<Conn, ForwardError>> + Send + 'a>;

/// Establishes connections to remote targets on behalf of the hub.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Opens a connection to `target` (`host:port`), propagating the trace
    /// id to the remote end.
    async fn dial(
        &self,
        trace_id: &TraceId,
        target: &str,
    ) -> std::result::Result<Conn, ForwardError>;
}

/// Splices a freshly dialed target with a deferred client connection.
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Opens `target`, invokes `accept` to obtain the client [`Conn`],
    /// and relays bytes both ways until either side closes.
    async fn forward<'a>(
        &self,
        target: &str,
        accept: AcceptFn<'a>,
    ) -> std::result::Result<(), ForwardError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_pair() -> (Conn, Conn) {
        let (a, b) = tokio::io::duplex(4096);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (Conn::from_io("left", ar, aw), Conn::from_io("right", br, bw))
    }

    #[tokio::test]
    async fn io_conn_round_trip() {
        let (mut left, mut right) = pipe_pair();
        left.write_all(b"hello over the pipe").await.unwrap();
        let mut buf = [0u8; 64];
        let n = right.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello over the pipe");
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (mut left, _right) = pipe_pair();
        left.close().await.unwrap();
        left.close().await.unwrap();
    }

    #[tokio::test]
    async fn read_write_after_close_fail() {
        let (mut left, _right) = pipe_pair();
        left.close().await.unwrap();
        let mut buf = [0u8; 8];
        assert!(matches!(left.read(&mut buf).await, Err(Error::Closed)));
        assert!(matches!(left.write(b"x").await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn empty_read_and_write_are_noops() {
        let (mut left, mut right) = pipe_pair();
        assert_eq!(left.write(&[]).await.unwrap(), 0);
        let mut empty = [0u8; 0];
        assert_eq!(right.read(&mut empty).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn close_propagates_eof_to_peer() {
        let (mut left, mut right) = pipe_pair();
        left.write_all(b"bye").await.unwrap();
        left.close().await.unwrap();
        let mut buf = [0u8; 16];
        let n = right.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"bye");
        assert_eq!(right.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn default_read_to_copies_everything() {
        let (mut src, peer) = pipe_pair();
        let (dst, mut dst_peer) = pipe_pair();

        src.write_all(b"payload to copy").await.unwrap();
        src.close().await.unwrap();

        let (mut from, _) = peer.into_split();
        let (_, mut to) = dst.into_split();
        let n = from.read_to(&mut to).await.unwrap();
        assert_eq!(n, b"payload to copy".len() as u64);

        let mut buf = [0u8; 64];
        let n = dst_peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"payload to copy");
    }
}
