//! Framed message I/O over a byte stream
//!
//! A `FramedConnection` owns the stream and an internal read buffer. It can
//! be split into independent read and write halves so a session can run one
//! reader task and one writer task, and it can be dissolved back into the
//! raw stream (plus any bytes already buffered) once a proxy transport
//! switches from control messages to raw splicing.

use bytes::BytesMut;
use outpost_proto::{ControlCodec, ControlMessage};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};

use crate::TransportError;

/// Any full-duplex byte stream a transport can run over (TCP or TLS)
pub trait IoStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> IoStream for T {}

/// Type-erased stream, used once TCP and TLS transports converge
pub type BoxedStream = Box<dyn IoStream>;

/// A framed control transport over `S`
pub struct FramedConnection<S> {
    stream: S,
    read_buf: BytesMut,
}

impl<S: IoStream> FramedConnection<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(4 * 1024),
        }
    }

    /// Read the next message. `Ok(None)` means the peer closed cleanly on a
    /// frame boundary; EOF inside a frame is an I/O error.
    pub async fn read_message(&mut self) -> Result<Option<ControlMessage>, TransportError> {
        read_frame(&mut self.stream, &mut self.read_buf).await
    }

    /// Write one message and flush it
    pub async fn write_message(&mut self, msg: &ControlMessage) -> Result<(), TransportError> {
        let encoded = ControlCodec::encode(msg)?;
        self.stream.write_all(&encoded).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Split into independent read and write halves
    pub fn into_split(self) -> (FramedReader<ReadHalf<S>>, FramedWriter<WriteHalf<S>>) {
        let (read, write) = tokio::io::split(self.stream);
        (
            FramedReader {
                stream: read,
                read_buf: self.read_buf,
            },
            FramedWriter { stream: write },
        )
    }

    /// Dissolve into the raw stream and any bytes read past the last frame
    pub fn into_inner(self) -> (S, BytesMut) {
        (self.stream, self.read_buf)
    }
}

/// Read half of a framed transport; single-consumer
pub struct FramedReader<R> {
    stream: R,
    read_buf: BytesMut,
}

impl<R: AsyncRead + Unpin + Send> FramedReader<R> {
    pub async fn read_message(&mut self) -> Result<Option<ControlMessage>, TransportError> {
        read_frame(&mut self.stream, &mut self.read_buf).await
    }
}

/// Write half of a framed transport
///
/// Writes are serialized by ownership: a session funnels all outbound
/// messages through one writer task, which gives per-session ordering.
pub struct FramedWriter<W> {
    stream: W,
}

impl<W: AsyncWrite + Unpin + Send> FramedWriter<W> {
    pub async fn write_message(&mut self, msg: &ControlMessage) -> Result<(), TransportError> {
        let encoded = ControlCodec::encode(msg)?;
        self.stream.write_all(&encoded).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Shut down the write side
    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

async fn read_frame<R: AsyncRead + Unpin>(
    stream: &mut R,
    read_buf: &mut BytesMut,
) -> Result<Option<ControlMessage>, TransportError> {
    loop {
        if let Some(msg) = ControlCodec::decode(read_buf)? {
            return Ok(Some(msg));
        }

        let n = stream.read_buf(read_buf).await?;
        if n == 0 {
            if read_buf.is_empty() {
                return Ok(None);
            }
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream closed inside a frame",
            )));
        }
    }
}

/// A dialed-back proxy transport after `StartProxy`: the raw stream plus
/// whatever the framed reader had already buffered. Reads drain the buffer
/// first so no client bytes are lost in the handoff to the splice.
pub struct ProxyStream {
    stream: Box<dyn IoStream>,
    buffered: BytesMut,
}

impl ProxyStream {
    pub fn new(stream: Box<dyn IoStream>, buffered: BytesMut) -> Self {
        Self { stream, buffered }
    }
}

impl std::fmt::Debug for ProxyStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyStream")
            .field("buffered", &self.buffered)
            .finish()
    }
}

impl AsyncRead for ProxyStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.buffered.is_empty() {
            let n = self.buffered.len().min(buf.remaining());
            let chunk = self.buffered.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for ProxyStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
