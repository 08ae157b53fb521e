//! Network socket wrapper allowing us to treat TCP and UNIX
//! connections the same across the code.

use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufStream, ReadBuf};
use tokio::net::{TcpStream, UnixStream};
use tracing::trace;

use std::io::{Error as IoError, ErrorKind};
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::Context;

use super::messages::{ErrorResponse, Message, MessageBuffer, Protocol, Terminate};

const BUFFER_CAPACITY: usize = 8192;

/// Inner stream types.
#[pin_project(project = StreamInnerProjection)]
#[derive(Debug)]
enum StreamInner {
    Plain(#[pin] BufStream<TcpStream>),
    Unix(#[pin] BufStream<UnixStream>),
}

/// A network socket.
#[pin_project]
#[derive(Debug)]
pub struct Stream {
    #[pin]
    inner: StreamInner,
    buffer: MessageBuffer,
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let project = self.project();
        match project.inner.project() {
            StreamInnerProjection::Plain(stream) => stream.poll_read(cx, buf),
            StreamInnerProjection::Unix(stream) => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<Result<usize, IoError>> {
        let project = self.project();
        match project.inner.project() {
            StreamInnerProjection::Plain(stream) => stream.poll_write(cx, buf),
            StreamInnerProjection::Unix(stream) => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> std::task::Poll<Result<(), IoError>> {
        let project = self.project();
        match project.inner.project() {
            StreamInnerProjection::Plain(stream) => stream.poll_flush(cx),
            StreamInnerProjection::Unix(stream) => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> std::task::Poll<Result<(), IoError>> {
        let project = self.project();
        match project.inner.project() {
            StreamInnerProjection::Plain(stream) => stream.poll_shutdown(cx),
            StreamInnerProjection::Unix(stream) => stream.poll_shutdown(cx),
        }
    }
}

impl Stream {
    /// Wrap a TCP stream.
    pub fn plain(stream: TcpStream) -> Self {
        Self {
            inner: StreamInner::Plain(BufStream::with_capacity(
                BUFFER_CAPACITY,
                BUFFER_CAPACITY,
                stream,
            )),
            buffer: MessageBuffer::new(),
        }
    }

    /// Wrap a UNIX domain socket.
    pub fn unix(stream: UnixStream) -> Self {
        Self {
            inner: StreamInner::Unix(BufStream::with_capacity(
                BUFFER_CAPACITY,
                BUFFER_CAPACITY,
                stream,
            )),
            buffer: MessageBuffer::new(),
        }
    }

    /// Get peer address, if this is a TCP socket.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match &self.inner {
            StreamInner::Plain(stream) => stream.get_ref().peer_addr().ok(),
            StreamInner::Unix(_) => None,
        }
    }

    /// Check the socket is still alive while it's idle in the pool.
    /// A peer that half-closed shows up as a pending EOF.
    pub async fn check(&mut self) -> Result<(), super::Error> {
        match &mut self.inner {
            StreamInner::Plain(plain) => {
                let mut buf = [0u8; 1];
                match eof(plain.get_mut().peek(&mut buf).await) {
                    Ok(0) => Err(super::Error::UnexpectedEof),
                    Ok(_) => Ok(()),
                    Err(err) => Err(err),
                }
            }
            // No peek on UNIX sockets; rely on the write failing.
            StreamInner::Unix(_) => Ok(()),
        }
    }

    /// Send a message via the stream.
    ///
    /// # Performance
    ///
    /// This is fast because the stream is buffered. Make sure to call
    /// [`Stream::send_flush`] for the last message in the exchange.
    pub async fn send(&mut self, message: &impl Protocol) -> Result<usize, super::Error> {
        let bytes = message.to_bytes()?;
        eof(self.write_all(&bytes).await)?;

        trace!("{:?} <-- {:?}", self.peer_addr(), message);

        Ok(bytes.len())
    }

    /// Send a message and flush the buffer, ensuring it's
    /// actually written to the socket.
    pub async fn send_flush(&mut self, message: &impl Protocol) -> Result<usize, super::Error> {
        let sent = self.send(message).await?;
        eof(self.flush().await)?;

        Ok(sent)
    }

    /// Send multiple messages and flush the buffer.
    pub async fn send_many(&mut self, messages: &[impl Protocol]) -> Result<usize, super::Error> {
        let mut sent = 0;
        for message in messages {
            sent += self.send(message).await?;
        }
        eof(self.flush().await)?;
        Ok(sent)
    }

    /// Send raw bytes and flush.
    pub async fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), super::Error> {
        eof(self.write_all(bytes).await)?;
        eof(self.flush().await)?;
        Ok(())
    }

    /// Read a message from the stream.
    ///
    /// # Cancellation safety
    ///
    /// This method is cancel-safe: the proxy loop selects over
    /// two of these at once.
    pub async fn read(&mut self) -> Result<Message, super::Error> {
        let Self { inner, buffer } = self;
        match inner {
            StreamInner::Plain(stream) => buffer.read(stream).await,
            StreamInner::Unix(stream) => buffer.read(stream).await,
        }
    }

    /// Send an error to the client and disconnect gracefully.
    pub async fn fatal(&mut self, error: ErrorResponse) -> Result<(), super::Error> {
        self.send(&error).await?;
        self.send_flush(&Terminate).await?;

        Ok(())
    }
}

pub(crate) fn eof<T>(result: std::io::Result<T>) -> Result<T, super::Error> {
    match result {
        Ok(val) => Ok(val),
        Err(err) => {
            if err.kind() == ErrorKind::UnexpectedEof {
                Err(super::Error::UnexpectedEof)
            } else {
                Err(super::Error::Io(err))
            }
        }
    }
}
