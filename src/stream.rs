//! Line framing over a TLS-optional byte stream
//!
//! Both engines read CRLF-terminated lines and write formatted lines or
//! dot-stuffed multi-line blocks through [`Framed`]. The transport under
//! the framing layer is swappable at runtime, which is how STARTTLS works:
//! the success reply is flushed, the plain stream is wrapped by the TLS
//! acceptor, and the read buffer is reset.

use std::io::Write as _;

use flate2::Compression;
use flate2::write::ZlibEncoder;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::TlsAcceptor;
use tracing::trace;

use crate::error::{Result, ServerError};

/// Byte stream a connection can run over
///
/// Implemented by plain TCP streams, server TLS streams and the in-memory
/// duplex pipes the tests use.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// Read chunk size
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Upper bound on a single protocol line; longer input is a framing error
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Strip NNTP dot-stuffing from a received line (leading ".." becomes ".")
pub fn strip_dot_stuffing(line: &str) -> &str {
    if line.starts_with("..") {
        &line[1..]
    } else {
        line
    }
}

/// Line-oriented framing over a swappable transport
pub struct Framed {
    io: Option<Box<dyn Transport>>,
    buf: Vec<u8>,
}

impl Framed {
    /// Wrap an already-boxed transport
    pub fn new(io: Box<dyn Transport>) -> Self {
        Self {
            io: Some(io),
            buf: Vec::with_capacity(READ_CHUNK_SIZE),
        }
    }

    /// Wrap any transport value
    pub fn from_io(io: impl Transport + 'static) -> Self {
        Self::new(Box::new(io))
    }

    fn io_mut(&mut self) -> Result<&mut Box<dyn Transport>> {
        self.io.as_mut().ok_or(ServerError::ConnectionClosed)
    }

    /// Read the next CRLF-terminated line
    ///
    /// Bytes are accumulated into an internal buffer; when one read
    /// delivers several lines they are returned by successive calls in
    /// arrival order, and an unterminated tail stays buffered. Bare LF
    /// terminators are tolerated on input.
    pub async fn read_line(&mut self) -> Result<String> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                let line = String::from_utf8_lossy(&line).into_owned();
                trace!("C: {}", line);
                return Ok(line);
            }
            if self.buf.len() > MAX_LINE_LENGTH {
                return Err(ServerError::LineTooLong(self.buf.len()));
            }
            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let n = self.io_mut()?.read(&mut chunk).await?;
            if n == 0 {
                return Err(ServerError::ConnectionClosed);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Write one line, appending CRLF, and flush
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        trace!("S: {}", line);
        let io = self.io_mut()?;
        io.write_all(line.as_bytes()).await?;
        io.write_all(b"\r\n").await?;
        io.flush().await?;
        Ok(())
    }

    /// Write a dot-stuffed multi-line block terminated by `.` and flush
    ///
    /// With `compress` the whole block — terminator included — is passed
    /// through a zlib encoder first (XFEATURE COMPRESS GZIP framing).
    pub async fn write_multiline<I, S>(&mut self, lines: I, compress: bool) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut block = String::new();
        for line in lines {
            let line = line.as_ref();
            if line.starts_with('.') {
                block.push('.');
            }
            block.push_str(line);
            block.push_str("\r\n");
        }
        block.push_str(".\r\n");

        let io = self.io_mut()?;
        if compress {
            let mut encoder = ZlibEncoder::new(
                Vec::with_capacity(block.len() / 2),
                Compression::default(),
            );
            encoder.write_all(block.as_bytes())?;
            let compressed = encoder.finish()?;
            trace!(
                "S: [{} bytes compressed to {}]",
                block.len(),
                compressed.len()
            );
            io.write_all(&compressed).await?;
        } else {
            io.write_all(block.as_bytes()).await?;
        }
        io.flush().await?;
        Ok(())
    }

    /// Write raw octets and flush (IMAP literals)
    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        let io = self.io_mut()?;
        io.write_all(bytes).await?;
        io.flush().await?;
        Ok(())
    }

    /// Replace the transport with its TLS-wrapped form
    ///
    /// Must be called after the upgrade reply has been flushed. The read
    /// buffer is discarded: bytes received before the handshake do not leak
    /// into the encrypted session.
    pub async fn starttls(&mut self, acceptor: &TlsAcceptor) -> Result<()> {
        let io = self.io.take().ok_or(ServerError::ConnectionClosed)?;
        let tls = acceptor
            .accept(io)
            .await
            .map_err(|e| ServerError::Tls(e.to_string()))?;
        self.io = Some(Box::new(tls));
        self.buf.clear();
        Ok(())
    }

    /// Orderly close of the write side
    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(io) = self.io.as_mut() {
            io.shutdown().await?;
        }
        Ok(())
    }
}
