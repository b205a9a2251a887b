//! Length-prefix framing shared by the byte stream transports
//!
//! Every frame is a 4-byte big-endian length followed by the payload.

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::transport::{TransportReceiver, TransportSender};

/// Largest frame accepted by default (100MB)
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

pub(crate) async fn with_timeout<T, F>(
    timeout: Option<Duration>,
    what: &'static str,
    op: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, op)
            .await
            .map_err(|_| Error::Timeout(what))?,
        None => op.await,
    }
}

fn closed_on_eof(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::ConnectionClosed
    } else {
        e.into()
    }
}

/// Write one length-prefixed frame
pub async fn write_frame<W>(writer: &mut W, bytes: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(bytes.len())
        .map_err(|_| Error::InvalidFrame(format!("Message too large: {} bytes", bytes.len())))?;
    writer.write_u32(len).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame, rejecting frames above `max_len`
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await.map_err(closed_on_eof)? as usize;

    if len > max_len {
        return Err(Error::InvalidFrame(format!(
            "Message too large: {} bytes",
            len
        )));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.map_err(closed_on_eof)?;
    Ok(buf)
}

/// Write half of a framed byte stream
pub struct StreamSender<W> {
    writer: W,
    send_timeout: Option<Duration>,
}

impl<W> StreamSender<W> {
    pub fn new(writer: W, send_timeout: Option<Duration>) -> Self {
        Self {
            writer,
            send_timeout,
        }
    }
}

#[async_trait::async_trait]
impl<W> TransportSender for StreamSender<W>
where
    W: AsyncWrite + Unpin + Send + Sync,
{
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        with_timeout(self.send_timeout, "Send", write_frame(&mut self.writer, bytes)).await
    }

    async fn close(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Read half of a framed byte stream
pub struct StreamReceiver<R> {
    reader: R,
    receive_timeout: Option<Duration>,
    max_frame_size: usize,
}

impl<R> StreamReceiver<R> {
    pub fn new(reader: R, receive_timeout: Option<Duration>, max_frame_size: usize) -> Self {
        Self {
            reader,
            receive_timeout,
            max_frame_size,
        }
    }
}

#[async_trait::async_trait]
impl<R> TransportReceiver for StreamReceiver<R>
where
    R: AsyncRead + Unpin + Send + Sync,
{
    async fn receive(&mut self) -> Result<Vec<u8>> {
        with_timeout(
            self.receive_timeout,
            "Receive",
            read_frame(&mut self.reader, self.max_frame_size),
        )
        .await
    }
}
