use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::message::{decode_frame, wire_payload_len, Message, DEFAULT_MAX_PAYLOAD};
use crate::transport::{MessageReader, MessageWriter};

const READ_CHUNK: usize = 8 * 1024;

/// Frame decoder over any byte stream
pub struct FramedReader<R> {
    inner: R,
    buffer: BytesMut,
    max_payload: usize,
    timeout: Option<Duration>,
}

impl<R: AsyncRead + Unpin + Send> FramedReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(READ_CHUNK),
            max_payload: DEFAULT_MAX_PAYLOAD,
            timeout: None,
        }
    }

    pub fn with_limits(mut self, max_payload: usize, timeout: Option<Duration>) -> Self {
        self.max_payload = max_payload;
        self.timeout = timeout;
        self
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    async fn read_frame(&mut self) -> Result<Message> {
        loop {
            if let Some(message) = decode_frame(&mut self.buffer, self.max_payload)? {
                return Ok(message);
            }

            self.buffer.reserve(READ_CHUNK);
            let read = self.inner.read_buf(&mut self.buffer).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    Error::ConnectionClosed
                } else {
                    e.into()
                }
            })?;

            if read == 0 {
                if !self.buffer.is_empty() {
                    tracing::debug!(
                        buffered = self.buffer.len(),
                        "peer closed in the middle of a frame"
                    );
                }
                return Err(Error::ConnectionClosed);
            }
        }
    }
}

#[async_trait::async_trait]
impl<R: AsyncRead + Unpin + Send> MessageReader for FramedReader<R> {
    async fn read_message(&mut self) -> Result<Message> {
        if let Some(timeout) = self.timeout {
            tokio::time::timeout(timeout, self.read_frame())
                .await
                .map_err(|_| Error::Timeout("Receive"))?
        } else {
            self.read_frame().await
        }
    }
}

/// Frame encoder over any byte sink
pub struct FramedWriter<W> {
    inner: W,
    timeout: Option<Duration>,
}

impl<W: AsyncWrite + Unpin + Send> FramedWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    async fn write_frame(&mut self, message: &Message) -> Result<()> {
        wire_payload_len(message.payload.len())?;
        let frame = message.encode();
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send> MessageWriter for FramedWriter<W> {
    async fn write_message(&mut self, message: &Message) -> Result<()> {
        if let Some(timeout) = self.timeout {
            tokio::time::timeout(timeout, self.write_frame(message))
                .await
                .map_err(|_| Error::Timeout("Send"))?
        } else {
            self.write_frame(message).await
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
