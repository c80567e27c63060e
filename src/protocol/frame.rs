//! Delimiter-terminated JSON framing
//!
//! The broker speaks newline-terminated frames, sandboxes speak NUL-terminated
//! frames. serde_json escapes every control character inside strings, so an
//! encoded payload never contains either delimiter unescaped.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::warn;

use crate::error::ProtocolError;

/// Frame delimiter on the broker connection
pub const BROKER_DELIMITER: u8 = b'\n';
/// Frame delimiter on sandbox RPC connections
pub const SANDBOX_DELIMITER: u8 = b'\0';

/// Longest accepted frame payload; longer frames are dropped
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Encode a value as one frame (payload + delimiter)
pub fn encode_json<T: Serialize>(value: &T, delimiter: u8) -> Result<Vec<u8>, ProtocolError> {
    let mut bytes = serde_json::to_vec(value)?;
    if bytes.contains(&delimiter) {
        return Err(ProtocolError::DelimiterInPayload);
    }
    bytes.push(delimiter);
    Ok(bytes)
}

/// Decode one frame payload (delimiter already stripped)
pub fn decode_json<T: DeserializeOwned>(frame: &[u8]) -> Result<T, ProtocolError> {
    let text = std::str::from_utf8(frame).map_err(|_| ProtocolError::InvalidUtf8)?;
    Ok(serde_json::from_str(text)?)
}

/// Reads delimiter-terminated frames from a byte stream
pub struct FrameReader {
    inner: BufReader<Box<dyn AsyncRead + Send + Unpin>>,
    delimiter: u8,
    max_len: usize,
}

impl FrameReader {
    pub fn new(reader: impl AsyncRead + Send + Unpin + 'static, delimiter: u8) -> Self {
        let boxed: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        Self {
            inner: BufReader::new(boxed),
            delimiter,
            max_len: MAX_FRAME_LEN,
        }
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    /// Read the next non-empty frame. `Ok(None)` means the peer closed the stream.
    ///
    /// A trailing frame without delimiter at EOF is returned as a frame.
    /// Frames longer than the limit are skipped without being buffered.
    pub async fn read_frame(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        loop {
            let mut buf = Vec::new();
            let mut oversized = false;
            let mut eof = false;

            loop {
                let available = self.inner.fill_buf().await?;
                if available.is_empty() {
                    eof = true;
                    break;
                }
                let (chunk_len, found) = match available.iter().position(|b| *b == self.delimiter) {
                    Some(i) => (i, true),
                    None => (available.len(), false),
                };
                if !oversized {
                    if buf.len() + chunk_len > self.max_len {
                        oversized = true;
                        buf = Vec::new();
                    } else {
                        buf.extend_from_slice(&available[..chunk_len]);
                    }
                }
                self.inner.consume(chunk_len + usize::from(found));
                if found {
                    break;
                }
            }

            if oversized {
                warn!("Dropped frame longer than {} bytes", self.max_len);
            } else if !buf.iter().all(|b| b.is_ascii_whitespace()) {
                return Ok(Some(buf));
            }
            // Stray delimiters, CRLF leftovers and dropped frames
            if eof {
                return Ok(None);
            }
        }
    }
}

/// Writes frames to a byte stream
pub struct FrameWriter {
    inner: Box<dyn AsyncWrite + Send + Unpin>,
    delimiter: u8,
}

impl FrameWriter {
    pub fn new(writer: impl AsyncWrite + Send + Unpin + 'static, delimiter: u8) -> Self {
        Self {
            inner: Box::new(writer),
            delimiter,
        }
    }

    /// Serialize and write one frame, flushing the stream
    pub async fn write_json<T: Serialize>(&mut self, value: &T) -> Result<(), WriteError> {
        let bytes = encode_json(value, self.delimiter)?;
        self.write_raw(&bytes).await?;
        Ok(())
    }

    /// Write an already encoded frame (delimiter included)
    pub async fn write_raw(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.inner.write_all(bytes).await?;
        self.inner.flush().await
    }

    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.inner.shutdown().await
    }
}

/// Failure to write a frame
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
