//! Transport layer for client ↔ agent communication.
//!
//! Messages are length-prefixed JSON: `[4-byte big-endian length][payload]`.
//! The length prefix keeps the stream 8-bit clean; payloads may contain any
//! source text.

pub mod protocol;
pub mod stdio_pipe;

#[cfg(test)]
pub(crate) mod testing;

pub use protocol::{Action, RequestEnvelope, ResponseEnvelope};
pub use stdio_pipe::{AgentChild, AgentIo, AgentLauncher, LaunchSpec, ProcessLauncher};

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum message size (64 MB). Safety valve against malformed messages.
const MAX_MESSAGE_SIZE: u32 = 64 * 1024 * 1024;

/// Why a frame could not be read.
#[derive(Error, Debug)]
pub enum FrameError {
    /// The stream closed cleanly on a frame boundary.
    #[error("end of stream")]
    EndOfStream,

    /// The bytes do not form a valid frame.
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Write a length-prefixed message to a writer.
///
/// Format: [4-byte big-endian length][payload bytes]
pub async fn send_message<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| anyhow::anyhow!("Message too large: {} bytes", payload.len()))?;
    anyhow::ensure!(
        len <= MAX_MESSAGE_SIZE,
        "Message exceeds max size: {len} > {MAX_MESSAGE_SIZE}"
    );

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-prefixed message from a reader.
///
/// Returns the raw payload bytes. Enforces `MAX_MESSAGE_SIZE`.
pub async fn recv_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, FrameError> {
    let mut len_buf = [0u8; 4];
    let n = reader.read(&mut len_buf).await?;
    if n == 0 {
        return Err(FrameError::EndOfStream);
    }
    read_exact(reader, &mut len_buf[n..], "truncated frame header").await?;

    let len = u32::from_be_bytes(len_buf);
    if len > MAX_MESSAGE_SIZE {
        return Err(FrameError::Malformed(format!(
            "message exceeds max size: {len} > {MAX_MESSAGE_SIZE}"
        )));
    }

    let mut buf = vec![0u8; len as usize];
    read_exact(reader, &mut buf, "truncated frame payload").await?;
    Ok(buf)
}

async fn read_exact<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
    what: &str,
) -> Result<(), FrameError> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(FrameError::Malformed(format!("{what}: expected {} bytes", buf.len())))
        }
        Err(e) => Err(FrameError::Io(e)),
    }
}

/// Encode one request envelope as a frame payload.
pub fn encode_request(envelope: &RequestEnvelope<'_>) -> Result<Vec<u8>> {
    serde_json::to_vec(envelope).context("Failed to serialize request")
}

/// Decode one response envelope from a frame payload.
pub fn decode_response(payload: &[u8]) -> Result<ResponseEnvelope> {
    serde_json::from_slice(payload).context("Failed to decode response")
}
