//! Stdio framing for instances that live in a child process.
//!
//! Each frame is a 4-byte big-endian length followed by that many bytes of
//! JSON; the JSON is one wire envelope. Frames are decoded to a raw
//! [`Value`] here and validated by the envelope codec in the router, so a
//! well-framed but malformed envelope is dropped without tearing down the
//! channel.

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::envelope::Envelope;

pub use bridge_config::DEFAULT_MAX_IPC_MESSAGE_SIZE;

fn invalid_data(msg: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg)
}

/// Write one length-prefixed JSON frame and flush.
pub async fn write_frame<T: Serialize, W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &T,
) -> Result<(), std::io::Error> {
    let payload = serde_json::to_vec(msg).map_err(invalid_data)?;
    let len = u32::try_from(payload.len()).map_err(|_| {
        invalid_data(format!(
            "frame too large: {} bytes (max {} bytes)",
            payload.len(),
            u32::MAX
        ))
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Write one envelope as a frame.
pub async fn write_envelope<W: AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
) -> Result<(), std::io::Error> {
    write_frame(writer, &envelope.to_value()).await
}

/// Read one frame using [`DEFAULT_MAX_IPC_MESSAGE_SIZE`].
///
/// Returns `None` on a clean EOF before the length prefix.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Value>, std::io::Error> {
    read_frame_with_limit(reader, DEFAULT_MAX_IPC_MESSAGE_SIZE).await
}

/// Read one frame, rejecting any whose declared length exceeds `max_size`.
pub async fn read_frame_with_limit<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<Value>, std::io::Error> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(invalid_data(format!(
            "frame too large: {len} bytes (limit: {max_size} bytes)"
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    let value = serde_json::from_slice(&payload).map_err(invalid_data)?;
    Ok(Some(value))
}
