//! Wire framing shared by caller and dispatcher.
//!
//! One connection carries exactly one call:
//!
//! ```text
//! client -> server   [u32 BE: len][encoded InvocationEnvelope]
//! client -> server   [0x64]                       (optional, at most once)
//! server -> client   [u32 BE: len][encoded RpcResult]
//! ```
//!
//! The single `0x64` byte (`ProtocolConfig::CANCEL_BYTE`) asks the server to
//! cancel the running invocation. End-of-stream before the result frame is
//! the disconnection path.

use crate::config::ProtocolConfig;
use crate::{Result, RpcError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// What the server saw on the connection after the invocation frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionSignal {
    /// The caller asked for cooperative cancellation.
    Cancel,
    /// The stream ended; the caller is gone.
    Closed,
    /// A byte that is not part of the protocol.
    Unexpected(u8),
}

/// Read a length-prefixed frame from an async reader.
///
/// Frame format: `[4-byte BE u32 length][payload bytes]`
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > ProtocolConfig::MAX_MESSAGE_SIZE {
        return Err(RpcError::communication(format!(
            "frame size {} exceeds maximum {}",
            len,
            ProtocolConfig::MAX_MESSAGE_SIZE
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
///
/// Frame format: `[4-byte BE u32 length][payload bytes]`
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > ProtocolConfig::MAX_MESSAGE_SIZE {
        return Err(RpcError::communication(format!(
            "frame size {} exceeds maximum {}",
            payload.len(),
            ProtocolConfig::MAX_MESSAGE_SIZE
        )));
    }

    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Write the cancellation byte.
pub async fn write_cancel<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<()> {
    writer.write_all(&[ProtocolConfig::CANCEL_BYTE]).await?;
    writer.flush().await?;
    Ok(())
}

/// Block until the caller sends its one optional byte or goes away.
///
/// I/O failures other than EOF are returned as errors; callers treat them
/// like `Closed`.
pub async fn read_signal<R: AsyncRead + Unpin>(reader: &mut R) -> Result<ConnectionSignal> {
    match reader.read_u8().await {
        Ok(ProtocolConfig::CANCEL_BYTE) => Ok(ConnectionSignal::Cancel),
        Ok(byte) => Ok(ConnectionSignal::Unexpected(byte)),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(ConnectionSignal::Closed),
        Err(e) => Err(e.into()),
    }
}
