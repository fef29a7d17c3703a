// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Wire format for peer connections.
//!
//! Each message is one frame on a reliable ordered byte stream:
//!
//! ```text
//! [len: u32 LE][bincode(SyncMessage)]
//! ```
//!
//! The bincode variant index doubles as the message-kind tag. Frames are
//! capped at 4 MiB; a peer announcing a larger frame is a protocol
//! violation and the session ends before any allocation happens.

use crate::errors::SyncError;
use forgeline_kernel::block::Block;
use forgeline_kernel::crypto::NodeId;
use forgeline_kernel::types::hash::BlockHash;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Divergence deeper than the reorg limit; operator intervention.
    DivergenceTooDeep,
    /// A block in the requested range is not available.
    RangeUnavailable,
    /// The peer rejected a block we sent.
    InvalidBlock,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Handshake: identity and current chain tip.
    Hello {
        node_id: NodeId,
        height: u64,
        head_hash: BlockHash,
    },
    /// Periodic tip refresh on an established session.
    HeightAdvert { height: u64, head_hash: BlockHash },
    /// Request blocks in `[from, to]`, served one per response.
    BlockRequest { from: u64, to: u64 },
    BlockResponse { block: Block },
    /// Fire-and-forget push of a freshly sealed block.
    BlockBroadcast { block: Block },
    Error { code: ErrorCode },
}

pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &SyncMessage,
) -> Result<(), SyncError> {
    let payload = bincode::serde::encode_to_vec(message, bincode::config::standard())
        .map_err(|e| SyncError::Decode(e.to_string()))?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(SyncError::FrameTooLarge(payload.len()));
    }

    writer.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    writer.write_all(&payload).await?;
    Ok(())
}

pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<SyncMessage, SyncError> {
    let mut len_bytes = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut len_bytes).await {
        return Err(match e.kind() {
            std::io::ErrorKind::UnexpectedEof => SyncError::Closed,
            _ => SyncError::Io(e),
        });
    }

    let len = u32::from_le_bytes(len_bytes) as usize;
    if len == 0 || len > MAX_FRAME_BYTES {
        return Err(SyncError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => SyncError::Closed,
        _ => SyncError::Io(e),
    })?;

    let (message, consumed): (SyncMessage, usize) =
        bincode::serde::decode_from_slice(&payload, bincode::config::standard())
            .map_err(|e| SyncError::Decode(e.to_string()))?;
    if consumed != payload.len() {
        return Err(SyncError::Decode("trailing bytes in frame".to_string()));
    }
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_message_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);

        let message = SyncMessage::Hello {
            node_id: NodeId([7u8; 32]),
            height: 42,
            head_hash: BlockHash([9u8; 32]),
        };

        write_message(&mut a, &message).await.unwrap();
        let received = read_message(&mut b).await.unwrap();

        assert_eq!(received, message);
    }

    #[tokio::test]
    async fn test_oversize_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);

        // Announce an absurd frame length.
        let len = (MAX_FRAME_BYTES as u32 + 1).to_le_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut a, &len).await.unwrap();

        match read_message(&mut b).await {
            Err(SyncError::FrameTooLarge(_)) => {}
            other => panic!("expected FrameTooLarge, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_closed_stream_reports_closed() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);

        match read_message(&mut b).await {
            Err(SyncError::Closed) => {}
            other => panic!("expected Closed, got {:?}", other.map(|_| ())),
        }
    }
}
