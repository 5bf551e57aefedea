//! Length-prefixed JSON framing
//!
//! Wire format: [4-byte big-endian length][JSON payload]
//!
//! Readers read the length fully, then the payload fully; writers emit
//! length+payload per message and flush. A zero length prefix is a protocol
//! error, as is a length above [`MAX_FRAME_BYTES`].

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{Error, Result};

use super::WireMessage;

/// Upper bound on a single frame's payload
pub const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

/// Read one framed message from a stream
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<WireMessage> {
    let len = reader.read_u32().await?;
    if len == 0 {
        return Err(Error::EmptyFrame);
    }
    if len > MAX_FRAME_BYTES {
        return Err(Error::FrameTooLarge {
            len,
            max: MAX_FRAME_BYTES,
        });
    }

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;

    serde_json::from_slice(&buf).map_err(|e| Error::ProtocolMalformed(e.to_string()))
}

/// Write one framed message to a stream
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    msg: &WireMessage,
) -> Result<()> {
    let json = serde_json::to_vec(msg)?;
    let len = json.len() as u32;

    writer.write_u32(len).await?;
    writer.write_all(&json).await?;
    writer.flush().await?;

    Ok(())
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TaskStatusUpdate;
    use serde_json::json;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let msg = WireMessage::TaskStatus(TaskStatusUpdate::completed("task_0", json!(25)));
        write_frame(&mut client, &msg).await.unwrap();

        let decoded = read_frame(&mut server).await.unwrap();
        match decoded {
            WireMessage::TaskStatus(update) => {
                assert_eq!(update.task_id, "task_0");
                assert_eq!(update.result, Some(json!(25)));
            }
            other => panic!("Expected task_status, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_zero_length_prefix_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_u32(0).await.unwrap();

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, Error::EmptyFrame));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_u32(MAX_FRAME_BYTES + 1).await.unwrap();

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_garbage_payload_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let payload = b"not json at all";
        client.write_u32(payload.len() as u32).await.unwrap();
        client.write_all(payload).await.unwrap();

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, Error::ProtocolMalformed(_)));
    }

    #[tokio::test]
    async fn test_back_to_back_frames() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        for i in 0..3 {
            let msg =
                WireMessage::TaskStatus(TaskStatusUpdate::poll(format!("task_{i}")));
            write_frame(&mut client, &msg).await.unwrap();
        }

        for i in 0..3 {
            match read_frame(&mut server).await.unwrap() {
                WireMessage::TaskStatus(update) => {
                    assert_eq!(update.task_id, format!("task_{i}"));
                }
                other => panic!("Expected task_status, got {}", other.kind()),
            }
        }
    }
}
