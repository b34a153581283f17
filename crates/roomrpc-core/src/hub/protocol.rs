//! Hub frame types and framing.
//!
//! Every frame is a 4-byte big-endian length prefix followed by a UTF-8 JSON
//! payload:
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```

use crate::config::HubConfig;
use crate::{Result, RpcError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Messages exchanged between a hub and its clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum HubFrame {
    /// Client → hub: start relaying `topic` to this connection.
    Subscribe { topic: String },
    /// Hub → client: the subscription is in place.
    Subscribed { topic: String },
    /// Client → hub: relay `payload` to every subscriber of `topic`.
    Publish { topic: String, payload: Value },
    /// Hub → client: a payload published on a subscribed topic.
    Deliver { topic: String, payload: Value },
}

impl HubFrame {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| RpcError::Json {
            message: format!("Failed to parse hub frame: {}", e),
            source: Some(e),
        })
    }
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > HubConfig::MAX_FRAME_SIZE {
        return Err(RpcError::Validation {
            field: "hub_frame".to_string(),
            message: format!(
                "Frame size {} exceeds maximum {}",
                len,
                HubConfig::MAX_FRAME_SIZE
            ),
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > HubConfig::MAX_FRAME_SIZE {
        return Err(RpcError::validation(
            "hub_frame",
            format!(
                "Frame size {} exceeds maximum {}",
                payload.len(),
                HubConfig::MAX_FRAME_SIZE
            ),
        ));
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_tagging() {
        let frame = HubFrame::Publish {
            topic: "module.dice".to_string(),
            payload: json!({"type": 0}),
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"op": "publish", "topic": "module.dice", "payload": {"type": 0}})
        );
    }

    #[test]
    fn test_from_bytes_rejects_unknown_op() {
        let result = HubFrame::from_bytes(br#"{"op": "teleport", "topic": "x"}"#);
        assert!(matches!(result, Err(RpcError::Json { .. })));
    }

    #[tokio::test]
    async fn test_frame_read_write() {
        let frame = HubFrame::Subscribe {
            topic: "module.dice".to_string(),
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame.to_bytes().unwrap()).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let bytes = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(HubFrame::from_bytes(&bytes).unwrap(), frame);
    }

    #[tokio::test]
    async fn test_frame_read_empty_stream_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let result = read_frame(&mut cursor).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_frame_read_oversized_returns_error() {
        let huge_len: u32 = (HubConfig::MAX_FRAME_SIZE + 1) as u32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&huge_len.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);

        let mut cursor = std::io::Cursor::new(buf);
        let result = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(RpcError::Validation { .. })));
    }
}
