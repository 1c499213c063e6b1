//! Wire format shared by the client channel and the server.
//!
//! Every message is a length-prefixed JSON document:
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! One connection multiplexes many calls. Each call is identified by a
//! client-chosen `id`; unary calls get exactly one `response`, streaming calls
//! get any number of `stream_item`s closed by one `stream_end` carrying the
//! final [`Status`].

use crate::config::WireConfig;
use crate::{BridgeError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Per-call metadata (credentials travel here).
pub type Metadata = BTreeMap<String, String>;

/// Method names of the fixed service contract.
pub mod methods {
    pub const START: &str = "start";
    pub const STOP: &str = "stop";
    pub const DING: &str = "ding";
    pub const LOGOUT: &str = "logout";
    pub const VERSION: &str = "version";
    pub const CURRENT_USER: &str = "current_user";
    pub const EVENT: &str = "event";
    pub const DOWNLOAD: &str = "download";
    pub const UPLOAD: &str = "upload";
    pub const MESSAGE_FILE: &str = "message_file";
    pub const MESSAGE_FILE_STREAM: &str = "message_file_stream";
    pub const MESSAGE_SEND_FILE: &str = "message_send_file";
    pub const MESSAGE_SEND_FILE_STREAM: &str = "message_send_file_stream";
}

/// Call status codes. Values follow the gRPC numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum StatusCode {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    Unimplemented,
    Internal,
    Unavailable,
    Unauthenticated,
}

impl From<i32> for StatusCode {
    fn from(value: i32) -> Self {
        match value {
            0 => StatusCode::Ok,
            1 => StatusCode::Cancelled,
            3 => StatusCode::InvalidArgument,
            4 => StatusCode::DeadlineExceeded,
            5 => StatusCode::NotFound,
            6 => StatusCode::AlreadyExists,
            12 => StatusCode::Unimplemented,
            13 => StatusCode::Internal,
            14 => StatusCode::Unavailable,
            16 => StatusCode::Unauthenticated,
            _ => StatusCode::Unknown,
        }
    }
}

impl From<StatusCode> for i32 {
    fn from(code: StatusCode) -> Self {
        match code {
            StatusCode::Ok => 0,
            StatusCode::Cancelled => 1,
            StatusCode::Unknown => 2,
            StatusCode::InvalidArgument => 3,
            StatusCode::DeadlineExceeded => 4,
            StatusCode::NotFound => 5,
            StatusCode::AlreadyExists => 6,
            StatusCode::Unimplemented => 12,
            StatusCode::Internal => 13,
            StatusCode::Unavailable => 14,
            StatusCode::Unauthenticated => 16,
        }
    }
}

/// Final status of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: StatusCode,
    #[serde(default)]
    pub message: String,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(StatusCode::Ok, "")
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Cancelled, message)
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }

    /// `Ok(())` for OK, otherwise the matching [`BridgeError`].
    pub fn into_result(self) -> Result<()> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(BridgeError::from_status(self))
        }
    }
}

/// Messages sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientMessage {
    Unary {
        id: u64,
        method: String,
        #[serde(default)]
        params: serde_json::Value,
        #[serde(default)]
        metadata: Metadata,
    },
    OpenStream {
        id: u64,
        method: String,
        #[serde(default)]
        params: serde_json::Value,
        #[serde(default)]
        metadata: Metadata,
    },
    StreamItem {
        id: u64,
        item: serde_json::Value,
    },
    StreamEnd {
        id: u64,
    },
    Cancel {
        id: u64,
    },
}

impl ClientMessage {
    pub fn id(&self) -> u64 {
        match self {
            ClientMessage::Unary { id, .. }
            | ClientMessage::OpenStream { id, .. }
            | ClientMessage::StreamItem { id, .. }
            | ClientMessage::StreamEnd { id }
            | ClientMessage::Cancel { id } => *id,
        }
    }
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerMessage {
    Response {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<Status>,
    },
    StreamItem {
        id: u64,
        item: serde_json::Value,
    },
    StreamEnd {
        id: u64,
        status: Status,
    },
}

impl ServerMessage {
    pub fn success(id: u64, result: serde_json::Value) -> Self {
        ServerMessage::Response {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: u64, status: Status) -> Self {
        ServerMessage::Response {
            id,
            result: None,
            error: Some(status),
        }
    }

    pub fn id(&self) -> u64 {
        match self {
            ServerMessage::Response { id, .. }
            | ServerMessage::StreamItem { id, .. }
            | ServerMessage::StreamEnd { id, .. } => *id,
        }
    }
}

/// Read a length-prefixed frame from an async reader.
///
/// Frame format: `[4-byte BE u32 length][payload bytes]`
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

    if len > WireConfig::MAX_FRAME_SIZE {
        return Err(BridgeError::protocol(format!(
            "frame size {} exceeds maximum {}",
            len,
            WireConfig::MAX_FRAME_SIZE
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > WireConfig::MAX_FRAME_SIZE {
        return Err(BridgeError::protocol(format!(
            "frame size {} exceeds maximum {}",
            payload.len(),
            WireConfig::MAX_FRAME_SIZE
        )));
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read and decode one JSON message. `None` on clean EOF.
pub async fn read_message<T, R>(reader: &mut R) -> Result<Option<T>>
where
    T: DeserializeOwned,
    R: AsyncReadExt + Unpin,
{
    match read_frame(reader).await? {
        Some(frame) => serde_json::from_slice(&frame)
            .map(Some)
            .map_err(|e| BridgeError::protocol(format!("malformed message: {}", e))),
        None => Ok(None),
    }
}

/// Encode and write one JSON message.
pub async fn write_message<T, W>(writer: &mut W, message: &T) -> Result<()>
where
    T: Serialize,
    W: AsyncWriteExt + Unpin,
{
    let bytes = serde_json::to_vec(message)?;
    write_frame(writer, &bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_serializes_as_integer() {
        let status = Status::new(StatusCode::AlreadyExists, "busy");
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json, serde_json::json!({"code": 6, "message": "busy"}));
    }

    #[test]
    fn test_unknown_status_code_maps_to_unknown() {
        let status: Status = serde_json::from_str(r#"{"code": 99}"#).unwrap();
        assert_eq!(status.code, StatusCode::Unknown);
        assert!(status.into_result().is_err());
    }

    #[test]
    fn test_client_message_tagging() {
        let msg = ClientMessage::Cancel { id: 7 };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"kind":"cancel","id":7}"#);
    }

    #[test]
    fn test_response_omits_missing_fields() {
        let json = serde_json::to_string(&ServerMessage::success(1, serde_json::json!("pong")))
            .unwrap();
        assert!(json.contains("\"result\""));
        assert!(!json.contains("\"error\""));
    }

    #[tokio::test]
    async fn test_message_read_write() {
        let mut buf = Vec::new();
        let msg = ClientMessage::Unary {
            id: 1,
            method: methods::DING.to_string(),
            params: serde_json::json!({"data": "hi"}),
            metadata: Metadata::new(),
        };
        write_message(&mut buf, &msg).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let read_back: Option<ClientMessage> = read_message(&mut cursor).await.unwrap();
        assert_eq!(read_back, Some(msg));
    }

    #[tokio::test]
    async fn test_frame_read_empty_stream_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let result = read_frame(&mut cursor).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_frame_read_oversized_returns_error() {
        let huge_len: u32 = (WireConfig::MAX_FRAME_SIZE + 1) as u32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&huge_len.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);

        let mut cursor = std::io::Cursor::new(buf);
        let result = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(BridgeError::Protocol { .. })));
    }

    #[tokio::test]
    async fn test_malformed_message_is_protocol_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"not json").await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let result: Result<Option<ClientMessage>> = read_message(&mut cursor).await;
        assert!(matches!(result, Err(BridgeError::Protocol { .. })));
    }
}
