//! Chunked binary transfer codec.
//!
//! A named byte stream is carried as one [`ChunkFrame::Name`] frame followed
//! by any number of [`ChunkFrame::Data`] frames, then end of stream:
//!
//! ```text
//! {"name":"photo.jpg"} {"data":"<base64>"} {"data":"<base64>"} <end>
//! ```
//!
//! Errors on the input side are never turned into a silent truncation: they
//! surface as an `Err` item on the decoded byte stream.

use crate::config::TransferConfig;
use crate::{BridgeError, Result};
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio_util::io::{ReaderStream, StreamReader};

/// One frame of a chunked transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChunkFrame {
    Name(String),
    Data(#[serde(with = "base64_bytes")] Bytes),
}

/// Leading item of a send-file stream, before the first chunk frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationHead {
    pub conversation_id: String,
}

/// Decoded byte stream of a transfer.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// A decoded transfer: its name and its body.
pub struct DecodedFile {
    pub name: String,
    pub body: ByteStream,
}

impl std::fmt::Debug for DecodedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedFile").field("name", &self.name).finish()
    }
}

impl DecodedFile {
    /// Adapt the body into an `AsyncRead`. Transfer errors become
    /// `io::Error`s wrapping the original [`BridgeError`].
    pub fn into_reader(self) -> impl AsyncRead + Send + Unpin + 'static {
        byte_stream_reader(self.body)
    }

    /// Collect the whole body, failing on the first transfer error.
    pub async fn read_to_end(self) -> Result<Vec<u8>> {
        collect_bytes(self.body).await
    }
}

/// Encode a named reader into frames.
pub fn encode<R>(name: impl Into<String>, reader: R) -> BoxStream<'static, Result<ChunkFrame>>
where
    R: AsyncRead + Send + 'static,
{
    let body = ReaderStream::with_capacity(reader, TransferConfig::CHUNK_SIZE)
        .map(|chunk| chunk.map_err(BridgeError::from));
    encode_stream(name, body)
}

/// Encode a named byte stream into frames.
///
/// Oversized input chunks are split so no data frame exceeds
/// [`TransferConfig::CHUNK_SIZE`].
pub fn encode_stream<S>(name: impl Into<String>, body: S) -> BoxStream<'static, Result<ChunkFrame>>
where
    S: Stream<Item = Result<Bytes>> + Send + 'static,
{
    let head = stream::once(futures::future::ready(Ok(ChunkFrame::Name(name.into()))));
    let data = body.flat_map(|chunk| {
        let frames: Vec<Result<ChunkFrame>> = match chunk {
            Ok(bytes) => split_chunk(bytes).into_iter().map(|b| Ok(ChunkFrame::Data(b))).collect(),
            Err(e) => vec![Err(e)],
        };
        stream::iter(frames)
    });
    head.chain(data).boxed()
}

fn split_chunk(mut bytes: Bytes) -> Vec<Bytes> {
    let mut parts = Vec::with_capacity(bytes.len() / TransferConfig::CHUNK_SIZE + 1);
    while bytes.len() > TransferConfig::CHUNK_SIZE {
        parts.push(bytes.split_to(TransferConfig::CHUNK_SIZE));
    }
    if !bytes.is_empty() {
        parts.push(bytes);
    }
    parts
}

/// Decode a frame sequence.
///
/// Consumes the first frame, which must be a `Name` frame, otherwise fails
/// with `Protocol("no name")`. The returned body yields the data frames in
/// order and ends with an error item if the input fails or a second `Name`
/// frame shows up.
pub async fn decode<S>(mut frames: S) -> Result<DecodedFile>
where
    S: Stream<Item = Result<ChunkFrame>> + Send + Unpin + 'static,
{
    let name = match frames.next().await {
        Some(Ok(ChunkFrame::Name(name))) => name,
        Some(Ok(ChunkFrame::Data(_))) | None => return Err(BridgeError::protocol("no name")),
        Some(Err(e)) => return Err(e),
    };

    let body = stream::unfold(Some(frames), |state| async move {
        let mut frames = state?;
        match frames.next().await {
            None => None,
            Some(Ok(ChunkFrame::Data(bytes))) => Some((Ok(bytes), Some(frames))),
            Some(Ok(ChunkFrame::Name(_))) => Some((
                Err(BridgeError::protocol("unexpected name frame after data")),
                None,
            )),
            Some(Err(e)) => Some((Err(e), None)),
        }
    })
    .boxed();

    Ok(DecodedFile { name, body })
}

/// Adapt a byte stream into an `AsyncRead`.
pub fn byte_stream_reader(body: ByteStream) -> impl AsyncRead + Send + Unpin + 'static {
    StreamReader::new(body.map(|chunk| chunk.map_err(std::io::Error::other)))
}

/// Collect a byte stream into memory.
pub async fn collect_bytes(mut body: ByteStream) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(chunk) = body.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}

/// Recover the bridge error carried inside an `io::Error` produced by
/// [`byte_stream_reader`].
pub fn unwrap_io_error(err: std::io::Error) -> BridgeError {
    if err.get_ref().is_some_and(|inner| inner.is::<BridgeError>()) {
        if let Some(inner) = err.into_inner() {
            if let Ok(bridge) = inner.downcast::<BridgeError>() {
                return *bridge;
            }
        }
        return BridgeError::stream("transfer failed");
    }
    BridgeError::from(err)
}

pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn frames_of(items: Vec<Result<ChunkFrame>>) -> BoxStream<'static, Result<ChunkFrame>> {
        stream::iter(items).boxed()
    }

    #[test]
    fn test_frame_wire_shape() {
        let json = serde_json::to_string(&ChunkFrame::Name("a.txt".into())).unwrap();
        assert_eq!(json, r#"{"name":"a.txt"}"#);
        let json = serde_json::to_string(&ChunkFrame::Data(Bytes::from_static(b"hi"))).unwrap();
        assert_eq!(json, r#"{"data":"aGk="}"#);
    }

    #[tokio::test]
    async fn test_roundtrip_preserves_name_and_bytes() {
        let payload: Vec<u8> = (0..(TransferConfig::CHUNK_SIZE * 3 + 17))
            .map(|i| (i % 251) as u8)
            .collect();

        let frames = encode("blob.bin", std::io::Cursor::new(payload.clone()));
        let decoded = decode(frames).await.unwrap();
        assert_eq!(decoded.name, "blob.bin");
        assert_eq!(decoded.read_to_end().await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_empty_body_encodes_to_name_only() {
        let frames: Vec<_> = encode("empty", std::io::Cursor::new(Vec::new()))
            .collect()
            .await;
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], Ok(ChunkFrame::Name(ref n)) if n == "empty"));
    }

    #[tokio::test]
    async fn test_oversized_chunks_are_split() {
        let big = Bytes::from(vec![7u8; TransferConfig::CHUNK_SIZE * 2 + 1]);
        let frames: Vec<_> = encode_stream("big", stream::iter(vec![Ok(big)])).collect().await;
        assert_eq!(frames.len(), 4);
        for frame in &frames[1..] {
            match frame {
                Ok(ChunkFrame::Data(b)) => assert!(b.len() <= TransferConfig::CHUNK_SIZE),
                other => panic!("Expected data frame, got: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_data_first_fails_with_no_name() {
        let frames = frames_of(vec![
            Ok(ChunkFrame::Data(Bytes::from_static(b"x"))),
            Ok(ChunkFrame::Name("late".into())),
        ]);
        let err = decode(frames).await.unwrap_err();
        assert_eq!(err.to_string(), "Protocol error: no name");
    }

    #[tokio::test]
    async fn test_empty_sequence_fails_with_no_name() {
        let err = decode(frames_of(vec![])).await.unwrap_err();
        assert!(matches!(err, BridgeError::Protocol { ref message } if message == "no name"));
    }

    #[tokio::test]
    async fn test_second_name_frame_is_an_error() {
        let frames = frames_of(vec![
            Ok(ChunkFrame::Name("a".into())),
            Ok(ChunkFrame::Data(Bytes::from_static(b"1"))),
            Ok(ChunkFrame::Name("b".into())),
        ]);
        let decoded = decode(frames).await.unwrap();
        assert!(matches!(
            decoded.read_to_end().await,
            Err(BridgeError::Protocol { .. })
        ));
    }

    #[tokio::test]
    async fn test_input_error_propagates_at_any_position() {
        // Error before any data, in the middle, and after all data.
        for position in 0..3usize {
            let mut items: Vec<Result<Bytes>> = vec![
                Ok(Bytes::from_static(b"first")),
                Ok(Bytes::from_static(b"second")),
            ];
            items.insert(position, Err(BridgeError::stream("peer went away")));

            let frames = encode_stream("f", stream::iter(items));
            let decoded = decode(frames).await.unwrap();
            let result = decoded.read_to_end().await;
            assert!(
                matches!(result, Err(BridgeError::Stream { .. })),
                "error at position {} was swallowed",
                position
            );
        }
    }

    #[tokio::test]
    async fn test_reader_adapter_surfaces_error() {
        let frames = encode_stream(
            "f",
            stream::iter(vec![
                Ok(Bytes::from_static(b"abc")),
                Err(BridgeError::stream("cut")),
            ]),
        );
        let mut reader = decode(frames).await.unwrap().into_reader();
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();
        assert!(matches!(unwrap_io_error(err), BridgeError::Stream { .. }));
    }
}
