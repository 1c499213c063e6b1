//! File payloads carried by file RPCs.
//!
//! A [`FileBox`] is either a reference (URL, UUID, QR code), in-memory bytes
//! (buffer, base64), or a handle (local file, open stream). Only serializable
//! variants ever travel inline; [`FileBox::prepare_for_wire`] applies the
//! transfer policy and stages everything else out of band.

use crate::chunk::base64_bytes;
use crate::store::OutOfBandStore;
use crate::transfer::{self, TransferDescriptor, TransferKind, TransferMode};
use crate::{BridgeError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;
use uuid::Uuid;

/// Boxed byte source.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin + 'static>;

pub type LoadFn = Arc<dyn Fn(Uuid) -> BoxFuture<'static, Result<BoxReader>> + Send + Sync>;
pub type SaveFn = Arc<dyn Fn(BoxReader) -> BoxFuture<'static, Result<Uuid>> + Send + Sync>;

/// How UUID references are turned into bytes and back.
///
/// Server side this is the local [`OutOfBandStore`]; client side it is the
/// `download`/`upload` calls of a connected session.
#[derive(Clone)]
pub struct UuidLoader {
    load: LoadFn,
    save: SaveFn,
}

impl std::fmt::Debug for UuidLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("UuidLoader")
    }
}

impl UuidLoader {
    pub fn new(load: LoadFn, save: SaveFn) -> Self {
        Self { load, save }
    }

    /// Loader backed by a local store.
    pub fn for_store(store: OutOfBandStore) -> Self {
        let load_store = store.clone();
        let load: LoadFn = Arc::new(move |uuid| {
            let store = load_store.clone();
            async move {
                let file = store.resolve(&uuid).await?;
                Ok(Box::new(file) as BoxReader)
            }
            .boxed()
        });
        let save: SaveFn = Arc::new(move |reader| {
            let result = store.register(reader);
            async move { result }.boxed()
        });
        Self::new(load, save)
    }

    pub async fn load(&self, uuid: Uuid) -> Result<BoxReader> {
        (self.load)(uuid).await
    }

    pub async fn save(&self, reader: BoxReader) -> Result<Uuid> {
        (self.save)(reader).await
    }
}

/// A file payload.
pub enum FileBox {
    Url {
        name: String,
        url: String,
    },
    Uuid {
        name: String,
        uuid: Uuid,
        size: Option<u64>,
    },
    QrCode {
        name: String,
        value: String,
    },
    Buffer {
        name: String,
        bytes: Bytes,
    },
    Base64 {
        name: String,
        data: String,
    },
    File {
        name: String,
        path: PathBuf,
    },
    Stream {
        name: String,
        reader: BoxReader,
    },
}

impl std::fmt::Debug for FileBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBox")
            .field("kind", &self.kind())
            .field("name", &self.name())
            .finish()
    }
}

/// Inline JSON form of the serializable variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum FileBoxJson {
    Url {
        name: String,
        url: String,
    },
    #[serde(rename_all = "camelCase")]
    Uuid {
        name: String,
        uuid: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<u64>,
    },
    QrCode {
        name: String,
        value: String,
    },
    Buffer {
        name: String,
        #[serde(with = "base64_bytes")]
        bytes: Bytes,
    },
    Base64 {
        name: String,
        data: String,
    },
}

impl FileBox {
    pub fn from_bytes(name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        FileBox::Buffer {
            name: name.into(),
            bytes: bytes.into(),
        }
    }

    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        FileBox::File { name, path }
    }

    pub fn from_reader(name: impl Into<String>, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        FileBox::Stream {
            name: name.into(),
            reader: Box::new(reader),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            FileBox::Url { name, .. }
            | FileBox::Uuid { name, .. }
            | FileBox::QrCode { name, .. }
            | FileBox::Buffer { name, .. }
            | FileBox::Base64 { name, .. }
            | FileBox::File { name, .. }
            | FileBox::Stream { name, .. } => name,
        }
    }

    pub fn kind(&self) -> TransferKind {
        match self {
            FileBox::Url { .. } => TransferKind::Url,
            FileBox::Uuid { .. } => TransferKind::Uuid,
            FileBox::QrCode { .. } => TransferKind::QrCode,
            FileBox::Buffer { .. } => TransferKind::Buffer,
            FileBox::Base64 { .. } => TransferKind::Base64,
            FileBox::File { .. } => TransferKind::File,
            FileBox::Stream { .. } => TransferKind::Stream,
        }
    }

    /// Descriptor for the transfer policy. Handles report size 0; their kind
    /// alone decides.
    pub fn descriptor(&self) -> TransferDescriptor {
        let size_bytes = match self {
            FileBox::Buffer { bytes, .. } => bytes.len() as u64,
            FileBox::Base64 { data, .. } => base64_decoded_len(data),
            FileBox::Uuid { size, .. } => size.unwrap_or(0),
            _ => 0,
        };
        TransferDescriptor::new(self.kind(), size_bytes)
    }

    /// Inline JSON form. Fails for file and stream handles.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        let json = match self {
            FileBox::Url { name, url } => FileBoxJson::Url {
                name: name.clone(),
                url: url.clone(),
            },
            FileBox::Uuid { name, uuid, size } => FileBoxJson::Uuid {
                name: name.clone(),
                uuid: *uuid,
                size: *size,
            },
            FileBox::QrCode { name, value } => FileBoxJson::QrCode {
                name: name.clone(),
                value: value.clone(),
            },
            FileBox::Buffer { name, bytes } => FileBoxJson::Buffer {
                name: name.clone(),
                bytes: bytes.clone(),
            },
            FileBox::Base64 { name, data } => FileBoxJson::Base64 {
                name: name.clone(),
                data: data.clone(),
            },
            FileBox::File { .. } | FileBox::Stream { .. } => {
                return Err(BridgeError::InvalidParams {
                    message: format!("{:?} payloads cannot travel inline", self.kind()),
                })
            }
        };
        Ok(serde_json::to_value(json)?)
    }

    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let json: FileBoxJson = serde_json::from_value(value).map_err(|e| BridgeError::InvalidParams {
            message: format!("invalid file box: {}", e),
        })?;
        Ok(match json {
            FileBoxJson::Url { name, url } => FileBox::Url { name, url },
            FileBoxJson::Uuid { name, uuid, size } => FileBox::Uuid { name, uuid, size },
            FileBoxJson::QrCode { name, value } => FileBox::QrCode { name, value },
            FileBoxJson::Buffer { name, bytes } => FileBox::Buffer { name, bytes },
            FileBoxJson::Base64 { name, data } => FileBox::Base64 { name, data },
        })
    }

    /// Apply the transfer policy: keep inline payloads, stage the rest via
    /// `loader` and replace them with a UUID reference.
    pub async fn prepare_for_wire(self, loader: &UuidLoader) -> Result<FileBox> {
        let descriptor = self.descriptor();
        match transfer::decide(&descriptor) {
            TransferMode::Inline => Ok(self),
            TransferMode::OutOfBand => {
                let name = self.name().to_string();
                let size = match &self {
                    FileBox::Buffer { .. } | FileBox::Base64 { .. } => Some(descriptor.size_bytes),
                    _ => None,
                };
                let reader = self.into_reader(None).await?;
                let uuid = loader.save(reader).await?;
                debug!("Staged {} out of band as {}", name, uuid);
                Ok(FileBox::Uuid { name, uuid, size })
            }
        }
    }

    /// Open the payload for reading. UUID references need a `loader`.
    pub async fn into_reader(self, loader: Option<&UuidLoader>) -> Result<BoxReader> {
        match self {
            FileBox::Buffer { bytes, .. } => Ok(Box::new(std::io::Cursor::new(bytes))),
            FileBox::Base64 { data, .. } => {
                let bytes = STANDARD.decode(data.as_bytes()).map_err(|e| BridgeError::InvalidParams {
                    message: format!("invalid base64 payload: {}", e),
                })?;
                Ok(Box::new(std::io::Cursor::new(bytes)))
            }
            FileBox::File { path, .. } => {
                let file = tokio::fs::File::open(&path)
                    .await
                    .map_err(|e| BridgeError::io_with_path(e, &path))?;
                Ok(Box::new(file))
            }
            FileBox::Stream { reader, .. } => Ok(reader),
            FileBox::Uuid { uuid, .. } => match loader {
                Some(loader) => loader.load(uuid).await,
                None => Err(BridgeError::InvalidParams {
                    message: format!("no loader for uuid {}", uuid),
                }),
            },
            FileBox::Url { url, .. } => {
                let bytes = reqwest::get(&url).await?.error_for_status()?.bytes().await?;
                Ok(Box::new(std::io::Cursor::new(bytes)))
            }
            FileBox::QrCode { .. } => Err(BridgeError::InvalidParams {
                message: "qr code payloads carry no byte content".to_string(),
            }),
        }
    }

    /// Read the whole payload into memory.
    pub async fn to_bytes(self, loader: Option<&UuidLoader>) -> Result<Vec<u8>> {
        let mut reader = self.into_reader(loader).await?;
        let mut out = Vec::new();
        reader
            .read_to_end(&mut out)
            .await
            .map_err(crate::chunk::unwrap_io_error)?;
        Ok(out)
    }
}

/// Decoded byte count of base64 text, padded or not.
fn base64_decoded_len(data: &str) -> u64 {
    let encoded = data.trim_end_matches('=').len() as u64;
    encoded / 4 * 3 + (encoded % 4 * 3) / 4
}
