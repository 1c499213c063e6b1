//! The backend contract the server exposes.
//!
//! A [`Puppet`] is whatever actually talks to the chat platform. The server
//! calls into it for unary RPCs and subscribes to its events for the event
//! stream. File payloads handed to the backend are always readable directly:
//! UUID references are resolved against the server's out-of-band store first.

mod memory;

pub use memory::{MemoryPuppet, SentFile};

use crate::event::PuppetEvent;
use crate::file_box::FileBox;
use crate::{BridgeError, Result};
use async_trait::async_trait;
use tokio::sync::broadcast;

/// A chat backend served over the bridge.
#[async_trait]
pub trait Puppet: Send + Sync + 'static {
    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// Liveness probe. The backend answers with a `dong` event carrying
    /// `data`.
    async fn ding(&self, data: &str) -> Result<()>;

    async fn logout(&self) -> Result<()>;

    fn version(&self) -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    /// Contact id of the logged-in account, if any.
    fn current_user(&self) -> Option<String>;

    /// Subscribe to backend events. Each call returns an independent
    /// receiver that sees events emitted after the call.
    fn subscribe(&self) -> broadcast::Receiver<PuppetEvent>;

    /// File attached to a message.
    async fn message_file(&self, message_id: &str) -> Result<FileBox>;

    /// Send a file to a conversation. Returns the new message id if the
    /// platform reports one.
    async fn message_send_file(&self, conversation_id: &str, file: FileBox)
        -> Result<Option<String>>;

    /// Any other method of the backend contract.
    async fn call(&self, method: &str, _params: serde_json::Value) -> Result<serde_json::Value> {
        Err(BridgeError::Unimplemented {
            method: method.to_string(),
        })
    }
}
