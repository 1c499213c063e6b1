//! Puppet Bridge - Out-of-process bridge between a chatbot and its puppet backend.
//!
//! The bot runs a [`PuppetClient`]; the backend is exposed by a
//! [`PuppetServer`]. Between them run a long-lived event stream, a heartbeat
//! watchdog that probes and finally resets a silent session, and chunked
//! file transfer with an out-of-band store for payloads too large to inline.
//!
//! # Example
//!
//! ```rust,ignore
//! use puppet_bridge::{BridgeOptions, PuppetClient, SessionEvent};
//!
//! #[tokio::main]
//! async fn main() -> puppet_bridge::Result<()> {
//!     let client = PuppetClient::new(BridgeOptions::from_env());
//!     let mut events = client.subscribe();
//!     client.start().await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         match event {
//!             SessionEvent::Event(event) => println!("{:?}", event),
//!             SessionEvent::Reset { reason } => {
//!                 println!("Restarting: {}", reason);
//!                 client.restart().await?;
//!             }
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod chunk;
pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod event;
pub mod file_box;
pub mod puppet;
pub mod retry;
pub mod server;
pub mod store;
pub mod tls;
pub mod transfer;
pub mod watchdog;
pub mod wire;

// Re-export commonly used types
pub use auth::Token;
pub use chunk::{ChunkFrame, DecodedFile};
pub use client::{ConnectionSession, PuppetClient, SessionEvent};
pub use config::{BridgeOptions, TlsOptions, WatchdogConfig};
pub use error::{BridgeError, Result};
pub use event::{EventEnvelope, EventType, PuppetEvent};
pub use file_box::{FileBox, UuidLoader};
pub use puppet::{MemoryPuppet, Puppet};
pub use server::{PuppetServer, PuppetServerHandle, ServerOptions};
pub use store::OutOfBandStore;
pub use transfer::{TransferDescriptor, TransferKind, TransferMode};
pub use watchdog::{ActiveState, RecoveryAction, Watchdog};
