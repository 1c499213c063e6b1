//! In-process backend that keeps everything in memory.
//!
//! Useful for local serving and for exercising the bridge end to end: events
//! are injected with [`MemoryPuppet::emit`], message files are seeded with
//! [`MemoryPuppet::add_message_file`] and sent files are recorded.

use super::Puppet;
use crate::event::{DataPayload, LogoutPayload, MessagePayload, PuppetEvent};
use crate::file_box::FileBox;
use crate::wire::StatusCode;
use crate::{BridgeError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

const EVENT_CAPACITY: usize = 256;

/// A file delivered through `message_send_file`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFile {
    pub conversation_id: String,
    pub message_id: String,
    pub name: String,
    pub bytes: Vec<u8>,
}

#[derive(Default)]
struct MemoryState {
    started: bool,
    user: Option<String>,
    files: HashMap<String, (String, Bytes)>,
    sent: Vec<SentFile>,
    next_message: u64,
    heartbeat: Option<JoinHandle<()>>,
}

pub struct MemoryPuppet {
    events: broadcast::Sender<PuppetEvent>,
    heartbeat_interval: Option<Duration>,
    state: Mutex<MemoryState>,
}

impl Default for MemoryPuppet {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPuppet {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            events,
            heartbeat_interval: None,
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Emit a heartbeat every `interval` while started.
    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Broadcast an event to every subscriber. Returns how many saw it.
    pub fn emit(&self, event: PuppetEvent) -> usize {
        self.events.send(event).unwrap_or(0)
    }

    /// Mark `contact_id` as logged in and announce it.
    pub fn login(&self, contact_id: impl Into<String>) {
        let contact_id = contact_id.into();
        self.state().user = Some(contact_id.clone());
        self.emit(PuppetEvent::login(contact_id));
    }

    pub fn add_message_file(
        &self,
        message_id: impl Into<String>,
        name: impl Into<String>,
        bytes: impl Into<Bytes>,
    ) {
        self.state()
            .files
            .insert(message_id.into(), (name.into(), bytes.into()));
    }

    pub fn sent_files(&self) -> Vec<SentFile> {
        self.state().sent.clone()
    }

    pub fn is_started(&self) -> bool {
        self.state().started
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }
}

impl Drop for MemoryPuppet {
    fn drop(&mut self) {
        if let Some(handle) = self.state().heartbeat.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl Puppet for MemoryPuppet {
    async fn start(&self) -> Result<()> {
        let mut state = self.state();
        if state.started {
            return Ok(());
        }
        state.started = true;

        if let Some(interval) = self.heartbeat_interval {
            let events = self.events.clone();
            state.heartbeat = Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let _ = events.send(PuppetEvent::heartbeat("memory"));
                }
            }));
        }
        info!("Memory puppet started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut state = self.state();
        state.started = false;
        if let Some(handle) = state.heartbeat.take() {
            handle.abort();
        }
        info!("Memory puppet stopped");
        Ok(())
    }

    async fn ding(&self, data: &str) -> Result<()> {
        debug!("ding({})", data);
        self.emit(PuppetEvent::Dong(DataPayload {
            data: data.to_string(),
        }));
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        let contact_id = self
            .state()
            .user
            .take()
            .ok_or_else(|| BridgeError::Other("not logged in".to_string()))?;
        self.emit(PuppetEvent::Logout(LogoutPayload {
            contact_id,
            data: "logout".to_string(),
        }));
        Ok(())
    }

    fn current_user(&self) -> Option<String> {
        self.state().user.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<PuppetEvent> {
        self.events.subscribe()
    }

    async fn message_file(&self, message_id: &str) -> Result<FileBox> {
        let (name, bytes) = self
            .state()
            .files
            .get(message_id)
            .cloned()
            .ok_or_else(|| BridgeError::Status {
                code: StatusCode::NotFound,
                message: format!("no file for message {}", message_id),
            })?;
        Ok(FileBox::from_bytes(name, bytes))
    }

    async fn message_send_file(
        &self,
        conversation_id: &str,
        file: FileBox,
    ) -> Result<Option<String>> {
        let name = file.name().to_string();
        let bytes = file.to_bytes(None).await?;

        let message_id = {
            let mut state = self.state();
            state.next_message += 1;
            let message_id = format!("memory-{}", state.next_message);
            state.sent.push(SentFile {
                conversation_id: conversation_id.to_string(),
                message_id: message_id.clone(),
                name: name.clone(),
                bytes,
            });
            message_id
        };

        debug!("Sent {} to {} as {}", name, conversation_id, message_id);
        self.emit(PuppetEvent::Message(MessagePayload {
            message_id: message_id.clone(),
        }));
        Ok(Some(message_id))
    }

    async fn call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        match method {
            "echo" => Ok(params),
            _ => Err(BridgeError::Unimplemented {
                method: method.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ding_answers_with_dong() {
        let puppet = MemoryPuppet::new();
        let mut events = puppet.subscribe();

        puppet.ding("probe").await.unwrap();

        match events.recv().await.unwrap() {
            PuppetEvent::Dong(payload) => assert_eq!(payload.data, "probe"),
            other => panic!("Expected Dong, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_login_logout() {
        let puppet = MemoryPuppet::new();
        assert!(puppet.logout().await.is_err());

        puppet.login("contact-1");
        assert_eq!(puppet.current_user().as_deref(), Some("contact-1"));

        puppet.logout().await.unwrap();
        assert_eq!(puppet.current_user(), None);
    }

    #[tokio::test]
    async fn test_send_file_is_recorded() {
        let puppet = MemoryPuppet::new();
        let id = puppet
            .message_send_file("room-1", FileBox::from_bytes("a.txt", &b"abc"[..]))
            .await
            .unwrap();

        let sent = puppet.sent_files();
        assert_eq!(sent.len(), 1);
        assert_eq!(Some(sent[0].message_id.clone()), id);
        assert_eq!(sent[0].conversation_id, "room-1");
        assert_eq!(sent[0].bytes, b"abc");
    }

    #[tokio::test]
    async fn test_unknown_message_file() {
        let puppet = MemoryPuppet::new();
        assert!(puppet.message_file("missing").await.is_err());

        puppet.add_message_file("m1", "b.bin", vec![1u8, 2, 3]);
        let file = puppet.message_file("m1").await.unwrap();
        assert_eq!(file.name(), "b.bin");
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_only_while_started() {
        let puppet = MemoryPuppet::new().with_heartbeat(Duration::from_secs(5));
        let mut events = puppet.subscribe();

        puppet.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;
        puppet.stop().await.unwrap();

        let mut beats = 0;
        while let Ok(event) = events.try_recv() {
            assert!(matches!(event, PuppetEvent::Heartbeat(_)));
            beats += 1;
        }
        assert_eq!(beats, 2);
    }
}
