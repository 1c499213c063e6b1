//! Remote puppet client.
//!
//! [`PuppetClient`] owns the current [`ConnectionSession`] and its watchdog,
//! and re-emits session events on an emitter that survives restarts. The
//! watchdog's probe is answered with a `ding("recover")`; its reset request
//! is surfaced as [`SessionEvent::Reset`] so the owner can call
//! [`PuppetClient::restart`].

use super::channel::Channel;
use super::session::{ConnectionSession, SessionEvent};
use crate::chunk::{self, ChunkFrame, ConversationHead, DecodedFile};
use crate::config::{BridgeOptions, SessionConfig, WatchdogConfig};
use crate::file_box::{BoxReader, FileBox, LoadFn, SaveFn, UuidLoader};
use crate::watchdog::{RecoveryAction, RecoveryCallback, Watchdog, WatchdogHandle};
use crate::wire::methods;
use crate::{BridgeError, Result};
use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Name frame used when staging anonymous content out of band.
const STAGED_NAME: &str = "out-of-band";

#[derive(Default)]
struct ClientState {
    session: Option<Arc<ConnectionSession>>,
    watchdog: Option<WatchdogHandle>,
    forwarder: Option<JoinHandle<()>>,
}

pub struct PuppetClient {
    options: BridgeOptions,
    watchdog_config: WatchdogConfig,
    events: broadcast::Sender<SessionEvent>,
    state: Mutex<ClientState>,
}

impl std::fmt::Debug for PuppetClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PuppetClient")
            .field("watchdog", &self.watchdog_config)
            .finish()
    }
}

impl PuppetClient {
    pub fn new(options: BridgeOptions) -> Self {
        let (events, _) = broadcast::channel(SessionConfig::EMITTER_CAPACITY);
        Self {
            options,
            watchdog_config: WatchdogConfig::default(),
            events,
            state: Mutex::new(ClientState::default()),
        }
    }

    pub fn with_watchdog(mut self, config: WatchdogConfig) -> Self {
        self.watchdog_config = config;
        self
    }

    /// Events of the current and all later sessions.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn is_active(&self) -> bool {
        self.state
            .lock()
            .await
            .session
            .as_ref()
            .is_some_and(|session| session.is_active())
    }

    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.session.is_some() {
            return Err(BridgeError::connection("client already started"));
        }

        let session = Arc::new(ConnectionSession::new(self.options.clone()));
        // Subscribe first so the earliest events are not missed.
        let forward_rx = session.subscribe();
        let watchdog_rx = session.subscribe();
        session.start().await?;
        let channel = session.channel().await?;

        state.forwarder = Some(tokio::spawn(forward_events(
            forward_rx,
            self.events.clone(),
        )));
        state.watchdog = Some(Watchdog::spawn(
            self.watchdog_config,
            session.active(),
            watchdog_rx,
            recovery_callback(channel, self.events.clone()),
        ));
        state.session = Some(session);
        info!("Puppet client started");
        Ok(())
    }

    /// Stop the watchdog, then the session. The watchdog's timers are gone
    /// when this returns.
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(watchdog) = state.watchdog.take() {
            watchdog.stop().await;
        }
        let session = state
            .session
            .take()
            .ok_or_else(|| BridgeError::connection("client is not started"))?;
        let result = session.stop().await;
        if let Some(forwarder) = state.forwarder.take() {
            forwarder.abort();
        }
        info!("Puppet client stopped");
        result
    }

    /// Stop the current session (if any) and start a fresh one.
    pub async fn restart(&self) -> Result<()> {
        if let Err(e) = self.stop().await {
            debug!("Restart: stop skipped: {}", e);
        }
        self.start().await
    }

    async fn channel(&self) -> Result<Channel> {
        let session = self
            .state
            .lock()
            .await
            .session
            .clone()
            .ok_or_else(|| BridgeError::connection("client is not started"))?;
        session.channel().await
    }

    pub async fn ding(&self, data: &str) -> Result<()> {
        self.channel()
            .await?
            .unary(methods::DING, json!({ "data": data }))
            .await?;
        Ok(())
    }

    pub async fn logout(&self) -> Result<()> {
        self.channel()
            .await?
            .unary(methods::LOGOUT, json!({}))
            .await?;
        Ok(())
    }

    pub async fn version(&self) -> Result<String> {
        let result = self
            .channel()
            .await?
            .unary(methods::VERSION, json!({}))
            .await?;
        Ok(result["version"].as_str().unwrap_or_default().to_string())
    }

    /// Contact id of the logged-in account on the backend.
    pub async fn current_user(&self) -> Result<Option<String>> {
        let result = self
            .channel()
            .await?
            .unary(methods::CURRENT_USER, json!({}))
            .await?;
        Ok(result["contactId"].as_str().map(str::to_string))
    }

    /// Any other backend method.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.channel().await?.unary(method, params).await
    }

    /// Loader that moves UUID-referenced content over this client's
    /// `download` and `upload` calls.
    pub async fn uuid_loader(&self) -> Result<UuidLoader> {
        Ok(channel_loader(self.channel().await?))
    }

    /// File attached to a message. Large files come back as a UUID
    /// reference; read them with [`PuppetClient::uuid_loader`].
    pub async fn message_file(&self, message_id: &str) -> Result<FileBox> {
        let result = self
            .channel()
            .await?
            .unary(methods::MESSAGE_FILE, json!({ "id": message_id }))
            .await?;
        FileBox::from_json(result)
    }

    /// Send a file, inline or staged out of band depending on its kind and
    /// size.
    pub async fn message_send_file(
        &self,
        conversation_id: &str,
        file: FileBox,
    ) -> Result<Option<String>> {
        let channel = self.channel().await?;
        let file = file.prepare_for_wire(&channel_loader(channel.clone())).await?;
        let result = channel
            .unary(
                methods::MESSAGE_SEND_FILE,
                json!({ "conversationId": conversation_id, "fileBox": file.to_json()? }),
            )
            .await?;
        Ok(message_id(&result))
    }

    /// File attached to a message, streamed in chunks.
    pub async fn message_file_stream(&self, message_id: &str) -> Result<DecodedFile> {
        let channel = self.channel().await?;
        download_frames(&channel, methods::MESSAGE_FILE_STREAM, json!({ "id": message_id })).await
    }

    /// Send a file as a chunk stream.
    pub async fn message_send_file_stream(
        &self,
        conversation_id: &str,
        file: FileBox,
    ) -> Result<Option<String>> {
        let channel = self.channel().await?;
        let name = file.name().to_string();
        let reader = file
            .into_reader(Some(&channel_loader(channel.clone())))
            .await?;

        let head = serde_json::to_value(ConversationHead {
            conversation_id: conversation_id.to_string(),
        })?;
        let result = upload_frames(
            &channel,
            methods::MESSAGE_SEND_FILE_STREAM,
            Some(head),
            chunk::encode(name, reader),
        )
        .await?;
        Ok(message_id(&result))
    }

    /// Stage content in the server's out-of-band store.
    pub async fn upload(&self, file: FileBox) -> Result<Uuid> {
        let channel = self.channel().await?;
        let name = file.name().to_string();
        let reader = file.into_reader(None).await?;
        upload_reader(&channel, name, reader).await
    }

    /// Take content out of the server's out-of-band store.
    pub async fn download(&self, uuid: Uuid) -> Result<DecodedFile> {
        let channel = self.channel().await?;
        download_frames(&channel, methods::DOWNLOAD, json!({ "uuid": uuid })).await
    }
}

fn message_id(result: &Value) -> Option<String> {
    result["messageId"].as_str().map(str::to_string)
}

async fn forward_events(
    mut rx: broadcast::Receiver<SessionEvent>,
    tx: broadcast::Sender<SessionEvent>,
) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let _ = tx.send(event);
            }
            Err(RecvError::Lagged(skipped)) => warn!("Dropped {} session events", skipped),
            Err(RecvError::Closed) => return,
        }
    }
}

fn recovery_callback(channel: Channel, events: broadcast::Sender<SessionEvent>) -> RecoveryCallback {
    Arc::new(move |action: RecoveryAction| match action {
        RecoveryAction::Probe => {
            let channel = channel.clone();
            tokio::spawn(async move {
                if let Err(e) = channel
                    .unary(methods::DING, json!({ "data": "recover" }))
                    .await
                {
                    warn!("Recovery ding failed: {}", e);
                }
            });
        }
        RecoveryAction::Reset => {
            let _ = events.send(SessionEvent::Reset {
                reason: "heartbeat lost".to_string(),
            });
        }
    })
}

fn channel_loader(channel: Channel) -> UuidLoader {
    let load_channel = channel.clone();
    let load: LoadFn = Arc::new(move |uuid: Uuid| -> BoxFuture<'static, Result<BoxReader>> {
        let channel = load_channel.clone();
        async move {
            let file =
                download_frames(&channel, methods::DOWNLOAD, json!({ "uuid": uuid })).await?;
            Ok(Box::new(file.into_reader()) as BoxReader)
        }
        .boxed()
    });
    let save: SaveFn = Arc::new(move |reader: BoxReader| -> BoxFuture<'static, Result<Uuid>> {
        let channel = channel.clone();
        async move { upload_reader(&channel, STAGED_NAME.to_string(), reader).await }.boxed()
    });
    UuidLoader::new(load, save)
}

async fn upload_reader<R>(channel: &Channel, name: String, reader: R) -> Result<Uuid>
where
    R: AsyncRead + Send + 'static,
{
    let result = upload_frames(channel, methods::UPLOAD, None, chunk::encode(name, reader)).await?;
    let uuid = result["uuid"]
        .as_str()
        .ok_or_else(|| BridgeError::protocol("upload response has no uuid"))?;
    Uuid::parse_str(uuid).map_err(|e| BridgeError::protocol(format!("invalid uuid {}: {}", uuid, e)))
}

/// Push `head` (if any) and then every frame. A failing frame source cancels
/// the call instead of finishing it, so the server never sees a truncated
/// transfer as complete.
async fn upload_frames<S>(
    channel: &Channel,
    method: &str,
    head: Option<Value>,
    mut frames: S,
) -> Result<Value>
where
    S: Stream<Item = Result<ChunkFrame>> + Unpin,
{
    let mut sink = channel.client_stream(method, json!({})).await?;
    if let Some(head) = head {
        sink.send(head).await?;
    }
    while let Some(frame) = frames.next().await {
        sink.send(serde_json::to_value(frame?)?).await?;
    }
    sink.finish().await
}

async fn download_frames(channel: &Channel, method: &str, params: Value) -> Result<DecodedFile> {
    let items = channel.server_stream(method, params).await?.into_items();
    let frames = items.map(|item| {
        item.and_then(|value| {
            serde_json::from_value::<ChunkFrame>(value)
                .map_err(|e| BridgeError::protocol(format!("invalid chunk frame: {}", e)))
        })
    });
    chunk::decode(frames).await
}
