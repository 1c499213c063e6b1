//! Puppet server.
//!
//! Serves one [`Puppet`] backend over the wire protocol. Every call is
//! authenticated against the service token; each call runs in its own task
//! and answers through the connection's single writer.
//!
//! The server owns one [`OutOfBandStore`] and one [`EventStreamManager`].
//! [`PuppetServerHandle::stop`] finishes the event stream and destroys the
//! store.

pub mod event_stream;

pub use event_stream::{EventSink, EventStreamHandle, EventStreamManager, Teardown};

use crate::auth::{self, Token};
use crate::chunk::{self, ChunkFrame, ConversationHead};
use crate::config::{BridgeOptions, ServerConfig, StoreConfig, WireConfig};
use crate::event::EventEnvelope;
use crate::file_box::{FileBox, UuidLoader};
use crate::puppet::Puppet;
use crate::store::OutOfBandStore;
use crate::tls::{self, Acceptor, BoxTransport};
use crate::wire::{
    methods, read_message, write_message, ClientMessage, Metadata, ServerMessage, Status,
};
use crate::{BridgeError, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How the server listens.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub bind: String,
    pub token: Token,
    pub acceptor: Acceptor,
    pub store_ttl: Duration,
}

impl ServerOptions {
    /// Plaintext on the default bind address.
    pub fn new(token: Token) -> Self {
        Self {
            bind: ServerConfig::DEFAULT_BIND.to_string(),
            token,
            acceptor: Acceptor::Plain,
            store_ttl: StoreConfig::DEFAULT_TTL,
        }
    }

    pub fn with_bind(mut self, bind: impl Into<String>) -> Self {
        self.bind = bind.into();
        self
    }

    pub fn with_acceptor(mut self, acceptor: Acceptor) -> Self {
        self.acceptor = acceptor;
        self
    }

    pub fn with_store_ttl(mut self, ttl: Duration) -> Self {
        self.store_ttl = ttl;
        self
    }

    /// Build from deployment options. TLS is on unless the server side is
    /// explicitly insecure, in which case a certificate and key are
    /// required.
    pub fn from_bridge(options: &BridgeOptions) -> Result<Self> {
        let token = Token::parse(
            options
                .token
                .clone()
                .ok_or_else(|| BridgeError::connection("no token"))?,
        )?;

        let bind = match &options.endpoint {
            Some(endpoint) => tls::normalize_endpoint(endpoint)?,
            None => ServerConfig::DEFAULT_BIND.to_string(),
        };

        let acceptor = if options.insecure_server() {
            Acceptor::Plain
        } else {
            let (Some(cert), Some(key)) = (&options.tls.server_cert, &options.tls.server_key)
            else {
                return Err(BridgeError::Tls {
                    message: "a server certificate and key are required unless TLS is disabled"
                        .to_string(),
                });
            };
            Acceptor::tls(tls::server_config(cert, key)?)
        };

        Ok(Self::new(token).with_bind(bind).with_acceptor(acceptor))
    }
}

/// State shared by every connection.
struct ServerShared {
    puppet: Arc<dyn Puppet>,
    token: Token,
    events: Arc<EventStreamManager>,
    store: OutOfBandStore,
    loader: UuidLoader,
}

/// Handle to a running server. Dropping it shuts the server down.
pub struct PuppetServerHandle {
    pub addr: SocketAddr,
    shared: Arc<ServerShared>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<JoinHandle<()>>,
}

impl PuppetServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn store(&self) -> &OutOfBandStore {
        &self.shared.store
    }

    pub fn events(&self) -> &Arc<EventStreamManager> {
        &self.shared.events
    }

    /// Stop accepting and close every connection.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }

    /// Full shutdown: connections, the event stream and the out-of-band
    /// store.
    pub async fn stop(mut self) -> Result<()> {
        self.shutdown();
        if let Some(task) = self.task_handle.take() {
            let _ = task.await;
        }
        self.shared.events.stop();
        self.shared.store.destroy().await
    }
}

impl Drop for PuppetServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

pub struct PuppetServer;

impl PuppetServer {
    /// Bind and start serving `puppet` in background tasks.
    pub async fn start(puppet: Arc<dyn Puppet>, options: ServerOptions) -> Result<PuppetServerHandle> {
        let listener = TcpListener::bind(&options.bind)
            .await
            .map_err(|e| BridgeError::connection(format!("bind {} failed: {}", options.bind, e)))?;
        let addr = listener.local_addr()?;

        let store = OutOfBandStore::with_ttl(options.store_ttl)?;
        let shared = Arc::new(ServerShared {
            events: EventStreamManager::new(puppet.clone()),
            loader: UuidLoader::for_store(store.clone()),
            store,
            puppet,
            token: options.token,
        });

        info!("Puppet server listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            options.acceptor,
            shared.clone(),
            shutdown_rx,
            conn_shutdown_rx,
            active_connections,
        ));

        Ok(PuppetServerHandle {
            addr,
            shared,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        acceptor: Acceptor,
        shared: Arc<ServerShared>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Puppet server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    let (tcp, peer_addr) = match accept_result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("Accept error: {}", e);
                            continue;
                        }
                    };

                    if active_connections.load(Ordering::Relaxed) >= ServerConfig::MAX_CONNECTIONS {
                        warn!(
                            "Rejecting connection from {}: at max capacity ({})",
                            peer_addr,
                            ServerConfig::MAX_CONNECTIONS
                        );
                        continue;
                    }

                    active_connections.fetch_add(1, Ordering::Relaxed);
                    let acceptor = acceptor.clone();
                    let shared = shared.clone();
                    let conns = active_connections.clone();
                    let conn_shutdown = conn_shutdown_rx.clone();

                    tokio::spawn(async move {
                        debug!("Connection from {}", peer_addr);
                        let _ = tcp.set_nodelay(true);
                        match acceptor.accept(tcp).await {
                            Ok(transport) => {
                                if let Err(e) = Connection::serve(transport, shared, conn_shutdown).await {
                                    debug!("Connection {} ended: {}", peer_addr, e);
                                }
                            }
                            Err(e) => warn!("Handshake with {} failed: {}", peer_addr, e),
                        }
                        conns.fetch_sub(1, Ordering::Relaxed);
                    });
                }
            }
        }
    }
}

/// Items of a client-streaming call as seen by its handler.
enum Inbound {
    Item(Value),
    End,
}

/// One client connection: routes incoming messages to per-call tasks.
struct Connection {
    shared: Arc<ServerShared>,
    tx: mpsc::Sender<ServerMessage>,
    event_streams: HashMap<u64, EventStreamHandle>,
    tasks: HashMap<u64, JoinHandle<()>>,
    inbound: HashMap<u64, mpsc::Sender<Inbound>>,
}

impl Connection {
    async fn serve(
        transport: BoxTransport,
        shared: Arc<ServerShared>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<()> {
        let (mut reader, writer) = tokio::io::split(transport);
        let (tx, rx) = mpsc::channel(WireConfig::STREAM_BUFFER);
        let writer_task = tokio::spawn(write_loop(writer, rx));

        let mut connection = Connection {
            shared,
            tx,
            event_streams: HashMap::new(),
            tasks: HashMap::new(),
            inbound: HashMap::new(),
        };

        let result = loop {
            let next = tokio::select! {
                result = read_message::<ClientMessage, _>(&mut reader) => result,
                _ = shutdown_rx.changed() => Ok(None),
            };
            match next {
                Ok(Some(message)) => connection.handle(message).await,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        connection.close();
        writer_task.abort();
        result
    }

    fn close(&mut self) {
        // Each handle drop tears its stream down as a closed connection.
        self.event_streams.clear();
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
        // Dropping the senders without an end marker fails the transfers.
        self.inbound.clear();
    }

    async fn reply(&self, message: ServerMessage) {
        let _ = self.tx.send(message).await;
    }

    fn track(&mut self, id: u64, task: JoinHandle<()>) {
        self.tasks.retain(|_, task| !task.is_finished());
        self.tasks.insert(id, task);
    }

    fn authenticate(&self, method: &str, metadata: &Metadata) -> Result<()> {
        auth::verify(metadata, &self.shared.token).map_err(|e| {
            warn!("Rejected {} call: {}", method, e);
            e
        })
    }

    async fn handle(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::Unary {
                id,
                method,
                params,
                metadata,
            } => {
                if let Err(e) = self.authenticate(&method, &metadata) {
                    self.reply(ServerMessage::failure(id, e.to_status())).await;
                    return;
                }
                let shared = self.shared.clone();
                let tx = self.tx.clone();
                let task = tokio::spawn(async move {
                    let response = match shared.unary(&method, params).await {
                        Ok(result) => ServerMessage::success(id, result),
                        Err(e) => {
                            debug!("{} failed: {}", method, e);
                            ServerMessage::failure(id, e.to_status())
                        }
                    };
                    let _ = tx.send(response).await;
                });
                self.track(id, task);
            }
            ClientMessage::OpenStream {
                id,
                method,
                params,
                metadata,
            } => {
                if let Err(e) = self.authenticate(&method, &metadata) {
                    self.reply(ServerMessage::StreamEnd {
                        id,
                        status: e.to_status(),
                    })
                    .await;
                    return;
                }
                match method.as_str() {
                    methods::EVENT => self.open_event_stream(id).await,
                    methods::DOWNLOAD | methods::MESSAGE_FILE_STREAM => {
                        self.open_server_stream(id, method, params)
                    }
                    methods::UPLOAD | methods::MESSAGE_SEND_FILE_STREAM => {
                        self.open_client_stream(id, method)
                    }
                    other => {
                        let status = BridgeError::Unimplemented {
                            method: other.to_string(),
                        }
                        .to_status();
                        self.reply(ServerMessage::StreamEnd { id, status }).await;
                    }
                }
            }
            ClientMessage::StreamItem { id, item } => {
                let Some(tx) = self.inbound.get(&id) else {
                    debug!("Item for unknown call {}", id);
                    return;
                };
                if tx.send(Inbound::Item(item)).await.is_err() {
                    self.inbound.remove(&id);
                }
            }
            ClientMessage::StreamEnd { id } => {
                if let Some(tx) = self.inbound.remove(&id) {
                    let _ = tx.send(Inbound::End).await;
                }
            }
            ClientMessage::Cancel { id } => {
                debug!("Call {} cancelled by client", id);
                if let Some(handle) = self.event_streams.remove(&id) {
                    handle.teardown(Teardown::Cancelled);
                }
                if let Some(task) = self.tasks.remove(&id) {
                    task.abort();
                }
                self.inbound.remove(&id);
            }
        }
    }

    async fn open_event_stream(&mut self, id: u64) {
        let sink = Arc::new(StreamSink {
            id,
            tx: self.tx.clone(),
        });
        match self.shared.events.attach(sink).await {
            Ok(handle) => {
                self.event_streams.insert(id, handle);
            }
            Err(e) => {
                warn!("Event stream {} rejected: {}", id, e);
                self.reply(ServerMessage::StreamEnd {
                    id,
                    status: e.to_status(),
                })
                .await;
            }
        }
    }

    fn open_server_stream(&mut self, id: u64, method: String, params: Value) {
        let shared = self.shared.clone();
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            let status = match shared.open_frames(&method, params).await {
                Ok(frames) => pump_frames(id, frames, &tx).await,
                Err(e) => e.to_status(),
            };
            if !status.is_ok() {
                debug!("{} stream {} ended: {:?}", method, id, status);
            }
            let _ = tx.send(ServerMessage::StreamEnd { id, status }).await;
        });
        self.track(id, task);
    }

    fn open_client_stream(&mut self, id: u64, method: String) {
        let (items_tx, items_rx) = mpsc::channel(WireConfig::STREAM_BUFFER);
        self.inbound.insert(id, items_tx);

        let shared = self.shared.clone();
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            let items = inbound_items(items_rx);
            let outcome = match method.as_str() {
                methods::UPLOAD => shared.upload(items).await,
                _ => shared.message_send_file_stream(items).await,
            };
            let response = match outcome {
                Ok(result) => ServerMessage::success(id, result),
                Err(e) => {
                    debug!("{} {} failed: {}", method, id, e);
                    ServerMessage::failure(id, e.to_status())
                }
            };
            let _ = tx.send(response).await;
        });
        self.track(id, task);
    }
}

/// Event sink writing stream items of one call.
struct StreamSink {
    id: u64,
    tx: mpsc::Sender<ServerMessage>,
}

#[async_trait]
impl EventSink for StreamSink {
    async fn send(&self, envelope: EventEnvelope) -> Result<()> {
        let item = serde_json::to_value(&envelope)?;
        self.tx
            .send(ServerMessage::StreamItem { id: self.id, item })
            .await
            .map_err(|_| BridgeError::stream("connection closed"))
    }

    async fn finish(&self, status: Status) {
        let _ = self
            .tx
            .send(ServerMessage::StreamEnd {
                id: self.id,
                status,
            })
            .await;
    }
}

/// Client-streaming items. Ends cleanly only on an explicit end marker; a
/// dropped sender (cancel, disconnect) ends it with an error.
fn inbound_items(rx: mpsc::Receiver<Inbound>) -> BoxStream<'static, Result<Value>> {
    stream::unfold(Some(rx), |state| async move {
        let mut rx = state?;
        match rx.recv().await {
            Some(Inbound::Item(item)) => Some((Ok(item), Some(rx))),
            Some(Inbound::End) => None,
            None => Some((Err(BridgeError::Cancelled), None)),
        }
    })
    .boxed()
}

fn frames_of(items: BoxStream<'static, Result<Value>>) -> BoxStream<'static, Result<ChunkFrame>> {
    items
        .map(|item| {
            item.and_then(|value| {
                serde_json::from_value::<ChunkFrame>(value)
                    .map_err(|e| BridgeError::protocol(format!("invalid chunk frame: {}", e)))
            })
        })
        .boxed()
}

async fn pump_frames(
    id: u64,
    mut frames: BoxStream<'static, Result<ChunkFrame>>,
    tx: &mpsc::Sender<ServerMessage>,
) -> Status {
    while let Some(frame) = frames.next().await {
        let item = match frame.and_then(|frame| Ok(serde_json::to_value(frame)?)) {
            Ok(item) => item,
            Err(e) => return e.to_status(),
        };
        if tx.send(ServerMessage::StreamItem { id, item }).await.is_err() {
            return Status::cancelled("connection closed");
        }
    }
    Status::ok()
}

async fn write_loop(mut writer: WriteHalf<BoxTransport>, mut rx: mpsc::Receiver<ServerMessage>) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = write_message(&mut writer, &message).await {
            debug!("Connection write failed: {}", e);
            return;
        }
    }
    let _ = writer.shutdown().await;
}

fn str_param<'a>(params: &'a Value, key: &str) -> Result<&'a str> {
    params[key]
        .as_str()
        .ok_or_else(|| BridgeError::InvalidParams {
            message: format!("missing string parameter '{}'", key),
        })
}

impl ServerShared {
    async fn unary(&self, method: &str, params: Value) -> Result<Value> {
        match method {
            methods::START => {
                self.puppet.start().await?;
                Ok(json!({}))
            }
            methods::STOP => {
                self.puppet.stop().await?;
                Ok(json!({}))
            }
            methods::DING => {
                self.puppet
                    .ding(params["data"].as_str().unwrap_or_default())
                    .await?;
                Ok(json!({}))
            }
            methods::LOGOUT => {
                self.puppet.logout().await?;
                Ok(json!({}))
            }
            methods::VERSION => Ok(json!({ "version": self.puppet.version() })),
            methods::CURRENT_USER => Ok(json!({ "contactId": self.puppet.current_user() })),
            methods::MESSAGE_FILE => {
                let file = self.puppet.message_file(str_param(&params, "id")?).await?;
                let file = file.prepare_for_wire(&self.loader).await?;
                file.to_json()
            }
            methods::MESSAGE_SEND_FILE => {
                let conversation_id = str_param(&params, "conversationId")?;
                let file = FileBox::from_json(params["fileBox"].clone())?;
                let file = self.localize(file).await?;
                let message_id = self
                    .puppet
                    .message_send_file(conversation_id, file)
                    .await?;
                Ok(json!({ "messageId": message_id }))
            }
            other => self.puppet.call(other, params).await,
        }
    }

    /// Replace a UUID reference into the local store by its content.
    async fn localize(&self, file: FileBox) -> Result<FileBox> {
        match file {
            FileBox::Uuid { name, uuid, .. } => {
                let reader = self.loader.load(uuid).await?;
                Ok(FileBox::Stream { name, reader })
            }
            other => Ok(other),
        }
    }

    async fn open_frames(
        &self,
        method: &str,
        params: Value,
    ) -> Result<BoxStream<'static, Result<ChunkFrame>>> {
        match method {
            methods::DOWNLOAD => {
                let raw = str_param(&params, "uuid")?;
                let uuid = Uuid::parse_str(raw).map_err(|e| BridgeError::InvalidParams {
                    message: format!("invalid uuid {}: {}", raw, e),
                })?;
                let file = self.store.resolve(&uuid).await?;
                Ok(chunk::encode(uuid.to_string(), file))
            }
            _ => {
                let file = self.puppet.message_file(str_param(&params, "id")?).await?;
                let name = file.name().to_string();
                let reader = file.into_reader(Some(&self.loader)).await?;
                Ok(chunk::encode(name, reader))
            }
        }
    }

    async fn upload(&self, items: BoxStream<'static, Result<Value>>) -> Result<Value> {
        let decoded = chunk::decode(frames_of(items)).await?;
        debug!("Receiving upload {}", decoded.name);
        let uuid = self.store.register(decoded.into_reader())?;
        self.store.written(&uuid).await?;
        Ok(json!({ "uuid": uuid }))
    }

    async fn message_send_file_stream(
        &self,
        mut items: BoxStream<'static, Result<Value>>,
    ) -> Result<Value> {
        let head = items
            .next()
            .await
            .ok_or_else(|| BridgeError::protocol("no conversation id"))??;
        let head: ConversationHead = serde_json::from_value(head)
            .map_err(|e| BridgeError::protocol(format!("invalid conversation head: {}", e)))?;

        let decoded = chunk::decode(frames_of(items)).await?;
        let file = FileBox::from_reader(decoded.name.clone(), decoded.into_reader());
        let message_id = self
            .puppet
            .message_send_file(&head.conversation_id, file)
            .await?;
        Ok(json!({ "messageId": message_id }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::puppet::MemoryPuppet;
    use crate::wire::StatusCode;
    use tokio::net::TcpStream;

    async fn start_server() -> (Arc<MemoryPuppet>, PuppetServerHandle) {
        let puppet = Arc::new(MemoryPuppet::new());
        let options = ServerOptions::new(Token::parse("puppet_server").unwrap()).with_bind("127.0.0.1:0");
        let handle = PuppetServer::start(puppet.clone(), options).await.unwrap();
        (puppet, handle)
    }

    async fn roundtrip(stream: &mut TcpStream, message: ClientMessage) -> ServerMessage {
        write_message(stream, &message).await.unwrap();
        read_message(stream).await.unwrap().unwrap()
    }

    fn metadata(token: &str) -> Metadata {
        auth::CallCredentials::new(&Token::parse(token).unwrap()).metadata()
    }

    #[tokio::test]
    async fn test_server_start_and_shutdown() {
        let (_puppet, handle) = start_server().await;
        assert!(handle.addr().port() > 0);
        let dir = handle.store().dir().to_path_buf();

        handle.stop().await.unwrap();
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_unary_version() {
        let (_puppet, handle) = start_server().await;
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();

        let response = roundtrip(
            &mut stream,
            ClientMessage::Unary {
                id: 1,
                method: methods::VERSION.to_string(),
                params: json!({}),
                metadata: metadata("puppet_server"),
            },
        )
        .await;

        match response {
            ServerMessage::Response {
                id: 1,
                result: Some(result),
                error: None,
            } => assert_eq!(result["version"], env!("CARGO_PKG_VERSION")),
            other => panic!("Expected version response, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bad_token_is_unauthenticated() {
        let (_puppet, handle) = start_server().await;
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();

        let response = roundtrip(
            &mut stream,
            ClientMessage::Unary {
                id: 7,
                method: methods::DING.to_string(),
                params: json!({"data": "x"}),
                metadata: metadata("puppet_wrong"),
            },
        )
        .await;

        match response {
            ServerMessage::Response {
                error: Some(status),
                ..
            } => assert_eq!(status.code, StatusCode::Unauthenticated),
            other => panic!("Expected Unauthenticated, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_method_is_unimplemented() {
        let (_puppet, handle) = start_server().await;
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();

        let response = roundtrip(
            &mut stream,
            ClientMessage::Unary {
                id: 2,
                method: "roomQrcode".to_string(),
                params: json!({}),
                metadata: metadata("puppet_server"),
            },
        )
        .await;

        match response {
            ServerMessage::Response {
                error: Some(status),
                ..
            } => assert_eq!(status.code, StatusCode::Unimplemented),
            other => panic!("Expected Unimplemented, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_download_unknown_uuid_is_not_found() {
        let (_puppet, handle) = start_server().await;
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();
        let uuid = Uuid::new_v4();

        let response = roundtrip(
            &mut stream,
            ClientMessage::OpenStream {
                id: 3,
                method: methods::DOWNLOAD.to_string(),
                params: json!({ "uuid": uuid }),
                metadata: metadata("puppet_server"),
            },
        )
        .await;

        match response {
            ServerMessage::StreamEnd { id: 3, status } => {
                assert_eq!(status.code, StatusCode::NotFound);
                assert_eq!(status.message, uuid.to_string());
            }
            other => panic!("Expected NotFound, got: {:?}", other),
        }
    }

    #[test]
    fn test_secure_server_requires_material() {
        let options = BridgeOptions::new().with_token("puppet_abc");
        assert!(matches!(
            ServerOptions::from_bridge(&options),
            Err(BridgeError::Tls { .. })
        ));

        let insecure = options.with_insecure_server(true);
        let server = ServerOptions::from_bridge(&insecure).unwrap();
        assert!(matches!(server.acceptor, Acceptor::Plain));
    }
}
