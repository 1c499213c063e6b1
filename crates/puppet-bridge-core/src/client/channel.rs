//! Multiplexed client channel.
//!
//! One transport carries every call of a session. A writer task drains a
//! bounded outbound queue; a reader task routes each server message to the
//! call it belongs to by id.
//!
//! # Call kinds
//!
//! - [`Channel::unary`]: one request, one response.
//! - [`Channel::server_stream`]: one request, a [`CallStream`] of items
//!   closed by a final status.
//! - [`Channel::client_stream`]: a [`CallSink`] of items, then one response.
//!
//! Dropping a `CallStream` or an unfinished `CallSink` cancels the call on
//! the server.
//!
//! The reader task never waits on a call's consumer: each server stream gets
//! its own unbounded queue, so an unread stream cannot hold back responses
//! or items of other calls.

use crate::auth::{CallCredentials, Credentials};
use crate::config::WireConfig;
use crate::tls::{self, BoxTransport};
use crate::wire::{read_message, write_message, ClientMessage, ServerMessage, Status, StatusCode};
use crate::{BridgeError, Result};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// What a server-streaming call yields.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Item(Value),
    /// Final status. Nothing follows it.
    End(Status),
}

enum Pending {
    Unary(oneshot::Sender<Result<Value>>),
    Stream(mpsc::UnboundedSender<StreamEvent>),
}

struct ChannelInner {
    endpoint: String,
    call: CallCredentials,
    outbound: mpsc::Sender<ClientMessage>,
    pending: Mutex<HashMap<u64, Pending>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChannelInner {
    fn pending(&self) -> MutexGuard<'_, HashMap<u64, Pending>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(&self, id: u64, pending: Pending) -> Result<()> {
        let mut map = self.pending();
        // Checked under the lock so `shutdown` cannot miss this entry.
        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::stream(format!(
                "channel to {} is closed",
                self.endpoint
            )));
        }
        map.insert(id, pending);
        Ok(())
    }

    fn dispatch(&self, message: ServerMessage) {
        match message {
            ServerMessage::Response { id, result, error } => {
                let outcome = match error {
                    Some(status) => Err(BridgeError::from_status(status)),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                let entry = self.pending().remove(&id);
                match entry {
                    Some(Pending::Unary(tx)) => {
                        let _ = tx.send(outcome);
                    }
                    Some(Pending::Stream(tx)) => {
                        let status = match outcome {
                            Ok(_) => Status::ok(),
                            Err(e) => e.to_status(),
                        };
                        let _ = tx.send(StreamEvent::End(status));
                    }
                    None => debug!("Response for unknown call {}", id),
                }
            }
            ServerMessage::StreamItem { id, item } => {
                let tx = match self.pending().get(&id) {
                    Some(Pending::Stream(tx)) => tx.clone(),
                    _ => {
                        debug!("Stream item for unknown call {}", id);
                        return;
                    }
                };
                if tx.send(StreamEvent::Item(item)).is_err() {
                    debug!("Receiver of call {} is gone, cancelling", id);
                    self.cancel(id);
                }
            }
            ServerMessage::StreamEnd { id, status } => {
                let entry = self.pending().remove(&id);
                match entry {
                    Some(Pending::Stream(tx)) => {
                        let _ = tx.send(StreamEvent::End(status));
                    }
                    Some(Pending::Unary(tx)) => {
                        let _ = tx.send(status.into_result().map(|()| Value::Null));
                    }
                    None => debug!("Stream end for unknown call {}", id),
                }
            }
        }
    }

    /// Fail every outstanding call and stop both tasks. Idempotent.
    fn shutdown(&self, reason: &str) {
        let drained: Vec<Pending> = {
            let mut map = self.pending();
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            map.drain().map(|(_, pending)| pending).collect()
        };

        debug!(
            "Channel to {} closed ({}), failing {} call(s)",
            self.endpoint,
            reason,
            drained.len()
        );
        for pending in drained {
            match pending {
                Pending::Unary(tx) => {
                    let _ = tx.send(Err(BridgeError::stream(reason)));
                }
                Pending::Stream(tx) => {
                    let _ = tx.send(StreamEvent::End(Status::new(
                        StatusCode::Unavailable,
                        reason,
                    )));
                }
            }
        }

        let tasks = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for task in tasks {
            task.abort();
        }
    }

    /// Best-effort cancel from a synchronous context.
    fn cancel(&self, id: u64) {
        self.pending().remove(&id);
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        match self.outbound.try_send(ClientMessage::Cancel { id }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(message)) => {
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    let outbound = self.outbound.clone();
                    runtime.spawn(async move {
                        let _ = outbound.send(message).await;
                    });
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

/// A connected, authenticated channel. Cheap to clone.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("endpoint", &self.inner.endpoint)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Channel {
    /// Open the transport to `endpoint` and start the channel tasks.
    pub async fn connect(endpoint: &str, credentials: &Credentials) -> Result<Self> {
        let transport = tls::connect(endpoint, &credentials.channel).await?;
        debug!("Channel connected to {}", endpoint);
        Ok(Self::over(transport, endpoint, credentials.call.clone()))
    }

    /// Run a channel over an already established transport.
    pub fn over(transport: BoxTransport, endpoint: impl Into<String>, call: CallCredentials) -> Self {
        let (reader, writer) = tokio::io::split(transport);
        let (outbound, outbound_rx) = mpsc::channel(WireConfig::STREAM_BUFFER);

        let inner = Arc::new(ChannelInner {
            endpoint: endpoint.into(),
            call,
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let writer_task = tokio::spawn(write_loop(writer, outbound_rx, Arc::downgrade(&inner)));
        let reader_task = tokio::spawn(read_loop(reader, Arc::downgrade(&inner)));
        inner
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend([writer_task, reader_task]);

        Self { inner }
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Close the transport. Outstanding calls fail with a stream error.
    pub fn close(&self) {
        self.inner.shutdown("channel closed");
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn send(&self, message: ClientMessage) -> Result<()> {
        if self.is_closed() {
            return Err(BridgeError::stream("channel closed"));
        }
        self.inner
            .outbound
            .send(message)
            .await
            .map_err(|_| BridgeError::stream("channel closed"))
    }

    async fn open(&self, id: u64, message: ClientMessage) -> Result<()> {
        if let Err(e) = self.send(message).await {
            self.inner.pending().remove(&id);
            return Err(e);
        }
        Ok(())
    }

    /// Unary call.
    pub async fn unary(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.inner.register(id, Pending::Unary(tx))?;

        self.open(
            id,
            ClientMessage::Unary {
                id,
                method: method.to_string(),
                params,
                metadata: self.inner.call.metadata(),
            },
        )
        .await?;

        rx.await
            .map_err(|_| BridgeError::stream("channel closed before response"))?
    }

    /// Server-streaming call.
    pub async fn server_stream(&self, method: &str, params: Value) -> Result<CallStream> {
        let id = self.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.register(id, Pending::Stream(tx))?;

        self.open(
            id,
            ClientMessage::OpenStream {
                id,
                method: method.to_string(),
                params,
                metadata: self.inner.call.metadata(),
            },
        )
        .await?;

        Ok(CallStream {
            id,
            rx,
            inner: Arc::downgrade(&self.inner),
            finished: false,
        })
    }

    /// Client-streaming call.
    pub async fn client_stream(&self, method: &str, params: Value) -> Result<CallSink> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.inner.register(id, Pending::Unary(tx))?;

        self.open(
            id,
            ClientMessage::OpenStream {
                id,
                method: method.to_string(),
                params,
                metadata: self.inner.call.metadata(),
            },
        )
        .await?;

        Ok(CallSink {
            id,
            channel: self.clone(),
            response: Some(rx),
        })
    }
}

/// Receiving side of a server-streaming call.
pub struct CallStream {
    id: u64,
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    inner: Weak<ChannelInner>,
    finished: bool,
}

impl std::fmt::Debug for CallStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallStream")
            .field("id", &self.id)
            .field("finished", &self.finished)
            .finish()
    }
}

impl CallStream {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next item or the final status; `None` once the final status was seen.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        match self.rx.recv().await {
            Some(StreamEvent::Item(item)) => Some(StreamEvent::Item(item)),
            Some(StreamEvent::End(status)) => {
                self.finished = true;
                Some(StreamEvent::End(status))
            }
            None => {
                self.finished = true;
                Some(StreamEvent::End(Status::new(
                    StatusCode::Unavailable,
                    "channel closed",
                )))
            }
        }
    }

    /// Stop receiving and tell the server to stop sending.
    pub fn cancel(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.rx.close();
        if let Some(inner) = self.inner.upgrade() {
            inner.cancel(self.id);
        }
    }

    /// Items as a stream. An OK final status ends it; any other status
    /// becomes its last, failed item.
    pub fn into_items(self) -> BoxStream<'static, Result<Value>> {
        stream::unfold(Some(self), |state| async move {
            let mut call = state?;
            match call.next().await? {
                StreamEvent::Item(item) => Some((Ok(item), Some(call))),
                StreamEvent::End(status) => match status.into_result() {
                    Ok(()) => None,
                    Err(e) => Some((Err(e), None)),
                },
            }
        })
        .boxed()
    }
}

impl Drop for CallStream {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Sending side of a client-streaming call.
pub struct CallSink {
    id: u64,
    channel: Channel,
    response: Option<oneshot::Receiver<Result<Value>>>,
}

impl std::fmt::Debug for CallSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSink").field("id", &self.id).finish()
    }
}

impl CallSink {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Send one item. Waits while the outbound queue is full.
    pub async fn send(&mut self, item: Value) -> Result<()> {
        self.channel
            .send(ClientMessage::StreamItem { id: self.id, item })
            .await
    }

    /// Close the sending side and wait for the response.
    pub async fn finish(mut self) -> Result<Value> {
        let response = self
            .response
            .take()
            .ok_or_else(|| BridgeError::stream("call already finished"))?;
        self.channel
            .send(ClientMessage::StreamEnd { id: self.id })
            .await?;
        response
            .await
            .map_err(|_| BridgeError::stream("channel closed before response"))?
    }
}

impl Drop for CallSink {
    fn drop(&mut self) {
        if self.response.is_some() {
            self.channel.inner.cancel(self.id);
        }
    }
}

async fn write_loop(
    mut writer: WriteHalf<BoxTransport>,
    mut outbound: mpsc::Receiver<ClientMessage>,
    inner: Weak<ChannelInner>,
) {
    while let Some(message) = outbound.recv().await {
        if let Err(e) = write_message(&mut writer, &message).await {
            warn!("Channel write failed: {}", e);
            if let Some(inner) = inner.upgrade() {
                inner.shutdown(&format!("write failed: {}", e));
            }
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(mut reader: ReadHalf<BoxTransport>, inner: Weak<ChannelInner>) {
    let reason = loop {
        let message = match read_message::<ServerMessage, _>(&mut reader).await {
            Ok(Some(message)) => message,
            Ok(None) => break "connection closed by peer".to_string(),
            Err(e) => break format!("connection lost: {}", e),
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.dispatch(message);
    };

    if let Some(inner) = inner.upgrade() {
        inner.shutdown(&reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Token;
    use crate::wire::methods;
    use serde_json::json;
    use tokio::io::DuplexStream;

    fn channel_pair() -> (Channel, DuplexStream) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let call = CallCredentials::new(&Token::parse("puppet_test").unwrap());
        (Channel::over(Box::new(client), "duplex", call), server)
    }

    async fn recv(server: &mut DuplexStream) -> ClientMessage {
        read_message(server).await.unwrap().unwrap()
    }

    async fn reply(server: &mut DuplexStream, message: ServerMessage) {
        write_message(server, &message).await.unwrap();
    }

    #[tokio::test]
    async fn test_unary_carries_credentials_and_result() {
        let (channel, mut server) = channel_pair();

        let call = tokio::spawn({
            let channel = channel.clone();
            async move { channel.unary(methods::VERSION, json!({})).await }
        });

        let request = recv(&mut server).await;
        match &request {
            ClientMessage::Unary {
                method, metadata, ..
            } => {
                assert_eq!(method, methods::VERSION);
                assert_eq!(
                    metadata.get("authorization").map(String::as_str),
                    Some("Puppet puppet_test")
                );
            }
            other => panic!("Expected Unary, got: {:?}", other),
        }
        reply(
            &mut server,
            ServerMessage::success(request.id(), json!({"version": "1.0"})),
        )
        .await;

        assert_eq!(call.await.unwrap().unwrap(), json!({"version": "1.0"}));
    }

    #[tokio::test]
    async fn test_unary_error_status_maps_back() {
        let (channel, mut server) = channel_pair();

        let call = tokio::spawn({
            let channel = channel.clone();
            async move { channel.unary(methods::START, json!({})).await }
        });

        let request = recv(&mut server).await;
        reply(
            &mut server,
            ServerMessage::failure(
                request.id(),
                Status::new(StatusCode::Unauthenticated, "invalid token"),
            ),
        )
        .await;

        match call.await.unwrap() {
            Err(BridgeError::Unauthenticated { message }) => assert_eq!(message, "invalid token"),
            other => panic!("Expected Unauthenticated, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_stream_items_then_end() {
        let (channel, mut server) = channel_pair();
        let mut stream = channel.server_stream(methods::EVENT, json!({})).await.unwrap();

        let id = recv(&mut server).await.id();
        for n in 0..3 {
            reply(&mut server, ServerMessage::StreamItem { id, item: json!(n) }).await;
        }
        reply(
            &mut server,
            ServerMessage::StreamEnd {
                id,
                status: Status::ok(),
            },
        )
        .await;

        for n in 0..3 {
            assert_eq!(stream.next().await, Some(StreamEvent::Item(json!(n))));
        }
        assert_eq!(stream.next().await, Some(StreamEvent::End(Status::ok())));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_unread_stream_does_not_hold_back_other_calls() {
        let (channel, mut server) = channel_pair();
        let mut stream = channel.server_stream(methods::DOWNLOAD, json!({})).await.unwrap();
        let stream_id = recv(&mut server).await.id();

        let backlog = WireConfig::STREAM_BUFFER * 4;
        for n in 0..backlog {
            reply(
                &mut server,
                ServerMessage::StreamItem {
                    id: stream_id,
                    item: json!(n),
                },
            )
            .await;
        }

        let call = tokio::spawn({
            let channel = channel.clone();
            async move { channel.unary(methods::VERSION, json!({})).await }
        });
        let request = recv(&mut server).await;
        reply(
            &mut server,
            ServerMessage::success(request.id(), json!({"version": "1.0"})),
        )
        .await;

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), call)
            .await
            .expect("unary reply held back by an unread stream");
        assert_eq!(result.unwrap().unwrap(), json!({"version": "1.0"}));

        // Nothing was dropped from the stream while it sat unread.
        for n in 0..backlog {
            assert_eq!(stream.next().await, Some(StreamEvent::Item(json!(n))));
        }
    }

    #[tokio::test]
    async fn test_dropping_stream_sends_cancel() {
        let (channel, mut server) = channel_pair();
        let stream = channel.server_stream(methods::EVENT, json!({})).await.unwrap();
        let id = recv(&mut server).await.id();

        drop(stream);

        assert_eq!(recv(&mut server).await, ClientMessage::Cancel { id });
    }

    #[tokio::test]
    async fn test_client_stream_sends_items_then_end() {
        let (channel, mut server) = channel_pair();
        let mut sink = channel.client_stream(methods::UPLOAD, json!({})).await.unwrap();
        let id = recv(&mut server).await.id();

        sink.send(json!({"name": "a.txt"})).await.unwrap();
        let finish = tokio::spawn(sink.finish());

        assert_eq!(
            recv(&mut server).await,
            ClientMessage::StreamItem {
                id,
                item: json!({"name": "a.txt"})
            }
        );
        assert_eq!(recv(&mut server).await, ClientMessage::StreamEnd { id });
        reply(&mut server, ServerMessage::success(id, json!({"uuid": "x"}))).await;

        assert_eq!(finish.await.unwrap().unwrap(), json!({"uuid": "x"}));
    }

    #[tokio::test]
    async fn test_peer_disconnect_fails_outstanding_calls() {
        let (channel, mut server) = channel_pair();

        let call = tokio::spawn({
            let channel = channel.clone();
            async move { channel.unary(methods::DING, json!({"data": "x"})).await }
        });
        let _ = recv(&mut server).await;
        drop(server);

        assert!(matches!(call.await.unwrap(), Err(BridgeError::Stream { .. })));
        // Reader task marks the channel closed on EOF.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(channel.is_closed());
        assert!(channel.unary(methods::DING, json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (channel, _server) = channel_pair();
        channel.close();
        channel.close();
        assert!(channel.is_closed());
        assert!(channel.server_stream(methods::EVENT, json!({})).await.is_err());
    }
}
