//! Client connection session.
//!
//! A session owns one channel and the event stream on it. It is single-shot:
//! `start` once, `stop` once, then build a new session to reconnect.
//!
//! # Start
//!
//! 1. Build credentials (fails before any I/O on a bad configuration).
//! 2. Resolve the endpoint, via discovery if none is configured.
//! 3. Connect and open the event stream.
//! 4. Wait up to [`SessionConfig::START_TIMEOUT`] for the first stream item
//!    or status. Backends that stay silent are tolerated; a stream refused
//!    with an error status fails the start.
//! 5. Call the backend's `start`.
//!
//! # Stop
//!
//! Activity goes to `Pending`, the event stream is dropped (cancelling it on
//! the server), the backend's `stop` is called if the channel is still up,
//! the channel is closed, and activity goes to `Off`.
//!
//! # Stream end
//!
//! When the server ends the event stream the session emits
//! [`SessionEvent::Reset`] and activity drops to `Pending`, which stops the
//! watchdog. The session still counts as started, so `stop` works as usual.

use super::channel::{CallStream, Channel, StreamEvent};
use crate::auth::{Credentials, Token};
use crate::config::{BridgeOptions, SessionConfig};
use crate::discovery;
use crate::event::{EventEnvelope, PuppetEvent};
use crate::watchdog::ActiveState;
use crate::wire::methods;
use crate::{BridgeError, Result};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What a session emits to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Event(PuppetEvent),
    /// The session is no longer usable and should be restarted.
    Reset { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    New,
    Started,
    Stopped,
}

/// The channel and the task bridging its event stream. Always torn down
/// together.
struct Live {
    channel: Channel,
    bridge: JoinHandle<()>,
}

struct SessionState {
    phase: Phase,
    endpoint: Option<String>,
    live: Option<Live>,
}

pub struct ConnectionSession {
    options: BridgeOptions,
    state: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    active: Arc<watch::Sender<ActiveState>>,
}

impl std::fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("active", &*self.active.borrow())
            .finish()
    }
}

impl ConnectionSession {
    pub fn new(options: BridgeOptions) -> Self {
        let (events, _) = broadcast::channel(SessionConfig::EMITTER_CAPACITY);
        let (active, _) = watch::channel(ActiveState::Off);
        Self {
            options,
            state: Mutex::new(SessionState {
                phase: Phase::New,
                endpoint: None,
                live: None,
            }),
            events,
            active: Arc::new(active),
        }
    }

    /// Receiver for everything the session emits from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// The session's activity signal.
    pub fn active(&self) -> watch::Receiver<ActiveState> {
        self.active.subscribe()
    }

    pub fn is_active(&self) -> bool {
        *self.active.borrow() == ActiveState::On
    }

    /// Endpoint the session connected to.
    pub async fn endpoint(&self) -> Option<String> {
        self.state.lock().await.endpoint.clone()
    }

    /// The live channel, for issuing calls.
    pub async fn channel(&self) -> Result<Channel> {
        self.state
            .lock()
            .await
            .live
            .as_ref()
            .map(|live| live.channel.clone())
            .ok_or_else(|| BridgeError::connection("session is not started"))
    }

    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.phase {
            Phase::New => {}
            Phase::Started => return Err(BridgeError::connection("session already started")),
            Phase::Stopped => {
                return Err(BridgeError::connection(
                    "session was stopped; create a new session to reconnect",
                ))
            }
        }

        let credentials = Credentials::build(&self.options)?;
        let endpoint = self.resolve_endpoint(&credentials.token).await?;

        self.active.send_replace(ActiveState::Pending);
        match self.connect(&endpoint, &credentials).await {
            Ok(live) => {
                info!("Session started on {}", endpoint);
                state.phase = Phase::Started;
                state.endpoint = Some(endpoint);
                state.live = Some(live);
                self.active.send_replace(ActiveState::On);
                Ok(())
            }
            Err(e) => {
                warn!("Session start on {} failed: {}", endpoint, e);
                self.active.send_replace(ActiveState::Off);
                Err(e)
            }
        }
    }

    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.phase {
            Phase::New => return Err(BridgeError::connection("session is not started")),
            Phase::Stopped => {
                debug!("Session already stopped");
                return Ok(());
            }
            Phase::Started => {}
        }

        self.active.send_replace(ActiveState::Pending);

        match state.live.take() {
            Some(Live { channel, bridge }) => {
                // Dropping the stream inside the task cancels it on the server.
                bridge.abort();
                let _ = bridge.await;

                if channel.is_closed() {
                    warn!("Channel already closed, skipping backend stop");
                } else if let Err(e) = channel.unary(methods::STOP, json!({})).await {
                    warn!("Backend stop failed: {}", e);
                }
                channel.close();
            }
            None => warn!("Stopping a session without a channel"),
        }

        state.phase = Phase::Stopped;
        self.active.send_replace(ActiveState::Off);
        info!("Session stopped");
        Ok(())
    }

    async fn resolve_endpoint(&self, token: &Token) -> Result<String> {
        if let Some(endpoint) = &self.options.endpoint {
            return Ok(endpoint.clone());
        }
        discovery::discover(self.options.authority(), token)
            .await?
            .ok_or_else(|| {
                BridgeError::connection(format!(
                    "no endpoint registered at {} for this token",
                    self.options.authority()
                ))
            })
    }

    async fn connect(&self, endpoint: &str, credentials: &Credentials) -> Result<Live> {
        let channel = Channel::connect(endpoint, credentials).await?;

        let mut stream = match channel.server_stream(methods::EVENT, json!({})).await {
            Ok(stream) => stream,
            Err(e) => {
                channel.close();
                return Err(e);
            }
        };

        let first = match tokio::time::timeout(SessionConfig::START_TIMEOUT, stream.next()).await {
            Ok(first) => first,
            Err(_) => {
                debug!(
                    "No event within {:?}, continuing start",
                    SessionConfig::START_TIMEOUT
                );
                None
            }
        };

        // A stream refused up front (bad token, already attached) fails the start.
        if let Some(StreamEvent::End(status)) = &first {
            if !status.is_ok() {
                channel.close();
                return Err(BridgeError::from_status(status.clone()));
            }
        }

        let bridge = tokio::spawn(bridge_events(
            stream,
            first,
            self.events.clone(),
            self.active.clone(),
        ));

        if let Err(e) = channel.unary(methods::START, json!({})).await {
            bridge.abort();
            let _ = bridge.await;
            channel.close();
            return Err(e);
        }

        Ok(Live { channel, bridge })
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        if let Some(live) = self.state.get_mut().live.take() {
            live.bridge.abort();
            live.channel.close();
        }
    }
}

/// Re-emit the event stream, starting with the item peeked during start.
async fn bridge_events(
    mut stream: CallStream,
    first: Option<StreamEvent>,
    events: broadcast::Sender<SessionEvent>,
    active: Arc<watch::Sender<ActiveState>>,
) {
    let mut next = first;
    loop {
        let event = match next.take() {
            Some(event) => event,
            None => match stream.next().await {
                Some(event) => event,
                None => return,
            },
        };

        match event {
            StreamEvent::Item(item) => forward_item(item, &events),
            StreamEvent::End(status) => {
                let reason = if status.is_ok() {
                    "event stream ended".to_string()
                } else {
                    format!("event stream failed: {:?} {}", status.code, status.message)
                };
                warn!("{}", reason);
                active.send_if_modified(|state| {
                    let was_on = *state == ActiveState::On;
                    if was_on {
                        *state = ActiveState::Pending;
                    }
                    was_on
                });
                let _ = events.send(SessionEvent::Reset { reason });
                return;
            }
        }
    }
}

fn forward_item(item: serde_json::Value, events: &broadcast::Sender<SessionEvent>) {
    let envelope: EventEnvelope = match serde_json::from_value(item) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("Malformed event envelope: {}", e);
            return;
        }
    };

    match envelope.decode() {
        Ok(Some(PuppetEvent::Reset(_))) => warn!("Dropping reset event received from the server"),
        Ok(Some(event)) => {
            let _ = events.send(SessionEvent::Event(event));
        }
        Ok(None) => warn!("Ignoring unknown event type {}", envelope.event_type),
        Err(e) => warn!("Undecodable event of type {}: {}", envelope.event_type, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;

    fn envelope(event_type: i32, payload: &str) -> serde_json::Value {
        json!({"type": event_type, "payload": payload})
    }

    #[test]
    fn test_forward_known_event() {
        let (tx, mut rx) = broadcast::channel(8);
        forward_item(envelope(EventType::Dong.code(), r#"{"data":"x"}"#), &tx);

        match rx.try_recv().unwrap() {
            SessionEvent::Event(PuppetEvent::Dong(payload)) => assert_eq!(payload.data, "x"),
            other => panic!("Expected Dong, got: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_and_reset_events_are_dropped() {
        let (tx, mut rx) = broadcast::channel(8);
        forward_item(envelope(999, "{}"), &tx);
        forward_item(envelope(EventType::Reset.code(), r#"{"data":"x"}"#), &tx);
        forward_item(json!({"not": "an envelope"}), &tx);

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_before_start_fails() {
        let session = ConnectionSession::new(BridgeOptions::new().with_token("puppet_x"));
        assert!(session.stop().await.is_err());
    }

    #[tokio::test]
    async fn test_start_without_sni_fails_before_io() {
        // Nothing listens on port 1; reaching it would be a different error.
        let session = ConnectionSession::new(
            BridgeOptions::new()
                .with_token("nosni")
                .with_endpoint("127.0.0.1:1"),
        );
        let err = session.start().await.unwrap_err();
        assert!(err.to_string().contains("SNI"), "got: {}", err);
        assert_eq!(*session.active().borrow(), ActiveState::Off);
    }
}
