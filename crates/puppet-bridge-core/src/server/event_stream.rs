//! Server-side event stream manager.
//!
//! At most one event stream is attached per served backend. Attaching
//! subscribes to the backend, sends one heartbeat, replays a login event if
//! an account is already logged in, then forwards every backend event until
//! the stream is torn down.
//!
//! # Teardown
//!
//! Five signals end a stream: the client cancels, a write fails, the server
//! finishes it, the backend's event source ends, or the connection closes.
//! Each attached stream carries a generation number; teardown takes the
//! stored stream only if the generation still matches, so whichever signal
//! arrives first removes the listener and every later one is a no-op.

use crate::event::{EventEnvelope, PuppetEvent};
use crate::puppet::Puppet;
use crate::wire::Status;
use crate::{BridgeError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Where an attached stream writes.
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    async fn send(&self, envelope: EventEnvelope) -> Result<()>;

    /// Close the stream with a final status.
    async fn finish(&self, status: Status);
}

/// Why a stream was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    Cancelled,
    Error,
    Finish,
    End,
    Close,
}

struct Attached {
    generation: u64,
    task: Option<JoinHandle<()>>,
    stop_tx: Option<oneshot::Sender<()>>,
}

pub struct EventStreamManager {
    puppet: Arc<dyn Puppet>,
    current: Mutex<Option<Attached>>,
    generations: AtomicU64,
}

impl std::fmt::Debug for EventStreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStreamManager")
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// Handle to an attached stream. Dropping it tears the stream down as a
/// closed connection.
#[derive(Debug)]
pub struct EventStreamHandle {
    generation: u64,
    manager: Weak<EventStreamManager>,
}

impl EventStreamHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns `false` if the stream was already gone.
    pub fn teardown(&self, reason: Teardown) -> bool {
        self.manager
            .upgrade()
            .is_some_and(|manager| manager.teardown(self.generation, reason))
    }
}

impl Drop for EventStreamHandle {
    fn drop(&mut self) {
        self.teardown(Teardown::Close);
    }
}

impl EventStreamManager {
    pub fn new(puppet: Arc<dyn Puppet>) -> Arc<Self> {
        Arc::new(Self {
            puppet,
            current: Mutex::new(None),
            generations: AtomicU64::new(0),
        })
    }

    fn current(&self) -> MutexGuard<'_, Option<Attached>> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_attached(&self) -> bool {
        self.current().is_some()
    }

    /// Attach a stream. Fails with `AlreadyExists` while another stream is
    /// attached; the existing stream is left untouched.
    pub async fn attach(self: &Arc<Self>, sink: Arc<dyn EventSink>) -> Result<EventStreamHandle> {
        let generation = {
            let mut current = self.current();
            if current.is_some() {
                return Err(BridgeError::AlreadyExists {
                    message: "an event stream is already attached".to_string(),
                });
            }
            let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
            *current = Some(Attached {
                generation,
                task: None,
                stop_tx: None,
            });
            generation
        };
        let handle = EventStreamHandle {
            generation,
            manager: Arc::downgrade(self),
        };

        // Subscribe before emitting so nothing in between is lost.
        let events = self.puppet.subscribe();
        if let Err(e) = self.emit_initial(sink.as_ref()).await {
            self.teardown(generation, Teardown::Error);
            return Err(e);
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(forward(
            Arc::downgrade(self),
            generation,
            events,
            sink.clone(),
            stop_rx,
        ));

        let installed = {
            let mut current = self.current();
            match current.as_mut() {
                Some(attached) if attached.generation == generation => {
                    attached.task = Some(task);
                    attached.stop_tx = Some(stop_tx);
                    true
                }
                _ => {
                    task.abort();
                    false
                }
            }
        };
        if !installed {
            debug!(generation, "Event stream torn down while attaching");
            sink.finish(Status::cancelled("event stream torn down")).await;
            return Ok(handle);
        }

        info!(generation, "Event stream attached");
        Ok(handle)
    }

    async fn emit_initial(&self, sink: &dyn EventSink) -> Result<()> {
        sink.send(EventEnvelope::encode(&PuppetEvent::heartbeat(
            "event stream attached",
        ))?)
        .await?;

        if let Some(contact_id) = self.puppet.current_user() {
            debug!("Replaying login of {}", contact_id);
            sink.send(EventEnvelope::encode(&PuppetEvent::login(contact_id))?)
                .await?;
        }
        Ok(())
    }

    /// Remove the stream of `generation` and its listener. Returns `false`
    /// for a stream that is already gone.
    pub fn teardown(&self, generation: u64, reason: Teardown) -> bool {
        let attached = {
            let mut current = self.current();
            match current.as_ref() {
                Some(attached) if attached.generation == generation => current.take(),
                _ => None,
            }
        };

        let Some(attached) = attached else {
            debug!(generation, ?reason, "Ignoring teardown of a detached stream");
            return false;
        };
        if let Some(task) = attached.task {
            task.abort();
        }
        info!(generation, ?reason, "Event stream detached");
        true
    }

    /// Finish the attached stream, if any, with an OK status.
    pub fn stop(&self) -> bool {
        let Some(mut attached) = self.current().take() else {
            return false;
        };
        match attached.stop_tx.take() {
            // The task finishes the sink and exits.
            Some(stop_tx) => {
                let _ = stop_tx.send(());
            }
            None => {
                if let Some(task) = attached.task.take() {
                    task.abort();
                }
            }
        }
        info!(
            generation = attached.generation,
            reason = ?Teardown::Finish,
            "Event stream detached"
        );
        true
    }
}

async fn forward(
    manager: Weak<EventStreamManager>,
    generation: u64,
    mut events: broadcast::Receiver<PuppetEvent>,
    sink: Arc<dyn EventSink>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let reason = loop {
        let received = tokio::select! {
            biased;
            _ = &mut stop_rx => None,
            received = events.recv() => Some(received),
        };
        let Some(received) = received else {
            sink.finish(Status::ok()).await;
            break Teardown::Finish;
        };

        match received {
            Ok(event) => {
                let Ok(envelope) = EventEnvelope::encode(&event) else {
                    debug!("Not forwarding {} event", event.event_type());
                    continue;
                };
                if let Err(e) = sink.send(envelope).await {
                    debug!(generation, "Event stream write failed: {}", e);
                    break Teardown::Error;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(generation, "Event stream lagged, {} events dropped", skipped);
            }
            Err(RecvError::Closed) => {
                sink.finish(Status::ok()).await;
                break Teardown::End;
            }
        }
    };

    if let Some(manager) = manager.upgrade() {
        manager.teardown(generation, reason);
    }
}
