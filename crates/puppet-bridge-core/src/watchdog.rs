//! Heartbeat watchdog.
//!
//! Watches a session's heartbeats while the session is active and asks its
//! owner to recover when they stop:
//!
//! - after `soft_threshold` of silence: [`RecoveryAction::Probe`], repeated
//!   every `soft_threshold / 2`;
//! - after `hard_threshold` of silence: [`RecoveryAction::Reset`], repeated
//!   every `hard_threshold`.
//!
//! A heartbeat pushes both deadlines out again. Leaving the active state
//! cancels both cycles; nothing fires while idle.
//!
//! All state lives in one task. Heartbeats and activity changes arrive over
//! channels and are handled ahead of the timers, so a heartbeat that lands at
//! the same instant as a deadline always wins.

use crate::client::SessionEvent;
use crate::config::WatchdogConfig;
use crate::event::PuppetEvent;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Activity of the watched session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActiveState {
    #[default]
    Off,
    /// Starting or stopping.
    Pending,
    On,
}

/// What the watchdog asks its owner to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Send a `ding` to the backend.
    Probe,
    /// Tear the session down and start a new one.
    Reset,
}

/// Callback invoked from the watchdog task.
pub type RecoveryCallback = Arc<dyn Fn(RecoveryAction) + Send + Sync>;

/// Handle to a running watchdog. Dropping it stops the watchdog.
pub struct WatchdogHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl WatchdogHandle {
    /// Cancel both cycles and wait until the task is gone.
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for WatchdogHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Deadlines {
    soft: Instant,
    hard: Instant,
}

impl Deadlines {
    fn from_last_beat(at: Instant, config: &WatchdogConfig) -> Self {
        Self {
            soft: at + config.soft_threshold,
            hard: at + config.hard_threshold,
        }
    }
}

pub struct Watchdog;

impl Watchdog {
    /// Start watching.
    ///
    /// `active` is the session's activity signal and `events` its event
    /// emitter; heartbeats are picked out of it.
    pub fn spawn(
        config: WatchdogConfig,
        active: watch::Receiver<ActiveState>,
        events: broadcast::Receiver<SessionEvent>,
        on_action: RecoveryCallback,
    ) -> WatchdogHandle {
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(Self::run(config, active, events, on_action, stop_rx));
        WatchdogHandle {
            stop_tx: Some(stop_tx),
            task: Some(task),
        }
    }

    async fn run(
        config: WatchdogConfig,
        mut active: watch::Receiver<ActiveState>,
        mut events: broadcast::Receiver<SessionEvent>,
        on_action: RecoveryCallback,
        mut stop_rx: oneshot::Receiver<()>,
    ) {
        let mut deadlines = (*active.borrow_and_update() == ActiveState::On)
            .then(|| Deadlines::from_last_beat(Instant::now(), &config));

        loop {
            let soft_at = deadlines.map(|d| d.soft);
            let hard_at = deadlines.map(|d| d.hard);

            tokio::select! {
                biased;

                _ = &mut stop_rx => break,

                changed = active.changed() => {
                    if changed.is_err() {
                        debug!("Watchdog: session gone");
                        break;
                    }
                    let on = *active.borrow_and_update() == ActiveState::On;
                    match (on, deadlines.is_some()) {
                        (true, false) => {
                            debug!("Watchdog: monitoring");
                            deadlines = Some(Deadlines::from_last_beat(Instant::now(), &config));
                        }
                        (false, true) => {
                            debug!("Watchdog: idle");
                            deadlines = None;
                        }
                        _ => {}
                    }
                }

                event = events.recv() => match event {
                    Ok(SessionEvent::Event(PuppetEvent::Heartbeat(_))) => {
                        if deadlines.is_some() {
                            deadlines = Some(Deadlines::from_last_beat(Instant::now(), &config));
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Watchdog lagged behind {} session events", skipped);
                    }
                    Err(RecvError::Closed) => {
                        debug!("Watchdog: event emitter closed");
                        break;
                    }
                },

                _ = wait_until(soft_at) => {
                    if let Some(d) = deadlines.as_mut() {
                        info!("No heartbeat for {:?}, probing", config.soft_threshold);
                        d.soft = Instant::now() + config.soft_interval();
                        on_action(RecoveryAction::Probe);
                    }
                }

                _ = wait_until(hard_at) => {
                    if let Some(d) = deadlines.as_mut() {
                        warn!("No heartbeat for {:?}, requesting reset", config.hard_threshold);
                        d.hard = Instant::now() + config.hard_interval();
                        on_action(RecoveryAction::Reset);
                    }
                }
            }
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Harness {
        active: watch::Sender<ActiveState>,
        events: broadcast::Sender<SessionEvent>,
        actions: Arc<Mutex<Vec<RecoveryAction>>>,
        handle: WatchdogHandle,
    }

    impl Harness {
        fn start(initial: ActiveState) -> Self {
            let (active, active_rx) = watch::channel(initial);
            let (events, events_rx) = broadcast::channel(64);
            let actions = Arc::new(Mutex::new(Vec::new()));
            let sink = actions.clone();
            let handle = Watchdog::spawn(
                WatchdogConfig::default(),
                active_rx,
                events_rx,
                Arc::new(move |action| sink.lock().unwrap().push(action)),
            );
            Self {
                active,
                events,
                actions,
                handle,
            }
        }

        fn beat(&self) {
            self.events
                .send(SessionEvent::Event(PuppetEvent::heartbeat("test")))
                .unwrap();
        }

        fn count(&self, action: RecoveryAction) -> usize {
            self.actions
                .lock()
                .unwrap()
                .iter()
                .filter(|a| **a == action)
                .count()
        }
    }

    async fn advance(secs: u64) {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_triggers_probe_then_repeats() {
        let h = Harness::start(ActiveState::On);

        advance(14).await;
        assert_eq!(h.count(RecoveryAction::Probe), 0);

        advance(2).await;
        assert_eq!(h.count(RecoveryAction::Probe), 1);

        // 15s + 7.5s + 7.5s = 30s
        advance(15).await;
        assert_eq!(h.count(RecoveryAction::Probe), 3);
        assert_eq!(h.count(RecoveryAction::Reset), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_silence_requests_reset() {
        let h = Harness::start(ActiveState::On);

        advance(59).await;
        assert_eq!(h.count(RecoveryAction::Reset), 0);

        advance(2).await;
        assert_eq!(h.count(RecoveryAction::Reset), 1);

        advance(60).await;
        assert_eq!(h.count(RecoveryAction::Reset), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_keep_it_quiet() {
        let h = Harness::start(ActiveState::On);

        for _ in 0..20 {
            advance(10).await;
            h.beat();
        }

        assert!(h.actions.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resumed_heartbeats_stop_the_probes() {
        let h = Harness::start(ActiveState::On);

        advance(20).await;
        let probes = h.count(RecoveryAction::Probe);
        assert!(probes >= 1);

        for _ in 0..10 {
            h.beat();
            advance(10).await;
        }

        assert_eq!(h.count(RecoveryAction::Probe), probes);
        assert_eq!(h.count(RecoveryAction::Reset), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_is_never_probed() {
        let h = Harness::start(ActiveState::Off);
        advance(300).await;
        assert!(h.actions.lock().unwrap().is_empty());

        h.active.send_replace(ActiveState::Pending);
        advance(300).await;
        assert!(h.actions.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_going_inactive_cancels_both_cycles() {
        let h = Harness::start(ActiveState::On);

        advance(20).await;
        let before = h.actions.lock().unwrap().len();
        assert!(before >= 1);

        h.active.send_replace(ActiveState::Off);
        advance(600).await;
        assert_eq!(h.actions.lock().unwrap().len(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reactivation_restarts_from_scratch() {
        let h = Harness::start(ActiveState::Off);
        advance(100).await;

        h.active.send_replace(ActiveState::On);
        advance(14).await;
        assert_eq!(h.count(RecoveryAction::Probe), 0);

        advance(2).await;
        assert_eq!(h.count(RecoveryAction::Probe), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_task() {
        let h = Harness::start(ActiveState::On);
        let actions = h.actions.clone();

        h.handle.stop().await;
        advance(600).await;
        assert!(actions.lock().unwrap().is_empty());
    }
}
