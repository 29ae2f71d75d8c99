//! Shared connection state and the driver task
//!
//! One `SharedConnection` exists per live endpoint. A driver task owns the
//! transport: it runs the reconnect loop, applies the backoff schedule, and
//! fans incoming messages out to the subscriber set. All state transitions
//! happen on the driver except the initial `Connecting` set by the registry.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use desk_core::{ConnectionState, FeedMessage};

use crate::backoff::ReconnectPolicy;
use crate::connector::{Connector, TransportEvent};
use crate::subscriber::{isolate, CloseEvent, FeedCallbacks};

/// No message for this long on a connected feed counts as stale
const STALE_THRESHOLD_SECS: u64 = 60;

/// Commands from subscribers/registry to the driver task
#[derive(Debug)]
pub(crate) enum Command {
    /// Write a serialized wire message
    Send(String),
    /// Intentional close: stop the transport and do not reconnect
    Shutdown,
}

/// One attached subscriber plus its open-notification bookkeeping
pub(crate) struct SubscriberEntry {
    pub(crate) id: u64,
    pub(crate) callbacks: Arc<FeedCallbacks>,
    /// Connection generation this subscriber last saw an open for
    last_open_epoch: AtomicU64,
}

impl SubscriberEntry {
    fn new(id: u64, callbacks: Arc<FeedCallbacks>) -> Self {
        Self {
            id,
            callbacks,
            last_open_epoch: AtomicU64::new(0),
        }
    }

    /// Invoke the open callback unless it already fired for this connection
    /// generation. The driver's fan-out and a synchronous attach can overlap;
    /// the epoch swap makes whichever runs first the only one that fires.
    fn notify_open(&self, epoch: u64) {
        if self.last_open_epoch.swap(epoch, Ordering::SeqCst) == epoch {
            return;
        }
        if let Some(cb) = self.callbacks.open.as_ref() {
            isolate(self.id, "open", || cb());
        }
    }
}

// ============================================================================
// Health metrics
// ============================================================================

/// Atomic counters describing one connection, safe to read from any task
#[derive(Debug, Default)]
pub(crate) struct ConnectionMetrics {
    connected: AtomicBool,
    last_message_epoch_ms: AtomicU64,
    message_count: AtomicU64,
}

impl ConnectionMetrics {
    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn record_message(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        self.last_message_epoch_ms.store(now, Ordering::SeqCst);
        self.message_count.fetch_add(1, Ordering::SeqCst);
    }
}

/// Snapshot of connection health for UI/status surfaces
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionHealth {
    pub endpoint: String,
    pub state: ConnectionState,
    pub message_count: u64,
    pub last_message_time: Option<DateTime<Utc>>,
    pub is_stale: bool,
}

// ============================================================================
// Shared connection
// ============================================================================

/// State shared between the registry, subscriptions, and the driver task
pub(crate) struct SharedConnection {
    pub(crate) endpoint: String,
    state: RwLock<ConnectionState>,
    subscribers: RwLock<Vec<Arc<SubscriberEntry>>>,
    /// Bumped by the driver on every successful open
    open_epoch: AtomicU64,
    /// Set by manual disconnect or release-to-zero; suppresses reconnects
    intentional: AtomicBool,
    /// True while a driver task is alive for this connection
    running: AtomicBool,
    command_tx: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    metrics: ConnectionMetrics,
}

impl SharedConnection {
    pub(crate) fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            state: RwLock::new(ConnectionState::Disconnected),
            subscribers: RwLock::new(Vec::new()),
            open_epoch: AtomicU64::new(0),
            intentional: AtomicBool::new(false),
            running: AtomicBool::new(false),
            command_tx: Mutex::new(None),
            metrics: ConnectionMetrics::default(),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.write();
        if *state != next {
            debug!(endpoint = %self.endpoint, from = %*state, to = %next, "connection state");
            *state = next;
        }
    }

    pub(crate) fn add_subscriber(&self, id: u64, callbacks: Arc<FeedCallbacks>) -> usize {
        let mut subs = self.subscribers.write();
        subs.push(Arc::new(SubscriberEntry::new(id, callbacks)));
        subs.len()
    }

    /// Returns the remaining refcount, or None if the id was already gone
    /// (release is idempotent).
    pub(crate) fn remove_subscriber(&self, id: u64) -> Option<usize> {
        let mut subs = self.subscribers.write();
        let before = subs.len();
        subs.retain(|entry| entry.id != id);
        if subs.len() == before {
            None
        } else {
            Some(subs.len())
        }
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    fn snapshot_subscribers(&self) -> Vec<Arc<SubscriberEntry>> {
        self.subscribers.read().clone()
    }

    pub(crate) fn set_intentional(&self, value: bool) {
        self.intentional.store(value, Ordering::SeqCst);
    }

    fn intentional(&self) -> bool {
        self.intentional.load(Ordering::SeqCst)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Claim the driver slot; false if a driver is already running
    pub(crate) fn try_claim_driver(&self) -> bool {
        !self.running.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn install_command_tx(&self, tx: mpsc::UnboundedSender<Command>) {
        *self.command_tx.lock() = Some(tx);
    }

    /// Returns false if no driver is listening
    pub(crate) fn send_command(&self, command: Command) -> bool {
        match self.command_tx.lock().as_ref() {
            Some(tx) => tx.send(command).is_ok(),
            None => false,
        }
    }

    pub(crate) fn health(&self) -> ConnectionHealth {
        let state = self.state();
        let last_ms = self.metrics.last_message_epoch_ms.load(Ordering::SeqCst);
        let message_count = self.metrics.message_count.load(Ordering::SeqCst);

        let last_message_time = if last_ms > 0 {
            DateTime::from_timestamp((last_ms / 1000) as i64, ((last_ms % 1000) * 1_000_000) as u32)
        } else {
            None
        };

        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        let is_stale = if state == ConnectionState::Connected && last_ms > 0 {
            now_ms.saturating_sub(last_ms) > STALE_THRESHOLD_SECS * 1000
        } else {
            state != ConnectionState::Connected
        };

        ConnectionHealth {
            endpoint: self.endpoint.clone(),
            state,
            message_count,
            last_message_time,
            is_stale,
        }
    }

    // ------------------------------------------------------------------
    // Fan-out. Sequential, in receipt order, one isolated call per
    // subscriber.
    // ------------------------------------------------------------------

    pub(crate) fn dispatch_open(&self) {
        let epoch = self.open_epoch.load(Ordering::SeqCst);
        for entry in self.snapshot_subscribers() {
            entry.notify_open(epoch);
        }
    }

    /// Synchronous open notification for a subscriber attaching to a live
    /// connection. Deduplicated against the driver's fan-out via the epoch.
    pub(crate) fn notify_open_if_connected(&self, id: u64) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        let epoch = self.open_epoch.load(Ordering::SeqCst);
        let entry = self
            .subscribers
            .read()
            .iter()
            .find(|entry| entry.id == id)
            .map(Arc::clone);
        if let Some(entry) = entry {
            entry.notify_open(epoch);
        }
    }

    fn dispatch_message(&self, message: &FeedMessage) {
        for entry in self.snapshot_subscribers() {
            if let Some(cb) = entry.callbacks.message.as_ref() {
                isolate(entry.id, "message", || cb(message));
            }
        }
    }

    fn dispatch_close(&self, event: CloseEvent) {
        for entry in self.snapshot_subscribers() {
            if let Some(cb) = entry.callbacks.close.as_ref() {
                isolate(entry.id, "close", || cb(event));
            }
        }
    }

    fn dispatch_error(&self, error: &str) {
        for entry in self.snapshot_subscribers() {
            if let Some(cb) = entry.callbacks.error.as_ref() {
                isolate(entry.id, "error", || cb(error));
            }
        }
    }
}

impl std::fmt::Debug for SharedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedConnection")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Driver task
// ============================================================================

/// Connection loop: connect, pump messages, reconnect with backoff on
/// abnormal closure. Exits on intentional close, normal closure from the
/// server, or a spent reconnect budget.
pub(crate) async fn run_driver(
    shared: Arc<SharedConnection>,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
) {
    let mut attempt = 0u32;

    'outer: loop {
        shared.set_state(ConnectionState::Connecting);
        info!(endpoint = %shared.endpoint, "connecting");

        match connector.connect(&shared.endpoint).await {
            Ok((mut sink, mut stream)) => {
                attempt = 0;
                shared.metrics.set_connected(true);
                // New generation before the state flips: attachers that see
                // Connected must also see the current epoch
                shared.open_epoch.fetch_add(1, Ordering::SeqCst);
                shared.set_state(ConnectionState::Connected);
                info!(endpoint = %shared.endpoint, "connected");
                shared.dispatch_open();

                let normal_close = loop {
                    tokio::select! {
                        event = stream.next_event() => match event {
                            TransportEvent::Text(text) => {
                                shared.metrics.record_message();
                                match serde_json::from_str::<FeedMessage>(&text) {
                                    Ok(message) => shared.dispatch_message(&message),
                                    Err(e) => {
                                        // One bad message must not break the feed
                                        warn!(
                                            endpoint = %shared.endpoint,
                                            error = %e,
                                            "dropping unparseable message"
                                        );
                                    }
                                }
                            }
                            TransportEvent::Ping(data) => {
                                if let Err(e) = sink.send_pong(data).await {
                                    warn!(endpoint = %shared.endpoint, error = %e, "failed to send pong");
                                }
                            }
                            TransportEvent::Error(e) => {
                                // Surfaced to subscribers only; the state
                                // machine advances on close events
                                warn!(endpoint = %shared.endpoint, error = %e, "transport error");
                                shared.dispatch_error(&e);
                            }
                            TransportEvent::Closed { normal } => {
                                info!(endpoint = %shared.endpoint, normal, "transport closed");
                                break normal;
                            }
                        },
                        command = command_rx.recv() => match command {
                            Some(Command::Send(text)) => {
                                if let Err(e) = sink.send_text(text).await {
                                    warn!(endpoint = %shared.endpoint, error = %e, "send failed");
                                    shared.dispatch_error(&e.to_string());
                                }
                            }
                            Some(Command::Shutdown) | None => {
                                shared.set_state(ConnectionState::Closing);
                                if let Err(e) = sink.close().await {
                                    debug!(endpoint = %shared.endpoint, error = %e, "close failed");
                                }
                                break true;
                            }
                        },
                    }
                };

                shared.metrics.set_connected(false);
                shared.set_state(ConnectionState::Disconnected);
                shared.dispatch_close(CloseEvent {
                    normal: normal_close,
                });

                if normal_close || shared.intentional() {
                    break 'outer;
                }
            }
            Err(e) => {
                warn!(endpoint = %shared.endpoint, error = %e, "connect failed");
                shared.dispatch_error(&e.to_string());
                shared.set_state(ConnectionState::Disconnected);
                if shared.intentional() {
                    break 'outer;
                }
            }
        }

        attempt += 1;
        if policy.exhausted(attempt) {
            warn!(
                endpoint = %shared.endpoint,
                attempts = attempt - 1,
                "reconnect budget spent, giving up"
            );
            break 'outer;
        }

        let delay = policy.delay_for(attempt);
        shared.set_state(ConnectionState::ReconnectScheduled);
        info!(endpoint = %shared.endpoint, attempt, ?delay, "reconnect scheduled");

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                command = command_rx.recv() => match command {
                    Some(Command::Shutdown) | None => {
                        // Cancels the pending reconnect timer
                        shared.set_state(ConnectionState::Disconnected);
                        break 'outer;
                    }
                    Some(Command::Send(_)) => {
                        warn!(endpoint = %shared.endpoint, "transport not open, dropping message");
                    }
                },
            }
        }
    }

    shared.set_state(ConnectionState::Disconnected);
    *shared.command_tx.lock() = None;
    shared.running.store(false, Ordering::SeqCst);
    debug!(endpoint = %shared.endpoint, "driver exited");
}
