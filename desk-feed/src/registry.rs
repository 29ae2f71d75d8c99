//! Connection registry
//!
//! The registry owns every shared connection, keyed by endpoint. It is an
//! explicit object handed to callers (no ambient global): components that
//! need the feed receive a registry handle and `acquire` a subscription.
//! At most one live transport exists per endpoint; the transport is torn
//! down when the last subscription is released.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use desk_core::{ConnectionState, FeedRequest};

use crate::backoff::ReconnectPolicy;
use crate::connection::{run_driver, Command, ConnectionHealth, SharedConnection};
use crate::connector::{Connector, WsConnector};
use crate::subscriber::FeedCallbacks;

struct RegistryInner {
    connections: DashMap<String, Arc<SharedConnection>>,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    next_subscriber_id: AtomicU64,
}

/// Registry of shared feed connections. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct FeedRegistry {
    inner: Arc<RegistryInner>,
}

impl FeedRegistry {
    pub fn new(connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                connections: DashMap::new(),
                connector,
                policy,
                next_subscriber_id: AtomicU64::new(1),
            }),
        }
    }

    /// Registry over the production WebSocket connector with the default
    /// backoff schedule
    pub fn with_defaults() -> Self {
        Self::new(Arc::new(WsConnector), ReconnectPolicy::default())
    }

    /// Register a subscriber for `endpoint`.
    ///
    /// Attaches to the live connection if one exists; if it is already
    /// connected the caller's open callback fires synchronously before this
    /// returns. Otherwise the connection is created and its driver spawned.
    pub fn acquire(&self, endpoint: &str, callbacks: FeedCallbacks) -> FeedSubscription {
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        let callbacks = Arc::new(callbacks);

        // Attach while holding the map entry so a concurrent release-to-zero
        // cannot tear the connection down underneath this subscriber
        let (shared, count) = {
            let entry = self
                .inner
                .connections
                .entry(endpoint.to_string())
                .or_insert_with(|| Arc::new(SharedConnection::new(endpoint)));
            let count = entry.add_subscriber(id, Arc::clone(&callbacks));
            (Arc::clone(entry.value()), count)
        };
        debug!(endpoint, subscriber_id = id, refcount = count, "subscriber attached");

        shared.notify_open_if_connected(id);
        self.ensure_driver(&shared);

        FeedSubscription {
            registry: self.clone(),
            endpoint: endpoint.to_string(),
            id,
            released: AtomicBool::new(false),
        }
    }

    /// Serialize `request` and write it if the transport is open; otherwise
    /// log a warning and drop it (fire-and-forget).
    pub fn send(&self, endpoint: &str, request: &FeedRequest) {
        let Some(shared) = self.connection(endpoint) else {
            warn!(endpoint, "no connection, dropping message");
            return;
        };
        if shared.state() != ConnectionState::Connected {
            warn!(endpoint, state = %shared.state(), "transport not open, dropping message");
            return;
        }
        match serde_json::to_string(request) {
            Ok(json) => {
                if !shared.send_command(Command::Send(json)) {
                    warn!(endpoint, "driver gone, dropping message");
                }
            }
            Err(e) => warn!(endpoint, error = %e, "failed to serialize request"),
        }
    }

    /// Manual disconnect: suppresses any scheduled reconnect and closes the
    /// transport. Idempotent. Subscribers stay attached and can be revived
    /// with [`FeedRegistry::reconnect`].
    pub fn disconnect(&self, endpoint: &str) {
        if let Some(shared) = self.connection(endpoint) {
            shared.set_intentional(true);
            if shared.send_command(Command::Shutdown) {
                info!(endpoint, "manual disconnect");
            }
        }
    }

    /// Manual reconnect after a disconnect or a spent reconnect budget.
    /// No-op while a driver is already running.
    pub fn reconnect(&self, endpoint: &str) {
        if let Some(shared) = self.connection(endpoint) {
            if !shared.is_running() {
                info!(endpoint, "manual reconnect");
                self.ensure_driver(&shared);
            }
        }
    }

    /// Coarse connection state for UI surfaces
    pub fn state(&self, endpoint: &str) -> ConnectionState {
        self.connection(endpoint)
            .map(|shared| shared.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn health(&self, endpoint: &str) -> Option<ConnectionHealth> {
        self.connection(endpoint).map(|shared| shared.health())
    }

    /// Number of active subscriptions for `endpoint`
    pub fn refcount(&self, endpoint: &str) -> usize {
        self.connection(endpoint)
            .map(|shared| shared.subscriber_count())
            .unwrap_or(0)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    fn connection(&self, endpoint: &str) -> Option<Arc<SharedConnection>> {
        self.inner
            .connections
            .get(endpoint)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Spawn a driver for this connection unless one is already running
    fn ensure_driver(&self, shared: &Arc<SharedConnection>) {
        if shared.try_claim_driver() {
            shared.set_intentional(false);
            let (tx, rx) = mpsc::unbounded_channel();
            shared.install_command_tx(tx);
            tokio::spawn(run_driver(
                Arc::clone(shared),
                Arc::clone(&self.inner.connector),
                self.inner.policy,
                rx,
            ));
        }
    }

    fn release_subscriber(&self, endpoint: &str, id: u64) {
        let Some(shared) = self.connection(endpoint) else {
            return;
        };
        match shared.remove_subscriber(id) {
            None => {} // already released
            Some(0) => {
                // A concurrent acquire may have attached since the count hit
                // zero; only tear down if the connection is still empty under
                // the map lock, and shut down the entry actually removed
                let removed = self
                    .inner
                    .connections
                    .remove_if(endpoint, |_, conn| conn.subscriber_count() == 0);
                if let Some((_, conn)) = removed {
                    conn.set_intentional(true);
                    conn.send_command(Command::Shutdown);
                    info!(endpoint, "last subscriber released, closing transport");
                }
            }
            Some(remaining) => {
                debug!(endpoint, subscriber_id = id, refcount = remaining, "subscriber released");
            }
        }
    }
}

impl std::fmt::Debug for FeedRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedRegistry")
            .field("connections", &self.connection_count())
            .finish()
    }
}

/// RAII handle for one subscriber. Dropping it releases the subscription.
pub struct FeedSubscription {
    registry: FeedRegistry,
    endpoint: String,
    id: u64,
    released: AtomicBool,
}

impl FeedSubscription {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Current state of the underlying shared connection
    pub fn state(&self) -> ConnectionState {
        self.registry.state(&self.endpoint)
    }

    /// Fire-and-forget write through the shared transport
    pub fn send(&self, request: &FeedRequest) {
        self.registry.send(&self.endpoint, request);
    }

    /// Detach from the shared connection. Safe to call more than once; the
    /// transport closes when the last subscriber releases.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.registry.release_subscriber(&self.endpoint, self.id);
        }
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for FeedSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedSubscription")
            .field("endpoint", &self.endpoint)
            .field("id", &self.id)
            .finish()
    }
}
