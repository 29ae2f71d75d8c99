//! Shared WebSocket connection manager for the Market Desk client
//!
//! One live transport per endpoint, reference-counted across subscribers:
//! the first [`FeedRegistry::acquire`] dials the endpoint, later acquires
//! attach to the existing connection, and the transport closes when the last
//! subscription is released. Abnormal closures reconnect with exponential
//! backoff; reconnection churn is hidden from subscribers behind their
//! callback set.

pub mod backoff;
pub mod connection;
pub mod connector;
pub mod registry;
pub mod subscriber;

pub use backoff::ReconnectPolicy;
pub use connection::ConnectionHealth;
pub use connector::{Connector, TransportEvent, TransportSink, TransportStream, WsConnector};
pub use registry::{FeedRegistry, FeedSubscription};
pub use subscriber::{CloseEvent, FeedCallbacks};
