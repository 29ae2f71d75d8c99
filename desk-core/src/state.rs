//! Connection lifecycle states
//!
//! The feed connection moves through these states; UI layers only ever see
//! this coarse view, never transport-level error detail.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a feed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No transport, no reconnect pending
    Disconnected,
    /// Transport handshake in progress
    Connecting,
    /// Transport open and receiving data
    Connected,
    /// Close initiated, waiting for the transport to go down
    Closing,
    /// Disconnected, a reconnect timer is pending
    ReconnectScheduled,
}

impl ConnectionState {
    /// True while the connection is usable or about to become usable
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::Connected
                | ConnectionState::ReconnectScheduled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
            ConnectionState::ReconnectScheduled => "reconnect_scheduled",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_snake_case() {
        let json = serde_json::to_string(&ConnectionState::ReconnectScheduled).unwrap();
        assert_eq!(json, "\"reconnect_scheduled\"");
    }

    #[test]
    fn active_states() {
        assert!(ConnectionState::Connected.is_active());
        assert!(ConnectionState::Connecting.is_active());
        assert!(ConnectionState::ReconnectScheduled.is_active());
        assert!(!ConnectionState::Disconnected.is_active());
        assert!(!ConnectionState::Closing.is_active());
    }
}
