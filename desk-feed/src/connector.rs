//! Transport seam for the connection driver
//!
//! The driver loop talks to the wire through the [`Connector`] /
//! [`TransportSink`] / [`TransportStream`] traits so that tests can inject a
//! scripted transport. Production uses [`WsConnector`] over
//! tokio-tungstenite.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use desk_core::DeskError;

/// One event read off the transport
#[derive(Debug)]
pub enum TransportEvent {
    /// A text frame (the feed speaks JSON over text frames)
    Text(String),
    /// Server ping; the driver answers with a pong
    Ping(Vec<u8>),
    /// Transport-level error. Does not end the connection by itself.
    Error(String),
    /// The transport went down. `normal` is true only for a clean
    /// normal-closure frame.
    Closed { normal: bool },
}

/// Write half of a transport
#[async_trait]
pub trait TransportSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), DeskError>;
    async fn send_pong(&mut self, data: Vec<u8>) -> Result<(), DeskError>;
    async fn close(&mut self) -> Result<(), DeskError>;
}

/// Read half of a transport
#[async_trait]
pub trait TransportStream: Send {
    /// Next event off the wire. Keeps returning `Closed` once the
    /// transport is down.
    async fn next_event(&mut self) -> TransportEvent;
}

/// Dials an endpoint and hands back the two transport halves
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        endpoint: &str,
    ) -> Result<(Box<dyn TransportSink>, Box<dyn TransportStream>), DeskError>;
}

// ============================================================================
// WebSocket implementation
// ============================================================================

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Production connector backed by tokio-tungstenite
#[derive(Debug, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        endpoint: &str,
    ) -> Result<(Box<dyn TransportSink>, Box<dyn TransportStream>), DeskError> {
        // Validate up front so a bad endpoint reads as config, not network
        Url::parse(endpoint)
            .map_err(|e| DeskError::config(format!("invalid endpoint '{}': {}", endpoint, e)))?;

        let (ws_stream, _) = connect_async(endpoint)
            .await
            .map_err(|e| DeskError::network(e.to_string()))?;

        let (write, read) = ws_stream.split();
        Ok((Box::new(WsSink { write }), Box::new(WsSource { read })))
    }
}

struct WsSink {
    write: SplitSink<WsStream, Message>,
}

#[async_trait]
impl TransportSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), DeskError> {
        self.write
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| DeskError::network(e.to_string()))
    }

    async fn send_pong(&mut self, data: Vec<u8>) -> Result<(), DeskError> {
        self.write
            .send(Message::Pong(data.into()))
            .await
            .map_err(|e| DeskError::network(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), DeskError> {
        self.write
            .close()
            .await
            .map_err(|e| DeskError::network(e.to_string()))
    }
}

struct WsSource {
    read: SplitStream<WsStream>,
}

#[async_trait]
impl TransportStream for WsSource {
    async fn next_event(&mut self) -> TransportEvent {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => return TransportEvent::Text(text.to_string()),
                Some(Ok(Message::Ping(data))) => return TransportEvent::Ping(data.to_vec()),
                // Binary frames and pong replies are not part of the feed protocol
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Binary(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    let normal = frame
                        .map(|f| f.code == CloseCode::Normal)
                        .unwrap_or(false);
                    return TransportEvent::Closed { normal };
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return TransportEvent::Error(e.to_string()),
                // Stream ended without a close frame: abnormal closure
                None => return TransportEvent::Closed { normal: false },
            }
        }
    }
}

// ============================================================================
// Scripted transport for tests
// ============================================================================

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    /// Handle a test keeps to drive one accepted session
    pub(crate) struct SessionHandle {
        pub events: mpsc::UnboundedSender<TransportEvent>,
        /// Text frames the driver wrote to this session
        pub sent: Arc<Mutex<Vec<String>>>,
    }

    impl SessionHandle {
        pub fn push_text(&self, text: impl Into<String>) {
            let _ = self.events.send(TransportEvent::Text(text.into()));
        }

        pub fn push_error(&self, msg: impl Into<String>) {
            let _ = self.events.send(TransportEvent::Error(msg.into()));
        }

        pub fn push_closed(&self, normal: bool) {
            let _ = self.events.send(TransportEvent::Closed { normal });
        }

        pub fn sent(&self) -> Vec<String> {
            self.sent.lock().clone()
        }
    }

    enum Session {
        Refused,
        Accept {
            events: mpsc::UnboundedReceiver<TransportEvent>,
            sent: Arc<Mutex<Vec<String>>>,
        },
    }

    /// Connector that replays a scripted sequence of sessions
    #[derive(Default)]
    pub(crate) struct MockConnector {
        sessions: Mutex<VecDeque<Session>>,
        connects: AtomicUsize,
    }

    impl MockConnector {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Queue a connection attempt that fails outright
        pub fn refuse_next(&self) {
            self.sessions.lock().push_back(Session::Refused);
        }

        /// Queue a connection attempt that succeeds; returns the handle the
        /// test uses to feed events and inspect writes
        pub fn accept_next(&self) -> SessionHandle {
            let (tx, rx) = mpsc::unbounded_channel();
            let sent = Arc::new(Mutex::new(Vec::new()));
            self.sessions.lock().push_back(Session::Accept {
                events: rx,
                sent: Arc::clone(&sent),
            });
            SessionHandle { events: tx, sent }
        }

        pub fn connect_count(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(
            &self,
            endpoint: &str,
        ) -> Result<(Box<dyn TransportSink>, Box<dyn TransportStream>), DeskError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            match self.sessions.lock().pop_front() {
                Some(Session::Accept { events, sent }) => Ok((
                    Box::new(MockSink { sent }),
                    Box::new(MockSource {
                        events,
                        down: false,
                    }),
                )),
                Some(Session::Refused) | None => {
                    Err(DeskError::network(format!("{}: connection refused", endpoint)))
                }
            }
        }
    }

    struct MockSink {
        sent: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl TransportSink for MockSink {
        async fn send_text(&mut self, text: String) -> Result<(), DeskError> {
            self.sent.lock().push(text);
            Ok(())
        }

        async fn send_pong(&mut self, _data: Vec<u8>) -> Result<(), DeskError> {
            Ok(())
        }

        async fn close(&mut self) -> Result<(), DeskError> {
            Ok(())
        }
    }

    struct MockSource {
        events: mpsc::UnboundedReceiver<TransportEvent>,
        down: bool,
    }

    #[async_trait]
    impl TransportStream for MockSource {
        async fn next_event(&mut self) -> TransportEvent {
            if self.down {
                return TransportEvent::Closed { normal: false };
            }
            match self.events.recv().await {
                Some(event) => {
                    if matches!(event, TransportEvent::Closed { .. }) {
                        self.down = true;
                    }
                    event
                }
                None => {
                    self.down = true;
                    TransportEvent::Closed { normal: false }
                }
            }
        }
    }
}
