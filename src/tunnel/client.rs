//! Tunnel client: the outbound WebSocket from device to server.
//!
//! [`ConnectionManager`] owns the one WebSocket the agent has. Connect
//! attempts and the frame reader run as background tasks that report back
//! through [`ConnectionEvent`]s; the event loop feeds those into
//! [`ConnectionManager::on_event`], which keeps the state machine in one
//! place:
//!
//! ```text
//! start ──▶ connecting ──opened──▶ open ──closed──▶ connecting (auto-reconnect)
//!              │  ▲                                  └──────▶ fatal (otherwise)
//!     failed ──┘  └── fixed delay (auto-reconnect), fatal otherwise
//! ```
//!
//! Every attempt gets a new generation number. Events from older generations
//! are ignored, so a reader that outlives its connection cannot close or feed
//! frames into the current one.

use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::{AgentError, ConnectError, SendError};
use crate::protocol::Outbound;

/// The WebSocket stream type returned by `connect_async`.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

type WsSink = SplitSink<WsStream, Message>;

/// Build the registration URL: `ws://<host>:<port><path>?mac=<device_id>`.
pub fn device_url(host: &str, port: u16, path: &str, device_id: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("ws://[{host}]:{port}{path}?mac={device_id}")
    } else {
        format!("ws://{host}:{port}{path}?mac={device_id}")
    }
}

/// How to reach the server and what to do when it goes away.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub url: String,
    /// Bound on a single connect attempt.
    pub connect_timeout: Duration,
    /// Fixed delay before retrying after a failed attempt.
    pub reconnect_delay: Duration,
    pub auto_reconnect: bool,
}

/// Reports from the connect and reader tasks.
pub enum ConnectionEvent {
    Opened {
        generation: u64,
        stream: Box<WsStream>,
    },
    ConnectFailed {
        generation: u64,
        error: ConnectError,
    },
    Message {
        generation: u64,
        text: String,
    },
    Error {
        generation: u64,
        error: tungstenite::Error,
    },
    Closed {
        generation: u64,
    },
}

/// What the event loop should do after [`ConnectionManager::on_event`].
#[derive(Debug, PartialEq, Eq)]
pub enum ConnectionUpdate {
    /// A connection just opened.
    Opened,
    /// A text frame to hand to the protocol handler.
    Frame(String),
    Idle,
}

/// Owns the transport: connect, reconnect, send, close.
pub struct ConnectionManager {
    settings: ConnectionSettings,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    generation: u64,
    sink: Option<WsSink>,
    opened_at: Option<Instant>,
    reader: Option<JoinHandle<()>>,
    attempt: Option<JoinHandle<()>>,
    reconnects: u64,
}

impl ConnectionManager {
    pub fn new(
        settings: ConnectionSettings,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        Self {
            settings,
            events,
            generation: 0,
            sink: None,
            opened_at: None,
            reader: None,
            attempt: None,
            reconnects: 0,
        }
    }

    /// Begin the first connect attempt.
    pub fn start(&mut self) {
        info!("Connecting to {}", self.settings.url);
        self.schedule(Duration::ZERO);
    }

    pub fn is_connected(&self) -> bool {
        self.sink.is_some()
    }

    /// Number of reconnect attempts since startup.
    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    /// Advance the state machine. `Err` means the agent cannot continue
    /// (the connection is gone and auto-reconnect is off).
    pub fn on_event(&mut self, event: ConnectionEvent) -> Result<ConnectionUpdate, AgentError> {
        match event {
            ConnectionEvent::Opened { generation, stream } if generation == self.generation => {
                self.open(*stream);
                Ok(ConnectionUpdate::Opened)
            }
            ConnectionEvent::ConnectFailed { generation, error }
                if generation == self.generation =>
            {
                self.attempt = None;
                if !self.settings.auto_reconnect {
                    return Err(AgentError::Connect(error));
                }
                let delay = self.settings.reconnect_delay;
                warn!("Connect failed: {error}, retrying in {}s", delay.as_secs());
                self.reconnects += 1;
                self.schedule(delay);
                Ok(ConnectionUpdate::Idle)
            }
            ConnectionEvent::Message { generation, text } if generation == self.generation => {
                Ok(ConnectionUpdate::Frame(text))
            }
            ConnectionEvent::Error { generation, error } if generation == self.generation => {
                // The reader reports Closed right after; that drives reconnect.
                warn!("Connection error: {error}");
                Ok(ConnectionUpdate::Idle)
            }
            ConnectionEvent::Closed { generation } if generation == self.generation => {
                let lifetime = self.opened_at.map(|t| t.elapsed());
                self.sink = None;
                self.reader = None;
                self.opened_at = None;
                if !self.settings.auto_reconnect {
                    info!("Connection closed");
                    return Err(AgentError::Closed);
                }
                // Reconnect right away, unless the server is dropping us
                // faster than the retry delay.
                let delay = match lifetime {
                    Some(l) if l < self.settings.reconnect_delay => {
                        self.settings.reconnect_delay - l
                    }
                    _ => Duration::ZERO,
                };
                info!("Connection closed, reconnecting in {}s", delay.as_secs());
                self.reconnects += 1;
                self.schedule(delay);
                Ok(ConnectionUpdate::Idle)
            }
            ConnectionEvent::Opened { generation, .. }
            | ConnectionEvent::ConnectFailed { generation, .. }
            | ConnectionEvent::Message { generation, .. }
            | ConnectionEvent::Error { generation, .. }
            | ConnectionEvent::Closed { generation } => {
                debug!("Ignoring event from stale connection {generation}");
                Ok(ConnectionUpdate::Idle)
            }
        }
    }

    /// Send one frame. Fails with [`SendError::NotConnected`] while no
    /// connection is open; failures are not retried.
    pub async fn send(&mut self, frame: &Outbound) -> Result<(), SendError> {
        let sink = self.sink.as_mut().ok_or(SendError::NotConnected)?;
        let text = frame.to_json()?;
        sink.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Close the connection (sending a close frame) and stop all tasks.
    pub async fn close(&mut self) {
        self.generation += 1;
        if let Some(attempt) = self.attempt.take() {
            attempt.abort();
        }
        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.close().await {
                debug!("Close handshake failed: {e}");
            }
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.opened_at = None;
    }

    fn open(&mut self, stream: WsStream) {
        self.attempt = None;
        let (sink, stream) = stream.split();
        self.sink = Some(sink);
        self.opened_at = Some(Instant::now());
        self.reader = Some(tokio::spawn(read_frames(
            self.generation,
            stream,
            self.events.clone(),
        )));
        info!("Connected to {}", self.settings.url);
    }

    /// Start a new connect attempt after `delay`, abandoning any previous one.
    fn schedule(&mut self, delay: Duration) {
        self.generation += 1;
        if let Some(previous) = self.attempt.take() {
            previous.abort();
        }
        self.attempt = Some(tokio::spawn(connect(
            self.generation,
            self.settings.url.clone(),
            delay,
            self.settings.connect_timeout,
            self.events.clone(),
        )));
    }
}

/// One connect attempt, bounded by `timeout`.
async fn connect(
    generation: u64,
    url: String,
    delay: Duration,
    timeout: Duration,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    let event = match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url.as_str()))
        .await
    {
        Ok(Ok((stream, _response))) => ConnectionEvent::Opened {
            generation,
            stream: Box::new(stream),
        },
        Ok(Err(e)) => ConnectionEvent::ConnectFailed {
            generation,
            error: ConnectError::WebSocket(e),
        },
        Err(_elapsed) => ConnectionEvent::ConnectFailed {
            generation,
            error: ConnectError::Timeout(timeout),
        },
    };
    let _ = events.send(event);
}

/// Forward text frames until the connection ends, then report `Closed`.
async fn read_frames(
    generation: u64,
    mut stream: SplitStream<WsStream>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let event = ConnectionEvent::Message {
                    generation,
                    text: text.as_str().to_owned(),
                };
                if events.send(event).is_err() {
                    return;
                }
            }
            Ok(Message::Close(frame)) => {
                debug!("Server sent close frame: {frame:?}");
                break;
            }
            Ok(Message::Binary(data)) => {
                debug!("Ignoring {}-byte binary frame", data.len());
            }
            Ok(_) => {}
            Err(error) => {
                let _ = events.send(ConnectionEvent::Error { generation, error });
                break;
            }
        }
    }
    let _ = events.send(ConnectionEvent::Closed { generation });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(auto_reconnect: bool) -> (ConnectionManager, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let settings = ConnectionSettings {
            // Port 9 on loopback: nothing listens, so attempts fail fast.
            url: "ws://127.0.0.1:9/ws/device?mac=AABB".into(),
            connect_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(5),
            auto_reconnect,
        };
        (ConnectionManager::new(settings, tx), rx)
    }

    fn timed_out() -> ConnectError {
        ConnectError::Timeout(Duration::from_secs(5))
    }

    #[test]
    fn test_device_url() {
        assert_eq!(
            device_url("10.0.0.1", 5912, "/ws/device", "001A2B3C4D5E"),
            "ws://10.0.0.1:5912/ws/device?mac=001A2B3C4D5E"
        );
        assert_eq!(
            device_url("fe80::1", 80, "/ws/device", "AABB"),
            "ws://[fe80::1]:80/ws/device?mac=AABB"
        );
    }

    #[tokio::test]
    async fn test_connect_failure_is_fatal_without_auto_reconnect() {
        let (mut mgr, _rx) = manager(false);
        mgr.start();
        let generation = mgr.generation;
        let result = mgr.on_event(ConnectionEvent::ConnectFailed {
            generation,
            error: timed_out(),
        });
        assert!(matches!(result, Err(AgentError::Connect(ConnectError::Timeout(_)))));
    }

    #[tokio::test]
    async fn test_connect_failure_schedules_retry() {
        let (mut mgr, _rx) = manager(true);
        mgr.start();
        let first = mgr.generation;
        let result = mgr.on_event(ConnectionEvent::ConnectFailed {
            generation: first,
            error: timed_out(),
        });
        assert_eq!(result.unwrap(), ConnectionUpdate::Idle);
        assert_eq!(mgr.reconnects(), 1);
        assert_eq!(mgr.generation, first + 1);
        assert!(mgr.attempt.is_some());
        assert!(!mgr.is_connected());
        mgr.close().await;
    }

    #[tokio::test]
    async fn test_close_is_fatal_without_auto_reconnect() {
        let (mut mgr, _rx) = manager(false);
        mgr.start();
        let generation = mgr.generation;
        let result = mgr.on_event(ConnectionEvent::Closed { generation });
        assert!(matches!(result, Err(AgentError::Closed)));
    }

    #[tokio::test]
    async fn test_close_reconnects_with_auto_reconnect() {
        let (mut mgr, _rx) = manager(true);
        mgr.start();
        let generation = mgr.generation;
        let result = mgr.on_event(ConnectionEvent::Closed { generation });
        assert_eq!(result.unwrap(), ConnectionUpdate::Idle);
        assert_eq!(mgr.generation, generation + 1);
        assert_eq!(mgr.reconnects(), 1);
        mgr.close().await;
    }

    #[tokio::test]
    async fn test_stale_events_are_ignored() {
        let (mut mgr, _rx) = manager(false);
        mgr.start();
        let stale = mgr.generation - 1;

        let frame = mgr.on_event(ConnectionEvent::Message {
            generation: stale,
            text: "{}".into(),
        });
        assert_eq!(frame.unwrap(), ConnectionUpdate::Idle);
        // Would be fatal if it were current.
        let closed = mgr.on_event(ConnectionEvent::Closed { generation: stale });
        assert_eq!(closed.unwrap(), ConnectionUpdate::Idle);
        mgr.close().await;
    }

    #[tokio::test]
    async fn test_current_message_is_forwarded() {
        let (mut mgr, _rx) = manager(false);
        mgr.start();
        let generation = mgr.generation;
        let frame = mgr.on_event(ConnectionEvent::Message {
            generation,
            text: "hello".into(),
        });
        assert_eq!(frame.unwrap(), ConnectionUpdate::Frame("hello".into()));
        mgr.close().await;
    }

    #[tokio::test]
    async fn test_send_without_connection() {
        let (mut mgr, _rx) = manager(false);
        let result = mgr.send(&Outbound::ping("AABB")).await;
        assert!(matches!(result, Err(SendError::NotConnected)));
    }

    #[tokio::test]
    async fn test_refused_connect_reports_failure() {
        let (mut mgr, mut rx) = manager(false);
        mgr.start();
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, ConnectionEvent::ConnectFailed { .. }));
        assert!(mgr.on_event(event).is_err());
    }
}
