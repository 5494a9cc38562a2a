//! WebSocket transport using tokio-tungstenite.
//!
//! Opens the socket, performs the auth handshake, then splits into a writer
//! task fed by an outbound queue and a reader task that maps provider frames
//! to [`TransportEvent`]s. `ping` waits for the provider's pong, so a
//! half-open socket shows up as a failed ping.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tabsync_protocol::{ClientFrame, ServerFrame};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::{EventStream, Transport, TransportError, TransportEvent};

#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Provider endpoint, e.g. `wss://realtime.example.com/ws`
    pub url: String,
    /// Time allowed for connect + auth handshake
    pub handshake_timeout: Duration,
    /// Time a ping waits for its pong
    pub pong_timeout: Duration,
}

impl WebSocketConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            handshake_timeout: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(10),
        }
    }
}

/// One live socket: outbound queue plus the reader task.
struct Session {
    socket_id: String,
    outbound: mpsc::UnboundedSender<Message>,
    /// Bumped by the reader on every pong.
    pongs: Arc<watch::Sender<u64>>,
    reader: JoinHandle<()>,
}

pub struct WebSocketTransport {
    config: WebSocketConfig,
    session: Mutex<Option<Session>>,
}

impl WebSocketTransport {
    pub fn new(config: WebSocketConfig) -> Self {
        Self {
            config,
            session: Mutex::new(None),
        }
    }

    /// Socket id assigned by the provider for the live connection.
    pub fn socket_id(&self) -> Option<String> {
        self.session.lock().as_ref().map(|s| s.socket_id.clone())
    }

    fn send_frame(&self, frame: &ClientFrame) -> Result<(), TransportError> {
        let text = serde_json::to_string(frame).map_err(|e| TransportError::Send(e.to_string()))?;
        let session = self.session.lock();
        let session = session.as_ref().ok_or(TransportError::NotConnected)?;
        session
            .outbound
            .send(Message::Text(text.into()))
            .map_err(|_| TransportError::NotConnected)
    }
}

impl Transport for WebSocketTransport {
    async fn connect(&self, token: &str) -> Result<EventStream, TransportError> {
        self.close();

        let timeout = self.config.handshake_timeout;
        let (ws, _response) = tokio::time::timeout(timeout, connect_async(self.config.url.as_str()))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(map_connect_error)?;
        let (mut ws_tx, mut ws_rx) = ws.split();

        let auth = serde_json::to_string(&ClientFrame::Auth { token: token.to_string() })
            .map_err(|e| TransportError::Send(e.to_string()))?;
        ws_tx
            .send(Message::Text(auth.into()))
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let handshake = async {
            while let Some(msg) = ws_rx.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str(text.as_str()) {
                        Ok(ServerFrame::Connected { socket_id }) => return Ok(socket_id),
                        Ok(ServerFrame::Unauthorized { message }) => {
                            return Err(TransportError::Unauthorized(message));
                        }
                        Ok(ServerFrame::Error { message }) => {
                            return Err(TransportError::Handshake(message));
                        }
                        Ok(other) => debug!("Ignoring frame before handshake: {other:?}"),
                        Err(e) => debug!("Unparseable frame before handshake: {e}"),
                    },
                    Ok(Message::Close(frame)) => {
                        let reason = frame
                            .map(|f| f.reason.as_str().to_string())
                            .unwrap_or_else(|| "closed during handshake".into());
                        return Err(TransportError::Handshake(reason));
                    }
                    Ok(_) => {}
                    Err(e) => return Err(TransportError::Connect(e.to_string())),
                }
            }
            Err(TransportError::Handshake("stream ended during handshake".into()))
        };
        let socket_id = tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| TransportError::Timeout)??;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

        // Writer ends once every outbound sender is dropped.
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(e) = ws_tx.send(msg).await {
                    debug!("WebSocket write failed: {e}");
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        let pong_tx = out_tx.clone();
        let pongs = Arc::new(watch::Sender::new(0u64));
        let pong_seen = pongs.clone();
        let reader = tokio::spawn(async move {
            let closed = loop {
                match ws_rx.next().await {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerFrame>(text.as_str()) {
                            Ok(ServerFrame::Pong) => pong_seen.send_modify(|n| *n += 1),
                            Ok(frame) => {
                                if let Some(event) = map_frame(frame) {
                                    if event_tx.send(event).is_err() {
                                        return;
                                    }
                                }
                            }
                            Err(e) => warn!("Dropping unparseable realtime frame: {e}"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = pong_tx.send(Message::Pong(data));
                    }
                    Some(Ok(Message::Pong(_))) => pong_seen.send_modify(|n| *n += 1),
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(f) => TransportEvent::Closed {
                                code: Some(u16::from(f.code)),
                                reason: f.reason.as_str().to_string(),
                            },
                            None => TransportEvent::Closed {
                                code: None,
                                reason: String::new(),
                            },
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        break TransportEvent::Closed { code: None, reason: e.to_string() };
                    }
                    None => {
                        break TransportEvent::Closed {
                            code: None,
                            reason: "stream ended".into(),
                        };
                    }
                }
            };
            let _ = event_tx.send(closed);
        });

        info!("Realtime socket connected (socket id {socket_id})");
        *self.session.lock() = Some(Session {
            socket_id,
            outbound: out_tx,
            pongs,
            reader,
        });
        Ok(event_rx)
    }

    async fn bind(&self, channel: &str) -> Result<(), TransportError> {
        self.send_frame(&ClientFrame::Bind { channel: channel.to_string() })
    }

    async fn unbind(&self, channel: &str) -> Result<(), TransportError> {
        self.send_frame(&ClientFrame::Unbind { channel: channel.to_string() })
    }

    async fn ping(&self) -> Result<(), TransportError> {
        let mut pongs = match self.session.lock().as_ref() {
            Some(session) => session.pongs.subscribe(),
            None => return Err(TransportError::NotConnected),
        };
        self.send_frame(&ClientFrame::Ping)?;
        match tokio::time::timeout(self.config.pong_timeout, pongs.changed()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::NotConnected),
            Err(_) => {
                warn!("No pong within {}ms", self.config.pong_timeout.as_millis());
                Err(TransportError::Timeout)
            }
        }
    }

    fn close(&self) {
        if let Some(session) = self.session.lock().take() {
            session.reader.abort();
            if session.outbound.send(Message::Close(None)).is_err() {
                warn!("Realtime socket already gone at close");
            }
            debug!("Realtime socket {} closed", session.socket_id);
        }
    }

    fn name(&self) -> &str {
        "websocket"
    }
}

fn map_connect_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Http(response)
            if matches!(response.status().as_u16(), 401 | 403) =>
        {
            TransportError::Unauthorized(format!("HTTP {}", response.status()))
        }
        other => TransportError::Connect(other.to_string()),
    }
}

fn map_frame(frame: ServerFrame) -> Option<TransportEvent> {
    match frame {
        ServerFrame::Event(event) => Some(TransportEvent::Message(event)),
        ServerFrame::Bound { channel } => Some(TransportEvent::Bound(channel)),
        ServerFrame::SubscriptionError { channel, message } => {
            Some(TransportEvent::SubscriptionError { channel, message })
        }
        ServerFrame::Unauthorized { message } => Some(TransportEvent::Unauthorized(message)),
        ServerFrame::Error { message } => Some(TransportEvent::Error(message)),
        ServerFrame::Pong | ServerFrame::Connected { .. } => None,
    }
}
