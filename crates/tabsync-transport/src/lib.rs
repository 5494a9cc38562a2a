//! tabsync transport layer
//!
//! The realtime transport is receive-only for this client: it authenticates,
//! binds channels and delivers events. Publishing always goes through the
//! backend trigger endpoint, never through the transport.
//!
//! The connection manager talks to the transport through the [`Transport`]
//! trait, so the WebSocket implementation can be swapped for an in-memory
//! one in tests.

pub mod websocket;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tabsync_protocol::RealtimeEvent;
use tokio::sync::mpsc;

pub use websocket::{WebSocketConfig, WebSocketTransport};

/// Something the transport observed after the handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(RealtimeEvent),
    Bound(String),
    SubscriptionError { channel: String, message: String },
    /// Explicit unauthorized signal from the provider.
    Unauthorized(String),
    /// The connection went away. Never emitted for a local `close()`.
    Closed { code: Option<u16>, reason: String },
    Error(String),
}

/// Events of one established connection. Dropped by the transport when the
/// connection ends.
pub type EventStream = mpsc::UnboundedReceiver<TransportEvent>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("timed out")]
    Timeout,
    #[error("not connected")]
    NotConnected,
    #[error("send failed: {0}")]
    Send(String),
}

impl TransportError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}

/// Receive-only pub/sub transport.
pub trait Transport: Send + Sync + 'static {
    /// Open the connection and authenticate with `token`. Any previous
    /// connection is closed first.
    fn connect(
        &self,
        token: &str,
    ) -> impl Future<Output = Result<EventStream, TransportError>> + Send;

    fn bind(&self, channel: &str) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn unbind(&self, channel: &str) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Heartbeat liveness check. Resolves once the provider answers; an
    /// error means the connection is gone or half-open.
    fn ping(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Tear the connection down. Errors are swallowed.
    fn close(&self);

    fn name(&self) -> &str {
        "transport"
    }
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe version of [`Transport`].
pub trait DynTransport: Send + Sync {
    fn connect_dyn<'a>(
        &'a self,
        token: &'a str,
    ) -> BoxFuture<'a, Result<EventStream, TransportError>>;
    fn bind_dyn<'a>(&'a self, channel: &'a str) -> BoxFuture<'a, Result<(), TransportError>>;
    fn unbind_dyn<'a>(&'a self, channel: &'a str) -> BoxFuture<'a, Result<(), TransportError>>;
    fn ping_dyn(&self) -> BoxFuture<'_, Result<(), TransportError>>;
    fn close_dyn(&self);
    fn name_dyn(&self) -> &str;
}

impl<T: Transport> DynTransport for T {
    fn connect_dyn<'a>(
        &'a self,
        token: &'a str,
    ) -> BoxFuture<'a, Result<EventStream, TransportError>> {
        Box::pin(self.connect(token))
    }
    fn bind_dyn<'a>(&'a self, channel: &'a str) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(self.bind(channel))
    }
    fn unbind_dyn<'a>(&'a self, channel: &'a str) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(self.unbind(channel))
    }
    fn ping_dyn(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(self.ping())
    }
    fn close_dyn(&self) {
        self.close()
    }
    fn name_dyn(&self) -> &str {
        self.name()
    }
}

pub type SharedTransport = Arc<dyn DynTransport>;
