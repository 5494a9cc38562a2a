//! The single realtime connection of a tab.
//!
//! Owns the connection state machine, channel bindings, the outbound queue
//! and the reconnect policy. State transitions:
//!
//! ```text
//! DISCONNECTED -> CONNECTING -> CONNECTED
//!                     |            | unexpected close
//!                     v            v
//!                RECONNECTING <----+  (backoff, or refresh first on auth failure)
//!                     | attempts > max
//!                     v
//!                   ERROR
//! ```
//!
//! `disconnect()` moves any state to DISCONNECTED synchronously.

pub mod queue;
pub mod registry;

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value as JsonValue;
use tabsync_protocol::token::placeholder_token;
use tabsync_protocol::{
    Ack, ConnectionState, PublishRequest, RealtimeEvent, SyncError, sanitize_channel_name,
};
use tabsync_transport::{EventStream, SharedTransport, TransportEvent};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::api::SharedPublisher;
use crate::backoff::Backoff;
use crate::clock::SharedClock;
use crate::config::SyncConfig;
use crate::observer::{ListenerId, Listeners};
use crate::task::{TaskSlot, Ticket};
use crate::token::TokenManager;

pub use queue::{OutboundQueue, QueuedMessage};
pub use registry::{
    ChannelBinding, EventFilter, EventHandler, SubscriptionId, SubscriptionRegistry,
};

const DEV_TOKEN_TTL_MS: i64 = 15 * 60 * 1_000;

/// Close codes the provider uses for rejected credentials.
const AUTH_CLOSE_CODES: [u16; 4] = [4001, 4003, 4401, 4403];
const AUTH_REASON_PATTERNS: [&str; 6] = ["auth", "token", "expired", "forbidden", "401", "403"];

/// Whether a disconnect was caused by rejected credentials.
pub fn is_auth_failure(code: Option<u16>, reason: &str) -> bool {
    if code.is_some_and(|c| AUTH_CLOSE_CODES.contains(&c)) {
        return true;
    }
    let reason = reason.to_ascii_lowercase();
    AUTH_REASON_PATTERNS.iter().any(|p| reason.contains(p))
}

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Falls back to the default channel.
    pub channel: Option<String>,
    /// Event name; defaults to the message type.
    pub event: Option<String>,
    pub await_ack: bool,
    /// Ack deadline; defaults to `ackTimeoutMs`.
    pub timeout: Option<Duration>,
}

impl SendOptions {
    pub fn on(channel: impl Into<String>) -> Self {
        Self {
            channel: Some(channel.into()),
            ..Self::default()
        }
    }

    pub fn with_ack(mut self, timeout: Option<Duration>) -> Self {
        self.await_ack = true;
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStats {
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub queue_length: usize,
    pub pending_acks: usize,
    pub subscriptions: usize,
    pub bindings: Vec<ChannelBinding>,
}

#[derive(Default)]
struct Inner {
    state: ConnectionState,
    attempts: u32,
    /// Bumped whenever the current connection is abandoned; stale reader,
    /// heartbeat and connect futures compare against it.
    generation: u64,
    /// The last connect failed on credentials and a refresh was tried.
    auth_retry: bool,
    explicit_token: Option<String>,
    default_channel: Option<String>,
}

pub struct ConnectionManager {
    weak: Weak<ConnectionManager>,
    config: RwLock<SyncConfig>,
    clock: SharedClock,
    transport: SharedTransport,
    publisher: SharedPublisher,
    tokens: Arc<TokenManager>,
    inner: Mutex<Inner>,
    registry: Mutex<SubscriptionRegistry>,
    queue: Mutex<OutboundQueue>,
    pending_acks: DashMap<String, oneshot::Sender<Ack>>,
    reader: TaskSlot,
    heartbeat: TaskSlot,
    reconnect_timer: TaskSlot,
    flusher: TaskSlot,
    state_listeners: Listeners<ConnectionState>,
    error_listeners: Listeners<SyncError>,
    disconnect_listeners: Listeners<String>,
}

impl ConnectionManager {
    pub fn new(
        config: SyncConfig,
        clock: SharedClock,
        transport: SharedTransport,
        publisher: SharedPublisher,
        tokens: Arc<TokenManager>,
    ) -> Arc<Self> {
        let queue = OutboundQueue::new(config.queue.max_length);
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            config: RwLock::new(config),
            clock,
            transport,
            publisher,
            tokens,
            inner: Mutex::new(Inner::default()),
            registry: Mutex::new(SubscriptionRegistry::new()),
            queue: Mutex::new(queue),
            pending_acks: DashMap::new(),
            reader: TaskSlot::new(),
            heartbeat: TaskSlot::new(),
            reconnect_timer: TaskSlot::new(),
            flusher: TaskSlot::new(),
            state_listeners: Listeners::new(),
            error_listeners: Listeners::new(),
            disconnect_listeners: Listeners::new(),
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Observers
    // ─────────────────────────────────────────────────────────────────────

    pub fn on_state_change(
        &self,
        handler: impl Fn(&ConnectionState) + Send + Sync + 'static,
    ) -> ListenerId {
        self.state_listeners.add(handler)
    }

    pub fn remove_state_listener(&self, id: ListenerId) -> bool {
        self.state_listeners.remove(id)
    }

    /// Non-blocking error reporting. Recoverable errors are retried internally
    /// and only surface here.
    pub fn on_error(&self, handler: impl Fn(&SyncError) + Send + Sync + 'static) -> ListenerId {
        self.error_listeners.add(handler)
    }

    pub fn remove_error_listener(&self, id: ListenerId) -> bool {
        self.error_listeners.remove(id)
    }

    pub fn on_disconnect(&self, handler: impl Fn(&String) + Send + Sync + 'static) -> ListenerId {
        self.disconnect_listeners.add(handler)
    }

    pub fn remove_disconnect_listener(&self, id: ListenerId) -> bool {
        self.disconnect_listeners.remove(id)
    }

    // ─────────────────────────────────────────────────────────────────────
    // State
    // ─────────────────────────────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn set_default_channel(&self, channel: Option<&str>) {
        self.inner.lock().default_channel = channel.map(sanitize_channel_name);
    }

    pub fn stats(&self) -> ConnectionStats {
        let (state, reconnect_attempts) = {
            let inner = self.inner.lock();
            (inner.state, inner.attempts)
        };
        let registry = self.registry.lock();
        ConnectionStats {
            state,
            reconnect_attempts,
            queue_length: self.queue.lock().len(),
            pending_acks: self.pending_acks.len(),
            subscriptions: registry.subscription_count(),
            bindings: registry.bindings(),
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = std::mem::replace(&mut self.inner.lock().state, next);
        if previous != next {
            info!("Connection {previous} -> {next}");
            self.state_listeners.emit(&next);
        }
    }

    fn report(&self, err: SyncError) {
        if err.is_recoverable() {
            warn!("[{}] {err}", err.code());
        } else {
            error!("[{}] {err}", err.code());
        }
        self.error_listeners.emit(&err);
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.lock().generation == generation
    }

    // ─────────────────────────────────────────────────────────────────────
    // Connect / disconnect
    // ─────────────────────────────────────────────────────────────────────

    /// Connect with `token`, the current token, or (outside production) a
    /// development placeholder. No-op while connected or connecting. Without
    /// a realtime provider this succeeds and stays disconnected.
    pub async fn connect(&self, token: Option<String>) -> Result<(), SyncError> {
        {
            let mut inner = self.inner.lock();
            if matches!(inner.state, ConnectionState::Connected | ConnectionState::Connecting) {
                debug!("connect() ignored in state {}", inner.state);
                return Ok(());
            }
            // A manual connect from rest starts a fresh reconnect budget
            if matches!(inner.state, ConnectionState::Error | ConnectionState::Disconnected) {
                inner.attempts = 0;
                inner.auth_retry = false;
            }
            if token.is_some() {
                inner.explicit_token = token.clone();
            }
        }
        if self.config.read().realtime.is_none() {
            warn!("No realtime provider configured, running without a connection");
            return Ok(());
        }
        let token = match token.or_else(|| self.tokens.access_token()) {
            Some(token) => token,
            None => match self.tokens.restore() {
                Some(restored) => restored.token,
                None => self.fallback_token().ok_or(SyncError::NotAuthenticated)?,
            },
        };
        self.reconnect_timer.cancel();
        self.establish(token).await
    }

    /// Drop the connection and connect again, e.g. after a token change.
    pub async fn reconnect(&self, token: Option<String>) -> Result<(), SyncError> {
        self.disconnect("reconnect");
        self.connect(token).await
    }

    /// Token used when no login exists: an explicitly supplied one, else a
    /// placeholder in non-production builds.
    fn fallback_token(&self) -> Option<String> {
        if let Some(token) = self.inner.lock().explicit_token.clone() {
            return Some(token);
        }
        if self.config.read().production {
            return None;
        }
        warn!("No token available, using a development placeholder");
        Some(placeholder_token(self.clock.now_ms(), DEV_TOKEN_TTL_MS))
    }

    async fn establish(&self, token: String) -> Result<(), SyncError> {
        let generation = {
            let mut inner = self.inner.lock();
            inner.generation += 1;
            inner.generation
        };
        self.set_state(ConnectionState::Connecting);
        debug!("Connecting via {}", self.transport.name_dyn());

        match self.transport.connect_dyn(&token).await {
            Ok(events) => {
                if !self.is_current(generation) {
                    debug!("Connection superseded during handshake");
                    if self.state() == ConnectionState::Disconnected {
                        self.transport.close_dyn();
                    }
                    return Ok(());
                }
                {
                    let mut inner = self.inner.lock();
                    inner.attempts = 0;
                    inner.auth_retry = false;
                }
                self.set_state(ConnectionState::Connected);
                self.start_reader(generation, events);
                self.start_heartbeat(generation);
                self.rebind_all().await;
                self.schedule_flush();
                Ok(())
            }
            Err(e) => {
                let err = SyncError::ConnectionFailed(e.to_string());
                if !self.is_current(generation) {
                    return Err(err);
                }
                self.report(err.clone());
                if e.is_unauthorized() {
                    self.handle_auth_failure(&e.to_string());
                } else {
                    self.schedule_reconnect();
                }
                Err(err)
            }
        }
    }

    /// Tear everything down and go to DISCONNECTED. Always succeeds. Queued
    /// messages and ack waiters are kept for the next connection; an ack
    /// wait only ends with its ack or its deadline.
    pub fn disconnect(&self, reason: &str) {
        let previous = {
            let mut inner = self.inner.lock();
            inner.generation += 1;
            inner.attempts = 0;
            inner.auth_retry = false;
            inner.state
        };
        self.reconnect_timer.cancel();
        self.heartbeat.cancel();
        self.reader.cancel();
        if previous == ConnectionState::Disconnected {
            return;
        }

        self.set_state(ConnectionState::Disconnecting);
        self.registry.lock().mark_all_unbound();
        self.transport.close_dyn();
        self.set_state(ConnectionState::Disconnected);
        info!("Disconnected: {reason}");
        self.disconnect_listeners.emit(&reason.to_string());
    }

    /// The connection of `generation` went away without a local disconnect.
    fn connection_lost(&self, generation: u64, reason: String, auth_failure: bool) {
        {
            let mut inner = self.inner.lock();
            if inner.generation != generation || inner.state != ConnectionState::Connected {
                return;
            }
            inner.generation += 1;
        }
        self.heartbeat.cancel();
        self.registry.lock().mark_all_unbound();
        self.transport.close_dyn();
        warn!("Connection lost: {reason}");
        self.disconnect_listeners.emit(&reason);
        self.report(SyncError::ConnectionError(reason.clone()));

        if auth_failure {
            self.handle_auth_failure(&reason);
        } else {
            self.schedule_reconnect();
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Reconnect policy
    // ─────────────────────────────────────────────────────────────────────

    fn schedule_reconnect(&self) {
        let reconnect = self.config.read().reconnect.clone();
        if !reconnect.enabled {
            info!("Reconnect disabled");
            self.set_state(ConnectionState::Disconnected);
            return;
        }
        let attempt = {
            let mut inner = self.inner.lock();
            inner.attempts += 1;
            inner.attempts
        };
        if let Some(max) = reconnect.max_attempts {
            if attempt > max {
                self.set_state(ConnectionState::Error);
                self.report(SyncError::MaxReconnectAttempts(max));
                return;
            }
        }

        let delay = Backoff::from_config(&reconnect).delay(attempt);
        self.set_state(ConnectionState::Reconnecting);
        info!("Reconnect attempt {attempt} in {}ms", delay.as_millis());

        let weak = self.weak.clone();
        self.reconnect_timer.spawn(move |ticket| async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = weak.upgrade() {
                manager.retry(ticket).await;
            }
        });
    }

    /// One reconnect attempt: make sure the token has enough life left, then
    /// connect.
    async fn retry(&self, ticket: Ticket) {
        if !self.reconnect_timer.release(ticket) {
            return;
        }
        let margin = self.config.read().token.validity_margin_ms;
        let token = match self.tokens.ensure_fresh(margin).await {
            Ok(token) => token,
            Err(SyncError::NotAuthenticated) => match self.fallback_token() {
                Some(token) => token,
                None => {
                    self.report(SyncError::NotAuthenticated);
                    self.abandon_reconnect();
                    return;
                }
            },
            Err(e) if e.is_recoverable() => {
                self.report(e);
                self.schedule_reconnect();
                return;
            }
            Err(e) => {
                self.report(e);
                self.abandon_reconnect();
                return;
            }
        };
        if self.state() != ConnectionState::Reconnecting {
            return;
        }
        // Failures reschedule themselves
        let _ = self.establish(token).await;
    }

    fn abandon_reconnect(&self) {
        if self.state() == ConnectionState::Reconnecting {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Credentials were rejected: refresh and reconnect instead of backing
    /// off. A second consecutive rejection falls back to the backoff path.
    fn handle_auth_failure(&self, reason: &str) {
        let repeated = std::mem::replace(&mut self.inner.lock().auth_retry, true);
        if repeated {
            warn!("Credentials rejected again after refresh, backing off");
            self.schedule_reconnect();
            return;
        }
        info!("Credentials rejected ({reason}), refreshing token before reconnecting");
        self.set_state(ConnectionState::Reconnecting);

        let weak = self.weak.clone();
        self.reconnect_timer.spawn(move |ticket| async move {
            let Some(manager) = weak.upgrade() else {
                return;
            };
            if !manager.reconnect_timer.release(ticket) {
                return;
            }
            match manager.tokens.refresh(None).await {
                Ok(token) => {
                    if manager.state() == ConnectionState::Reconnecting {
                        let _ = manager.establish(token.token).await;
                    }
                }
                Err(e) if e.is_recoverable() => {
                    manager.report(e);
                    manager.schedule_reconnect();
                }
                Err(e) => {
                    manager.report(e);
                    manager.abandon_reconnect();
                }
            }
        });
    }

    // ─────────────────────────────────────────────────────────────────────
    // Background tasks
    // ─────────────────────────────────────────────────────────────────────

    fn start_reader(&self, generation: u64, mut events: EventStream) {
        let weak = self.weak.clone();
        self.reader.spawn(move |ticket| async move {
            while let Some(event) = events.recv().await {
                let Some(manager) = weak.upgrade() else {
                    return;
                };
                let lost = match event {
                    TransportEvent::Message(event) => {
                        manager.dispatch_event(event);
                        None
                    }
                    TransportEvent::Bound(channel) => {
                        trace!("Bound {channel}");
                        manager.registry.lock().mark_bound(&channel);
                        None
                    }
                    TransportEvent::SubscriptionError { channel, message } => {
                        manager.registry.lock().mark_unbound(&channel);
                        manager.report(SyncError::subscription(channel, message));
                        None
                    }
                    TransportEvent::Error(message) => {
                        manager.report(SyncError::ConnectionError(message));
                        None
                    }
                    TransportEvent::Unauthorized(message) => Some((message, true)),
                    TransportEvent::Closed { code, reason } => {
                        let auth = is_auth_failure(code, &reason);
                        Some((reason, auth))
                    }
                };
                if let Some((reason, auth)) = lost {
                    manager.reader.release(ticket);
                    manager.connection_lost(generation, reason, auth);
                    return;
                }
            }
            if let Some(manager) = weak.upgrade() {
                manager.reader.release(ticket);
                manager.connection_lost(generation, "transport closed".into(), false);
            }
        });
    }

    fn dispatch_event(&self, event: RealtimeEvent) {
        if let Some(message_id) = event.acked_message_id() {
            if let Some((_, waiter)) = self.pending_acks.remove(message_id) {
                let _ = waiter.send(Ack {
                    message_id: message_id.to_string(),
                    data: event.data.clone(),
                });
            }
        }
        let handlers = self.registry.lock().handlers_for(&event);
        trace!("{} on {} -> {} handler(s)", event.event, event.channel, handlers.len());
        for handler in handlers {
            handler(&event);
        }
    }

    fn start_heartbeat(&self, generation: u64) {
        let Some(interval) = self.config.read().heartbeat_interval() else {
            return;
        };
        let weak = self.weak.clone();
        self.heartbeat.spawn(move |ticket| async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(manager) = weak.upgrade() else {
                    return;
                };
                if !manager.is_current(generation) {
                    return;
                }
                if let Err(e) = manager.transport.ping_dyn().await {
                    manager.heartbeat.release(ticket);
                    manager.connection_lost(generation, format!("heartbeat failed: {e}"), false);
                    return;
                }
                trace!("Heartbeat ok");
            }
        });
    }

    // ─────────────────────────────────────────────────────────────────────
    // Subscriptions
    // ─────────────────────────────────────────────────────────────────────

    pub async fn subscribe(
        &self,
        channel: &str,
        handler: impl Fn(&RealtimeEvent) + Send + Sync + 'static,
    ) -> Result<SubscriptionId, SyncError> {
        self.subscribe_with_filter(channel, handler, None).await
    }

    /// Register a handler on `channel`. The first subscription to a channel
    /// binds it when connected; otherwise binding waits for the next connect.
    pub async fn subscribe_with_filter(
        &self,
        channel: &str,
        handler: impl Fn(&RealtimeEvent) + Send + Sync + 'static,
        filter: Option<EventFilter>,
    ) -> Result<SubscriptionId, SyncError> {
        let channel = sanitize_channel_name(channel);
        if channel.is_empty() {
            return Err(SyncError::subscription(channel, "empty channel name"));
        }
        let (id, first) = self.registry.lock().add(&channel, Arc::new(handler), filter);
        debug!("Subscribed {id:?} to {channel}");
        if first && self.is_connected() {
            self.bind_channel(&channel).await;
        }
        Ok(id)
    }

    /// Returns false for an unknown id.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Some((channel, last)) = self.registry.lock().remove(id) else {
            return false;
        };
        debug!("Unsubscribed {id:?} from {channel}");
        if last && self.is_connected() {
            if let Err(e) = self.transport.unbind_dyn(&channel).await {
                debug!("Unbind {channel} failed: {e}");
            }
        }
        true
    }

    async fn bind_channel(&self, channel: &str) {
        match self.transport.bind_dyn(channel).await {
            Ok(()) => {
                let still_wanted = self.registry.lock().mark_bound(channel);
                if !still_wanted {
                    // Unsubscribed while the bind was in flight
                    let _ = self.transport.unbind_dyn(channel).await;
                }
            }
            Err(e) => self.report(SyncError::subscription(channel, e.to_string())),
        }
    }

    async fn rebind_all(&self) {
        let channels = self.registry.lock().channels();
        if !channels.is_empty() {
            debug!("Binding {} channel(s)", channels.len());
        }
        for channel in channels {
            self.bind_channel(&channel).await;
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Outbound
    // ─────────────────────────────────────────────────────────────────────

    /// Publish through the backend trigger. Messages go through the FIFO
    /// queue, so anything queued while disconnected is delivered first.
    ///
    /// With `await_ack`, resolves with the acknowledgement or fails with
    /// `AckTimeout` once the deadline passes, whether or not delivery
    /// succeeded.
    pub async fn send(
        &self,
        message_type: &str,
        payload: JsonValue,
        options: SendOptions,
    ) -> Result<Option<Ack>, SyncError> {
        let channel = options
            .channel
            .as_deref()
            .map(sanitize_channel_name)
            .or_else(|| self.inner.lock().default_channel.clone())
            .ok_or_else(|| SyncError::SendError("no channel given and no default channel".into()))?;
        let message_id = uuid::Uuid::new_v4().to_string();
        let request = PublishRequest {
            channel,
            event: options.event.clone().unwrap_or_else(|| message_type.to_string()),
            message_type: message_type.to_string(),
            payload,
            message_id: message_id.clone(),
        };

        let (ack_timeout, max_attempts) = {
            let config = self.config.read();
            (options.timeout.unwrap_or_else(|| config.ack_timeout()), config.queue.max_attempts)
        };
        let deadline = Instant::now() + ack_timeout;
        let ack = if options.await_ack {
            let (tx, rx) = oneshot::channel();
            self.pending_acks.insert(message_id.clone(), tx);
            Some(rx)
        } else {
            None
        };

        let (message, delivery) = QueuedMessage::new(request, self.clock.now_ms(), max_attempts);
        self.queue.lock().push(message);
        if self.is_connected() {
            self.schedule_flush();
        } else {
            debug!("Queued {message_id} while {}", self.state());
        }

        let Some(ack) = ack else {
            return delivery
                .await
                .unwrap_or_else(|_| Err(SyncError::SendError("message dropped".into())))
                .map(|_| None);
        };

        let timeout_ms = ack_timeout.as_millis() as u64;
        let outcome = tokio::time::timeout_at(deadline, async {
            delivery
                .await
                .unwrap_or_else(|_| Err(SyncError::SendError("message dropped".into())))?;
            ack.await.map_err(|_| {
                SyncError::SendError("connection closed before acknowledgement".into())
            })
        })
        .await;
        match outcome {
            Ok(result) => {
                self.pending_acks.remove(&message_id);
                result.map(Some)
            }
            Err(_) => {
                self.pending_acks.remove(&message_id);
                Err(SyncError::AckTimeout(timeout_ms))
            }
        }
    }

    /// Fail and drop every queued message.
    pub fn clear_queue(&self) -> usize {
        let dropped = self.queue.lock().clear("queue cleared");
        if dropped > 0 {
            info!("Dropped {dropped} queued message(s)");
        }
        dropped
    }

    fn schedule_flush(&self) {
        {
            let mut queue = self.queue.lock();
            if queue.flushing || queue.is_empty() {
                return;
            }
            queue.flushing = true;
        }
        let weak = self.weak.clone();
        self.flusher.spawn(move |_| async move {
            if let Some(manager) = weak.upgrade() {
                manager.flush().await;
            }
        });
    }

    /// Deliver queued messages strictly in order until the queue is empty or
    /// the connection drops.
    async fn flush(&self) {
        let mut guard = FlushGuard {
            queue: &self.queue,
            armed: true,
        };
        let retry_delay = Duration::from_millis(self.config.read().queue.retry_delay_ms);
        loop {
            let next = {
                let mut queue = self.queue.lock();
                let next = if self.is_connected() { queue.pop_front() } else { None };
                if next.is_none() {
                    // Cleared under the lock: a push after this point schedules a new flush
                    queue.flushing = false;
                    guard.armed = false;
                }
                next
            };
            let Some(mut message) = next else {
                return;
            };

            message.attempt_count += 1;
            let token = self
                .tokens
                .access_token()
                .or_else(|| self.inner.lock().explicit_token.clone());
            match self.publisher.publish_dyn(token.as_deref(), &message.request).await {
                Ok(()) => {
                    trace!("Delivered {}", message.request.message_id);
                    message.succeed();
                }
                Err(e) if message.exhausted() => {
                    let err = SyncError::SendError(e.to_string());
                    self.report(err.clone());
                    message.fail(err);
                }
                Err(e) => {
                    debug!(
                        "Publish of {} failed (attempt {}/{}): {e}",
                        message.request.message_id, message.attempt_count, message.max_attempts
                    );
                    self.queue.lock().retry_front(message);
                    tokio::time::sleep(retry_delay).await;
                }
            }
        }
    }
}

/// Clears the flushing flag if a flush is cancelled before draining.
struct FlushGuard<'a> {
    queue: &'a Mutex<OutboundQueue>,
    armed: bool,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.queue.lock().flushing = false;
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.reconnect_timer.cancel();
        self.heartbeat.cancel();
        self.reader.cancel();
        self.flusher.cancel();
        self.transport.close_dyn();
    }
}
