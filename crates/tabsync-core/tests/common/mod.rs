//! In-memory collaborators shared by the core integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use parking_lot::Mutex;
use serde_json::json;
use tabsync_core::config::RealtimeConfig;
use tabsync_core::{
    ApiError, AuthApi, BroadcastHub, Clock, MemoryStateStore, MemoryStorage, Publisher,
    RuntimeClock, SyncConfig, Tab, TabDeps, TokenPair,
};
use tabsync_protocol::PublishRequest;
use tabsync_transport::{EventStream, Transport, TransportError, TransportEvent};
use tokio::sync::mpsc;

/// 2023-11-14T22:13:20Z
pub const EPOCH_MS: i64 = 1_700_000_000_000;
pub const MINUTE_MS: i64 = 60_000;

/// Unsigned JWT with the given expiry (ms) and subject.
pub fn jwt(exp_ms: i64, sub: &str) -> String {
    jwt_n(exp_ms, sub, 0)
}

/// Like [`jwt`], with a `jti` so tokens minted in the same instant differ.
pub fn jwt_n(exp_ms: i64, sub: &str, n: u32) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let claims = json!({ "sub": sub, "exp": exp_ms / 1000, "jti": n });
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.sig")
}

/// Let spawned tasks run without moving the paused clock.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Advance the paused clock by `ms`, then settle.
pub async fn advance_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
    settle().await;
}

pub fn test_config() -> SyncConfig {
    let mut config = SyncConfig {
        realtime: Some(RealtimeConfig {
            url: "ws://provider.test/ws".into(),
            trigger_url: Some("http://backend.test/trigger".into()),
        }),
        heartbeat_interval_ms: 0,
        ..SyncConfig::default()
    };
    config.queue.retry_delay_ms = 100;
    config
}

// ─────────────────────────────────────────────────────────────────────────────
// Transport
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockTransport {
    pub connect_tokens: Mutex<Vec<String>>,
    pub binds: Mutex<Vec<String>>,
    pub unbinds: Mutex<Vec<String>>,
    pub closes: AtomicU32,
    /// Scripted connect outcomes; succeeds once the script runs out.
    pub script: Mutex<VecDeque<Result<(), TransportError>>>,
    pub always_fail: AtomicBool,
    pub pings: AtomicU32,
    /// Pings time out, as on a half-open socket.
    pub ping_fails: AtomicBool,
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
}

impl MockTransport {
    pub fn failing() -> Self {
        let transport = Self::default();
        transport.always_fail.store(true, Ordering::SeqCst);
        transport
    }

    pub fn script(&self, outcome: Result<(), TransportError>) {
        self.script.lock().push_back(outcome);
    }

    pub fn connects(&self) -> usize {
        self.connect_tokens.lock().len()
    }

    pub fn last_token(&self) -> Option<String> {
        self.connect_tokens.lock().last().cloned()
    }

    /// Deliver an event on the live connection.
    pub fn push(&self, event: TransportEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    /// The provider closes the connection.
    pub fn drop_connection(&self, code: Option<u16>, reason: &str) {
        self.push(TransportEvent::Closed {
            code,
            reason: reason.to_string(),
        });
        self.events.lock().take();
    }
}

impl Transport for MockTransport {
    async fn connect(&self, token: &str) -> Result<EventStream, TransportError> {
        self.connect_tokens.lock().push(token.to_string());
        if self.always_fail.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("connection refused".into()));
        }
        if let Some(Err(e)) = self.script.lock().pop_front() {
            return Err(e);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock() = Some(tx);
        Ok(rx)
    }

    async fn bind(&self, channel: &str) -> Result<(), TransportError> {
        self.binds.lock().push(channel.to_string());
        Ok(())
    }

    async fn unbind(&self, channel: &str) -> Result<(), TransportError> {
        self.unbinds.lock().push(channel.to_string());
        Ok(())
    }

    async fn ping(&self) -> Result<(), TransportError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if self.ping_fails.load(Ordering::SeqCst) {
            return Err(TransportError::Timeout);
        }
        Ok(())
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.events.lock().take();
    }

    fn name(&self) -> &str {
        "mock"
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP collaborators
// ─────────────────────────────────────────────────────────────────────────────

pub struct MockAuthApi {
    clock: Arc<dyn Clock>,
    pub refresh_calls: AtomicU32,
    pub logout_calls: AtomicU32,
    /// Scripted refresh outcomes; issues a one-hour token once exhausted.
    pub script: Mutex<VecDeque<Result<TokenPair, ApiError>>>,
    pub latency: Mutex<Duration>,
}

impl MockAuthApi {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            refresh_calls: AtomicU32::new(0),
            logout_calls: AtomicU32::new(0),
            script: Mutex::new(VecDeque::new()),
            latency: Mutex::new(Duration::ZERO),
        }
    }

    pub fn script(&self, outcome: Result<TokenPair, ApiError>) {
        self.script.lock().push_back(outcome);
    }

    pub fn refreshes(&self) -> u32 {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

impl AuthApi for MockAuthApi {
    async fn refresh_token(&self, _refresh_token: &str) -> Result<TokenPair, ApiError> {
        let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if let Some(outcome) = self.script.lock().pop_front() {
            return outcome;
        }
        Ok(TokenPair {
            token: jwt_n(self.clock.now_ms() + 60 * MINUTE_MS, "user-1", n),
            refresh_token: Some(format!("refresh-{n}")),
        })
    }

    async fn logout(&self, _access_token: Option<&str>) -> Result<(), ApiError> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockPublisher {
    pub published: Mutex<Vec<PublishRequest>>,
    pub failures_left: AtomicU32,
}

impl MockPublisher {
    pub fn message_types(&self) -> Vec<String> {
        self.published.lock().iter().map(|r| r.message_type.clone()).collect()
    }
}

impl Publisher for MockPublisher {
    async fn publish(
        &self,
        _access_token: Option<&str>,
        request: &PublishRequest,
    ) -> Result<(), ApiError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ApiError::Status {
                status: 503,
                message: "unavailable".into(),
            });
        }
        self.published.lock().push(request.clone());
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Origin / tab harness
// ─────────────────────────────────────────────────────────────────────────────

/// Storage, hub and clock shared by every tab of one origin.
pub struct Origin {
    pub storage: MemoryStorage,
    pub hub: Option<BroadcastHub>,
    pub clock: Arc<RuntimeClock>,
}

impl Origin {
    pub fn new() -> Self {
        Self {
            storage: MemoryStorage::new(),
            hub: Some(BroadcastHub::new()),
            clock: Arc::new(RuntimeClock::starting_at(EPOCH_MS)),
        }
    }

    /// An origin without a direct broadcast primitive.
    pub fn storage_only() -> Self {
        Self {
            hub: None,
            ..Self::new()
        }
    }

    pub fn now(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn tab(&self, config: SyncConfig) -> TestTab {
        self.tab_with(config, MockTransport::default())
    }

    pub fn tab_with(&self, config: SyncConfig, transport: MockTransport) -> TestTab {
        let transport = Arc::new(transport);
        let api = Arc::new(MockAuthApi::new(self.clock.clone()));
        let publisher = Arc::new(MockPublisher::default());
        let state = Arc::new(MemoryStateStore::new());
        let tab = Tab::new(
            config,
            TabDeps {
                storage: Arc::new(self.storage.clone()),
                hub: self.hub.clone(),
                transport: transport.clone(),
                api: api.clone(),
                publisher: publisher.clone(),
                state: state.clone(),
                clock: self.clock.clone(),
            },
        );
        TestTab {
            tab,
            transport,
            api,
            publisher,
            state,
        }
    }
}

pub struct TestTab {
    pub tab: Arc<Tab>,
    pub transport: Arc<MockTransport>,
    pub api: Arc<MockAuthApi>,
    pub publisher: Arc<MockPublisher>,
    pub state: Arc<MemoryStateStore>,
}
