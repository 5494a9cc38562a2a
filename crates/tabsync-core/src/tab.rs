//! One tab: the explicitly constructed set of managers sharing an origin's
//! storage and broadcast hub with its sibling tabs.
//!
//! Wiring between the managers:
//!
//! - token replaced while connected -> silent reconnect with the new token
//! - tokens cleared -> disconnect, drop the queue, stop session monitoring
//! - session expired -> logout in every tab
//! - cross-tab message -> adopt or clear the token locally

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tabsync_protocol::token::peek_claim;
use tabsync_protocol::{CrossTabEvent, CrossTabMessage, RealtimeEvent, SyncError, user_channel};
use tabsync_transport::SharedTransport;
use tracing::{debug, info, warn};

use crate::api::{SharedAuthApi, SharedPublisher};
use crate::bus::{BroadcastBus, BroadcastHub};
use crate::clock::SharedClock;
use crate::config::SyncConfig;
use crate::connection::{ConnectionManager, SubscriptionId};
use crate::observer::{ListenerId, Listeners};
use crate::session::{SessionMonitor, SessionPhase};
use crate::storage::SharedStorage;
use crate::store::{Action, Notification, StateStore, user_id_of};
use crate::token::{TokenEvent, TokenManager};
use crate::token_store::{SessionMetadata, TokenStore};

/// Collaborators of a tab. Tabs of one origin share `storage` and `hub`.
#[derive(Clone)]
pub struct TabDeps {
    pub storage: Arc<dyn SharedStorage>,
    /// `None` makes the bus fall back to storage signals.
    pub hub: Option<BroadcastHub>,
    pub transport: SharedTransport,
    pub api: SharedAuthApi,
    pub publisher: SharedPublisher,
    pub state: Arc<dyn StateStore>,
    pub clock: SharedClock,
}

pub struct Tab {
    id: String,
    clock: SharedClock,
    state: Arc<dyn StateStore>,
    store: TokenStore,
    api: SharedAuthApi,
    bus: Arc<BroadcastBus>,
    tokens: Arc<TokenManager>,
    connection: Arc<ConnectionManager>,
    session: Arc<SessionMonitor>,
    user_subscription: Mutex<Option<SubscriptionId>>,
    user_events: Arc<Listeners<RealtimeEvent>>,
}

impl Tab {
    pub fn new(config: SyncConfig, deps: TabDeps) -> Arc<Self> {
        let id = uuid::Uuid::new_v4().to_string();
        let store = TokenStore::new(deps.storage.clone());
        let bus = Arc::new(BroadcastBus::new(
            id.clone(),
            deps.clock.clone(),
            deps.storage.clone(),
            deps.hub.clone(),
        ));
        let tokens = TokenManager::new(
            config.token.clone(),
            deps.clock.clone(),
            store.clone(),
            deps.api.clone(),
            bus.clone(),
            deps.state.clone(),
        );
        let session =
            SessionMonitor::new(config.session.clone(), deps.clock.clone(), deps.state.clone());
        let connection = ConnectionManager::new(
            config,
            deps.clock.clone(),
            deps.transport,
            deps.publisher,
            tokens.clone(),
        );

        let tab = Arc::new_cyclic(|weak: &Weak<Tab>| {
            wire(weak, &bus, &tokens, &connection, &session, &deps.state);
            Self {
                id,
                clock: deps.clock,
                state: deps.state,
                store,
                api: deps.api,
                bus,
                tokens,
                connection,
                session,
                user_subscription: Mutex::new(None),
                user_events: Arc::new(Listeners::new()),
            }
        });
        debug!("Tab {} created (cross-tab via {})", tab.id, tab.bus.channel_name());
        tab
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    pub fn session(&self) -> &Arc<SessionMonitor> {
        &self.session
    }

    pub fn bus(&self) -> &Arc<BroadcastBus> {
        &self.bus
    }

    /// Events delivered on the signed-in user's private channel.
    pub fn on_user_event(
        &self,
        handler: impl Fn(&RealtimeEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.user_events.add(handler)
    }

    /// Restore a stored login and connect with it.
    pub async fn start(&self) -> Result<(), SyncError> {
        self.bus.start();
        let Some(token) = self.tokens.restore() else {
            info!("Tab {} started signed out", self.id);
            return Ok(());
        };
        let user_id = self
            .store
            .session_metadata()
            .map(|m| m.user_id)
            .or_else(|| self.state.get_state().user_id)
            .or_else(|| peek_claim(&token.token, "sub"));
        info!("Tab {} restored session for {:?}", self.id, user_id);
        self.session.start(user_id.clone());
        if let Some(user_id) = &user_id {
            self.subscribe_user_channel(user_id).await;
        }
        self.connect_quietly(None).await;
        Ok(())
    }

    pub async fn login(
        &self,
        token: &str,
        refresh_token: Option<String>,
        user: JsonValue,
    ) -> Result<(), SyncError> {
        let user_id = user_id_of(&user).or_else(|| peek_claim(token, "sub"));
        self.tokens.login(token, refresh_token, user.clone())?;
        if let Some(user_id) = &user_id {
            let metadata = SessionMetadata {
                user_id: user_id.clone(),
                session_id: uuid::Uuid::new_v4().to_string(),
                login_at_ms: self.clock.now_ms(),
            };
            if let Err(e) = self.store.write_session_metadata(&metadata) {
                warn!("Failed to store session metadata: {e}");
            }
        }
        self.state.dispatch(Action::LoginSuccess { user });
        self.session.start(user_id.clone());
        if let Some(user_id) = &user_id {
            self.subscribe_user_channel(user_id).await;
        }
        self.connect_quietly(Some(token.to_string())).await;
        Ok(())
    }

    /// User-initiated logout. The server call runs in the background and its
    /// failure never blocks the local logout.
    pub fn logout(&self) {
        let access_token = self.tokens.access_token();
        let api = self.api.clone();
        tokio::spawn(async move {
            if let Err(e) = api.logout_dyn(access_token.as_deref()).await {
                warn!("Server logout failed: {e}");
            }
        });
        let reason = "User logged out";
        if self.tokens.clear(reason) {
            if let Err(e) = self.bus.broadcast(CrossTabEvent::Logout { reason: None }) {
                warn!("Failed to broadcast logout: {e}");
            }
            self.state.dispatch(Action::Logout {
                reason: reason.to_string(),
            });
        }
    }

    /// Inactivity timeout: end the session here and in every sibling tab.
    pub fn expire_session(&self) {
        let reason = "Session expired";
        if !self.tokens.clear(reason) {
            return;
        }
        if let Err(e) = self.bus.broadcast(CrossTabEvent::SessionExpired) {
            warn!("Failed to broadcast session expiry: {e}");
        }
        self.state.dispatch(Action::Logout {
            reason: reason.to_string(),
        });
        self.state.dispatch(Action::Notify(Notification::warning(
            "Your session expired due to inactivity",
        )));
        self.tokens.redirect_to_login();
    }

    /// Apply a message from a sibling tab. Every branch is idempotent.
    pub async fn handle_cross_tab(&self, message: &CrossTabMessage) {
        match &message.event {
            CrossTabEvent::Login {
                token,
                refresh_token,
                user,
            } => {
                let changed = match self.tokens.apply_external(token, refresh_token.clone()) {
                    Ok(changed) => changed,
                    Err(e) => {
                        warn!("Failed to adopt login from another tab: {e}");
                        return;
                    }
                };
                if !changed {
                    return;
                }
                self.state.dispatch(Action::LoginSuccess { user: user.clone() });
                let user_id = user_id_of(user).or_else(|| peek_claim(token, "sub"));
                self.session.start(user_id.clone());
                if let Some(user_id) = &user_id {
                    self.subscribe_user_channel(user_id).await;
                }
                if !self.connection.is_connected() {
                    self.connect_quietly(Some(token.clone())).await;
                }
            }
            CrossTabEvent::TokenRefreshed { token, refresh_token } => {
                if let Err(e) = self.tokens.apply_external(token, refresh_token.clone()) {
                    warn!("Failed to adopt refreshed token: {e}");
                }
            }
            CrossTabEvent::Logout { .. } | CrossTabEvent::SessionExpired => {
                let reason = match &message.event {
                    CrossTabEvent::SessionExpired => "Session expired in another tab",
                    _ => "Signed out in another tab",
                };
                if self.tokens.clear(reason) {
                    self.state.dispatch(Action::Logout {
                        reason: reason.to_string(),
                    });
                    self.state.dispatch(Action::Notify(Notification::info(
                        "You were signed out elsewhere",
                    )));
                }
            }
        }
    }

    pub fn shutdown(&self) {
        self.session.stop();
        self.bus.stop();
        self.tokens.cancel_refresh();
        self.connection.disconnect("shutdown");
        info!("Tab {} shut down", self.id);
    }

    async fn connect_quietly(&self, token: Option<String>) {
        if let Err(e) = self.connection.connect(token).await {
            // The reconnect policy takes over from here
            debug!("Initial connect failed: {e}");
        }
    }

    async fn subscribe_user_channel(&self, user_id: &str) {
        let previous = self.user_subscription.lock().take();
        if let Some(previous) = previous {
            self.connection.unsubscribe(previous).await;
        }
        let listeners = self.user_events.clone();
        match self
            .connection
            .subscribe(&user_channel(user_id), move |event| listeners.emit(event))
            .await
        {
            Ok(id) => *self.user_subscription.lock() = Some(id),
            Err(e) => warn!("Failed to subscribe to the user channel: {e}"),
        }
    }

    fn drop_user_subscription(&self) {
        let Some(id) = self.user_subscription.lock().take() else {
            return;
        };
        let connection = self.connection.clone();
        tokio::spawn(async move {
            connection.unsubscribe(id).await;
        });
    }
}

fn wire(
    tab: &Weak<Tab>,
    bus: &Arc<BroadcastBus>,
    tokens: &Arc<TokenManager>,
    connection: &Arc<ConnectionManager>,
    session: &Arc<SessionMonitor>,
    state: &Arc<dyn StateStore>,
) {
    let weak = tab.clone();
    tokens.on_event(move |event| {
        let Some(tab) = weak.upgrade() else {
            return;
        };
        match event {
            TokenEvent::Updated { token, origin } => {
                if !tab.connection.is_connected() {
                    return;
                }
                debug!("Token replaced ({origin:?}), reconnecting with new credentials");
                let connection = tab.connection.clone();
                let token = token.token.clone();
                tokio::spawn(async move {
                    if let Err(e) = connection.reconnect(Some(token)).await {
                        debug!("Reconnect after token change failed: {e}");
                    }
                });
            }
            TokenEvent::Cleared { reason } => {
                tab.connection.disconnect(reason);
                tab.connection.clear_queue();
                tab.session.stop();
                tab.drop_user_subscription();
            }
        }
    });

    let store = state.clone();
    connection.on_state_change(move |state| {
        store.dispatch(Action::ConnectionStateChanged(*state));
    });

    let store = state.clone();
    connection.on_error(move |err| {
        // Terminal refresh failures are announced by the forced logout
        if err.is_recoverable() || matches!(err, SyncError::TokenRefreshFailed { .. }) {
            return;
        }
        store.dispatch(Action::Notify(Notification::error(err.to_string(), Some(err.code()))));
    });

    let weak = tab.clone();
    session.on_phase_change(move |phase| {
        if *phase == SessionPhase::Expired {
            if let Some(tab) = weak.upgrade() {
                tab.expire_session();
            }
        }
    });

    let weak = tab.clone();
    bus.on_message(move |message| {
        let Some(tab) = weak.upgrade() else {
            return;
        };
        let message = message.clone();
        tokio::spawn(async move {
            tab.handle_cross_tab(&message).await;
        });
    });
}
