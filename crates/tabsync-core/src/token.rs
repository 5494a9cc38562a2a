//! Token lifecycle: restore, proactive refresh, cross-tab adoption and forced
//! logout.
//!
//! The manager is the only writer of the stored token. Every replacement
//! re-arms the refresh timer from `(now, expires_at, threshold)`.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value as JsonValue;
use tabsync_protocol::{AuthToken, CrossTabEvent, ErrorCode, SyncError};
use tracing::{debug, info, warn};

use crate::api::SharedAuthApi;
use crate::bus::BroadcastBus;
use crate::clock::SharedClock;
use crate::config::TokenConfig;
use crate::observer::{ListenerId, Listeners};
use crate::store::{Action, Notification, StateStore};
use crate::task::TaskSlot;
use crate::token_store::TokenStore;

/// Floor between two refreshes, for servers issuing tokens shorter than the
/// refresh threshold.
const MIN_REFRESH_INTERVAL_MS: i64 = 10_000;

/// Where a token replacement came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenOrigin {
    /// Login or refresh performed by this tab.
    Local,
    /// Adopted from a sibling tab.
    CrossTab,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenEvent {
    Updated { token: AuthToken, origin: TokenOrigin },
    Cleared { reason: String },
}

/// Delay until the refresh for a token expiring at `expires_at_ms` is due.
/// `None` means the refresh is already due and must run now.
pub fn refresh_delay(now_ms: i64, expires_at_ms: i64, threshold_ms: u64) -> Option<Duration> {
    let refresh_at = expires_at_ms.saturating_sub(threshold_ms as i64);
    if refresh_at <= now_ms {
        None
    } else {
        Some(Duration::from_millis((refresh_at - now_ms) as u64))
    }
}

pub struct TokenManager {
    weak: Weak<TokenManager>,
    config: TokenConfig,
    clock: SharedClock,
    store: TokenStore,
    api: SharedAuthApi,
    bus: Arc<BroadcastBus>,
    state: Arc<dyn StateStore>,
    current: RwLock<Option<AuthToken>>,
    last_refresh_ms: RwLock<Option<i64>>,
    in_flight: tokio::sync::Mutex<()>,
    refresh_timer: TaskSlot,
    redirect_timer: TaskSlot,
    listeners: Listeners<TokenEvent>,
}

impl TokenManager {
    pub fn new(
        config: TokenConfig,
        clock: SharedClock,
        store: TokenStore,
        api: SharedAuthApi,
        bus: Arc<BroadcastBus>,
        state: Arc<dyn StateStore>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            config,
            clock,
            store,
            api,
            bus,
            state,
            current: RwLock::new(None),
            last_refresh_ms: RwLock::new(None),
            in_flight: tokio::sync::Mutex::new(()),
            refresh_timer: TaskSlot::new(),
            redirect_timer: TaskSlot::new(),
            listeners: Listeners::new(),
        })
    }

    pub fn on_event(&self, handler: impl Fn(&TokenEvent) + Send + Sync + 'static) -> ListenerId {
        self.listeners.add(handler)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn current(&self) -> Option<AuthToken> {
        self.current.read().clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.current.read().as_ref().map(|t| t.token.clone())
    }

    /// Read and decode the stored pair. Undecodable tokens count as absent.
    pub fn load_stored_token(&self) -> Option<AuthToken> {
        let stored = self.store.read()?;
        match AuthToken::decode(stored.token, stored.refresh_token) {
            Ok(token) => Some(token),
            Err(e) => {
                warn!("Stored token is unusable: {e}");
                None
            }
        }
    }

    /// True iff a stored token exists and has not expired.
    pub fn is_authenticated(&self) -> bool {
        let now = self.clock.now_ms();
        self.load_stored_token().is_some_and(|t| t.expires_at_ms > now)
    }

    /// Load the stored token at startup and arm its refresh. An expired token
    /// is kept only if it can still be refreshed.
    pub fn restore(&self) -> Option<AuthToken> {
        let token = self.load_stored_token()?;
        let now = self.clock.now_ms();
        if token.expires_at_ms <= now && !token.can_refresh_at(now) {
            info!("Stored token expired and cannot be refreshed");
            return None;
        }
        *self.current.write() = Some(token.clone());
        self.schedule_refresh(&token);
        Some(token)
    }

    /// Arm the single refresh timer for `token`, replacing any earlier one.
    pub fn schedule_refresh(&self, token: &AuthToken) {
        if token.refresh_token.is_none() {
            debug!("No refresh token, refresh not scheduled");
            self.refresh_timer.cancel();
            return;
        }
        let now = self.clock.now_ms();
        let threshold = self.config.refresh_threshold_ms;
        let mut delay = refresh_delay(now, token.expires_at_ms, threshold);
        if delay.is_none() {
            if let Some(last) = *self.last_refresh_ms.read() {
                let wait = last + MIN_REFRESH_INTERVAL_MS - now;
                if wait > 0 {
                    delay = Some(Duration::from_millis(wait as u64));
                }
            }
        }
        match delay {
            Some(delay) => debug!("Token refresh scheduled in {}s", delay.as_secs()),
            None => debug!("Token inside refresh window, refreshing now"),
        }

        let weak = self.weak.clone();
        self.refresh_timer.spawn(move |ticket| async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let Some(manager) = weak.upgrade() else {
                return;
            };
            if !manager.refresh_timer.release(ticket) {
                return;
            }
            if let Err(e) = manager.refresh(None).await {
                warn!("Scheduled token refresh failed: {e}");
            }
        });
    }

    pub fn cancel_refresh(&self) {
        self.refresh_timer.cancel();
    }

    /// Exchange the refresh token for a new pair.
    ///
    /// Concurrent callers share one request: a caller that waited on another
    /// refresh returns the token it produced. A newer valid token already in
    /// shared storage (refreshed by a sibling tab) is adopted instead of
    /// calling the endpoint.
    pub async fn refresh(&self, refresh_token: Option<String>) -> Result<AuthToken, SyncError> {
        let seen = self.access_token();
        let _flight = self.in_flight.lock().await;
        let now = self.clock.now_ms();

        if let Some(current) = self.current() {
            if Some(&current.token) != seen.as_ref() && current.is_valid_at(now, 0) {
                debug!("Refresh completed by a concurrent caller");
                return Ok(current);
            }
        }

        let threshold = self.config.refresh_threshold_ms as i64;
        if let Some(stored) = self.load_stored_token() {
            let differs = seen.as_deref() != Some(stored.token.as_str());
            if differs && stored.is_valid_at(now, threshold) {
                info!("Adopting token refreshed by another tab");
                self.install(stored.clone(), TokenOrigin::CrossTab)?;
                return Ok(stored);
            }
        }

        let refresh_token = refresh_token
            .or_else(|| self.current().and_then(|t| t.refresh_token))
            .or_else(|| self.store.read().and_then(|t| t.refresh_token));
        let Some(refresh_token) = refresh_token else {
            self.force_logout("Session expired");
            return Err(SyncError::refresh_failed("no refresh token", true));
        };

        let result = self.api.refresh_token_dyn(&refresh_token).await;
        *self.last_refresh_ms.write() = Some(self.clock.now_ms());
        match result {
            Ok(pair) => {
                let refresh_token = pair.refresh_token.or(Some(refresh_token));
                let token = AuthToken::decode(pair.token, refresh_token).map_err(|e| {
                    SyncError::refresh_failed(format!("refresh returned {e}"), false)
                })?;
                self.install(token.clone(), TokenOrigin::Local)?;
                if let Err(e) = self.bus.broadcast(CrossTabEvent::TokenRefreshed {
                    token: token.token.clone(),
                    refresh_token: token.refresh_token.clone(),
                }) {
                    warn!("Failed to broadcast refreshed token: {e}");
                }
                let expires_in_s = token.expires_in_ms(self.clock.now_ms()) / 1000;
                info!("Token refreshed, expires in {expires_in_s}s");
                Ok(token)
            }
            Err(e) if e.is_credential_failure() => {
                warn!("Refresh token rejected: {e}");
                self.force_logout("Session expired");
                Err(SyncError::refresh_failed(e.to_string(), true))
            }
            Err(e) => {
                warn!("Token refresh failed, will retry: {e}");
                Err(SyncError::refresh_failed(e.to_string(), false))
            }
        }
    }

    /// A token valid for at least `margin_ms`, refreshing if needed.
    pub async fn ensure_fresh(&self, margin_ms: u64) -> Result<String, SyncError> {
        let now = self.clock.now_ms();
        let token = match self.current() {
            Some(token) => token,
            None => self.restore().ok_or(SyncError::NotAuthenticated)?,
        };
        if token.is_valid_at(now, margin_ms as i64) {
            return Ok(token.token);
        }
        debug!("Token expires within {margin_ms}ms, refreshing first");
        self.refresh(None).await.map(|t| t.token)
    }

    /// Install a token obtained by logging in and announce it to other tabs.
    pub fn login(
        &self,
        token: impl Into<String>,
        refresh_token: Option<String>,
        user: JsonValue,
    ) -> Result<AuthToken, SyncError> {
        let token = AuthToken::decode(token, refresh_token).map_err(|e| {
            warn!("Login token rejected: {e}");
            SyncError::NotAuthenticated
        })?;
        self.redirect_timer.cancel();
        self.install(token.clone(), TokenOrigin::Local)?;
        self.bus.broadcast(CrossTabEvent::Login {
            token: token.token.clone(),
            refresh_token: token.refresh_token.clone(),
            user,
        })?;
        Ok(token)
    }

    /// Adopt a token announced by another tab. Never re-broadcasts. Returns
    /// whether the local token changed.
    pub fn apply_external(
        &self,
        token: &str,
        refresh_token: Option<String>,
    ) -> Result<bool, SyncError> {
        if self.access_token().as_deref() == Some(token) {
            return Ok(false);
        }
        let token = match AuthToken::decode(token, refresh_token) {
            Ok(token) => token,
            Err(e) => {
                warn!("Ignoring undecodable token from another tab: {e}");
                return Ok(false);
            }
        };
        self.redirect_timer.cancel();
        self.install(token, TokenOrigin::CrossTab)?;
        Ok(true)
    }

    fn install(&self, token: AuthToken, origin: TokenOrigin) -> Result<(), SyncError> {
        self.store.write(&token)?;
        *self.current.write() = Some(token.clone());
        self.schedule_refresh(&token);
        self.listeners.emit(&TokenEvent::Updated { token, origin });
        Ok(())
    }

    /// Drop the local token and stored pair. Returns false if there was
    /// nothing to clear, which makes repeated logouts no-ops.
    pub fn clear(&self, reason: &str) -> bool {
        self.refresh_timer.cancel();
        let had_current = self.current.write().take().is_some();
        let had_stored = self.store.has_tokens();
        if !had_current && !had_stored {
            return false;
        }
        if let Err(e) = self.store.clear() {
            warn!("Failed to clear stored tokens: {e}");
        }
        info!("Tokens cleared: {reason}");
        self.listeners.emit(&TokenEvent::Cleared {
            reason: reason.to_string(),
        });
        true
    }

    /// Terminal auth failure: clear tokens, tell sibling tabs, notify the
    /// user and redirect to the login page after a short delay.
    pub fn force_logout(&self, reason: &str) {
        if !self.clear(reason) {
            return;
        }
        warn!("Forced logout: {reason}");
        if let Err(e) = self.bus.broadcast(CrossTabEvent::Logout {
            reason: Some(reason.to_string()),
        }) {
            warn!("Failed to broadcast logout: {e}");
        }
        self.state.dispatch(Action::Logout {
            reason: reason.to_string(),
        });
        self.state.dispatch(Action::Notify(Notification::error(
            reason,
            Some(ErrorCode::TokenRefreshFailed),
        )));
        self.redirect_to_login();
    }

    /// Dispatch a redirect to the login page after the configured delay, so
    /// notifications have time to render.
    pub fn redirect_to_login(&self) {
        let delay = Duration::from_millis(self.config.logout_redirect_delay_ms);
        let path = self.config.login_path.clone();
        let state = self.state.clone();
        self.redirect_timer.spawn(move |_| async move {
            tokio::time::sleep(delay).await;
            state.dispatch(Action::Redirect { path });
        });
    }
}

impl Drop for TokenManager {
    fn drop(&mut self) {
        self.refresh_timer.cancel();
        self.redirect_timer.cancel();
    }
}
