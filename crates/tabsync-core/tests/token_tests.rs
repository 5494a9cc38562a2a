//! Token lifecycle: scheduling, refresh outcomes and cross-tab adoption.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use parking_lot::Mutex;
use serde_json::json;
use tabsync_core::token::refresh_delay;
use tabsync_core::token_store::AUTH_KEY;
use tabsync_core::{
    Action, ApiError, BroadcastBus, SharedStorage, TokenEvent, TokenOrigin, TokenStore,
};
use tabsync_protocol::{AuthToken, CrossTabKind, SyncError, decode_expiry};

/// Put a token pair in the origin's storage, as a previous session would.
fn seed(origin: &Origin, expires_in_ms: i64, refresh_token: Option<&str>) -> String {
    let token = jwt(origin.now() + expires_in_ms, "user-1");
    let auth = AuthToken::decode(token.clone(), refresh_token.map(str::to_string)).unwrap();
    TokenStore::new(Arc::new(origin.storage.clone())).write(&auth).unwrap();
    token
}

// ─────────────────────────────────────────────────────────────────────────────
// Scheduling
// ─────────────────────────────────────────────────────────────────────────────

mod scheduling {
    use super::*;

    #[test]
    fn refresh_delay_is_a_function_of_expiry_and_threshold() {
        let now = EPOCH_MS;
        let threshold = 5 * 60_000;
        assert_eq!(
            refresh_delay(now, now + 10 * MINUTE_MS, threshold),
            Some(Duration::from_secs(5 * 60))
        );
        assert_eq!(refresh_delay(now, now + 3 * MINUTE_MS, threshold), None);
        assert_eq!(refresh_delay(now, now + 5 * MINUTE_MS, threshold), None);
        assert_eq!(refresh_delay(now, now - MINUTE_MS, threshold), None);
    }

    #[tokio::test(start_paused = true)]
    async fn token_inside_threshold_refreshes_immediately_and_reschedules() {
        let origin = Origin::new();
        let old = seed(&origin, 3 * MINUTE_MS, Some("rt-1"));
        let t = origin.tab(test_config());

        t.tab.tokens().restore().unwrap();
        settle().await;

        assert_eq!(t.api.refreshes(), 1);
        let current = t.tab.tokens().current().unwrap();
        assert_ne!(current.token, old);
        assert_eq!(current.expires_at_ms, decode_expiry(&current.token).unwrap());
        let stored = t.tab.tokens().load_stored_token().unwrap();
        assert_eq!(stored.token, current.token);

        // Next refresh lands five minutes before the new expiry
        let due = (current.expires_at_ms - 5 * MINUTE_MS - origin.now()) as u64;
        advance_ms(due - 1_000).await;
        assert_eq!(t.api.refreshes(), 1);
        advance_ms(2_000).await;
        assert_eq!(t.api.refreshes(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn replacing_the_token_cancels_the_previous_timer() {
        let origin = Origin::new();
        let t = origin.tab(test_config());
        let tokens = t.tab.tokens();

        tokens
            .login(jwt(origin.now() + 10 * MINUTE_MS, "user-1"), Some("rt".into()), json!({}))
            .unwrap();
        tokens
            .login(jwt(origin.now() + 60 * MINUTE_MS, "user-1"), Some("rt".into()), json!({}))
            .unwrap();

        advance_ms(6 * 60_000).await;
        assert_eq!(t.api.refreshes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn token_without_refresh_token_is_not_scheduled() {
        let origin = Origin::new();
        let t = origin.tab(test_config());
        t.tab
            .tokens()
            .login(jwt(origin.now() + 2 * MINUTE_MS, "user-1"), None, json!({}))
            .unwrap();

        advance_ms(60_000).await;
        assert_eq!(t.api.refreshes(), 0);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Stored token
// ─────────────────────────────────────────────────────────────────────────────

mod stored {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn is_authenticated_follows_the_stored_expiry() {
        let origin = Origin::new();
        let t = origin.tab(test_config());
        let tokens = t.tab.tokens();
        assert!(!tokens.is_authenticated());

        tokens
            .login(jwt(origin.now() + 10 * MINUTE_MS, "user-1"), None, json!({}))
            .unwrap();
        assert!(tokens.is_authenticated());

        advance_ms(11 * 60_000).await;
        assert!(!tokens.is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_stored_token_counts_as_absent() {
        let origin = Origin::new();
        origin
            .storage
            .set_item(AUTH_KEY, r#"{"token":"not-a-jwt","refreshToken":"rt"}"#)
            .unwrap();
        let t = origin.tab(test_config());

        assert!(t.tab.tokens().load_stored_token().is_none());
        assert!(t.tab.tokens().restore().is_none());
        assert!(!t.tab.tokens().is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_token_without_refresh_is_not_restored() {
        let origin = Origin::new();
        seed(&origin, -MINUTE_MS, None);
        let t = origin.tab(test_config());
        assert!(t.tab.tokens().restore().is_none());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Refresh outcomes
// ─────────────────────────────────────────────────────────────────────────────

mod refresh {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn concurrent_refreshes_share_one_request() {
        let origin = Origin::new();
        seed(&origin, 30 * MINUTE_MS, Some("rt-1"));
        let t = origin.tab(test_config());
        t.tab.tokens().restore().unwrap();
        *t.api.latency.lock() = Duration::from_secs(1);

        let a = t.tab.tokens().clone();
        let b = t.tab.tokens().clone();
        let (first, second) = tokio::join!(a.refresh(None), b.refresh(None));

        assert_eq!(t.api.refreshes(), 1);
        assert_eq!(first.unwrap().token, second.unwrap().token);
    }

    #[tokio::test(start_paused = true)]
    async fn network_failure_is_recoverable_and_keeps_tokens() {
        let origin = Origin::new();
        let old = seed(&origin, 30 * MINUTE_MS, Some("rt-1"));
        let t = origin.tab(test_config());
        t.tab.tokens().restore().unwrap();
        t.api.script(Err(ApiError::Network("connection reset".into())));

        let err = t.tab.tokens().refresh(None).await.unwrap_err();

        assert!(err.is_recoverable());
        assert_eq!(t.tab.tokens().access_token(), Some(old));
        assert_eq!(t.state.count(|a| matches!(a, Action::Logout { .. })), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_refresh_token_forces_logout() {
        let origin = Origin::new();
        seed(&origin, 30 * MINUTE_MS, Some("rt-1"));
        let sibling = origin.tab(test_config());
        sibling.tab.start().await.unwrap();
        let t = origin.tab(test_config());
        t.tab.tokens().restore().unwrap();
        t.api.script(Err(ApiError::Unauthorized("refresh token revoked".into())));

        let err = t.tab.tokens().refresh(None).await.unwrap_err();
        settle().await;

        assert_eq!(err, SyncError::refresh_failed("unauthorized: refresh token revoked", true));
        assert!(!err.is_recoverable());
        assert!(t.tab.tokens().current().is_none());
        assert!(t.tab.tokens().load_stored_token().is_none());
        assert_eq!(t.state.count(|a| matches!(a, Action::Logout { .. })), 1);
        assert_eq!(t.state.count(|a| matches!(a, Action::Notify(_))), 1);

        // The sibling tab heard the LOGOUT
        assert!(sibling.tab.tokens().current().is_none());
        assert_eq!(sibling.state.count(|a| matches!(a, Action::Logout { .. })), 1);

        // Redirect waits for the notification to render
        assert_eq!(t.state.count(|a| matches!(a, Action::Redirect { .. })), 0);
        advance_ms(2_001).await;
        assert!(t.state.actions().contains(&Action::Redirect { path: "/login".into() }));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_refresh_token_is_terminal() {
        let origin = Origin::new();
        seed(&origin, 30 * MINUTE_MS, None);
        let t = origin.tab(test_config());
        t.tab.tokens().restore().unwrap();

        let err = t.tab.tokens().refresh(None).await.unwrap_err();

        assert!(!err.is_recoverable());
        assert_eq!(t.api.refreshes(), 0);
        assert!(!t.tab.tokens().is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn newer_token_in_storage_is_adopted_without_a_request() {
        let origin = Origin::new();
        seed(&origin, 30 * MINUTE_MS, Some("rt-1"));
        let a = origin.tab(test_config());
        let b = origin.tab(test_config());
        a.tab.tokens().restore().unwrap();
        b.tab.tokens().restore().unwrap();

        let refreshed = a.tab.tokens().refresh(None).await.unwrap();
        let adopted = b.tab.tokens().refresh(None).await.unwrap();

        assert_eq!(adopted.token, refreshed.token);
        assert_eq!(a.api.refreshes(), 1);
        assert_eq!(b.api.refreshes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_refresh_broadcasts_and_emits_local_update() {
        let origin = Origin::new();
        seed(&origin, 30 * MINUTE_MS, Some("rt-1"));
        let t = origin.tab(test_config());
        let listener = Arc::new(BroadcastBus::new(
            "observer",
            origin.clock.clone(),
            Arc::new(origin.storage.clone()),
            origin.hub.clone(),
        ));
        listener.start();
        let kinds = Arc::new(Mutex::new(Vec::new()));
        let sink = kinds.clone();
        listener.on_message(move |m| sink.lock().push(m.kind()));
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        t.tab.tokens().on_event(move |e| sink.lock().push(e.clone()));

        t.tab.tokens().restore().unwrap();
        let token = t.tab.tokens().refresh(None).await.unwrap();
        settle().await;

        assert_eq!(*kinds.lock(), vec![CrossTabKind::TokenRefreshed]);
        assert_eq!(
            *events.lock(),
            vec![TokenEvent::Updated {
                token,
                origin: TokenOrigin::Local
            }]
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// External tokens
// ─────────────────────────────────────────────────────────────────────────────

mod external {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn apply_external_is_a_no_op_for_the_same_token() {
        let origin = Origin::new();
        let t = origin.tab(test_config());
        let token = jwt(origin.now() + 30 * MINUTE_MS, "user-1");

        assert!(t.tab.tokens().apply_external(&token, Some("rt".into())).unwrap());
        assert!(!t.tab.tokens().apply_external(&token, Some("rt".into())).unwrap());
        assert!(!t.tab.tokens().apply_external("garbage", None).unwrap());
        assert_eq!(t.tab.tokens().access_token(), Some(token));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_is_idempotent() {
        let origin = Origin::new();
        let t = origin.tab(test_config());
        let cleared = Arc::new(Mutex::new(0));
        let sink = cleared.clone();
        t.tab.tokens().on_event(move |e| {
            if matches!(e, TokenEvent::Cleared { .. }) {
                *sink.lock() += 1;
            }
        });
        t.tab
            .tokens()
            .login(jwt(origin.now() + 30 * MINUTE_MS, "user-1"), None, json!({}))
            .unwrap();

        assert!(t.tab.tokens().clear("bye"));
        assert!(!t.tab.tokens().clear("bye"));
        assert_eq!(*cleared.lock(), 1);
    }
}
