//! Protocol layer tests: token decoding, cross-tab envelopes, frames, errors.

#[cfg(test)]
mod tests {
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use serde_json::json;
    use tabsync_protocol::channel::*;
    use tabsync_protocol::*;

    fn jwt(claims: serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
        format!("{header}.{payload}.sig")
    }

    // ─────────────────────────────────────────────────────────────────────
    // Tokens
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn decode_expiry_converts_seconds_to_ms() {
        let token = jwt(json!({"sub": "u1", "exp": 1_700_000_000}));
        assert_eq!(decode_expiry(&token).unwrap(), 1_700_000_000_000);
    }

    #[test]
    fn decode_expiry_accepts_float_claim() {
        let token = jwt(json!({"exp": 1_700_000_000.5}));
        assert_eq!(decode_expiry(&token).unwrap(), 1_700_000_000_000);
    }

    #[test]
    fn decode_expiry_rejects_garbage() {
        assert_eq!(decode_expiry("not-a-jwt"), Err(TokenDecodeError::Malformed));
        assert_eq!(decode_expiry("a.!!!.c"), Err(TokenDecodeError::Encoding));
        let no_exp = jwt(json!({"sub": "u1"}));
        assert_eq!(decode_expiry(&no_exp), Err(TokenDecodeError::MissingExpiry));
    }

    #[test]
    fn auth_token_validity_is_strict() {
        let token = AuthToken::decode(jwt(json!({"exp": 100})), None).unwrap();
        assert!(token.is_valid_at(99_999, 0));
        assert!(!token.is_valid_at(100_000, 0));
        assert!(!token.is_valid_at(40_000, 60_000));
    }

    #[test]
    fn opaque_refresh_token_is_usable() {
        let token = AuthToken::decode(jwt(json!({"exp": 100})), Some("opaque".into())).unwrap();
        assert_eq!(token.refresh_expires_at_ms, None);
        assert!(token.can_refresh_at(i64::MAX));

        let expiring = AuthToken::decode(
            jwt(json!({"exp": 100})),
            Some(jwt(json!({"exp": 200}))),
        )
        .unwrap();
        assert!(expiring.can_refresh_at(199_000));
        assert!(!expiring.can_refresh_at(200_000));
    }

    #[test]
    fn auth_token_debug_redacts_secrets() {
        let token = AuthToken::decode(jwt(json!({"exp": 100})), Some("secret-rt".into())).unwrap();
        let printed = format!("{token:?}");
        assert!(!printed.contains("secret-rt"));
        assert!(!printed.contains(&token.token));
    }

    #[test]
    fn peek_claim_reads_subject() {
        let token = jwt(json!({"sub": "user-42", "exp": 1}));
        assert_eq!(token::peek_claim(&token, "sub").as_deref(), Some("user-42"));
        assert_eq!(token::peek_claim(&token, "missing"), None);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Cross-tab envelopes
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn token_refreshed_envelope_shape() {
        let msg = CrossTabMessage::new(
            CrossTabEvent::TokenRefreshed {
                token: "t".into(),
                refresh_token: Some("r".into()),
            },
            1234,
            "tab-a",
        );
        let value: serde_json::Value = serde_json::from_str(&msg.to_envelope().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "TOKEN_REFRESHED",
                "timestamp": 1234,
                "tabId": "tab-a",
                "token": "t",
                "refreshToken": "r",
            })
        );
    }

    #[test]
    fn login_envelope_parses_with_user() {
        let raw = concat!(
            r#"{"type":"LOGIN","timestamp":5,"token":"t","#,
            r#""refreshToken":"r","user":{"id":"u1"}}"#
        );
        let msg = CrossTabMessage::from_envelope(raw).unwrap();
        assert_eq!(msg.kind(), CrossTabKind::Login);
        assert_eq!(msg.tab_id, None);
        match msg.event {
            CrossTabEvent::Login { token, refresh_token, user } => {
                assert_eq!(token, "t");
                assert_eq!(refresh_token.as_deref(), Some("r"));
                assert_eq!(user["id"], "u1");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn session_expired_envelope_has_no_extra_fields() {
        let msg = CrossTabMessage::new(CrossTabEvent::SessionExpired, 9, "tab-b");
        let value: serde_json::Value = serde_json::from_str(&msg.to_envelope().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "SESSION_EXPIRED", "timestamp": 9, "tabId": "tab-b"}));
        let parsed = CrossTabMessage::from_envelope(&msg.to_envelope().unwrap()).unwrap();
        assert_eq!(parsed.event.kind(), CrossTabKind::SessionExpired);
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(CrossTabMessage::from_envelope(r#"{"type":"HELLO","timestamp":1}"#).is_err());
    }

    #[test]
    fn dedupe_key_ignores_payload() {
        let a = CrossTabMessage::new(CrossTabEvent::Logout { reason: None }, 7, "tab");
        let b = CrossTabMessage::new(CrossTabEvent::Logout { reason: Some("x".into()) }, 7, "tab");
        assert_eq!(a.dedupe_key(), b.dedupe_key());
    }

    // ─────────────────────────────────────────────────────────────────────
    // Channels
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn channel_names_are_sanitized_and_truncated() {
        assert_eq!(sanitize_channel_name("chat room#1"), "chat_room_1");
        assert_eq!(sanitize_channel_name(&"a".repeat(150)).len(), MAX_CHANNEL_NAME_LEN);
        assert_eq!(user_channel("42"), "private-user-42");
        assert_eq!(user_channel("a@b.c"), "private-user-a_b_c");
        assert_eq!(presence_channel("lobby"), "presence-lobby");
        assert_eq!(presence_channel("presence-lobby"), "presence-lobby");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Frames
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn client_frames_serialize_with_op_tag() {
        let bind = serde_json::to_value(ClientFrame::Bind { channel: "c".into() }).unwrap();
        assert_eq!(bind, json!({"op": "bind", "channel": "c"}));
        let ping = serde_json::to_value(ClientFrame::Ping).unwrap();
        assert_eq!(ping, json!({"op": "ping"}));
    }

    #[test]
    fn server_event_frame_parses() {
        let frame: ServerFrame = serde_json::from_value(json!({
            "op": "event",
            "channel": "private-user-1",
            "event": "message",
            "data": {"text": "hi"},
        }))
        .unwrap();
        match frame {
            ServerFrame::Event(ev) => {
                assert_eq!(ev.channel, "private-user-1");
                assert_eq!(ev.data["text"], "hi");
                assert_eq!(ev.acked_message_id(), None);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn ack_event_exposes_message_id() {
        let ev = RealtimeEvent::new("c", ACK_EVENT, json!({"messageId": "m-1"}));
        assert_eq!(ev.acked_message_id(), Some("m-1"));
    }

    #[test]
    fn publish_request_uses_type_key() {
        let req = PublishRequest {
            channel: "c".into(),
            event: "chat".into(),
            message_type: "chat".into(),
            payload: json!({"a": 1}),
            message_id: "m".into(),
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["type"], "chat");
        assert_eq!(value["messageId"], "m");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Errors
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn error_codes_and_recoverability() {
        assert_eq!(SyncError::ConnectionFailed("x".into()).code().as_str(), "CONNECTION_FAILED");
        assert!(SyncError::SendError("x".into()).is_recoverable());
        assert!(SyncError::refresh_failed("net", false).is_recoverable());
        assert!(!SyncError::refresh_failed("401", true).is_recoverable());
        assert!(!SyncError::MaxReconnectAttempts(5).is_recoverable());
        assert_eq!(
            serde_json::to_value(ErrorCode::MaxReconnectAttempts).unwrap(),
            json!("MAX_RECONNECT_ATTEMPTS")
        );
    }

    #[test]
    fn connection_state_display() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
        assert_eq!(ConnectionState::Reconnecting.to_string(), "RECONNECTING");
        assert!(!ConnectionState::Reconnecting.is_connected());
    }
}
