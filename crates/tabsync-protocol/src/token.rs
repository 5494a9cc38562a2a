//! Access/refresh token pair with the expiry decoded from the JWT `exp` claim.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenDecodeError {
    #[error("token is not a three-part JWT")]
    Malformed,
    #[error("invalid payload encoding")]
    Encoding,
    #[error("payload is not a JSON object")]
    Payload,
    #[error("missing claim: exp")]
    MissingExpiry,
}

/// An immutable token value. A refresh produces a new `AuthToken`; the old one
/// is replaced wholesale in the token store.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthToken {
    pub token: String,
    pub expires_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_expires_at_ms: Option<i64>,
}

impl AuthToken {
    /// Build a token by decoding the access token's expiry. The refresh
    /// token's expiry is decoded best-effort; opaque refresh tokens are fine.
    pub fn decode(
        token: impl Into<String>,
        refresh_token: Option<String>,
    ) -> Result<Self, TokenDecodeError> {
        let token = token.into();
        let expires_at_ms = decode_expiry(&token)?;
        let refresh_expires_at_ms = refresh_token
            .as_deref()
            .and_then(|rt| decode_expiry(rt).ok());
        Ok(Self {
            token,
            expires_at_ms,
            refresh_token,
            refresh_expires_at_ms,
        })
    }

    /// True iff the token outlives `now + margin`.
    pub fn is_valid_at(&self, now_ms: i64, margin_ms: i64) -> bool {
        self.expires_at_ms > now_ms + margin_ms
    }

    pub fn expires_in_ms(&self, now_ms: i64) -> i64 {
        self.expires_at_ms - now_ms
    }

    /// Whether the refresh token may still be presented. Unknown expiry counts
    /// as usable; the server has the final word.
    pub fn can_refresh_at(&self, now_ms: i64) -> bool {
        match (&self.refresh_token, self.refresh_expires_at_ms) {
            (None, _) => false,
            (Some(_), Some(exp)) => exp > now_ms,
            (Some(_), None) => true,
        }
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthToken")
            .field("token", &"<redacted>")
            .field("expires_at_ms", &self.expires_at_ms)
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("refresh_expires_at_ms", &self.refresh_expires_at_ms)
            .finish()
    }
}

/// Decode the `exp` claim (seconds) of a JWT into epoch milliseconds.
///
/// The signature is not verified; the server validates tokens, the client
/// only needs to know when to refresh.
pub fn decode_expiry(token: &str) -> Result<i64, TokenDecodeError> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 || parts[1].is_empty() {
        return Err(TokenDecodeError::Malformed);
    }

    let payload = URL_SAFE_NO_PAD
        .decode(parts[1].trim_end_matches('='))
        .map_err(|_| TokenDecodeError::Encoding)?;
    let claims: JsonValue =
        serde_json::from_slice(&payload).map_err(|_| TokenDecodeError::Payload)?;
    if !claims.is_object() {
        return Err(TokenDecodeError::Payload);
    }

    let exp = claims.get("exp").ok_or(TokenDecodeError::MissingExpiry)?;
    let seconds = exp
        .as_i64()
        .or_else(|| exp.as_f64().map(|f| f as i64))
        .ok_or(TokenDecodeError::MissingExpiry)?;
    Ok(seconds.saturating_mul(1000))
}

/// Read a string claim without verification (e.g. `sub` for the user id).
pub fn peek_claim(token: &str, claim: &str) -> Option<String> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: JsonValue = serde_json::from_slice(&bytes).ok()?;
    match claims.get(claim)? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Unsigned short-lived token for local development against a provider that
/// does not verify signatures. Never used in production builds.
pub fn placeholder_token(now_ms: i64, ttl_ms: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let claims = serde_json::json!({
        "sub": "dev-user",
        "exp": (now_ms + ttl_ms) / 1000,
        "dev": true,
    });
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.")
}
