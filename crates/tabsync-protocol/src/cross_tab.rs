//! Messages exchanged between tabs of the same origin.
//!
//! Envelope shape, identical on every cross-tab path:
//!   `{ "type": "LOGIN" | "LOGOUT" | "TOKEN_REFRESHED" | "SESSION_EXPIRED",
//!      "timestamp": <epoch ms>, "tabId": "...", ...type-specific fields }`

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Type-specific part of a cross-tab message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CrossTabEvent {
    #[serde(rename_all = "camelCase")]
    Login {
        token: String,
        #[serde(default)]
        refresh_token: Option<String>,
        #[serde(default)]
        user: JsonValue,
    },
    Logout {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    TokenRefreshed {
        token: String,
        #[serde(default)]
        refresh_token: Option<String>,
    },
    SessionExpired,
}

/// Discriminant of a [`CrossTabEvent`], used for dedupe keys and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrossTabKind {
    Login,
    Logout,
    TokenRefreshed,
    SessionExpired,
}

impl CrossTabKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Login => "LOGIN",
            Self::Logout => "LOGOUT",
            Self::TokenRefreshed => "TOKEN_REFRESHED",
            Self::SessionExpired => "SESSION_EXPIRED",
        }
    }
}

impl CrossTabEvent {
    pub fn kind(&self) -> CrossTabKind {
        match self {
            Self::Login { .. } => CrossTabKind::Login,
            Self::Logout { .. } => CrossTabKind::Logout,
            Self::TokenRefreshed { .. } => CrossTabKind::TokenRefreshed,
            Self::SessionExpired => CrossTabKind::SessionExpired,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossTabMessage {
    #[serde(flatten)]
    pub event: CrossTabEvent,
    pub timestamp: i64,
    /// Sending tab; receivers drop their own echoes.
    #[serde(rename = "tabId", default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<String>,
}

/// Identity of one logical broadcast, for dropping duplicates delivered over
/// more than one path.
pub type DedupeKey = (CrossTabKind, i64, Option<String>);

impl CrossTabMessage {
    pub fn new(event: CrossTabEvent, timestamp: i64, tab_id: impl Into<String>) -> Self {
        Self {
            event,
            timestamp,
            tab_id: Some(tab_id.into()),
        }
    }

    pub fn kind(&self) -> CrossTabKind {
        self.event.kind()
    }

    pub fn dedupe_key(&self) -> DedupeKey {
        (self.kind(), self.timestamp, self.tab_id.clone())
    }

    pub fn to_envelope(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_envelope(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
