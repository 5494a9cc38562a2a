//! Token persistence in shared storage.
//!
//! The access and refresh token are written as one record so a sibling tab
//! never observes a half-written pair.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tabsync_protocol::{AuthToken, SyncError};
use tracing::warn;

use crate::storage::SharedStorage;

pub const AUTH_KEY: &str = "tabsync.auth";
pub const SESSION_KEY: &str = "tabsync.session";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredTokens {
    pub token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Lightweight session metadata kept next to the tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub user_id: String,
    pub session_id: String,
    pub login_at_ms: i64,
}

#[derive(Clone)]
pub struct TokenStore {
    storage: Arc<dyn SharedStorage>,
}

impl TokenStore {
    pub fn new(storage: Arc<dyn SharedStorage>) -> Self {
        Self { storage }
    }

    pub fn read(&self) -> Option<StoredTokens> {
        let raw = self.storage.get_item(AUTH_KEY)?;
        match serde_json::from_str(&raw) {
            Ok(tokens) => Some(tokens),
            Err(e) => {
                warn!("Discarding unreadable stored tokens: {e}");
                None
            }
        }
    }

    pub fn write(&self, token: &AuthToken) -> Result<(), SyncError> {
        let record = StoredTokens {
            token: token.token.clone(),
            refresh_token: token.refresh_token.clone(),
        };
        let raw = serde_json::to_string(&record).map_err(|e| SyncError::Storage(e.to_string()))?;
        self.storage.set_item(AUTH_KEY, &raw)
    }

    pub fn clear(&self) -> Result<(), SyncError> {
        self.storage.remove_item(AUTH_KEY)?;
        self.storage.remove_item(SESSION_KEY)
    }

    pub fn has_tokens(&self) -> bool {
        self.storage.get_item(AUTH_KEY).is_some()
    }

    pub fn session_metadata(&self) -> Option<SessionMetadata> {
        let raw = self.storage.get_item(SESSION_KEY)?;
        serde_json::from_str(&raw).ok()
    }

    pub fn write_session_metadata(&self, meta: &SessionMetadata) -> Result<(), SyncError> {
        let raw = serde_json::to_string(meta).map_err(|e| SyncError::Storage(e.to_string()))?;
        self.storage.set_item(SESSION_KEY, &raw)
    }
}
