//! Application state store collaborator.
//!
//! The core dispatches actions into the application's store and reads the
//! current user from it; it never owns UI state.

use parking_lot::{Mutex, RwLock};
use serde_json::Value as JsonValue;
use tabsync_protocol::{ConnectionState, ErrorCode};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
    pub code: Option<ErrorCode>,
}

impl Notification {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Info,
            message: message.into(),
            code: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Warning,
            message: message.into(),
            code: None,
        }
    }

    pub fn error(message: impl Into<String>, code: Option<ErrorCode>) -> Self {
        Self {
            level: NotificationLevel::Error,
            message: message.into(),
            code,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    LoginSuccess { user: JsonValue },
    Logout { reason: String },
    Notify(Notification),
    Redirect { path: String },
    ConnectionStateChanged(ConnectionState),
    SessionWarning { remaining_ms: u64 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppSnapshot {
    pub user_id: Option<String>,
    pub authenticated: bool,
}

pub trait StateStore: Send + Sync {
    fn dispatch(&self, action: Action);
    fn get_state(&self) -> AppSnapshot;
}

/// Extract a user id from a login payload: `id`, `userId` or `sub`.
pub fn user_id_of(user: &JsonValue) -> Option<String> {
    ["id", "userId", "sub"].iter().find_map(|key| match user.get(*key)? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// Minimal reducer that records every action. Used by the CLI and tests.
#[derive(Default)]
pub struct MemoryStateStore {
    state: RwLock<AppSnapshot>,
    log: Mutex<Vec<Action>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn actions(&self) -> Vec<Action> {
        self.log.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&Action) -> bool) -> usize {
        self.log.lock().iter().filter(|a| predicate(a)).count()
    }
}

impl StateStore for MemoryStateStore {
    fn dispatch(&self, action: Action) {
        debug!("dispatch {action:?}");
        match &action {
            Action::LoginSuccess { user } => {
                let mut state = self.state.write();
                state.user_id = user_id_of(user);
                state.authenticated = true;
            }
            Action::Logout { .. } => *self.state.write() = AppSnapshot::default(),
            _ => {}
        }
        self.log.lock().push(action);
    }

    fn get_state(&self) -> AppSnapshot {
        self.state.read().clone()
    }
}
