//! Error taxonomy and wire error codes.

use serde::{Deserialize, Serialize};

/// Stable error codes surfaced to error handlers and notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ConnectionFailed,
    ConnectionError,
    SendError,
    TokenRefreshFailed,
    MaxReconnectAttempts,
    SubscriptionError,
    AckTimeout,
    NotAuthenticated,
    StorageError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionFailed => "CONNECTION_FAILED",
            Self::ConnectionError => "CONNECTION_ERROR",
            Self::SendError => "SEND_ERROR",
            Self::TokenRefreshFailed => "TOKEN_REFRESH_FAILED",
            Self::MaxReconnectAttempts => "MAX_RECONNECT_ATTEMPTS",
            Self::SubscriptionError => "SUBSCRIPTION_ERROR",
            Self::AckTimeout => "ACK_TIMEOUT",
            Self::NotAuthenticated => "NOT_AUTHENTICATED",
            Self::StorageError => "STORAGE_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the connectivity core.
///
/// Recoverable errors are retried internally and only reported through the
/// non-blocking error handlers. Terminal errors end in a logout sequence or
/// require a manual reconnect.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("send failed: {0}")]
    SendError(String),

    #[error("token refresh failed: {message}")]
    TokenRefreshFailed { message: String, terminal: bool },

    #[error("gave up after {0} reconnect attempts")]
    MaxReconnectAttempts(u32),

    #[error("subscription to '{channel}' failed: {message}")]
    SubscriptionError { channel: String, message: String },

    #[error("no acknowledgement within {0} ms")]
    AckTimeout(u64),

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("storage error: {0}")]
    Storage(String),
}

impl SyncError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::ConnectionFailed(_) => ErrorCode::ConnectionFailed,
            Self::ConnectionError(_) => ErrorCode::ConnectionError,
            Self::SendError(_) => ErrorCode::SendError,
            Self::TokenRefreshFailed { .. } => ErrorCode::TokenRefreshFailed,
            Self::MaxReconnectAttempts(_) => ErrorCode::MaxReconnectAttempts,
            Self::SubscriptionError { .. } => ErrorCode::SubscriptionError,
            Self::AckTimeout(_) => ErrorCode::AckTimeout,
            Self::NotAuthenticated => ErrorCode::NotAuthenticated,
            Self::Storage(_) => ErrorCode::StorageError,
        }
    }

    /// Whether the core keeps retrying on its own after this error.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::TokenRefreshFailed { terminal, .. } => !terminal,
            Self::MaxReconnectAttempts(_) | Self::NotAuthenticated => false,
            _ => true,
        }
    }

    pub fn refresh_failed(message: impl Into<String>, terminal: bool) -> Self {
        Self::TokenRefreshFailed {
            message: message.into(),
            terminal,
        }
    }

    pub fn subscription(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SubscriptionError {
            channel: channel.into(),
            message: message.into(),
        }
    }
}
