//! HTTP collaborators: auth endpoints and the publish trigger.
//!
//! The managers only see these traits; [`crate::http::HttpApi`] is the
//! production implementation.

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tabsync_protocol::PublishRequest;
use tabsync_transport::BoxFuture;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("network error: {0}")]
    Network(String),
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("invalid response: {0}")]
    Decode(String),
    #[error("endpoint not configured: {0}")]
    NotConfigured(&'static str),
}

impl ApiError {
    /// Credential failures are terminal for a refresh: retrying with the same
    /// refresh token cannot succeed.
    pub fn is_credential_failure(&self) -> bool {
        match self {
            Self::Unauthorized(_) => true,
            Self::Status { status, .. } => matches!(status, 400 | 401 | 403),
            _ => false,
        }
    }
}

/// Token pair returned by the refresh endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    #[serde(alias = "accessToken")]
    pub token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

pub trait AuthApi: Send + Sync + 'static {
    fn refresh_token(
        &self,
        refresh_token: &str,
    ) -> impl Future<Output = Result<TokenPair, ApiError>> + Send;

    fn logout(
        &self,
        access_token: Option<&str>,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;
}

/// Publishes through the backend trigger endpoint. A non-2xx answer is a send
/// failure eligible for queue retry.
pub trait Publisher: Send + Sync + 'static {
    fn publish(
        &self,
        access_token: Option<&str>,
        request: &PublishRequest,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;
}

/// Object-safe version of [`AuthApi`].
pub trait DynAuthApi: Send + Sync {
    fn refresh_token_dyn<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, Result<TokenPair, ApiError>>;
    fn logout_dyn<'a>(
        &'a self,
        access_token: Option<&'a str>,
    ) -> BoxFuture<'a, Result<(), ApiError>>;
}

impl<T: AuthApi> DynAuthApi for T {
    fn refresh_token_dyn<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, Result<TokenPair, ApiError>> {
        Box::pin(self.refresh_token(refresh_token))
    }
    fn logout_dyn<'a>(
        &'a self,
        access_token: Option<&'a str>,
    ) -> BoxFuture<'a, Result<(), ApiError>> {
        Box::pin(self.logout(access_token))
    }
}

/// Object-safe version of [`Publisher`].
pub trait DynPublisher: Send + Sync {
    fn publish_dyn<'a>(
        &'a self,
        access_token: Option<&'a str>,
        request: &'a PublishRequest,
    ) -> BoxFuture<'a, Result<(), ApiError>>;
}

impl<T: Publisher> DynPublisher for T {
    fn publish_dyn<'a>(
        &'a self,
        access_token: Option<&'a str>,
        request: &'a PublishRequest,
    ) -> BoxFuture<'a, Result<(), ApiError>> {
        Box::pin(self.publish(access_token, request))
    }
}

pub type SharedAuthApi = Arc<dyn DynAuthApi>;
pub type SharedPublisher = Arc<dyn DynPublisher>;
