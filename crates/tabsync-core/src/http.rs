//! reqwest implementation of the auth and publish collaborators.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::json;
use tabsync_protocol::PublishRequest;
use tracing::debug;

use crate::api::{ApiError, AuthApi, Publisher, TokenPair};
use crate::config::SyncConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

pub struct HttpApi {
    client: Client,
    api_url: Option<String>,
    trigger_url: Option<String>,
}

impl HttpApi {
    pub fn new(api_url: Option<String>, trigger_url: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            api_url: api_url.map(|u| u.trim_end_matches('/').to_string()),
            trigger_url,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.api_url.clone(), config.trigger_url().map(str::to_string))
    }

    fn endpoint(&self, path: &str) -> Result<String, ApiError> {
        let base = self.api_url.as_deref().ok_or(ApiError::NotConfigured("apiUrl"))?;
        Ok(format!("{base}{path}"))
    }
}

/// Turn a non-2xx response into the matching [`ApiError`].
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    if status == StatusCode::UNAUTHORIZED {
        return Err(ApiError::Unauthorized(message));
    }
    Err(ApiError::Status {
        status: status.as_u16(),
        message,
    })
}

fn network(err: reqwest::Error) -> ApiError {
    ApiError::Network(err.to_string())
}

impl AuthApi for HttpApi {
    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenPair, ApiError> {
        let url = self.endpoint("/auth/refresh")?;
        debug!("POST {url}");
        let response = self
            .client
            .post(&url)
            .json(&json!({ "refreshToken": refresh_token }))
            .send()
            .await
            .map_err(network)?;
        let response = check_status(response).await?;
        response
            .json::<TokenPair>()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }

    async fn logout(&self, access_token: Option<&str>) -> Result<(), ApiError> {
        let url = self.endpoint("/auth/logout")?;
        debug!("POST {url}");
        let mut request = self.client.post(&url);
        if let Some(token) = access_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(network)?;
        check_status(response).await.map(|_| ())
    }
}

impl Publisher for HttpApi {
    async fn publish(
        &self,
        access_token: Option<&str>,
        request: &PublishRequest,
    ) -> Result<(), ApiError> {
        let url = self
            .trigger_url
            .as_deref()
            .ok_or(ApiError::NotConfigured("realtime.triggerUrl"))?;
        let mut builder = self.client.post(url).json(request);
        if let Some(token) = access_token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await.map_err(network)?;
        check_status(response).await.map(|_| ())
    }
}
