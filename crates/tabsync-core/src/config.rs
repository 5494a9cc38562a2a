//! Configuration for every manager of a tab.
//!
//! Loaded from `tabsync.jsonc` (JSON with comments), then overridden from the
//! environment. Every field has a default, so an empty file is valid.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeConfig {
    /// Pub/sub provider socket URL
    pub url: String,
    /// Backend endpoint that publishes on the client's behalf
    #[serde(default)]
    pub trigger_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
    /// Fraction of the nominal delay added or removed at random
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: None,
            jitter: 0.25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueConfig {
    pub max_attempts: u32,
    pub max_length: usize,
    pub retry_delay_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_length: 100,
            retry_delay_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenConfig {
    /// Refresh this long before expiry
    pub refresh_threshold_ms: u64,
    /// Minimum remaining lifetime for a token to be used on reconnect
    pub validity_margin_ms: u64,
    /// Delay between a forced logout and the redirect to the login page
    pub logout_redirect_delay_ms: u64,
    pub login_path: String,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            refresh_threshold_ms: 5 * 60 * 1_000,
            validity_margin_ms: 60 * 1_000,
            logout_redirect_delay_ms: 2_000,
            login_path: "/login".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    pub inactivity_warning_min: u64,
    pub session_timeout_min: u64,
    pub check_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inactivity_warning_min: 25,
            session_timeout_min: 30,
            check_interval_ms: 60_000,
        }
    }
}

impl SessionConfig {
    pub fn warning_after(&self) -> Duration {
        Duration::from_secs(self.inactivity_warning_min * 60)
    }

    pub fn timeout_after(&self) -> Duration {
        Duration::from_secs(self.session_timeout_min * 60)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// `None` runs in degraded mode: `connect()` succeeds and stays disconnected
    pub realtime: Option<RealtimeConfig>,
    /// Base URL for `/auth/refresh` and `/auth/logout`
    pub api_url: Option<String>,
    /// Disables the development placeholder token
    pub production: bool,
    pub reconnect: ReconnectConfig,
    /// 0 disables the heartbeat
    pub heartbeat_interval_ms: u64,
    pub queue: QueueConfig,
    pub token: TokenConfig,
    pub session: SessionConfig,
    pub ack_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            realtime: None,
            api_url: None,
            production: false,
            reconnect: ReconnectConfig::default(),
            heartbeat_interval_ms: 25_000,
            queue: QueueConfig::default(),
            token: TokenConfig::default(),
            session: SessionConfig::default(),
            ack_timeout_ms: 10_000,
        }
    }
}

impl SyncConfig {
    /// Load a JSONC config file, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::from_jsonc(&content)?;
        config.apply_env();
        config.validate()?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_jsonc(content: &str) -> Result<Self, ConfigError> {
        let stripped = strip_jsonc_comments(content);
        if stripped.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(&stripped)?)
    }

    /// `TABSYNC_WS_URL`, `TABSYNC_TRIGGER_URL`, `TABSYNC_API_URL`,
    /// `TABSYNC_ENV=production`.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("TABSYNC_WS_URL") {
            debug!("Realtime URL overridden from environment");
            match &mut self.realtime {
                Some(realtime) => realtime.url = url,
                None => {
                    self.realtime = Some(RealtimeConfig {
                        url,
                        trigger_url: None,
                    })
                }
            }
        }
        if let Some(trigger) = lookup("TABSYNC_TRIGGER_URL") {
            if let Some(realtime) = &mut self.realtime {
                realtime.trigger_url = Some(trigger);
            }
        }
        if let Some(api) = lookup("TABSYNC_API_URL") {
            self.api_url = Some(api);
        }
        if let Some(env) = lookup("TABSYNC_ENV") {
            self.production = env.eq_ignore_ascii_case("production");
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.reconnect;
        if r.base_delay_ms == 0 {
            return Err(ConfigError::Invalid("reconnect.baseDelayMs must be > 0".into()));
        }
        if r.max_delay_ms < r.base_delay_ms {
            return Err(ConfigError::Invalid(
                "reconnect.maxDelayMs must be >= baseDelayMs".into(),
            ));
        }
        if !(0.0..1.0).contains(&r.jitter) {
            return Err(ConfigError::Invalid("reconnect.jitter must be in [0, 1)".into()));
        }
        let s = &self.session;
        if s.inactivity_warning_min >= s.session_timeout_min {
            return Err(ConfigError::Invalid(
                "session.inactivityWarningMin must be < sessionTimeoutMin".into(),
            ));
        }
        if s.check_interval_ms == 0 {
            return Err(ConfigError::Invalid("session.checkIntervalMs must be > 0".into()));
        }
        if self.queue.max_attempts == 0 || self.queue.max_length == 0 {
            return Err(ConfigError::Invalid("queue limits must be > 0".into()));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0).then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn trigger_url(&self) -> Option<&str> {
        self.realtime.as_ref().and_then(|r| r.trigger_url.as_deref())
    }
}

/// Remove `//` line comments and `/* */` block comments outside strings.
fn strip_jsonc_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            match c {
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                }
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match (c, chars.peek()) {
            ('"', _) => {
                in_string = true;
                out.push(c);
            }
            ('/', Some('/')) => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = '\0';
                for next in chars.by_ref() {
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_comments_but_not_strings() {
        let input = r#"{
            // line comment
            "apiUrl": "http://x//y", /* block */
            "production": true
        }"#;
        let config = SyncConfig::from_jsonc(input).unwrap();
        assert_eq!(config.api_url.as_deref(), Some("http://x//y"));
        assert!(config.production);
    }

    #[test]
    fn empty_file_is_default() {
        assert_eq!(SyncConfig::from_jsonc("// nothing\n").unwrap(), SyncConfig::default());
    }

    #[test]
    fn env_overrides_create_realtime_section() {
        let mut config = SyncConfig::default();
        config.apply_overrides(|key| match key {
            "TABSYNC_WS_URL" => Some("ws://localhost:6001/ws".into()),
            "TABSYNC_TRIGGER_URL" => Some("http://localhost:3000/trigger".into()),
            "TABSYNC_ENV" => Some("PRODUCTION".into()),
            _ => None,
        });
        assert_eq!(config.realtime.as_ref().unwrap().url, "ws://localhost:6001/ws");
        assert_eq!(config.trigger_url(), Some("http://localhost:3000/trigger"));
        assert!(config.production);
    }

    #[test]
    fn validation_rejects_inverted_session_windows() {
        let mut config = SyncConfig::default();
        config.session.inactivity_warning_min = 30;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = SyncConfig::default();
        config.reconnect.max_delay_ms = 10;
        assert!(config.validate().is_err());
        assert!(SyncConfig::default().validate().is_ok());
    }
}
