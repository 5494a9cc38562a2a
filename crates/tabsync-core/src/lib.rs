//! tabsync core
//!
//! Realtime connectivity and session synchronization for the tabs of one
//! origin:
//!
//! - [`connection`]: the single realtime connection, its state machine,
//!   channel bindings, outbound queue and reconnect policy
//! - [`token`]: token restore, proactive refresh and forced logout
//! - [`bus`]: cross-tab broadcast of login/logout/refresh events
//! - [`session`]: inactivity warning and timeout
//! - [`tab`]: composition root wiring the managers for one tab
//!
//! Everything is constructed explicitly and passed by handle; there is no
//! global state.

pub mod api;
pub mod backoff;
pub mod bus;
pub mod clock;
pub mod config;
pub mod connection;
pub mod http;
pub mod observer;
pub mod session;
pub mod storage;
pub mod store;
pub mod tab;
pub mod task;
pub mod token;
pub mod token_store;

pub use api::{ApiError, AuthApi, Publisher, SharedAuthApi, SharedPublisher, TokenPair};
pub use bus::{BroadcastBus, BroadcastHub};
pub use clock::{Clock, RuntimeClock, SharedClock, SystemClock};
pub use config::{ConfigError, SyncConfig};
pub use connection::{ConnectionManager, ConnectionStats, SendOptions, SubscriptionId};
pub use http::HttpApi;
pub use observer::ListenerId;
pub use session::{SessionInfo, SessionMonitor, SessionPhase};
pub use storage::{FileStorage, MemoryStorage, SharedStorage, StorageChange};
pub use store::{Action, AppSnapshot, MemoryStateStore, Notification, NotificationLevel, StateStore};
pub use tab::{Tab, TabDeps};
pub use token::{TokenEvent, TokenManager, TokenOrigin};
pub use token_store::{SessionMetadata, StoredTokens, TokenStore};
