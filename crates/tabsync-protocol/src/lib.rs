//! tabsync protocol types
//!
//! Single source of truth for the data shared by the transport, the core
//! managers and sibling tabs: connection state, auth tokens, cross-tab
//! envelopes, realtime frames, channel naming and error codes.

pub mod channel;
pub mod cross_tab;
pub mod error;
pub mod frames;
pub mod state;
pub mod token;

pub use channel::{sanitize_channel_name, user_channel, presence_channel};
pub use cross_tab::{CrossTabEvent, CrossTabKind, CrossTabMessage};
pub use error::{ErrorCode, SyncError};
pub use frames::{Ack, ClientFrame, PublishRequest, RealtimeEvent, ServerFrame, ACK_EVENT};
pub use state::ConnectionState;
pub use token::{AuthToken, TokenDecodeError, decode_expiry};
