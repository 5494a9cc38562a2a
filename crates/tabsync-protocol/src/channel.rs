//! Channel naming rules.

pub const MAX_CHANNEL_NAME_LEN: usize = 100;
pub const USER_CHANNEL_PREFIX: &str = "private-user-";
pub const PRESENCE_CHANNEL_PREFIX: &str = "presence-";

/// Restrict a channel name to `[A-Za-z0-9_-]` and at most 100 characters.
/// Any other character is replaced with `_`.
pub fn sanitize_channel_name(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_CHANNEL_NAME_LEN)
        .collect()
}

/// Per-user private channel: `private-user-<userId>`.
pub fn user_channel(user_id: &str) -> String {
    sanitize_channel_name(&format!("{USER_CHANNEL_PREFIX}{user_id}"))
}

pub fn presence_channel(name: &str) -> String {
    if name.starts_with(PRESENCE_CHANNEL_PREFIX) {
        sanitize_channel_name(name)
    } else {
        sanitize_channel_name(&format!("{PRESENCE_CHANNEL_PREFIX}{name}"))
    }
}
