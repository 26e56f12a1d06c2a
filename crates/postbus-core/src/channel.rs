//! Channel naming and site scoping.
//!
//! A backlog is identified by a channel name together with the site it was
//! published on. The same channel name on two sites is two independent logs.

use std::fmt;

/// Maximum channel name length.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 256;

/// Maximum site id length.
pub const MAX_SITE_ID_LENGTH: usize = 128;

/// Channel the keepalive task publishes to.
pub const KEEPALIVE_CHANNEL: &str = "/__mb_keepalive__/";

/// A channel identifier.
pub type ChannelId = String;

/// Validate a channel name.
///
/// # Errors
///
/// Returns an error message if the channel name is invalid.
pub fn validate_channel_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Channel name cannot be empty");
    }
    if name.len() > MAX_CHANNEL_NAME_LENGTH {
        return Err("Channel name too long");
    }
    if name == postbus_protocol::STATUS_CHANNEL {
        return Err("Channel name is reserved");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Channel name contains invalid characters");
    }
    Ok(())
}

/// Validate a site id.
///
/// Site ids become part of substrate keys, so `:` is not allowed.
///
/// # Errors
///
/// Returns an error message if the site id is invalid.
pub fn validate_site_id(site_id: &str) -> Result<(), &'static str> {
    if site_id.is_empty() {
        return Err("Site id cannot be empty");
    }
    if site_id.len() > MAX_SITE_ID_LENGTH {
        return Err("Site id too long");
    }
    if site_id.contains(':') || site_id.chars().any(|c| c.is_ascii_control()) {
        return Err("Site id contains invalid characters");
    }
    Ok(())
}

/// A site-scoped channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelKey {
    site_id: Option<String>,
    channel: ChannelId,
}

impl ChannelKey {
    /// Scope `channel` to `site_id`.
    #[must_use]
    pub fn new(channel: impl Into<ChannelId>, site_id: Option<&str>) -> Self {
        Self {
            site_id: site_id.map(str::to_string),
            channel: channel.into(),
        }
    }

    /// The channel name.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// The site, if any.
    #[must_use]
    pub fn site_id(&self) -> Option<&str> {
        self.site_id.as_deref()
    }
}

impl fmt::Display for ChannelKey {
    /// `site:channel`, with an empty site segment for the default site.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.site_id.as_deref().unwrap_or(""), self.channel)
    }
}
