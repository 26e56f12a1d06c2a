//! Backlog substrates.
//!
//! A [`BacklogStore`] is the ordered, bounded, multi-process log the bus is
//! built on. It keeps one backlog per site-scoped channel plus one global
//! backlog spanning every channel, and broadcasts each append to every
//! process listening on it.
//!
//! Implementations:
//!
//! - [`MemoryBacklog`] - single process, used for development and tests
//! - [`RedisBacklog`] - Redis sorted sets, a Lua publish script and pub/sub
//!   (feature `redis`)

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::MemoryBacklog;
#[cfg(feature = "redis")]
pub use self::redis::RedisBacklog;

use crate::message::{Message, MessageId, PublishOptions};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use postbus_protocol::ProtocolError;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Backlog errors.
#[derive(Debug, Error)]
pub enum BacklogError {
    /// Invalid channel name.
    #[error("Invalid channel name: {0}")]
    InvalidChannel(&'static str),

    /// Invalid site id.
    #[error("Invalid site id: {0}")]
    InvalidSite(&'static str),

    /// Retention outside what the substrate can represent.
    #[error("Invalid retention: {0}")]
    InvalidRetention(&'static str),

    /// The substrate could not be reached or rejected the operation.
    #[error("Substrate unavailable: {0}")]
    Unavailable(String),

    /// Redis error.
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    /// A stored payload could not be decoded.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl BacklogError {
    /// Whether the publish or read was rejected because of its input.
    #[must_use]
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            BacklogError::InvalidChannel(_)
                | BacklogError::InvalidSite(_)
                | BacklogError::InvalidRetention(_)
        )
    }
}

/// Outcome of a single-message lookup.

#[derive(Debug, Clone, PartialEq)]
pub enum MessageLookup {
    /// The message is still in the backlog.
    Found(Message),
    /// The id was assigned but the message has been trimmed or expired.
    Expired,
    /// The id was never assigned on this channel.
    NotFound,
}

impl MessageLookup {
    /// The message, if found.
    #[must_use]
    pub fn into_message(self) -> Option<Message> {
        match self {
            MessageLookup::Found(message) => Some(message),
            _ => None,
        }
    }
}

/// A stream of every message published through the substrate.
///
/// The stream ending or yielding an error means the substrate connection was
/// lost; the caller reconnects by calling [`BacklogStore::listen`] again.
pub type MessageStream = BoxStream<'static, Result<Message, BacklogError>>;

/// Longest backlog age a substrate accepts (ten years).
pub const MAX_BACKLOG_AGE: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Retention bounds shared by all substrates.

#[derive(Debug, Clone)]
pub struct BacklogConfig {
    /// Messages kept per channel.
    pub max_backlog_size: usize,
    /// Messages kept in the global backlog.
    pub max_global_backlog_size: usize,
    /// Backlogs expire this long after their last append.
    pub max_backlog_age: Duration,
}

impl BacklogConfig {
    /// Check the bounds are usable.
    ///
    /// # Errors
    ///
    /// Returns [`BacklogError::InvalidRetention`] if `max_backlog_age` is
    /// longer than [`MAX_BACKLOG_AGE`].
    pub fn validate(&self) -> Result<(), BacklogError> {
        validate_backlog_age(self.max_backlog_age)
    }
}

impl Default for BacklogConfig {
    fn default() -> Self {
        Self {
            max_backlog_size: 1000,
            max_global_backlog_size: 2000,
            max_backlog_age: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// An ordered, bounded, replayable log with cross-process notification.
#[async_trait]
pub trait BacklogStore: Send + Sync {
    /// Append a message, trim both backlogs and notify listeners, atomically.
    ///
    /// Returns the channel id assigned to the message.
    async fn publish(
        &self,
        channel: &str,
        data: Value,
        options: &PublishOptions,
    ) -> Result<MessageId, BacklogError>;

    /// Highest global id ever assigned, `0` if none.
    async fn last_global_id(&self) -> Result<MessageId, BacklogError>;

    /// Highest id ever assigned on the channel, `0` if none.
    async fn last_id(&self, channel: &str, site_id: Option<&str>)
        -> Result<MessageId, BacklogError>;

    /// Messages on the channel with an id greater than `last_id`, oldest first.
    async fn backlog(
        &self,
        channel: &str,
        last_id: MessageId,
        site_id: Option<&str>,
    ) -> Result<Vec<Message>, BacklogError>;

    /// Messages on any channel with a global id greater than `last_global_id`.
    async fn global_backlog(&self, last_global_id: MessageId)
        -> Result<Vec<Message>, BacklogError>;

    /// Look up a single message by channel id.
    async fn get_message(
        &self,
        channel: &str,
        id: MessageId,
        site_id: Option<&str>,
    ) -> Result<MessageLookup, BacklogError>;

    /// Open a notification stream.
    async fn listen(&self) -> Result<MessageStream, BacklogError>;

    /// Remove every backlog and id counter.
    async fn reset(&self) -> Result<(), BacklogError>;

    /// Substrate name (e.g., "memory", "redis").
    fn name(&self) -> &'static str;
}

/// Reject ages the substrates cannot store.
///
/// # Errors
///
/// Returns [`BacklogError::InvalidRetention`] if `age` is longer than
/// [`MAX_BACKLOG_AGE`].
pub fn validate_backlog_age(age: Duration) -> Result<(), BacklogError> {
    if age > MAX_BACKLOG_AGE {
        return Err(BacklogError::InvalidRetention(
            "max backlog age exceeds ten years",
        ));
    }
    Ok(())
}

/// Check a publish before touching the substrate.
///
/// Returns the backlog age to apply.
pub(crate) fn validate_publish(
    channel: &str,
    options: &PublishOptions,
    config: &BacklogConfig,
) -> Result<Duration, BacklogError> {
    crate::channel::validate_channel_name(channel).map_err(BacklogError::InvalidChannel)?;
    if let Some(site_id) = options.site_id.as_deref() {
        crate::channel::validate_site_id(site_id).map_err(BacklogError::InvalidSite)?;
    }
    let age = options.max_backlog_age.unwrap_or(config.max_backlog_age);
    validate_backlog_age(age)?;
    Ok(age)
}
