//! Subscriber identities.
//!
//! A [`Client`] is rebuilt for every poll from the request's `client_id`,
//! the caller-supplied [`Identity`] and the positions in the request body.
//! Only the `client_id` is stable across poll cycles.

use crate::backlog::{BacklogError, BacklogStore};
use crate::channel::{validate_channel_name, ChannelId};
use crate::message::{Message, MessageId};
use postbus_protocol::Cursor;
use std::collections::BTreeMap;
use tracing::debug;

/// Who a client is, as far as message targeting is concerned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    /// Site the client belongs to.
    pub site_id: Option<String>,
    /// Authenticated user, if any.
    pub user_id: Option<i64>,
    /// Groups the user belongs to.
    pub group_ids: Vec<i64>,
}

impl Identity {
    /// Anonymous identity on the default site.
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Set the site.
    #[must_use]
    pub fn with_site(mut self, site_id: impl Into<String>) -> Self {
        self.site_id = Some(site_id.into());
        self
    }

    /// Set the user.
    #[must_use]
    pub fn with_user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// Set the groups.
    #[must_use]
    pub fn with_groups(mut self, group_ids: Vec<i64>) -> Self {
        self.group_ids = group_ids;
        self
    }

    /// Site, user and group targeting.
    fn accepts(&self, message: &Message) -> bool {
        if message.site_id != self.site_id {
            return false;
        }
        if !message.user_ids.is_empty()
            && !self
                .user_id
                .is_some_and(|user_id| message.user_ids.contains(&user_id))
        {
            return false;
        }
        if !message.group_ids.is_empty()
            && !message.group_ids.iter().any(|g| self.group_ids.contains(g))
        {
            return false;
        }
        true
    }
}

/// A subscriber with per-channel resume positions.
#[derive(Debug, Clone)]
pub struct Client {
    client_id: String,
    identity: Identity,
    subscriptions: BTreeMap<ChannelId, Cursor>,
}

impl Client {
    /// Create a client with no subscriptions.
    #[must_use]
    pub fn new(client_id: impl Into<String>, identity: Identity) -> Self {
        Self {
            client_id: client_id.into(),
            identity,
            subscriptions: BTreeMap::new(),
        }
    }

    /// The stable client id.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The targeting identity.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The site this client belongs to.
    #[must_use]
    pub fn site_id(&self) -> Option<&str> {
        self.identity.site_id.as_deref()
    }

    /// Subscribed channel names.
    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.subscriptions.keys().map(String::as_str)
    }

    /// Number of subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// The cursor for a channel.
    #[must_use]
    pub fn cursor(&self, channel: &str) -> Option<Cursor> {
        self.subscriptions.get(channel).copied()
    }

    /// Register interest in a channel, replacing any previous cursor.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel name is invalid.
    pub fn subscribe(&mut self, channel: impl Into<ChannelId>, cursor: Cursor) -> Result<(), BacklogError> {
        let channel = channel.into();
        validate_channel_name(&channel).map_err(BacklogError::InvalidChannel)?;
        self.subscriptions.insert(channel, cursor);
        Ok(())
    }

    /// Whether `message` may be delivered to this client.
    ///
    /// Untargeted messages reach every same-site subscriber of the channel;
    /// targeted messages never cross site, user, group or client boundaries.
    #[must_use]
    pub fn should_deliver(&self, message: &Message) -> bool {
        self.subscriptions.contains_key(&message.channel)
            && self.identity.accepts(message)
            && (message.client_ids.is_empty() || message.client_ids.contains(&self.client_id))
    }

    /// Whether the client's position on the message's channel is already at
    /// or past the message.
    #[must_use]
    pub fn has_seen(&self, message: &Message) -> bool {
        self.subscriptions
            .get(&message.channel)
            .and_then(Cursor::position)
            .is_some_and(|seen| message.message_id <= seen)
    }

    /// Fetch everything the client has not seen yet.
    ///
    /// Resolves every cursor to an explicit position as a side effect.
    /// Channels subscribed with [`Cursor::Status`], and channels whose
    /// position is ahead of the substrate, are reported through a trailing
    /// `/__status` message.
    ///
    /// # Errors
    ///
    /// Returns an error if the substrate cannot be read.
    pub async fn backlog(&mut self, store: &dyn BacklogStore) -> Result<Vec<Message>, BacklogError> {
        let site_id = self.identity.site_id.clone();
        let site_id = site_id.as_deref();

        let mut messages = Vec::new();
        let mut status = BTreeMap::new();

        for (channel, cursor) in self.subscriptions.iter_mut() {
            let last_id = store.last_id(channel, site_id).await?;

            let start = match *cursor {
                Cursor::Latest => last_id,
                Cursor::Status => {
                    status.insert(channel.clone(), last_id);
                    last_id
                }
                Cursor::Rewind(count) => {
                    let count = MessageId::try_from(count).unwrap_or(MessageId::MAX);
                    last_id.saturating_sub(count).max(0)
                }
                Cursor::After(seen) if seen > last_id => {
                    debug!(channel = %channel, seen, last_id, "Client is ahead of the backlog");
                    status.insert(channel.clone(), last_id);
                    last_id
                }
                Cursor::After(seen) => seen,
            };

            let mut position = start;
            if start < last_id {
                for message in store.backlog(channel, start, site_id).await? {
                    position = position.max(message.message_id);
                    if self.identity.accepts(&message)
                        && (message.client_ids.is_empty()
                            || message.client_ids.contains(&self.client_id))
                    {
                        messages.push(message);
                    }
                }
            }
            *cursor = Cursor::After(position);
        }

        if !status.is_empty() {
            messages.push(Message::status(status));
        }

        Ok(messages)
    }
}
