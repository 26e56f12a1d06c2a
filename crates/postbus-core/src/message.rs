//! Publish options and message re-exports.

use std::time::Duration;

pub use postbus_protocol::{Message, MessageBody, MessageId};

/// Targeting and retention options for a single publish.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishOptions {
    /// Site scope.
    pub site_id: Option<String>,
    /// Deliver only to these users.
    pub user_ids: Vec<i64>,
    /// Deliver only to members of these groups.
    pub group_ids: Vec<i64>,
    /// Deliver only to these client ids.
    pub client_ids: Vec<String>,
    /// Override the store's channel backlog bound for this append.
    pub max_backlog_size: Option<usize>,
    /// Override the store's backlog expiry for this append.
    pub max_backlog_age: Option<Duration>,
}

impl PublishOptions {
    /// Create options with no targeting.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish on a site.
    #[must_use]
    pub fn with_site(mut self, site_id: impl Into<String>) -> Self {
        self.site_id = Some(site_id.into());
        self
    }

    /// Restrict to users.
    #[must_use]
    pub fn with_user_ids(mut self, user_ids: Vec<i64>) -> Self {
        self.user_ids = user_ids;
        self
    }

    /// Restrict to groups.
    #[must_use]
    pub fn with_group_ids(mut self, group_ids: Vec<i64>) -> Self {
        self.group_ids = group_ids;
        self
    }

    /// Restrict to client ids.
    #[must_use]
    pub fn with_client_ids(mut self, client_ids: Vec<String>) -> Self {
        self.client_ids = client_ids;
        self
    }

    /// Bound the channel backlog for this append.
    #[must_use]
    pub fn with_max_backlog_size(mut self, size: usize) -> Self {
        self.max_backlog_size = Some(size);
        self
    }

    /// Expire the backlogs this long after this append.
    #[must_use]
    pub fn with_max_backlog_age(mut self, age: Duration) -> Self {
        self.max_backlog_age = Some(age);
        self
    }

    /// Build the stored body for `channel`.
    #[must_use]
    pub fn body(&self, channel: &str, data: serde_json::Value) -> MessageBody {
        MessageBody {
            channel: channel.to_string(),
            data,
            site_id: self.site_id.clone(),
            user_ids: self.user_ids.clone(),
            group_ids: self.group_ids.clone(),
            client_ids: self.client_ids.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_publish_options_body() {
        let opts = PublishOptions::new()
            .with_site("tenant-a")
            .with_user_ids(vec![5])
            .with_max_backlog_size(2);

        let body = opts.body("/foo", json!("bar"));
        assert_eq!(body.channel, "/foo");
        assert_eq!(body.site_id.as_deref(), Some("tenant-a"));
        assert_eq!(body.user_ids, vec![5]);
        assert!(body.group_ids.is_empty());
        assert_eq!(opts.max_backlog_size, Some(2));
    }
}
