//! The message data model.
//!
//! A [`Message`] is the immutable unit stored in a backlog. Its ids are
//! assigned by the substrate at publish time; everything else is the
//! [`MessageBody`] supplied by the publisher.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A channel or global sequence number.
///
/// Signed because clients use negative values on the wire to request status
/// reports and rewinds.
pub type MessageId = i64;

/// Reserved channel carrying position reports back to clients.
pub const STATUS_CHANNEL: &str = "/__status";

/// The publisher-supplied part of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBody {
    /// Target channel.
    pub channel: String,
    /// Opaque payload.
    pub data: Value,
    /// Site scope, `None` for the default site.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_id: Option<String>,
    /// Restrict delivery to these users.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user_ids: Vec<i64>,
    /// Restrict delivery to members of these groups.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_ids: Vec<i64>,
    /// Restrict delivery to these client ids.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub client_ids: Vec<String>,
}

impl MessageBody {
    /// Create an untargeted body.
    #[must_use]
    pub fn new(channel: impl Into<String>, data: Value) -> Self {
        Self {
            channel: channel.into(),
            data,
            site_id: None,
            user_ids: Vec::new(),
            group_ids: Vec::new(),
            client_ids: Vec::new(),
        }
    }
}

/// A published message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Position in the global (cross-channel) backlog.
    pub global_id: MessageId,
    /// Position in the channel backlog.
    pub message_id: MessageId,
    /// Channel the message was published to.
    pub channel: String,
    /// Opaque payload.
    pub data: Value,
    /// Site scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_id: Option<String>,
    /// User targeting; empty means every user.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user_ids: Vec<i64>,
    /// Group targeting; empty means every group.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_ids: Vec<i64>,
    /// Client targeting; empty means every client.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub client_ids: Vec<String>,
}

impl Message {
    /// Assemble a message from its assigned ids and body.
    #[must_use]
    pub fn from_body(global_id: MessageId, message_id: MessageId, body: MessageBody) -> Self {
        Self {
            global_id,
            message_id,
            channel: body.channel,
            data: body.data,
            site_id: body.site_id,
            user_ids: body.user_ids,
            group_ids: body.group_ids,
            client_ids: body.client_ids,
        }
    }

    /// Build a `/__status` message reporting the current position of each channel.
    #[must_use]
    pub fn status(positions: BTreeMap<String, MessageId>) -> Self {
        let data = positions
            .into_iter()
            .map(|(channel, id)| (channel, Value::from(id)))
            .collect::<serde_json::Map<_, _>>();
        Self::from_body(-1, -1, MessageBody::new(STATUS_CHANNEL, Value::Object(data)))
    }

    /// Whether this is a synthetic status report.
    #[must_use]
    pub fn is_status(&self) -> bool {
        self.channel == STATUS_CHANNEL
    }

    /// Whether any targeting restriction applies.
    #[must_use]
    pub fn is_targeted(&self) -> bool {
        !(self.user_ids.is_empty() && self.group_ids.is_empty() && self.client_ids.is_empty())
    }

    /// Borrow the publisher-supplied fields as a body for re-encoding.
    #[must_use]
    pub fn to_body(&self) -> MessageBody {
        MessageBody {
            channel: self.channel.clone(),
            data: self.data.clone(),
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
    fn test_status_message() {
        let mut positions = BTreeMap::new();
        positions.insert("/foo".to_string(), 3);
        positions.insert("/bar".to_string(), 0);

        let msg = Message::status(positions);
        assert!(msg.is_status());
        assert_eq!(msg.global_id, -1);
        assert_eq!(msg.message_id, -1);
        assert_eq!(msg.data, json!({"/foo": 3, "/bar": 0}));
    }

    #[test]
    fn test_targeting_flags() {
        let mut body = MessageBody::new("/foo", json!("bar"));
        assert!(!Message::from_body(1, 1, body.clone()).is_targeted());

        body.group_ids = vec![10];
        assert!(Message::from_body(1, 1, body).is_targeted());
    }
}
