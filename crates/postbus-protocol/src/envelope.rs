//! HTTP response envelopes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::{Message, MessageId};

/// One entry of a poll response array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Channel the message belongs to.
    pub channel: String,
    /// Opaque payload.
    pub data: Value,
    /// Global position (`-1` for status reports).
    pub global_id: MessageId,
    /// Channel position (`-1` for status reports).
    pub message_id: MessageId,
}

impl From<&Message> for Envelope {
    fn from(message: &Message) -> Self {
        Self {
            channel: message.channel.clone(),
            data: message.data.clone(),
            global_id: message.global_id,
            message_id: message.message_id,
        }
    }
}

impl From<Message> for Envelope {
    fn from(message: Message) -> Self {
        Self {
            channel: message.channel,
            data: message.data,
            global_id: message.global_id,
            message_id: message.message_id,
        }
    }
}

/// Convert delivered messages into the response array.
#[must_use]
pub fn envelopes(messages: Vec<Message>) -> Vec<Envelope> {
    messages.into_iter().map(Envelope::from).collect()
}
