//! Poll request bodies.
//!
//! A poll body is a JSON object mapping channel names to the last id the
//! client has seen:
//!
//! ```json
//! {"/chat/1": 41, "/notifications": null, "/presence": -1, "__seq": 3}
//! ```
//!
//! Keys starting with `__` are reserved for client bookkeeping and ignored.

use serde_json::Value;

use crate::codec::ProtocolError;
use crate::message::MessageId;

/// Prefix of reserved body keys.
pub const RESERVED_PREFIX: &str = "__";

/// Where a subscription starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cursor {
    /// Only messages published from now on (`null`).
    Latest,
    /// Report the current position, replay nothing (`-1`).
    Status,
    /// Replay the last `n` messages (`-(n + 1)`).
    Rewind(u64),
    /// Everything after this id.
    After(MessageId),
}

impl Cursor {
    /// Interpret a wire value.
    #[must_use]
    pub fn from_wire(value: Option<MessageId>) -> Self {
        match value {
            None => Cursor::Latest,
            Some(-1) => Cursor::Status,
            Some(id) if id < -1 => Cursor::Rewind(id.unsigned_abs() - 1),
            Some(id) => Cursor::After(id),
        }
    }

    /// The explicit position, if resolved.
    #[must_use]
    pub fn position(&self) -> Option<MessageId> {
        match self {
            Cursor::After(id) => Some(*id),
            _ => None,
        }
    }
}

/// Parse a poll body into `(channel, cursor)` pairs, ordered by channel name.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidRequest`] when the body is not a JSON
/// object or a position is neither an integer, a numeric string nor `null`.
pub fn parse_subscriptions(body: &[u8]) -> Result<Vec<(String, Cursor)>, ProtocolError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }

    let value: Value = serde_json::from_slice(body)
        .map_err(|e| ProtocolError::InvalidRequest(format!("body is not JSON: {e}")))?;

    let Value::Object(map) = value else {
        return Err(ProtocolError::InvalidRequest(
            "body must be a JSON object".into(),
        ));
    };

    map.into_iter()
        .filter(|(channel, _)| !channel.starts_with(RESERVED_PREFIX))
        .map(|(channel, position)| {
            let position = parse_position(&channel, &position)?;
            Ok((channel, Cursor::from_wire(position)))
        })
        .collect()
}

fn parse_position(channel: &str, value: &Value) -> Result<Option<MessageId>, ProtocolError> {
    let invalid = || ProtocolError::InvalidRequest(format!("invalid position for {channel}"));

    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n.as_i64().map(Some).ok_or_else(invalid),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => s.trim().parse().map(Some).map_err(|_| invalid()),
        _ => Err(invalid()),
    }
}
