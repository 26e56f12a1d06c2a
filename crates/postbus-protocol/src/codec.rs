//! Codec for the inter-process message payload.
//!
//! Every message stored in a backlog, and every notification sent between
//! processes, uses the same layout:
//!
//! - ASCII decimal global id, `|`
//! - ASCII decimal channel id, `|`
//! - MessagePack-encoded [`MessageBody`]
//!
//! The ids stay in plain text so the substrate can prepend them atomically
//! when it assigns them (see the Redis publish script).

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::message::{Message, MessageBody, MessageId};

/// Maximum encoded body size (16 MiB).
pub const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// Separator between the id prefix fields and the body.
pub const SEPARATOR: u8 = b'|';

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Body exceeds maximum size.
    #[error("Body size {0} exceeds maximum {MAX_BODY_SIZE}")]
    BodyTooLarge(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Malformed id prefix.
    #[error("Invalid payload: {0}")]
    Invalid(String),

    /// Malformed subscription request body.
    #[error("Invalid subscription request: {0}")]
    InvalidRequest(String),
}

/// Encode a message body without ids.
///
/// # Errors
///
/// Returns an error if the body is too large or encoding fails.
pub fn encode_body(body: &MessageBody) -> Result<Vec<u8>, ProtocolError> {
    let encoded = rmp_serde::to_vec_named(body)?;
    if encoded.len() > MAX_BODY_SIZE {
        return Err(ProtocolError::BodyTooLarge(encoded.len()));
    }
    Ok(encoded)
}

/// Encode a complete message in stored form.
///
/// # Errors
///
/// Returns an error if the body is too large or encoding fails.
pub fn encode(message: &Message) -> Result<Bytes, ProtocolError> {
    let body = encode_body(&message.to_body())?;
    let prefix = format!("{}|{}|", message.global_id, message.message_id);

    let mut buf = BytesMut::with_capacity(prefix.len() + body.len());
    buf.put_slice(prefix.as_bytes());
    buf.extend_from_slice(&body);

    Ok(buf.freeze())
}

/// Decode a message from stored form.
///
/// # Errors
///
/// Returns an error if the id prefix or the body is malformed.
pub fn decode(data: &[u8]) -> Result<Message, ProtocolError> {
    let (global_id, rest) = split_id(data)?;
    let (message_id, body) = split_id(rest)?;

    if body.len() > MAX_BODY_SIZE {
        return Err(ProtocolError::BodyTooLarge(body.len()));
    }

    let body: MessageBody = rmp_serde::from_slice(body)?;
    Ok(Message::from_body(global_id, message_id, body))
}

/// Split one `<id>|` field off the front of `data`.
fn split_id(data: &[u8]) -> Result<(MessageId, &[u8]), ProtocolError> {
    let pos = data
        .iter()
        .position(|b| *b == SEPARATOR)
        .ok_or_else(|| ProtocolError::Invalid("missing id separator".into()))?;

    let id = std::str::from_utf8(&data[..pos])
        .ok()
        .and_then(|s| s.parse::<MessageId>().ok())
        .ok_or_else(|| ProtocolError::Invalid("id is not an integer".into()))?;

    Ok((id, &data[pos + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Message {
        let mut body = MessageBody::new("/chat/42", json!({"text": "a|b|c", "n": 7}));
        body.site_id = Some("tenant-a".into());
        body.user_ids = vec![5, 6];
        Message::from_body(1200, 17, body)
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let msg = sample();
        let encoded = encode(&msg).unwrap();
        assert!(encoded.starts_with(b"1200|17|"));
        assert_eq!(decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_body_prefixed_externally() {
        // The Redis script builds the prefix itself from the raw body.
        let msg = sample();
        let body = encode_body(&msg.to_body()).unwrap();
        let mut stored = b"9|3|".to_vec();
        stored.extend_from_slice(&body);

        let decoded = decode(&stored).unwrap();
        assert_eq!(decoded.global_id, 9);
        assert_eq!(decoded.message_id, 3);
        assert_eq!(decoded.data, msg.data);
    }

    #[test]
    fn test_decode_invalid_prefix() {
        assert!(matches!(decode(b"abc"), Err(ProtocolError::Invalid(_))));
        assert!(matches!(decode(b"x|1|"), Err(ProtocolError::Invalid(_))));
        assert!(matches!(decode(b"1|"), Err(ProtocolError::Invalid(_))));
    }

    #[test]
    fn test_decode_garbage_body() {
        match decode(b"1|1|\xc1") {
            Err(ProtocolError::Decode(_)) => {}
            other => panic!("Expected Decode error, got {:?}", other),
        }
    }
}
