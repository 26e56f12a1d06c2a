//! # postbus-protocol
//!
//! Message model and wire formats for the postbus message bus.
//!
//! Two formats live here:
//!
//! - **Stored payloads** ([`codec`]) - how a [`Message`] is written into a
//!   backlog and broadcast between server processes.
//! - **HTTP** ([`request`], [`envelope`]) - the long-poll request body and
//!   the JSON response array served to browsers.
//!
//! ## Example
//!
//! ```rust
//! use postbus_protocol::{codec, Message, MessageBody};
//! use serde_json::json;
//!
//! let msg = Message::from_body(1, 1, MessageBody::new("/foo", json!("bar")));
//! let stored = codec::encode(&msg).unwrap();
//! assert_eq!(codec::decode(&stored).unwrap(), msg);
//! ```

pub mod codec;
pub mod envelope;
pub mod message;
pub mod request;

pub use codec::{decode, encode, ProtocolError};
pub use envelope::{envelopes, Envelope};
pub use message::{Message, MessageBody, MessageId, STATUS_CHANNEL};
pub use request::{parse_subscriptions, Cursor};
