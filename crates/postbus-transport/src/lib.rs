//! # postbus-transport
//!
//! Transport layer for the postbus message bus.
//!
//! - **Long-poll** - one HTTP request per poll cycle, parked until a message
//!   arrives or the poll times out
//!
//! ## Transport Abstraction
//!
//! Transports implement the [`Transport`] trait, allowing the server to be
//! protocol-agnostic.
//!
//! ```rust,ignore
//! use postbus_transport::{ClientId, LongPoll, PollRequest, Transport};
//!
//! async fn serve(transport: &LongPoll, body: bytes::Bytes) {
//!     let request = PollRequest::new(ClientId::parse("abc")?, Identity::anonymous(), body);
//!     let outcome = transport.poll(request).await?;
//!     // Send outcome.into_envelopes() as JSON
//! }
//! ```

pub mod longpoll;
pub mod traits;

pub use longpoll::{LongPoll, PollOutcome, PollRequest, PollState};
pub use traits::{ClientId, Transport, TransportError};
