//! Transport abstraction traits for postbus.
//!
//! A transport turns one request from a client into one response. The server
//! stays transport-agnostic by talking to [`Transport`].

use crate::longpoll::{PollOutcome, PollRequest};
use async_trait::async_trait;
use postbus_core::BacklogError;
use std::fmt;
use thiserror::Error;

/// Maximum client id length.
pub const MAX_CLIENT_ID_LENGTH: usize = 128;

/// A client-chosen identifier, stable across polls.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(String);

impl ClientId {
    /// Validate and wrap a client id.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is empty, too long, or contains characters
    /// other than ASCII letters, digits, `-` and `_`.
    pub fn parse(id: impl Into<String>) -> Result<Self, TransportError> {
        let id = id.into();
        if id.is_empty() {
            return Err(TransportError::BadRequest("Client id cannot be empty".into()));
        }
        if id.len() > MAX_CLIENT_ID_LENGTH {
            return Err(TransportError::BadRequest("Client id too long".into()));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(TransportError::BadRequest(
                "Client id contains invalid characters".into(),
            ));
        }
        Ok(Self(id))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The request cannot be served as sent.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] postbus_protocol::ProtocolError),

    /// The backlog could not be read.
    #[error("Backlog error: {0}")]
    Backlog(#[from] BacklogError),
}

impl TransportError {
    /// Whether the client is at fault.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        match self {
            TransportError::BadRequest(_) | TransportError::Protocol(_) => true,
            TransportError::Backlog(e) => e.is_invalid_input(),
        }
    }
}

/// A request/response transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Serve one poll.
    ///
    /// Resolves once there is something to send back, which may take up to
    /// the poll timeout.
    async fn poll(&self, request: PollRequest) -> Result<PollOutcome, TransportError>;

    /// Get the transport name (e.g., "long-poll").
    fn name(&self) -> &'static str;
}
