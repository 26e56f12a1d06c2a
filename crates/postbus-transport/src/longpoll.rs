//! HTTP long-poll transport.
//!
//! Each poll either answers straight from the backlog or parks the client in
//! the [`ConnectionManager`] until a message arrives or the poll times out.
//! A poll always ends with exactly one response.

use crate::traits::{ClientId, Transport, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use postbus_core::{
    Client, ConnectionManager, Identity, Message, MessageBus, Resolution, ResponseSlot,
};
use postbus_protocol::{envelopes, parse_subscriptions, Envelope};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// A parsed-on-demand poll request.
#[derive(Debug, Clone)]
pub struct PollRequest {
    client_id: ClientId,
    identity: Identity,
    body: Bytes,
    long_poll: bool,
}

impl PollRequest {
    /// Create a long-polling request.
    #[must_use]
    pub fn new(client_id: ClientId, identity: Identity, body: impl Into<Bytes>) -> Self {
        Self {
            client_id,
            identity,
            body: body.into(),
            long_poll: true,
        }
    }

    /// Enable or disable parking (`dlp=t` disables).
    #[must_use]
    pub fn with_long_poll(mut self, long_poll: bool) -> Self {
        self.long_poll = long_poll;
        self
    }
}

/// How a poll was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    /// Answered from the backlog without parking.
    Immediate,
    /// Parked, then woken by a message.
    Delivered,
    /// Parked until the timeout, or replaced by a newer poll.
    TimedOut,
}

impl PollState {
    /// Label used in logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PollState::Immediate => "immediate",
            PollState::Delivered => "delivered",
            PollState::TimedOut => "timeout",
        }
    }
}

/// The response to a poll.
#[derive(Debug, Clone, PartialEq)]
pub struct PollOutcome {
    /// How the poll ended.
    pub state: PollState,
    /// Messages to send, possibly empty.
    pub messages: Vec<Message>,
}

impl PollOutcome {
    fn new(state: PollState, messages: Vec<Message>) -> Self {
        Self { state, messages }
    }

    /// Wire representation of the messages.
    #[must_use]
    pub fn into_envelopes(self) -> Vec<Envelope> {
        envelopes(self.messages)
    }
}

/// Deregisters a parked client when the poll future is dropped.
struct ParkGuard {
    connections: Arc<ConnectionManager>,
    client_id: String,
    slot: Arc<ResponseSlot>,
}

impl Drop for ParkGuard {
    fn drop(&mut self) {
        if self.connections.remove_slot(&self.client_id, &self.slot) {
            trace!(client = %self.client_id, "Released parked client");
        }
    }
}

/// Long-poll transport over a [`MessageBus`].
pub struct LongPoll {
    bus: Arc<MessageBus>,
    timeout: Duration,
}

impl LongPoll {
    /// Create a transport using the bus's poll timeout.
    #[must_use]
    pub fn new(bus: Arc<MessageBus>) -> Self {
        let timeout = bus.config().poll_timeout;
        Self { bus, timeout }
    }

    /// Override the poll timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The poll timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn client(request: &PollRequest) -> Result<Client, TransportError> {
        let mut client = Client::new(request.client_id.as_str(), request.identity.clone());
        for (channel, cursor) in parse_subscriptions(&request.body)? {
            client.subscribe(channel, cursor)?;
        }
        Ok(client)
    }
}

#[async_trait]
impl Transport for LongPoll {
    async fn poll(&self, request: PollRequest) -> Result<PollOutcome, TransportError> {
        let mut client = Self::client(&request)?;
        let store = self.bus.store().as_ref();

        let messages = client.backlog(store).await?;
        if !messages.is_empty() || !request.long_poll || client.subscription_count() == 0 {
            trace!(client = %request.client_id, count = messages.len(), "Answering from backlog");
            return Ok(PollOutcome::new(PollState::Immediate, messages));
        }

        let connections = self.bus.connections().clone();
        let (slot, rx) = ResponseSlot::new();
        let _guard = ParkGuard {
            connections: connections.clone(),
            client_id: request.client_id.as_str().to_string(),
            slot: slot.clone(),
        };
        connections.add_client(client.clone(), slot.clone(), self.timeout);

        // A publish between the first read and registration is only visible here.
        let late = client.backlog(store).await?;
        if !late.is_empty() && slot.resolve(Resolution::Delivered(late)) {
            debug!(client = %request.client_id, "Message arrived while parking");
        }

        match rx.await {
            Ok(Resolution::Delivered(messages)) => {
                Ok(PollOutcome::new(PollState::Delivered, messages))
            }
            Ok(Resolution::TimedOut | Resolution::Replaced) | Err(_) => {
                Ok(PollOutcome::new(PollState::TimedOut, Vec::new()))
            }
        }
    }

    fn name(&self) -> &'static str {
        "long-poll"
    }
}
