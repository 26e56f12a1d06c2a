//! # postbus-core
//!
//! Backlogs, subscribers and message routing for the postbus message bus.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Backlog** - Ordered, bounded, replayable logs with cross-process notification
//! - **Client** - Subscriber identity, targeting and resume positions
//! - **Connection** - Registry of parked long-poll clients
//! - **Subscriber** - Substrate listener with gap-fill and reconnect
//! - **Bus** - The per-process service tying them together
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  publish  ┌──────────────┐  notify   ┌─────────────┐
//! │  MessageBus │──────────▶│ BacklogStore │──────────▶│  Listener   │
//! └─────────────┘           └──────────────┘           └─────────────┘
//!                                  ▲                          │
//!                           backlog│                          ▼
//!                           ┌─────────────┐  park   ┌───────────────────┐
//!                           │   Client    │────────▶│ ConnectionManager │
//!                           └─────────────┘         └───────────────────┘
//! ```

pub mod backlog;
pub mod bus;
pub mod channel;
pub mod client;
pub mod connection;
pub mod message;
pub mod subscriber;

#[cfg(feature = "redis")]
pub use backlog::RedisBacklog;
pub use backlog::{
    BacklogConfig, BacklogError, BacklogStore, MemoryBacklog, MessageLookup, MessageStream,
    MAX_BACKLOG_AGE,
};
pub use bus::{BusConfig, Handler, MessageBus};
pub use channel::{ChannelId, ChannelKey, KEEPALIVE_CHANNEL};
pub use client::{Client, Identity};
pub use connection::{ConnectionManager, ConnectionStats, ParkedClient, Resolution, ResponseSlot};
pub use message::{Message, MessageBody, MessageId, PublishOptions};
pub use postbus_protocol::Cursor;
pub use subscriber::{Listener, ListenerStatus};
