//! In-process backlog substrate.
//!
//! Everything lives behind one mutex, which makes each publish trivially
//! atomic. Notifications go out over a broadcast channel, so several
//! [`MessageBus`](crate::MessageBus) instances sharing one `MemoryBacklog`
//! behave like separate processes sharing a Redis.

use super::{
    validate_publish, BacklogConfig, BacklogError, BacklogStore, MessageLookup, MessageStream,
};
use crate::channel::ChannelKey;
use crate::message::{Message, MessageId, PublishOptions};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{trace, warn};

/// Default broadcast capacity for notifications.
const DEFAULT_NOTIFY_CAPACITY: usize = 4096;

/// A bounded, expiring sequence of messages.
#[derive(Debug, Default)]
struct Log {
    messages: VecDeque<Arc<Message>>,
    expires_at: Option<Instant>,
}

impl Log {
    fn push(&mut self, message: Arc<Message>, bound: usize, expires_at: Instant) {
        self.messages.push_back(message);
        while self.messages.len() > bound {
            self.messages.pop_front();
        }
        self.expires_at = Some(expires_at);
    }

    /// Drop everything if the log has expired.
    fn expire(&mut self, now: Instant) {
        if self.expires_at.is_some_and(|at| at <= now) {
            self.messages.clear();
            self.expires_at = None;
        }
    }
}

#[derive(Debug, Default)]
struct State {
    global_id: MessageId,
    last_ids: HashMap<ChannelKey, MessageId>,
    channels: HashMap<ChannelKey, Log>,
    global: Log,
}

/// In-memory [`BacklogStore`].
pub struct MemoryBacklog {
    state: Mutex<State>,
    notifier: Mutex<broadcast::Sender<Arc<Message>>>,
    config: BacklogConfig,
}

impl MemoryBacklog {
    /// Create a store with default bounds.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(BacklogConfig::default())
    }

    /// Create a store with custom bounds.
    #[must_use]
    pub fn with_config(config: BacklogConfig) -> Self {
        let (sender, _) = broadcast::channel(DEFAULT_NOTIFY_CAPACITY);
        Self {
            state: Mutex::new(State::default()),
            notifier: Mutex::new(sender),
            config,
        }
    }

    /// Close every open notification stream.
    ///
    /// Listeners see their stream end, exactly as they would on a lost
    /// substrate connection, and reconnect.
    pub fn drop_listeners(&self) {
        let (sender, _) = broadcast::channel(DEFAULT_NOTIFY_CAPACITY);
        *self.notifier.lock() = sender;
        warn!("Closed all memory backlog listeners");
    }

    /// Number of open notification streams.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.notifier.lock().receiver_count()
    }
}

impl Default for MemoryBacklog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BacklogStore for MemoryBacklog {
    async fn publish(
        &self,
        channel: &str,
        data: Value,
        options: &PublishOptions,
    ) -> Result<MessageId, BacklogError> {
        let age = validate_publish(channel, options, &self.config)?;

        let key = ChannelKey::new(channel, options.site_id.as_deref());
        let bound = options
            .max_backlog_size
            .unwrap_or(self.config.max_backlog_size);
        let now = Instant::now();
        let expires_at = now
            .checked_add(age)
            .ok_or(BacklogError::InvalidRetention("backlog expiry out of range"))?;
        let mut guard = self.state.lock();
        let state = &mut *guard;

        state.global_id += 1;
        let global_id = state.global_id;
        let last_id = state.last_ids.entry(key.clone()).or_insert(0);
        *last_id += 1;
        let message_id = *last_id;

        let message = Arc::new(Message::from_body(
            global_id,
            message_id,
            options.body(channel, data),
        ));

        let log = state.channels.entry(key).or_default();
        log.expire(now);
        log.push(Arc::clone(&message), bound, expires_at);
        state.global.expire(now);
        state.global.push(
            Arc::clone(&message),
            self.config.max_global_backlog_size,
            expires_at,
        );

        // Notify while still holding the state lock so listeners observe
        // global ids in order.
        let receivers = self.notifier.lock().send(message).unwrap_or_default();
        trace!(channel = %channel, message_id, global_id, receivers, "Published message");

        Ok(message_id)
    }

    async fn last_global_id(&self) -> Result<MessageId, BacklogError> {
        Ok(self.state.lock().global_id)
    }

    async fn last_id(
        &self,
        channel: &str,
        site_id: Option<&str>,
    ) -> Result<MessageId, BacklogError> {
        let key = ChannelKey::new(channel, site_id);
        Ok(self.state.lock().last_ids.get(&key).copied().unwrap_or(0))
    }

    async fn backlog(
        &self,
        channel: &str,
        last_id: MessageId,
        site_id: Option<&str>,
    ) -> Result<Vec<Message>, BacklogError> {
        let key = ChannelKey::new(channel, site_id);
        let mut state = self.state.lock();

        let Some(log) = state.channels.get_mut(&key) else {
            return Ok(Vec::new());
        };
        log.expire(Instant::now());

        Ok(log
            .messages
            .iter()
            .filter(|m| m.message_id > last_id)
            .map(|m| Message::clone(m))
            .collect())
    }

    async fn global_backlog(
        &self,
        last_global_id: MessageId,
    ) -> Result<Vec<Message>, BacklogError> {
        let mut state = self.state.lock();
        state.global.expire(Instant::now());

        Ok(state
            .global
            .messages
            .iter()
            .filter(|m| m.global_id > last_global_id)
            .map(|m| Message::clone(m))
            .collect())
    }

    async fn get_message(
        &self,
        channel: &str,
        id: MessageId,
        site_id: Option<&str>,
    ) -> Result<MessageLookup, BacklogError> {
        let key = ChannelKey::new(channel, site_id);
        let mut state = self.state.lock();

        let last_id = state.last_ids.get(&key).copied().unwrap_or(0);
        if id <= 0 || id > last_id {
            return Ok(MessageLookup::NotFound);
        }

        let found = state.channels.get_mut(&key).and_then(|log| {
            log.expire(Instant::now());
            log.messages
                .iter()
                .find(|m| m.message_id == id)
                .map(|m| Message::clone(m))
        });

        Ok(found.map_or(MessageLookup::Expired, MessageLookup::Found))
    }

    async fn listen(&self) -> Result<MessageStream, BacklogError> {
        let rx = self.notifier.lock().subscribe();

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(message) => return Some((Ok(Message::clone(&message)), rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // The listener fills the gap from the global backlog.
                        warn!(skipped, "Memory backlog listener lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(Box::pin(stream))
    }

    async fn reset(&self) -> Result<(), BacklogError> {
        *self.state.lock() = State::default();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
