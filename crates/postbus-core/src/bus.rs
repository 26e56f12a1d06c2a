//! The message bus service.
//!
//! One [`MessageBus`] per process ties a substrate to the parked-client
//! registry. Every message, including this process's own publishes, reaches
//! parked clients and registered handlers through the substrate listener.

use crate::backlog::{BacklogError, BacklogStore};
use crate::channel::{validate_channel_name, KEEPALIVE_CHANNEL};
use crate::connection::ConnectionManager;
use crate::message::{Message, MessageId, PublishOptions};
use crate::subscriber::{Listener, ListenerStatus};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// An in-process message handler.
pub type Handler = Arc<dyn Fn(&Message) + Send + Sync>;

/// Bus configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// How long a poll stays parked.
    pub poll_timeout: Duration,
    /// Keepalive publish interval, zero disables.
    pub keepalive_interval: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(25),
            keepalive_interval: Duration::from_secs(60),
        }
    }
}

/// Handler table keyed by exact channel name.
type Handlers = DashMap<String, Vec<Handler>>;

/// The message bus.
pub struct MessageBus {
    store: Arc<dyn BacklogStore>,
    connections: Arc<ConnectionManager>,
    handlers: Arc<Handlers>,
    listener_status: Arc<ListenerStatus>,
    config: BusConfig,
    cancel: CancellationToken,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MessageBus {
    /// Create a bus over a substrate. Call [`MessageBus::start`] to begin
    /// delivering.
    #[must_use]
    pub fn new(store: Arc<dyn BacklogStore>, config: BusConfig) -> Self {
        info!(
            store = store.name(),
            poll_timeout_ms = config.poll_timeout.as_millis() as u64,
            keepalive_ms = config.keepalive_interval.as_millis() as u64,
            "Creating message bus"
        );
        Self {
            store,
            connections: Arc::new(ConnectionManager::new()),
            handlers: Arc::new(DashMap::new()),
            listener_status: Arc::new(ListenerStatus::new()),
            config,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the listener and, if enabled, the keepalive task.
    ///
    /// Subsequent calls do nothing.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let connections = self.connections.clone();
        let handlers = self.handlers.clone();
        let listener = Listener::new(self.store.clone(), self.cancel.child_token())
            .with_status(self.listener_status.clone());
        let listener_task = tokio::spawn(listener.run(None, move |message| {
            dispatch(&connections, &handlers, &message);
        }));

        let mut tasks = self.tasks.lock();
        tasks.push(listener_task);

        if !self.config.keepalive_interval.is_zero() {
            tasks.push(tokio::spawn(keepalive(
                self.store.clone(),
                self.listener_status.clone(),
                self.config.keepalive_interval,
                self.cancel.child_token(),
            )));
        }

        info!("Message bus started");
    }

    /// Stop background tasks and release every parked client.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let drained = self.connections.drain();

        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }

        info!(drained, "Message bus stopped");
    }

    /// Publish a message.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel or site is invalid or the substrate is
    /// unavailable.
    pub async fn publish(
        &self,
        channel: &str,
        data: Value,
        options: PublishOptions,
    ) -> Result<MessageId, BacklogError> {
        let id = self.store.publish(channel, data, &options).await?;
        trace!(channel = %channel, message_id = id, "Published");
        Ok(id)
    }

    /// Register a handler for every message on `channel`, on any site.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel name is invalid.
    pub fn on<F>(&self, channel: &str, handler: F) -> Result<(), BacklogError>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        validate_channel_name(channel).map_err(BacklogError::InvalidChannel)?;
        self.handlers
            .entry(channel.to_string())
            .or_default()
            .push(Arc::new(handler));
        debug!(channel = %channel, "Registered handler");
        Ok(())
    }

    /// Remove every handler for `channel`.
    pub fn off(&self, channel: &str) -> usize {
        self.handlers
            .remove(channel)
            .map(|(_, handlers)| handlers.len())
            .unwrap_or_default()
    }

    /// The substrate.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn BacklogStore> {
        &self.store
    }

    /// The parked-client registry.
    #[must_use]
    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Listener health.
    #[must_use]
    pub fn listener_status(&self) -> &Arc<ListenerStatus> {
        &self.listener_status
    }

    /// Bus configuration.
    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.config
    }
}

fn dispatch(connections: &ConnectionManager, handlers: &Handlers, message: &Message) {
    if message.channel == KEEPALIVE_CHANNEL {
        return;
    }

    connections.notify_clients(message);

    // Clone out so handlers may register more handlers.
    let registered = handlers.get(&message.channel).map(|h| h.value().clone());
    for handler in registered.into_iter().flatten() {
        handler(message);
    }
}

/// Time without a notification, once it exceeds three keepalive intervals.
fn stalled_for(status: &ListenerStatus, started: Instant, interval: Duration) -> Option<Duration> {
    let idle = status.idle_for().unwrap_or_else(|| started.elapsed());
    (idle > interval * 3).then_some(idle)
}

async fn keepalive(
    store: Arc<dyn BacklogStore>,
    status: Arc<ListenerStatus>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let started = Instant::now();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick fires immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Some(idle) = stalled_for(&status, started, interval) {
            warn!(
                idle_ms = idle.as_millis() as u64,
                "Listener has not received a message in three keepalive intervals"
            );
        }

        if let Err(e) = store
            .publish(KEEPALIVE_CHANNEL, Value::Null, &PublishOptions::new())
            .await
        {
            warn!(error = %e, "Keepalive publish failed");
        }
    }
}
