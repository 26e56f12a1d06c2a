//! Substrate listener.
//!
//! A [`Listener`] consumes the substrate's notification stream and hands
//! every matching message to a handler. It tracks the highest global id it
//! has seen so it can fill gaps from the global backlog and replay after a
//! reconnect.

use crate::backlog::{BacklogError, BacklogStore};
use crate::channel::ChannelKey;
use crate::message::{Message, MessageId};
use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Health of a running listener, shared with diagnostics.
#[derive(Debug, Default)]
pub struct ListenerStatus {
    degraded: AtomicBool,
    reconnects: AtomicU64,
    last_global_id: AtomicI64,
    last_message_at: Mutex<Option<Instant>>,
}

impl ListenerStatus {
    /// Create a healthy status.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the listener has lost its substrate connection.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Number of reconnect attempts since start.
    #[must_use]
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Highest global id received, `0` before the first message.
    #[must_use]
    pub fn last_global_id(&self) -> MessageId {
        self.last_global_id.load(Ordering::Relaxed)
    }

    /// Time since the last notification, `None` before the first one.
    #[must_use]
    pub fn idle_for(&self) -> Option<Duration> {
        self.last_message_at.lock().map(|at| at.elapsed())
    }

    fn set_degraded(&self, degraded: bool) {
        self.degraded.store(degraded, Ordering::Release);
    }

    pub(crate) fn touch(&self, global_id: MessageId) {
        self.last_global_id.fetch_max(global_id, Ordering::Relaxed);
        *self.last_message_at.lock() = Some(Instant::now());
    }
}

enum Replay {
    Channel(ChannelKey, MessageId),
    Global(MessageId),
}

/// Long-running consumer of the substrate notification stream.
pub struct Listener {
    store: Arc<dyn BacklogStore>,
    filter: Option<ChannelKey>,
    status: Arc<ListenerStatus>,
    backoff: ExponentialBuilder,
    cancel: CancellationToken,
}

impl Listener {
    /// Create an unfiltered listener.
    #[must_use]
    pub fn new(store: Arc<dyn BacklogStore>, cancel: CancellationToken) -> Self {
        Self {
            store,
            filter: None,
            status: Arc::new(ListenerStatus::new()),
            backoff: ExponentialBuilder::default()
                .with_min_delay(Duration::from_millis(100))
                .with_max_delay(MAX_RECONNECT_DELAY)
                .with_max_times(usize::MAX)
                .with_jitter(),
            cancel,
        }
    }

    /// Only hand messages on one site-scoped channel to the handler.
    #[must_use]
    pub fn with_filter(mut self, filter: ChannelKey) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Override the reconnect backoff.
    #[must_use]
    pub fn with_backoff(mut self, backoff: ExponentialBuilder) -> Self {
        self.backoff = backoff;
        self
    }

    /// Share an existing status handle.
    #[must_use]
    pub fn with_status(mut self, status: Arc<ListenerStatus>) -> Self {
        self.status = status;
        self
    }

    /// The status handle.
    #[must_use]
    pub fn status(&self) -> Arc<ListenerStatus> {
        self.status.clone()
    }

    /// Run until cancelled.
    ///
    /// With `last_id` set, first replays what was published after it: the
    /// channel backlog when filtered (a channel id), the global backlog
    /// otherwise (a global id).
    pub async fn run<F>(self, last_id: Option<MessageId>, mut handler: F)
    where
        F: FnMut(Message) + Send,
    {
        let mut highest: Option<MessageId> = None;
        let mut replay = last_id.map(|id| match &self.filter {
            Some(key) => Replay::Channel(key.clone(), id),
            None => Replay::Global(id),
        });
        let mut backoff_iter = self.backoff.build();

        info!(store = self.store.name(), filter = ?self.filter.as_ref().map(ToString::to_string), "Listener started");

        loop {
            let result = tokio::select! {
                () = self.cancel.cancelled() => break,
                result = self.connect_and_consume(&mut replay, &mut highest, &mut backoff_iter, &mut handler) => result,
            };

            if let Err(e) = result {
                error!(error = %e, "Listener lost substrate connection");
            } else {
                warn!("Listener notification stream ended");
            }

            self.status.set_degraded(true);
            self.status.reconnects.fetch_add(1, Ordering::Relaxed);
            if let Some(seen) = highest {
                replay = Some(Replay::Global(seen));
            }

            let delay = backoff_iter.next().unwrap_or(MAX_RECONNECT_DELAY);
            warn!(backoff_ms = delay.as_millis() as u64, "Reconnecting listener after backoff");
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        info!("Listener stopped");
    }

    async fn connect_and_consume<F>(
        &self,
        replay: &mut Option<Replay>,
        highest: &mut Option<MessageId>,
        backoff_iter: &mut ExponentialBackoff,
        handler: &mut F,
    ) -> Result<(), BacklogError>
    where
        F: FnMut(Message) + Send,
    {
        // Without a position a reconnect would have nothing to replay from.
        // Read it before subscribing so a publish in between is gap-filled.
        if highest.is_none() && !matches!(replay, Some(Replay::Global(_))) {
            let seed = self.store.last_global_id().await?;
            trace!(seed, "Seeded listener position");
            *highest = Some(seed);
        }

        // Subscribe before replaying so nothing published in between is lost.
        let mut stream = self.store.listen().await?;

        if let Some(pending) = replay.as_ref() {
            let messages = match pending {
                Replay::Channel(key, id) => {
                    self.store
                        .backlog(key.channel(), *id, key.site_id())
                        .await?
                }
                Replay::Global(id) => {
                    if highest.is_none() {
                        *highest = Some(*id);
                    }
                    self.store.global_backlog(*id).await?
                }
            };
            if !messages.is_empty() {
                debug!(count = messages.len(), "Replaying backlog");
            }
            for message in messages {
                *highest = Some(highest.map_or(message.global_id, |seen| seen.max(message.global_id)));
                self.emit(message, handler);
            }
            *replay = None;
        }

        if self.status.is_degraded() {
            info!("Listener reconnected");
        }
        self.status.set_degraded(false);
        *backoff_iter = self.backoff.build();

        while let Some(received) = stream.next().await {
            self.receive(received?, highest, handler).await?;
        }
        Ok(())
    }

    async fn receive<F>(
        &self,
        message: Message,
        highest: &mut Option<MessageId>,
        handler: &mut F,
    ) -> Result<(), BacklogError>
    where
        F: FnMut(Message) + Send,
    {
        self.status.touch(message.global_id);

        if let Some(seen) = *highest {
            if message.global_id == 1 && seen > 1 {
                warn!(seen, "Global id restarted, substrate was reset");
            } else if message.global_id <= seen {
                trace!(global_id = message.global_id, seen, "Skipping already handled message");
                return Ok(());
            } else if message.global_id > seen + 1 {
                debug!(from = seen + 1, to = message.global_id - 1, "Filling global id gap");
                for missed in self.store.global_backlog(seen).await? {
                    if missed.global_id >= message.global_id {
                        break;
                    }
                    self.emit(missed, handler);
                }
            }
        }

        *highest = Some(message.global_id);
        self.emit(message, handler);
        Ok(())
    }

    fn emit<F>(&self, message: Message, handler: &mut F)
    where
        F: FnMut(Message),
    {
        if let Some(key) = &self.filter {
            if message.channel != key.channel() || message.site_id.as_deref() != key.site_id() {
                return;
            }
        }
        handler(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backlog::MemoryBacklog;
    use crate::message::PublishOptions;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn fast_backoff() -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(10))
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("listener delivered nothing")
            .expect("listener stopped")
    }

    fn spawn(listener: Listener, last_id: Option<MessageId>) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(listener.run(last_id, move |message| {
            let _ = tx.send(message);
        }));
        rx
    }

    async fn wait_for_listener(store: &MemoryBacklog) {
        while store.listener_count() == 0 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_receives_published_messages() {
        let store = Arc::new(MemoryBacklog::new());
        let cancel = CancellationToken::new();
        let listener = Listener::new(store.clone(), cancel.clone());
        let status = listener.status();
        let mut rx = spawn(listener, None);
        wait_for_listener(&store).await;

        store.publish("/foo", json!(1), &PublishOptions::new()).await.unwrap();
        store.publish("/bar", json!(2), &PublishOptions::new()).await.unwrap();

        assert_eq!(recv(&mut rx).await.channel, "/foo");
        assert_eq!(recv(&mut rx).await.channel, "/bar");
        assert_eq!(status.last_global_id(), 2);
        assert!(!status.is_degraded());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_filter_and_channel_replay() {
        let store = Arc::new(MemoryBacklog::new());
        let opts = PublishOptions::new();
        store.publish("/foo", json!("a"), &opts).await.unwrap();
        store.publish("/bar", json!("b"), &opts).await.unwrap();
        store.publish("/foo", json!("c"), &opts).await.unwrap();

        let cancel = CancellationToken::new();
        let listener = Listener::new(store.clone(), cancel.clone())
            .with_filter(ChannelKey::new("/foo", None));
        let mut rx = spawn(listener, Some(1));

        assert_eq!(recv(&mut rx).await.data, json!("c"));

        wait_for_listener(&store).await;
        store.publish("/bar", json!("d"), &opts).await.unwrap();
        store.publish("/foo", json!("e"), &opts).await.unwrap();
        assert_eq!(recv(&mut rx).await.data, json!("e"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_global_replay_then_live() {
        let store = Arc::new(MemoryBacklog::new());
        let opts = PublishOptions::new();
        for i in 1..=3 {
            store.publish("/foo", json!(i), &opts).await.unwrap();
        }

        let cancel = CancellationToken::new();
        let mut rx = spawn(Listener::new(store.clone(), cancel.clone()), Some(1));

        assert_eq!(recv(&mut rx).await.global_id, 2);
        assert_eq!(recv(&mut rx).await.global_id, 3);

        wait_for_listener(&store).await;
        store.publish("/foo", json!(4), &opts).await.unwrap();
        assert_eq!(recv(&mut rx).await.global_id, 4);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_reconnect_replays_missed_messages() {
        let store = Arc::new(MemoryBacklog::new());
        let opts = PublishOptions::new();
        let cancel = CancellationToken::new();
        let listener = Listener::new(store.clone(), cancel.clone()).with_backoff(fast_backoff());
        let status = listener.status();
        let mut rx = spawn(listener, None);
        wait_for_listener(&store).await;

        store.publish("/foo", json!(1), &opts).await.unwrap();
        assert_eq!(recv(&mut rx).await.global_id, 1);

        store.drop_listeners();
        // Published while the listener is disconnected.
        store.publish("/foo", json!(2), &opts).await.unwrap();

        assert_eq!(recv(&mut rx).await.global_id, 2);
        assert!(status.reconnects() >= 1);

        wait_for_listener(&store).await;
        store.publish("/foo", json!(3), &opts).await.unwrap();
        assert_eq!(recv(&mut rx).await.global_id, 3);
        assert!(!status.is_degraded());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_outage_before_first_message_is_replayed() {
        let store = Arc::new(MemoryBacklog::new());
        let opts = PublishOptions::new();
        let cancel = CancellationToken::new();
        let listener = Listener::new(store.clone(), cancel.clone()).with_backoff(fast_backoff());
        let mut rx = spawn(listener, None);
        wait_for_listener(&store).await;

        store.drop_listeners();
        store.publish("/foo", json!("during outage"), &opts).await.unwrap();

        let missed = recv(&mut rx).await;
        assert_eq!(missed.global_id, 1);
        assert_eq!(missed.data, json!("during outage"));

        wait_for_listener(&store).await;
        store.publish("/foo", json!("after"), &opts).await.unwrap();
        assert_eq!(recv(&mut rx).await.global_id, 2);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_starts_from_current_position() {
        let store = Arc::new(MemoryBacklog::new());
        let opts = PublishOptions::new();
        store.publish("/foo", json!("old"), &opts).await.unwrap();

        let cancel = CancellationToken::new();
        let mut rx = spawn(Listener::new(store.clone(), cancel.clone()), None);
        wait_for_listener(&store).await;

        store.publish("/foo", json!("new"), &opts).await.unwrap();
        let message = recv(&mut rx).await;
        assert_eq!(message.global_id, 2);
        assert_eq!(message.data, json!("new"));
        cancel.cancel();
    }

    /// Serves reads from a memory backlog but notifies with a fixed script.
    struct ScriptedStore {
        inner: MemoryBacklog,
        position: MessageId,
        script: Mutex<Vec<Message>>,
    }

    impl ScriptedStore {
        fn new(inner: MemoryBacklog, position: MessageId, script: Vec<Message>) -> Self {
            Self {
                inner,
                position,
                script: Mutex::new(script),
            }
        }
    }

    #[async_trait::async_trait]
    impl BacklogStore for ScriptedStore {
        async fn publish(
            &self,
            channel: &str,
            data: serde_json::Value,
            options: &PublishOptions,
        ) -> Result<MessageId, BacklogError> {
            self.inner.publish(channel, data, options).await
        }

        async fn last_global_id(&self) -> Result<MessageId, BacklogError> {
            Ok(self.position)
        }

        async fn last_id(
            &self,
            channel: &str,
            site_id: Option<&str>,
        ) -> Result<MessageId, BacklogError> {
            self.inner.last_id(channel, site_id).await
        }

        async fn backlog(
            &self,
            channel: &str,
            last_id: MessageId,
            site_id: Option<&str>,
        ) -> Result<Vec<Message>, BacklogError> {
            self.inner.backlog(channel, last_id, site_id).await
        }

        async fn global_backlog(
            &self,
            last_global_id: MessageId,
        ) -> Result<Vec<Message>, BacklogError> {
            self.inner.global_backlog(last_global_id).await
        }

        async fn get_message(
            &self,
            channel: &str,
            id: MessageId,
            site_id: Option<&str>,
        ) -> Result<crate::backlog::MessageLookup, BacklogError> {
            self.inner.get_message(channel, id, site_id).await
        }

        async fn listen(&self) -> Result<crate::backlog::MessageStream, BacklogError> {
            let script = std::mem::take(&mut *self.script.lock());
            let stream = futures_util::stream::iter(script.into_iter().map(Ok::<Message, BacklogError>))
                .chain(futures_util::stream::pending());
            Ok(Box::pin(stream))
        }

        async fn reset(&self) -> Result<(), BacklogError> {
            self.inner.reset().await
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    fn message(global_id: MessageId, message_id: MessageId, data: serde_json::Value) -> Message {
        Message::from_body(global_id, message_id, PublishOptions::new().body("/foo", data))
    }

    #[tokio::test]
    async fn test_gap_filled_from_global_backlog() {
        let inner = MemoryBacklog::new();
        for i in 1..=4 {
            inner.publish("/foo", json!(i), &PublishOptions::new()).await.unwrap();
        }
        // Only global id 4 is notified; 2 and 3 must come from the backlog.
        let live = inner.global_backlog(3).await.unwrap();
        let store = Arc::new(ScriptedStore::new(inner, 1, live));

        let cancel = CancellationToken::new();
        let mut rx = spawn(Listener::new(store, cancel.clone()), None);

        let ids = [
            recv(&mut rx).await.global_id,
            recv(&mut rx).await.global_id,
            recv(&mut rx).await.global_id,
        ];
        assert_eq!(ids, [2, 3, 4]);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_duplicates_skipped_and_reset_delivered() {
        let script = vec![
            message(1, 1, json!("a")),
            message(2, 2, json!("b")),
            message(3, 3, json!("c")),
            message(2, 2, json!("b")),
            message(1, 1, json!("after reset")),
            message(2, 2, json!("after reset 2")),
        ];
        let store = Arc::new(ScriptedStore::new(MemoryBacklog::new(), 0, script));

        let cancel = CancellationToken::new();
        let listener = Listener::new(store, cancel.clone());
        let status = listener.status();
        let mut rx = spawn(listener, None);

        let mut received = Vec::new();
        for _ in 0..5 {
            let message = recv(&mut rx).await;
            received.push((message.global_id, message.data));
        }
        assert_eq!(
            received,
            vec![
                (1, json!("a")),
                (2, json!("b")),
                (3, json!("c")),
                (1, json!("after reset")),
                (2, json!("after reset 2")),
            ]
        );
        assert!(rx.try_recv().is_err());
        assert!(!status.is_degraded());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_cancel_stops_listener() {
        let store = Arc::new(MemoryBacklog::new());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Listener::new(store.clone(), cancel.clone()).run(None, |_| {}));
        wait_for_listener(&store).await;

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
