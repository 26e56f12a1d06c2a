//! Parked long-poll clients.
//!
//! The [`ConnectionManager`] holds every client waiting for a message in this
//! process, indexed by client id and by site-scoped channel. A parked client
//! is resolved exactly once, either by a delivery, by its timer, or by a newer
//! poll from the same client id replacing it.

use crate::channel::ChannelKey;
use crate::client::Client;
use crate::message::Message;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

/// How a parked poll ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// New messages arrived.
    Delivered(Vec<Message>),
    /// The poll timeout elapsed.
    TimedOut,
    /// A newer poll from the same client id took over.
    Replaced,
}

/// Single-flight response slot.
///
/// Whoever flips the flag first sends the resolution; every later attempt is
/// a no-op.
#[derive(Debug)]
pub struct ResponseSlot {
    resolved: AtomicBool,
    sender: Mutex<Option<oneshot::Sender<Resolution>>>,
}

impl ResponseSlot {
    /// Create a slot and the receiver the request awaits.
    #[must_use]
    pub fn new() -> (Arc<Self>, oneshot::Receiver<Resolution>) {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Self {
            resolved: AtomicBool::new(false),
            sender: Mutex::new(Some(tx)),
        });
        (slot, rx)
    }

    /// Resolve the slot.
    ///
    /// Returns `true` if this call won.
    pub fn resolve(&self, resolution: Resolution) -> bool {
        if self.resolved.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(tx) = self.sender.lock().take() {
            // The request may already be gone.
            let _ = tx.send(resolution);
        }
        true
    }

    /// Whether the slot has been resolved.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }
}

/// A registered client waiting on its slot.
pub struct ParkedClient {
    client: Client,
    slot: Arc<ResponseSlot>,
    channel_keys: Vec<ChannelKey>,
    parked_at: Instant,
    timer: Mutex<Option<AbortHandle>>,
}

impl ParkedClient {
    fn new(client: Client, slot: Arc<ResponseSlot>) -> Self {
        let channel_keys = client
            .channels()
            .map(|channel| ChannelKey::new(channel, client.site_id()))
            .collect();
        Self {
            client,
            slot,
            channel_keys,
            parked_at: Instant::now(),
            timer: Mutex::new(None),
        }
    }

    /// The parked client.
    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// How long the client has been parked.
    #[must_use]
    pub fn parked_for(&self) -> Duration {
        self.parked_at.elapsed()
    }
}

impl Drop for ParkedClient {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.get_mut().take() {
            timer.abort();
        }
    }
}

/// Snapshot of the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Clients currently parked.
    pub parked_clients: usize,
    /// Site-scoped channels with at least one parked subscriber.
    pub channel_count: usize,
    /// Parked subscriptions per site, the default site under `""`.
    pub subscriptions_per_site: BTreeMap<String, usize>,
}

/// Registry of parked clients.
#[derive(Default)]
pub struct ConnectionManager {
    /// Parked clients by client id.
    clients: DashMap<String, Arc<ParkedClient>>,
    /// Site-scoped channel -> parked client ids.
    channels: DashMap<ChannelKey, HashSet<String>>,
}

impl ConnectionManager {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a client until `timeout` elapses or a message is delivered.
    ///
    /// An existing entry for the same client id is replaced and resolved with
    /// [`Resolution::Replaced`].
    pub fn add_client(self: &Arc<Self>, client: Client, slot: Arc<ResponseSlot>, timeout: Duration) {
        let client_id = client.client_id().to_string();
        let parked = Arc::new(ParkedClient::new(client, slot.clone()));

        let previous = match self.clients.entry(client_id.clone()) {
            Entry::Occupied(mut entry) => {
                self.unindex(&client_id, &entry.get().channel_keys);
                self.index(&client_id, &parked.channel_keys);
                Some(entry.insert(parked.clone()))
            }
            Entry::Vacant(entry) => {
                self.index(&client_id, &parked.channel_keys);
                entry.insert(parked.clone());
                None
            }
        };

        if let Some(previous) = previous {
            debug!(client = %client_id, "Replacing parked client");
            previous.slot.resolve(Resolution::Replaced);
        }

        let manager = Arc::downgrade(self);
        let timer_id = client_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            expire_weak(&manager, &timer_id, &slot);
        });
        *parked.timer.lock() = Some(handle.abort_handle());

        trace!(
            client = %client_id,
            channels = parked.channel_keys.len(),
            timeout_ms = timeout.as_millis() as u64,
            "Parked client"
        );
    }

    /// Deregister a client regardless of which request parked it.
    pub fn remove_client(&self, client_id: &str) -> Option<Arc<ParkedClient>> {
        match self.clients.entry(client_id.to_string()) {
            Entry::Occupied(entry) => {
                self.unindex(client_id, &entry.get().channel_keys);
                Some(entry.remove())
            }
            Entry::Vacant(_) => None,
        }
    }

    /// Deregister a client only if it is still parked on `slot`.
    pub fn remove_slot(&self, client_id: &str, slot: &Arc<ResponseSlot>) -> bool {
        match self.clients.entry(client_id.to_string()) {
            Entry::Occupied(entry) if Arc::ptr_eq(&entry.get().slot, slot) => {
                self.unindex(client_id, &entry.get().channel_keys);
                entry.remove();
                true
            }
            _ => false,
        }
    }

    /// Timer path: resolve `slot` as timed out and deregister it.
    pub fn expire(&self, client_id: &str, slot: &Arc<ResponseSlot>) -> bool {
        if slot.resolve(Resolution::TimedOut) {
            self.remove_slot(client_id, slot);
            trace!(client = %client_id, "Poll timed out");
            true
        } else {
            false
        }
    }

    /// Deliver `message` to every parked client that should see it.
    ///
    /// Returns the number of clients resolved.
    pub fn notify_clients(&self, message: &Message) -> usize {
        let key = ChannelKey::new(message.channel.as_str(), message.site_id.as_deref());

        let candidates: Vec<String> = match self.channels.get(&key) {
            Some(ids) => ids.iter().cloned().collect(),
            None => return 0,
        };

        let mut delivered = 0;
        for client_id in candidates {
            let Some(parked) = self.clients.get(&client_id).map(|e| e.value().clone()) else {
                continue;
            };
            if !parked.client.should_deliver(message) || parked.client.has_seen(message) {
                continue;
            }
            if parked.slot.resolve(Resolution::Delivered(vec![message.clone()])) {
                self.remove_slot(&client_id, &parked.slot);
                delivered += 1;
            }
        }

        if delivered > 0 {
            trace!(channel = %key, message_id = message.message_id, delivered, "Flushed parked clients");
        }
        delivered
    }

    /// Resolve and deregister every parked client.
    pub fn drain(&self) -> usize {
        let ids: Vec<String> = self.clients.iter().map(|e| e.key().clone()).collect();
        let mut drained = 0;
        for client_id in ids {
            if let Some(parked) = self.remove_client(&client_id) {
                parked.slot.resolve(Resolution::TimedOut);
                drained += 1;
            }
        }
        drained
    }

    /// Whether a client id is parked.
    #[must_use]
    pub fn is_parked(&self, client_id: &str) -> bool {
        self.clients.contains_key(client_id)
    }

    /// Number of parked clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no client is parked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> ConnectionStats {
        let mut subscriptions_per_site = BTreeMap::new();
        for entry in self.clients.iter() {
            let client = &entry.value().client;
            *subscriptions_per_site
                .entry(client.site_id().unwrap_or_default().to_string())
                .or_insert(0) += client.subscription_count();
        }
        ConnectionStats {
            parked_clients: self.clients.len(),
            channel_count: self.channels.len(),
            subscriptions_per_site,
        }
    }

    fn index(&self, client_id: &str, keys: &[ChannelKey]) {
        for key in keys {
            self.channels
                .entry(key.clone())
                .or_default()
                .insert(client_id.to_string());
        }
    }

    fn unindex(&self, client_id: &str, keys: &[ChannelKey]) {
        for key in keys {
            let empty = match self.channels.get_mut(key) {
                Some(mut ids) => {
                    ids.remove(client_id);
                    ids.is_empty()
                }
                None => false,
            };
            if empty {
                self.channels.remove_if(key, |_, ids| ids.is_empty());
            }
        }
    }
}

fn expire_weak(manager: &Weak<ConnectionManager>, client_id: &str, slot: &Arc<ResponseSlot>) {
    if let Some(manager) = manager.upgrade() {
        manager.expire(client_id, slot);
    } else {
        slot.resolve(Resolution::TimedOut);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Identity;
    use postbus_protocol::{Cursor, MessageBody};
    use serde_json::json;

    fn client(id: &str, channel: &str, position: i64) -> Client {
        let mut client = Client::new(id, Identity::anonymous());
        client.subscribe(channel, Cursor::After(position)).unwrap();
        client
    }

    fn message(channel: &str, id: i64) -> Message {
        Message::from_body(id, id, MessageBody::new(channel, json!(id)))
    }

    #[tokio::test]
    async fn test_notify_resolves_and_deregisters() {
        let manager = Arc::new(ConnectionManager::new());
        let (slot, rx) = ResponseSlot::new();
        manager.add_client(client("c1", "/foo", 0), slot, Duration::from_secs(30));

        assert_eq!(manager.notify_clients(&message("/bar", 1)), 0);
        assert_eq!(manager.notify_clients(&message("/foo", 1)), 1);

        assert_eq!(rx.await.unwrap(), Resolution::Delivered(vec![message("/foo", 1)]));
        assert!(!manager.is_parked("c1"));
        assert_eq!(manager.stats(), ConnectionStats::default());
    }

    #[tokio::test]
    async fn test_notify_skips_seen_messages() {
        let manager = Arc::new(ConnectionManager::new());
        let (slot, _rx) = ResponseSlot::new();
        manager.add_client(client("c1", "/foo", 5), slot, Duration::from_secs(30));

        assert_eq!(manager.notify_clients(&message("/foo", 5)), 0);
        assert!(manager.is_parked("c1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_expires_client() {
        let manager = Arc::new(ConnectionManager::new());
        let (slot, rx) = ResponseSlot::new();
        manager.add_client(client("c1", "/foo", 0), slot, Duration::from_secs(25));

        assert_eq!(rx.await.unwrap(), Resolution::TimedOut);
        assert!(!manager.is_parked("c1"));
    }

    #[tokio::test]
    async fn test_replaced_client_resolves_old_request() {
        let manager = Arc::new(ConnectionManager::new());
        let (old, old_rx) = ResponseSlot::new();
        let (new, mut new_rx) = ResponseSlot::new();

        manager.add_client(client("c1", "/foo", 0), old.clone(), Duration::from_secs(30));
        manager.add_client(client("c1", "/bar", 0), new.clone(), Duration::from_secs(30));

        assert_eq!(old_rx.await.unwrap(), Resolution::Replaced);
        assert!(new_rx.try_recv().is_err());

        // The stale request's cleanup must not evict the new entry.
        assert!(!manager.remove_slot("c1", &old));
        assert!(manager.is_parked("c1"));

        assert_eq!(manager.notify_clients(&message("/foo", 1)), 0);
        assert_eq!(manager.notify_clients(&message("/bar", 1)), 1);
        assert_eq!(manager.stats().channel_count, 0);
    }

    #[tokio::test]
    async fn test_expire_after_delivery_is_noop() {
        let manager = Arc::new(ConnectionManager::new());
        let (slot, rx) = ResponseSlot::new();
        manager.add_client(client("c1", "/foo", 0), slot.clone(), Duration::from_secs(30));

        manager.notify_clients(&message("/foo", 1));
        assert!(!manager.expire("c1", &slot));
        assert!(matches!(rx.await.unwrap(), Resolution::Delivered(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_flush_and_timer_resolve_once() {
        for _ in 0..200 {
            let manager = Arc::new(ConnectionManager::new());
            let (slot, rx) = ResponseSlot::new();
            manager.add_client(client("c1", "/foo", 0), slot.clone(), Duration::from_secs(30));

            let flusher = {
                let manager = manager.clone();
                tokio::spawn(async move { manager.notify_clients(&message("/foo", 1)) })
            };
            let timer = {
                let manager = manager.clone();
                let slot = slot.clone();
                tokio::spawn(async move { usize::from(manager.expire("c1", &slot)) })
            };

            let wins = flusher.await.unwrap() + timer.await.unwrap();
            assert_eq!(wins, 1);
            assert!(rx.await.is_ok());
            assert!(!manager.is_parked("c1"));
        }
    }

    #[tokio::test]
    async fn test_site_scoped_index() {
        let manager = Arc::new(ConnectionManager::new());
        let mut tenant = Client::new("c1", Identity::anonymous().with_site("a"));
        tenant.subscribe("/foo", Cursor::After(0)).unwrap();
        let (slot, _rx) = ResponseSlot::new();
        manager.add_client(tenant, slot, Duration::from_secs(30));

        assert_eq!(manager.notify_clients(&message("/foo", 1)), 0);

        let stats = manager.stats();
        assert_eq!(stats.parked_clients, 1);
        assert_eq!(stats.subscriptions_per_site.get("a"), Some(&1));

        let mut scoped = message("/foo", 1);
        scoped.site_id = Some("a".into());
        assert_eq!(manager.notify_clients(&scoped), 1);
    }

    #[tokio::test]
    async fn test_drain_times_out_everyone() {
        let manager = Arc::new(ConnectionManager::new());
        let (a, a_rx) = ResponseSlot::new();
        let (b, b_rx) = ResponseSlot::new();
        manager.add_client(client("a", "/foo", 0), a, Duration::from_secs(30));
        manager.add_client(client("b", "/bar", 0), b, Duration::from_secs(30));

        assert_eq!(manager.drain(), 2);
        assert_eq!(a_rx.await.unwrap(), Resolution::TimedOut);
        assert_eq!(b_rx.await.unwrap(), Resolution::TimedOut);
        assert!(manager.is_empty());
    }
}
