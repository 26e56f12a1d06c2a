//! Redis backlog substrate.
//!
//! Backlogs are sorted sets scored by id. A Lua script assigns both ids,
//! appends, trims and publishes in one step, so concurrent publishers in
//! different processes never race on id assignment or trimming.
//!
//! Key layout, for prefix `p`:
//!
//! - `p:global_id` - global id counter
//! - `p:backlog_id:{site}:{channel}` - channel id counter
//! - `p:backlog:{site}:{channel}` - channel backlog
//! - `p:global_backlog` - global backlog
//! - `p:notify` - pub/sub channel for new messages

use super::{
    validate_publish, BacklogConfig, BacklogError, BacklogStore, MessageLookup, MessageStream,
};
use crate::channel::ChannelKey;
use crate::message::{Message, MessageId, PublishOptions};
use async_trait::async_trait;
use futures_util::StreamExt;
use postbus_protocol::codec;
use redis::{aio::ConnectionManager, AsyncCommands, Client, Script};
use serde_json::Value;
use tracing::{debug, info, trace};

/// Default key prefix.
pub const DEFAULT_KEY_PREFIX: &str = "__mb";

/// KEYS: global id, channel id, channel backlog, global backlog, notify channel.
/// ARGV: body, max age (seconds), channel bound, global bound.
const PUBLISH_SCRIPT: &str = r#"
local body = ARGV[1]
local max_backlog_age = tonumber(ARGV[2])
local max_backlog_size = tonumber(ARGV[3])
local max_global_backlog_size = tonumber(ARGV[4])

local global_id = redis.call("INCR", KEYS[1])
local backlog_id = redis.call("INCR", KEYS[2])
local payload = table.concat({ global_id, backlog_id, body }, "|")

redis.call("ZADD", KEYS[3], backlog_id, payload)
redis.call("EXPIRE", KEYS[3], max_backlog_age)
redis.call("ZADD", KEYS[4], global_id, payload)
redis.call("EXPIRE", KEYS[4], max_backlog_age)

if backlog_id > max_backlog_size then
  redis.call("ZREMRANGEBYSCORE", KEYS[3], 1, backlog_id - max_backlog_size)
end
if global_id > max_global_backlog_size then
  redis.call("ZREMRANGEBYSCORE", KEYS[4], 1, global_id - max_global_backlog_size)
end

redis.call("PUBLISH", KEYS[5], payload)

return { global_id, backlog_id }
"#;

/// Redis-backed [`BacklogStore`].
pub struct RedisBacklog {
    client: Client,
    conn: ConnectionManager,
    key_prefix: String,
    config: BacklogConfig,
    publish_script: Script,
}

impl RedisBacklog {
    /// Connect to Redis.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., redis://localhost:6379)
    /// * `key_prefix` - Prefix for all keys (default: "__mb")
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or Redis is unreachable.
    pub async fn new(
        url: &str,
        key_prefix: Option<&str>,
        config: BacklogConfig,
    ) -> Result<Self, BacklogError> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;

        info!(url = %url, "Connected to Redis");

        Ok(Self {
            client,
            conn,
            key_prefix: key_prefix.unwrap_or(DEFAULT_KEY_PREFIX).to_string(),
            config,
            publish_script: Script::new(PUBLISH_SCRIPT),
        })
    }

    fn global_id_key(&self) -> String {
        format!("{}:global_id", self.key_prefix)
    }

    fn backlog_id_key(&self, key: &ChannelKey) -> String {
        format!("{}:backlog_id:{}", self.key_prefix, key)
    }

    fn backlog_key(&self, key: &ChannelKey) -> String {
        format!("{}:backlog:{}", self.key_prefix, key)
    }

    fn global_backlog_key(&self) -> String {
        format!("{}:global_backlog", self.key_prefix)
    }

    fn notify_channel(&self) -> String {
        format!("{}:notify", self.key_prefix)
    }

    fn decode_all(raw: Vec<Vec<u8>>) -> Result<Vec<Message>, BacklogError> {
        raw.iter()
            .map(|payload| codec::decode(payload).map_err(BacklogError::from))
            .collect()
    }
}

#[async_trait]
impl BacklogStore for RedisBacklog {
    async fn publish(
        &self,
        channel: &str,
        data: Value,
        options: &PublishOptions,
    ) -> Result<MessageId, BacklogError> {
        let age = validate_publish(channel, options, &self.config)?;

        let key = ChannelKey::new(channel, options.site_id.as_deref());
        let body = codec::encode_body(&options.body(channel, data))?;
        let max_age = age.as_secs().max(1);
        let bound = options
            .max_backlog_size
            .unwrap_or(self.config.max_backlog_size);

        let mut invocation = self.publish_script.prepare_invoke();
        invocation
            .key(self.global_id_key())
            .key(self.backlog_id_key(&key))
            .key(self.backlog_key(&key))
            .key(self.global_backlog_key())
            .key(self.notify_channel())
            .arg(body)
            .arg(max_age)
            .arg(bound)
            .arg(self.config.max_global_backlog_size);

        let mut conn = self.conn.clone();
        let (global_id, message_id): (MessageId, MessageId) =
            invocation.invoke_async(&mut conn).await?;

        trace!(channel = %key, message_id, global_id, "Published message to Redis");
        Ok(message_id)
    }

    async fn last_global_id(&self) -> Result<MessageId, BacklogError> {
        let mut conn = self.conn.clone();
        let id: Option<MessageId> = conn.get(self.global_id_key()).await?;
        Ok(id.unwrap_or(0))
    }

    async fn last_id(
        &self,
        channel: &str,
        site_id: Option<&str>,
    ) -> Result<MessageId, BacklogError> {
        let key = ChannelKey::new(channel, site_id);
        let mut conn = self.conn.clone();

        let id: Option<MessageId> = conn.get(self.backlog_id_key(&key)).await?;
        Ok(id.unwrap_or(0))
    }

    async fn backlog(
        &self,
        channel: &str,
        last_id: MessageId,
        site_id: Option<&str>,
    ) -> Result<Vec<Message>, BacklogError> {
        let key = ChannelKey::new(channel, site_id);
        let mut conn = self.conn.clone();

        let raw: Vec<Vec<u8>> = conn
            .zrangebyscore(self.backlog_key(&key), last_id + 1, "+inf")
            .await?;

        Self::decode_all(raw)
    }

    async fn global_backlog(
        &self,
        last_global_id: MessageId,
    ) -> Result<Vec<Message>, BacklogError> {
        let mut conn = self.conn.clone();

        let raw: Vec<Vec<u8>> = conn
            .zrangebyscore(self.global_backlog_key(), last_global_id + 1, "+inf")
            .await?;

        Self::decode_all(raw)
    }

    async fn get_message(
        &self,
        channel: &str,
        id: MessageId,
        site_id: Option<&str>,
    ) -> Result<MessageLookup, BacklogError> {
        let key = ChannelKey::new(channel, site_id);
        let mut conn = self.conn.clone();

        let raw: Vec<Vec<u8>> = conn.zrangebyscore(self.backlog_key(&key), id, id).await?;
        if let Some(payload) = raw.first() {
            return Ok(MessageLookup::Found(codec::decode(payload)?));
        }

        let last_id = self.last_id(channel, site_id).await?;
        if id > 0 && id <= last_id {
            Ok(MessageLookup::Expired)
        } else {
            Ok(MessageLookup::NotFound)
        }
    }

    async fn listen(&self) -> Result<MessageStream, BacklogError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(self.notify_channel()).await?;

        debug!(channel = %self.notify_channel(), "Subscribed to Redis notifications");

        let stream = pubsub
            .into_on_message()
            .map(|msg| -> Result<Message, BacklogError> {
                let payload: Vec<u8> = msg.get_payload()?;
                Ok(codec::decode(&payload)?)
            });

        Ok(Box::pin(stream))
    }

    async fn reset(&self) -> Result<(), BacklogError> {
        let mut conn = self.conn.clone();

        let keys: Vec<String> = conn.keys(format!("{}:*", self.key_prefix)).await?;
        if !keys.is_empty() {
            let removed: usize = conn.del(&keys).await?;
            info!(removed, prefix = %self.key_prefix, "Reset Redis backlogs");
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
