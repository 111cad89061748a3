//! Redis pub/sub transport for multi-instance deployments.
//!
//! ## Channel Layout
//!
//! | Traffic          | Redis channel / key                        |
//! |------------------|--------------------------------------------|
//! | change feed      | `{prefix}:cdc:{schema}:{table}`            |
//! | broadcasts       | `{prefix}:bcast:{topic}`                   |
//! | presence signals | `{prefix}:presence:{topic}`                |
//! | presence members | `{prefix}:presence:{topic}:members` (set)  |
//!
//! The writer side of the change feed calls [`RedisTransport::publish_change`]
//! (or publishes the same JSON itself). Each subscription opens its own
//! pub/sub connection; pooled connections serve every other command.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use courier_core::{ChangeFilter, ChangeRecord};
use deadpool_redis::Pool;
use deadpool_redis::redis::{AsyncCommands, Client};
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{PresenceSignal, SubscriptionId, Transport, TransportMessage, TransportSubscription};
use crate::channel::ChannelSpec;
use crate::error::TransportError;

/// Broadcast payload on the wire. `origin` lets an instance drop its own
/// broadcasts when they come back.
#[derive(Debug, Serialize, Deserialize)]
struct BroadcastEnvelope {
    origin: Uuid,
    event: String,
    payload: Value,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum PresenceEnvelope {
    Join { keys: Vec<String> },
    Leave { keys: Vec<String> },
}

#[derive(Debug, Clone)]
struct ChannelNames {
    prefix: String,
}

impl ChannelNames {
    fn cdc(&self, schema: &str, table: &str) -> String {
        format!("{}:cdc:{schema}:{table}", self.prefix)
    }

    fn broadcast(&self, topic: &str) -> String {
        format!("{}:bcast:{topic}", self.prefix)
    }

    fn presence(&self, topic: &str) -> String {
        format!("{}:presence:{topic}", self.prefix)
    }

    fn presence_members(&self, topic: &str) -> String {
        format!("{}:presence:{topic}:members", self.prefix)
    }
}

/// Turns raw pub/sub messages of one subscription into transport messages.
struct MessageDecoder {
    origin: Uuid,
    filters: Vec<ChangeFilter>,
    broadcast_channel: Option<String>,
    presence_channel: Option<String>,
}

impl MessageDecoder {
    fn decode(&self, channel: &str, payload: &str) -> Result<Option<TransportMessage>, TransportError> {
        if self.broadcast_channel.as_deref() == Some(channel) {
            let envelope: BroadcastEnvelope = serde_json::from_str(payload)?;
            if envelope.origin == self.origin {
                return Ok(None);
            }
            return Ok(Some(TransportMessage::Broadcast {
                event: envelope.event,
                payload: envelope.payload,
            }));
        }

        if self.presence_channel.as_deref() == Some(channel) {
            let signal = match serde_json::from_str::<PresenceEnvelope>(payload)? {
                PresenceEnvelope::Join { keys } => PresenceSignal::Join(keys),
                PresenceEnvelope::Leave { keys } => PresenceSignal::Leave(keys),
            };
            return Ok(Some(TransportMessage::Presence(signal)));
        }

        let record: ChangeRecord = serde_json::from_str(payload)?;
        if self.filters.iter().any(|f| f.matches(&record)) {
            Ok(Some(TransportMessage::Change(record)))
        } else {
            Ok(None)
        }
    }
}

/// Transport over Redis pub/sub.
pub struct RedisTransport {
    client: Client,
    pool: Pool,
    names: ChannelNames,
    instance_id: Uuid,
    healthy: Arc<AtomicBool>,
    next_id: AtomicU64,
    subscriptions: Mutex<HashMap<SubscriptionId, JoinHandle<()>>>,
}

impl RedisTransport {
    /// Create a transport. Does not connect; call `connect` first.
    pub fn new(pool: Pool, redis_url: &str, prefix: impl Into<String>) -> Result<Self, TransportError> {
        // Pub/sub needs dedicated connections, not pooled ones
        let client = Client::open(redis_url)?;
        Ok(Self {
            client,
            pool,
            names: ChannelNames {
                prefix: prefix.into(),
            },
            instance_id: Uuid::new_v4(),
            healthy: Arc::new(AtomicBool::new(false)),
            next_id: AtomicU64::new(0),
            subscriptions: Mutex::new(HashMap::new()),
        })
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Publish a change record on its table channel.
    pub async fn publish_change(&self, record: &ChangeRecord) -> Result<(), TransportError> {
        let channel = self.names.cdc(&record.schema, &record.table);
        let message = serde_json::to_string(record)?;
        let mut conn = self.pool.get().await?;
        conn.publish::<_, _, ()>(&channel, message).await?;
        debug!(channel = %channel, op = %record.event_type, "Published change record");
        Ok(())
    }

    async fn ping(&self) -> Result<(), TransportError> {
        let mut conn = self.pool.get().await?;
        let _: String = deadpool_redis::redis::cmd("PING")
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn publish_presence(&self, topic: &str, envelope: PresenceEnvelope) -> Result<(), TransportError> {
        let message = serde_json::to_string(&envelope)?;
        let mut conn = self.pool.get().await?;
        conn.publish::<_, _, ()>(self.names.presence(topic), message)
            .await?;
        Ok(())
    }

    /// Dedicated pub/sub connection per subscription, drained by a decode task.
    async fn open_subscription(&self, spec: &ChannelSpec) -> Result<TransportSubscription, TransportError> {
        let broadcast_channel = spec.broadcast.then(|| self.names.broadcast(&spec.topic));
        let presence_channel = spec
            .has_presence()
            .then(|| self.names.presence(&spec.topic));

        let mut channels: BTreeSet<String> = spec
            .filters
            .iter()
            .map(|f| self.names.cdc(&f.schema, &f.table))
            .collect();
        channels.extend(broadcast_channel.iter().cloned());
        channels.extend(presence_channel.iter().cloned());

        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in &channels {
            pubsub.subscribe(channel.as_str()).await?;
        }

        let (tx, rx) = mpsc::unbounded_channel();

        if spec.has_presence() {
            let mut conn = self.pool.get().await?;
            let members: Vec<String> = conn
                .smembers(self.names.presence_members(&spec.topic))
                .await?;
            let _ = tx.send(TransportMessage::Presence(PresenceSignal::Sync(members)));
        }

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let decoder = MessageDecoder {
            origin: self.instance_id,
            filters: spec.filters.clone(),
            broadcast_channel,
            presence_channel,
        };
        let healthy = Arc::clone(&self.healthy);
        let topic = spec.topic.clone();

        let task = tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(topic = %topic, error = %e, "Failed to read pub/sub payload");
                        continue;
                    }
                };
                match decoder.decode(msg.get_channel_name(), &payload) {
                    Ok(Some(message)) => {
                        if tx.send(message).is_err() {
                            // Subscriber went away
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(topic = %topic, error = %e, "Failed to decode pub/sub message");
                    }
                }
            }
            warn!(topic = %topic, "Redis pub/sub stream ended");
            healthy.store(false, Ordering::Release);
        });

        self.subscriptions.lock().insert(id, task);
        debug!(topic = %spec.topic, subscription = %id, channels = channels.len(), "Subscribed");
        Ok(TransportSubscription { id, messages: rx })
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.healthy.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

impl std::fmt::Debug for RedisTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTransport")
            .field("prefix", &self.names.prefix)
            .field("instance_id", &self.instance_id)
            .field("healthy", &self.healthy.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for RedisTransport {
    fn name(&self) -> &str {
        "redis"
    }

    async fn connect(&self) -> Result<(), TransportError> {
        match self.ping().await {
            Ok(()) => {
                self.healthy.store(true, Ordering::Release);
                info!(instance_id = %self.instance_id, "Redis transport connected");
                Ok(())
            }
            Err(e) => {
                self.healthy.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    async fn heartbeat(&self) -> Result<(), TransportError> {
        self.ensure_connected()?;
        let result = self.ping().await;
        if result.is_err() {
            self.healthy.store(false, Ordering::Release);
        }
        result
    }

    async fn subscribe(&self, spec: &ChannelSpec) -> Result<TransportSubscription, TransportError> {
        self.ensure_connected()?;
        let result = self.open_subscription(spec).await;
        if let Err(e) = &result {
            if e.is_connection_loss() {
                self.healthy.store(false, Ordering::Release);
            }
        }
        result
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError> {
        if let Some(task) = self.subscriptions.lock().remove(&id) {
            task.abort();
        }
        Ok(())
    }

    async fn broadcast(&self, topic: &str, event: &str, payload: Value) -> Result<(), TransportError> {
        self.ensure_connected()?;
        let envelope = BroadcastEnvelope {
            origin: self.instance_id,
            event: event.to_string(),
            payload,
        };
        let message = serde_json::to_string(&envelope)?;
        let mut conn = self.pool.get().await?;
        conn.publish::<_, _, ()>(self.names.broadcast(topic), message)
            .await
            .map_err(|e| TransportError::broadcast_failed(topic, e.to_string()))?;
        Ok(())
    }

    async fn track(&self, topic: &str, key: &str) -> Result<(), TransportError> {
        self.ensure_connected()?;
        let added: u64 = {
            let mut conn = self.pool.get().await?;
            conn.sadd(self.names.presence_members(topic), key).await?
        };
        if added > 0 {
            self.publish_presence(
                topic,
                PresenceEnvelope::Join {
                    keys: vec![key.to_string()],
                },
            )
            .await?;
        }
        Ok(())
    }

    async fn untrack(&self, topic: &str, key: &str) -> Result<(), TransportError> {
        self.ensure_connected()?;
        let removed: u64 = {
            let mut conn = self.pool.get().await?;
            conn.srem(self.names.presence_members(topic), key).await?
        };
        if removed > 0 {
            self.publish_presence(
                topic,
                PresenceEnvelope::Leave {
                    keys: vec![key.to_string()],
                },
            )
            .await?;
        }
        Ok(())
    }

    async fn disconnect(&self) {
        let tasks: Vec<JoinHandle<()>> = self.subscriptions.lock().drain().map(|(_, t)| t).collect();
        for task in tasks {
            task.abort();
        }
        self.healthy.store(false, Ordering::Release);
        info!("Redis transport disconnected");
    }
}

/// Builder for [`RedisTransport`].
#[derive(Default)]
pub struct RedisTransportBuilder {
    pool: Option<Pool>,
    redis_url: Option<String>,
    prefix: Option<String>,
}

impl RedisTransportBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pool(mut self, pool: Pool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    /// Key and channel namespace; defaults to `courier`.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn build(self) -> Result<RedisTransport, TransportError> {
        let pool = self
            .pool
            .ok_or_else(|| TransportError::Pool("Redis pool is required".to_string()))?;
        let redis_url = self
            .redis_url
            .ok_or_else(|| TransportError::ConnectionLost("Redis URL is required".to_string()))?;
        let prefix = self.prefix.unwrap_or_else(|| "courier".to_string());
        RedisTransport::new(pool, &redis_url, prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decoder(origin: Uuid) -> MessageDecoder {
        MessageDecoder {
            origin,
            filters: vec![ChangeFilter::eq("messages", "thread_id", "t1")],
            broadcast_channel: Some("courier:bcast:thread:t1".into()),
            presence_channel: Some("courier:presence:thread:t1".into()),
        }
    }

    #[test]
    fn test_channel_names() {
        let names = ChannelNames {
            prefix: "courier".into(),
        };
        assert_eq!(names.cdc("public", "messages"), "courier:cdc:public:messages");
        assert_eq!(names.broadcast("thread:t1"), "courier:bcast:thread:t1");
        assert_eq!(names.presence("presence:online_users"), "courier:presence:presence:online_users");
        assert_eq!(
            names.presence_members("presence:online_users"),
            "courier:presence:presence:online_users:members"
        );
    }

    #[test]
    fn test_decode_change_applies_filters() {
        let d = decoder(Uuid::new_v4());
        let matching = ChangeRecord::insert("messages", json!({"id": "m1", "thread_id": "t1"}));
        let other = ChangeRecord::insert("messages", json!({"id": "m2", "thread_id": "t2"}));

        let decoded = d
            .decode("courier:cdc:public:messages", &serde_json::to_string(&matching).unwrap())
            .unwrap();
        assert_eq!(decoded, Some(TransportMessage::Change(matching)));

        let decoded = d
            .decode("courier:cdc:public:messages", &serde_json::to_string(&other).unwrap())
            .unwrap();
        assert_eq!(decoded, None);
    }

    #[test]
    fn test_decode_drops_own_broadcasts() {
        let me = Uuid::new_v4();
        let d = decoder(me);

        let own = serde_json::to_string(&BroadcastEnvelope {
            origin: me,
            event: "typing".into(),
            payload: json!({}),
        })
        .unwrap();
        assert_eq!(d.decode("courier:bcast:thread:t1", &own).unwrap(), None);

        let peer = serde_json::to_string(&BroadcastEnvelope {
            origin: Uuid::new_v4(),
            event: "typing".into(),
            payload: json!({"user_id": "u2"}),
        })
        .unwrap();
        assert_eq!(
            d.decode("courier:bcast:thread:t1", &peer).unwrap(),
            Some(TransportMessage::Broadcast {
                event: "typing".into(),
                payload: json!({"user_id": "u2"}),
            })
        );
    }

    #[test]
    fn test_decode_presence_and_garbage() {
        let d = decoder(Uuid::new_v4());
        assert_eq!(
            d.decode("courier:presence:thread:t1", r#"{"kind":"leave","keys":["u3"]}"#)
                .unwrap(),
            Some(TransportMessage::Presence(PresenceSignal::Leave(vec!["u3".into()])))
        );
        assert!(d.decode("courier:cdc:public:messages", "not json").is_err());
    }
}
