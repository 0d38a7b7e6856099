//! [`MessageBus`] adapter backed by Redis Streams.
//!
//! Selected via `PUBSUB_ADAPTER=streams`. Topics map 1:1 to Redis streams;
//! consumer groups map to Redis consumer groups (`XGROUP`); `reclaim` is
//! `XAUTOCLAIM`. Connection recovery is handled by `redis`'s own
//! `ConnectionManager`, which this adapter relies on rather than re-
//! implementing reconnect/backoff itself.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::streams::{StreamAutoClaimOptions, StreamAutoClaimReply, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisError, Value};

use super::{BusError, BusSubscription, Delivery, MessageBus};
use crate::protocol_constants::BUS_BLOCKING_READ_TIMEOUT_SECS;

/// Field name under which the raw payload bytes are stored in each stream entry.
const PAYLOAD_FIELD: &str = "data";

/// [`MessageBus`] backed by Redis Streams, via a shared, auto-reconnecting
/// [`ConnectionManager`].
pub struct RedisStreamsBus {
    manager: ConnectionManager,
}

impl RedisStreamsBus {
    /// Wraps an already-established connection manager.
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    /// Opens a client against `redis_url` and establishes the connection manager.
    pub async fn connect(redis_url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(redis_url).map_err(map_err)?;
        let manager = ConnectionManager::new(client).await.map_err(map_err)?;
        Ok(Self::new(manager))
    }
}

#[async_trait]
impl MessageBus for RedisStreamsBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<String, BusError> {
        let mut conn = self.manager.clone();
        let id: String = conn
            .xadd(topic, "*", &[(PAYLOAD_FIELD, payload.as_slice())])
            .await
            .map_err(map_err)?;
        Ok(id)
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Box<dyn BusSubscription>, BusError> {
        let mut conn = self.manager.clone();
        // `$` joins at the tail; MKSTREAM creates the stream if it doesn't exist yet.
        let created: Result<(), RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(topic)
            .arg(group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        if let Err(err) = created {
            // BUSYGROUP means the group already exists, which is the expected
            // path on worker restart — the group resumes from its own cursor.
            if !err.to_string().contains("BUSYGROUP") {
                return Err(map_err(err));
            }
        }
        Ok(Box::new(RedisSubscription {
            manager: self.manager.clone(),
            topic: topic.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
        }))
    }

    async fn scan_topics(&self, pattern: &str) -> Result<Vec<String>, BusError> {
        let mut conn = self.manager.clone();
        let mut iter: redis::AsyncIter<String> = conn.scan_match(pattern).await.map_err(map_err)?;
        let mut topics = Vec::new();
        while let Some(key) = iter.next().await {
            topics.push(key);
        }
        Ok(topics)
    }
}

struct RedisSubscription {
    manager: ConnectionManager,
    topic: String,
    group: String,
    consumer: String,
}

#[async_trait]
impl BusSubscription for RedisSubscription {
    async fn recv(&mut self) -> Result<Option<Delivery>, BusError> {
        let mut conn = self.manager.clone();
        let opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(1)
            .block((BUS_BLOCKING_READ_TIMEOUT_SECS * 1000) as usize);

        let reply: StreamReadReply = conn
            .xread_options(&[self.topic.as_str()], &[">"], &opts)
            .await
            .map_err(map_err)?;

        for stream_key in reply.keys {
            if let Some(entry) = stream_key.ids.into_iter().next() {
                let payload = extract_payload(&entry.map);
                return Ok(Some(Delivery {
                    message_id: entry.id,
                    payload,
                }));
            }
        }
        Ok(None)
    }

    async fn ack(&mut self, message_id: &str) -> Result<(), BusError> {
        let mut conn = self.manager.clone();
        let _: i64 = conn
            .xack(&self.topic, &self.group, &[message_id])
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn reclaim(&mut self, min_idle_ms: u64) -> Result<Vec<Delivery>, BusError> {
        let mut conn = self.manager.clone();
        let reply: StreamAutoClaimReply = conn
            .xautoclaim_options(
                &self.topic,
                &self.group,
                &self.consumer,
                min_idle_ms as usize,
                "0-0",
                StreamAutoClaimOptions::default(),
            )
            .await
            .map_err(map_err)?;

        Ok(reply
            .claimed
            .into_iter()
            .map(|entry| Delivery {
                payload: extract_payload(&entry.map),
                message_id: entry.id,
            })
            .collect())
    }
}

fn extract_payload(map: &HashMap<String, Value>) -> Vec<u8> {
    map.get(PAYLOAD_FIELD)
        .and_then(|value| redis::from_redis_value::<Vec<u8>>(value).ok())
        .unwrap_or_default()
}

fn map_err(err: RedisError) -> BusError {
    if err.is_timeout() {
        BusError::Timeout(err.to_string())
    } else if err.is_connection_dropped() || err.is_connection_refusal() {
        BusError::Connection(err.to_string())
    } else {
        BusError::Backend(err.to_string())
    }
}
