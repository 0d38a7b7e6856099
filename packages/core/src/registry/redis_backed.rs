//! [`CallRegistry`] adapter backed by Redis.
//!
//! Call metadata is stored as a JSON blob at `call:metadata:<interaction_id>`
//! with native key TTL (`SET ... EX`); no separate sweep task is needed since
//! Redis expires the key itself. `list_active` pays for a `SCAN` plus one
//! `GET` per candidate key — acceptable at the registry's expected cardinality
//! (concurrent live calls), and avoids a secondary index that could drift
//! from the TTL-governed keys.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError};

use super::{Call, CallMetadata, CallRegistry, CallStatus, RegistryError};
use crate::utils::now_millis;

const KEY_PREFIX: &str = "call:metadata:";

fn key_for(interaction_id: &str) -> String {
    format!("{KEY_PREFIX}{interaction_id}")
}

/// [`CallRegistry`] backed by Redis, via a shared, auto-reconnecting
/// [`ConnectionManager`].
pub struct RedisCallRegistry {
    manager: ConnectionManager,
    call_ttl_secs: u64,
    ended_call_ttl_secs: u64,
}

impl RedisCallRegistry {
    pub fn new(manager: ConnectionManager, call_ttl_secs: u64, ended_call_ttl_secs: u64) -> Self {
        Self {
            manager,
            call_ttl_secs,
            ended_call_ttl_secs,
        }
    }

    pub async fn connect(
        redis_url: &str,
        call_ttl_secs: u64,
        ended_call_ttl_secs: u64,
    ) -> Result<Self, RegistryError> {
        let client = redis::Client::open(redis_url).map_err(map_err)?;
        let manager = ConnectionManager::new(client).await.map_err(map_err)?;
        Ok(Self::new(manager, call_ttl_secs, ended_call_ttl_secs))
    }

    async fn read(&self, interaction_id: &str) -> Result<Option<Call>, RegistryError> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn.get(key_for(interaction_id)).await.map_err(map_err)?;
        Ok(raw.and_then(|raw| serde_json::from_str(&raw).ok()))
    }

    async fn write(&self, call: &Call, ttl_secs: u64) -> Result<(), RegistryError> {
        let payload = serde_json::to_string(call).map_err(|e| RegistryError::Backend(e.to_string()))?;
        let mut conn = self.manager.clone();
        let _: () = conn
            .set_ex(key_for(&call.interaction_id), payload, ttl_secs.max(1))
            .await
            .map_err(map_err)?;
        Ok(())
    }
}

#[async_trait]
impl CallRegistry for RedisCallRegistry {
    async fn register(&self, interaction_id: &str, metadata: CallMetadata) -> Result<(), RegistryError> {
        let now = now_millis();
        let call = Call {
            interaction_id: interaction_id.to_string(),
            tenant_id: metadata.tenant_id,
            from: metadata.from,
            to: metadata.to,
            start_time_ms: now,
            last_activity_ms: now,
            status: CallStatus::Active,
            sample_rate_hz: metadata.sample_rate_hz,
            encoding: metadata.encoding,
        };
        self.write(&call, self.call_ttl_secs).await
    }

    async fn touch(&self, interaction_id: &str) -> Result<(), RegistryError> {
        if let Some(mut call) = self.read(interaction_id).await? {
            call.last_activity_ms = now_millis();
            self.write(&call, self.call_ttl_secs).await?;
        }
        Ok(())
    }

    async fn end(&self, interaction_id: &str) -> Result<(), RegistryError> {
        if let Some(mut call) = self.read(interaction_id).await? {
            call.status = CallStatus::Ended;
            self.write(&call, self.ended_call_ttl_secs).await?;
        }
        Ok(())
    }

    async fn list_active(&self, limit: usize) -> Result<Vec<Call>, RegistryError> {
        let mut scan_conn = self.manager.clone();
        let mut iter: redis::AsyncIter<String> = scan_conn
            .scan_match(format!("{KEY_PREFIX}*"))
            .await
            .map_err(map_err)?;
        let mut keys = Vec::new();
        while let Some(key) = iter.next().await {
            keys.push(key);
        }
        drop(iter);

        let mut conn = self.manager.clone();
        let mut calls = Vec::new();
        for key in keys {
            let raw: Option<String> = conn.get(&key).await.map_err(map_err)?;
            if let Some(call) = raw.and_then(|raw| serde_json::from_str::<Call>(&raw).ok()) {
                if call.status == CallStatus::Active {
                    calls.push(call);
                }
            }
        }
        calls.sort_by(|a, b| b.last_activity_ms.cmp(&a.last_activity_ms));
        calls.truncate(limit);
        Ok(calls)
    }

    async fn get(&self, interaction_id: &str) -> Result<Option<Call>, RegistryError> {
        self.read(interaction_id).await
    }
}

fn map_err(err: RedisError) -> RegistryError {
    if err.is_connection_dropped() || err.is_connection_refusal() {
        RegistryError::Unavailable(err.to_string())
    } else {
        RegistryError::Backend(err.to_string())
    }
}
