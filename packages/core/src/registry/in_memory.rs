//! Single-process [`CallRegistry`] adapter.
//!
//! Calls live in a `DashMap` keyed by `interaction_id`. TTL is advisory: it is
//! checked lazily on read and swept periodically by a background task
//! (mirrors [`crate::bus::in_memory::InMemoryBus`]'s ring-buffer trim), so a
//! read that races the sweeper never observes a phantom live call.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{Call, CallMetadata, CallRegistry, CallStatus, RegistryError};
use crate::runtime::TaskSpawner;
use crate::utils::now_millis;

struct Record {
    call: Call,
    expires_at_ms: u64,
}

/// In-memory [`CallRegistry`]. Cheap to clone (shares state via `Arc`).
#[derive(Clone)]
pub struct InMemoryCallRegistry {
    calls: Arc<DashMap<String, Record>>,
    call_ttl_secs: u64,
    ended_call_ttl_secs: u64,
}

impl InMemoryCallRegistry {
    pub fn new(call_ttl_secs: u64, ended_call_ttl_secs: u64) -> Self {
        Self {
            calls: Arc::new(DashMap::new()),
            call_ttl_secs,
            ended_call_ttl_secs,
        }
    }

    /// Starts the periodic sweep that evicts expired entries. `interval_secs`
    /// should be well under `call_ttl_secs` so expired active calls don't
    /// linger and mislead `list_active` callers.
    pub fn spawn_sweeper(&self, spawner: &Arc<dyn TaskSpawner>, interval_secs: u64) {
        let calls = Arc::clone(&self.calls);
        spawner.spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
            loop {
                ticker.tick().await;
                let now = now_millis();
                calls.retain(|_, record| record.expires_at_ms > now);
            }
        });
    }
}

#[async_trait]
impl CallRegistry for InMemoryCallRegistry {
    async fn register(&self, interaction_id: &str, metadata: CallMetadata) -> Result<(), RegistryError> {
        let now = now_millis();
        self.calls.insert(
            interaction_id.to_string(),
            Record {
                call: Call {
                    interaction_id: interaction_id.to_string(),
                    tenant_id: metadata.tenant_id,
                    from: metadata.from,
                    to: metadata.to,
                    start_time_ms: now,
                    last_activity_ms: now,
                    status: CallStatus::Active,
                    sample_rate_hz: metadata.sample_rate_hz,
                    encoding: metadata.encoding,
                },
                expires_at_ms: now + self.call_ttl_secs * 1000,
            },
        );
        Ok(())
    }

    async fn touch(&self, interaction_id: &str) -> Result<(), RegistryError> {
        if let Some(mut record) = self.calls.get_mut(interaction_id) {
            let now = now_millis();
            record.call.last_activity_ms = now;
            record.expires_at_ms = now + self.call_ttl_secs * 1000;
        }
        Ok(())
    }

    async fn end(&self, interaction_id: &str) -> Result<(), RegistryError> {
        if let Some(mut record) = self.calls.get_mut(interaction_id) {
            record.call.status = CallStatus::Ended;
            record.expires_at_ms = now_millis() + self.ended_call_ttl_secs * 1000;
        }
        Ok(())
    }

    async fn list_active(&self, limit: usize) -> Result<Vec<Call>, RegistryError> {
        let now = now_millis();
        let mut calls: Vec<Call> = self
            .calls
            .iter()
            .filter(|entry| entry.expires_at_ms > now && entry.call.status == CallStatus::Active)
            .map(|entry| entry.call.clone())
            .collect();
        calls.sort_by(|a, b| b.last_activity_ms.cmp(&a.last_activity_ms));
        calls.truncate(limit);
        Ok(calls)
    }

    async fn get(&self, interaction_id: &str) -> Result<Option<Call>, RegistryError> {
        let now = now_millis();
        Ok(self
            .calls
            .get(interaction_id)
            .filter(|record| record.expires_at_ms > now)
            .map(|record| record.call.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::AudioEncoding;

    fn metadata() -> CallMetadata {
        CallMetadata {
            tenant_id: "tenant-1".into(),
            from: "+15550001111".into(),
            to: "+15559998888".into(),
            sample_rate_hz: 8_000,
            encoding: AudioEncoding::Pcm16,
        }
    }

    #[tokio::test]
    async fn register_then_get_returns_active_call() {
        let registry = InMemoryCallRegistry::new(3600, 300);
        registry.register("call-1", metadata()).await.unwrap();

        let call = registry.get("call-1").await.unwrap().unwrap();
        assert_eq!(call.status, CallStatus::Active);
        assert_eq!(call.tenant_id, "tenant-1");
    }

    #[tokio::test]
    async fn touch_on_unknown_call_is_a_no_op() {
        let registry = InMemoryCallRegistry::new(3600, 300);
        registry.touch("ghost").await.unwrap();
        assert!(registry.get("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn end_marks_ended_and_shortens_ttl() {
        let registry = InMemoryCallRegistry::new(3600, 0);
        registry.register("call-1", metadata()).await.unwrap();
        registry.end("call-1").await.unwrap();

        // ended_call_ttl_secs = 0 means the record is already expired.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(registry.get("call-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_active_excludes_ended_and_sorts_by_recency() {
        let registry = InMemoryCallRegistry::new(3600, 300);
        registry.register("call-1", metadata()).await.unwrap();
        registry.register("call-2", metadata()).await.unwrap();
        registry.end("call-2").await.unwrap();
        registry.touch("call-1").await.unwrap();

        let active = registry.list_active(10).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].interaction_id, "call-1");
    }
}
