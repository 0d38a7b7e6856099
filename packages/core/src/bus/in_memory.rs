//! Single-process, dependency-free [`MessageBus`] adapter.
//!
//! Backed by a `DashMap<topic, TopicState>` where each `TopicState` owns a
//! bounded ring buffer (trim policy) plus per-group pending-entry tables and
//! a `tokio::sync::Notify` to wake blocked `recv` polls. This is the
//! first-class adapter for tests and single-binary deployments — selected via
//! `PUBSUB_ADAPTER=in_memory` — not a test-only shim.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::timeout;

use super::{BusError, BusSubscription, Delivery, MessageBus};
use crate::protocol_constants::{AUDIO_TOPIC, BUS_BLOCKING_READ_TIMEOUT_SECS};
use crate::utils::now_millis;

/// How a topic's ring buffer is trimmed.
#[derive(Debug, Clone, Copy)]
enum TrimPolicy {
    /// Retain the last `len` messages.
    Count(usize),
    /// Retain messages published within the last `minutes`.
    Age(u64),
}

struct Entry {
    seq: u64,
    id: String,
    payload: Arc<Vec<u8>>,
    published_at_ms: u64,
}

struct PendingEntry {
    id: String,
    payload: Arc<Vec<u8>>,
    consumer: String,
    delivered_at_ms: u64,
}

struct GroupState {
    /// Highest seq already handed out to this group.
    cursor_seq: u64,
    pending: HashMap<String, PendingEntry>,
}

struct TopicState {
    entries: VecDeque<Entry>,
    next_seq: u64,
    trim: TrimPolicy,
    groups: HashMap<String, GroupState>,
    notify: Arc<Notify>,
}

impl TopicState {
    fn new(trim: TrimPolicy) -> Self {
        Self {
            entries: VecDeque::new(),
            next_seq: 0,
            trim,
            groups: HashMap::new(),
            notify: Arc::new(Notify::new()),
        }
    }

    fn apply_trim(&mut self) {
        match self.trim {
            TrimPolicy::Count(len) => {
                while self.entries.len() > len {
                    self.entries.pop_front();
                }
            }
            TrimPolicy::Age(minutes) => {
                let cutoff = now_millis().saturating_sub(minutes * 60_000);
                while matches!(self.entries.front(), Some(e) if e.published_at_ms < cutoff) {
                    self.entries.pop_front();
                }
            }
        }
    }

    fn next_for_group(&mut self, group: &str, consumer: &str) -> Option<Delivery> {
        let cursor = self.groups.get(group).map(|g| g.cursor_seq).unwrap_or(0);
        let (seq, id, payload) = {
            let entry = self.entries.iter().find(|e| e.seq > cursor)?;
            (entry.seq, entry.id.clone(), Arc::clone(&entry.payload))
        };
        let group_state = self.groups.entry(group.to_string()).or_insert(GroupState {
            cursor_seq: 0,
            pending: HashMap::new(),
        });
        group_state.cursor_seq = seq;
        group_state.pending.insert(
            id.clone(),
            PendingEntry {
                id: id.clone(),
                payload: Arc::clone(&payload),
                consumer: consumer.to_string(),
                delivered_at_ms: now_millis(),
            },
        );
        Some(Delivery {
            message_id: id,
            payload: (*payload).clone(),
        })
    }
}

/// In-memory [`MessageBus`]. Cheap to clone (shares state via `Arc`).
pub struct InMemoryBus {
    topics: Arc<DashMap<String, Arc<Mutex<TopicState>>>>,
    transcript_trim_len: usize,
    audio_retention_minutes: u64,
}

impl InMemoryBus {
    /// Creates a bus with explicit trim policy for transcript topics and the
    /// shared audio topic.
    pub fn new(transcript_trim_len: usize, audio_retention_minutes: u64) -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
            transcript_trim_len,
            audio_retention_minutes,
        }
    }

    fn trim_policy_for(&self, topic: &str) -> TrimPolicy {
        if topic == AUDIO_TOPIC {
            TrimPolicy::Age(self.audio_retention_minutes)
        } else {
            TrimPolicy::Count(self.transcript_trim_len)
        }
    }

    fn topic_state(&self, topic: &str) -> Arc<Mutex<TopicState>> {
        Arc::clone(
            self.topics
                .entry(topic.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(TopicState::new(self.trim_policy_for(topic)))))
                .value(),
        )
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(
            crate::protocol_constants::TRANSCRIPT_TOPIC_TRIM_LEN,
            crate::protocol_constants::AUDIO_TOPIC_RETENTION_MINUTES,
        )
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<String, BusError> {
        let topic_state = self.topic_state(topic);
        let (id, notify) = {
            let mut state = topic_state.lock();
            state.next_seq += 1;
            let seq = state.next_seq;
            let now = now_millis();
            let id = format!("{now}-{seq}");
            state.entries.push_back(Entry {
                seq,
                id: id.clone(),
                payload: Arc::new(payload),
                published_at_ms: now,
            });
            state.apply_trim();
            (id, Arc::clone(&state.notify))
        };
        notify.notify_waiters();
        Ok(id)
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Box<dyn BusSubscription>, BusError> {
        let state = self.topic_state(topic);
        {
            let mut state = state.lock();
            if !state.groups.contains_key(group) {
                // A new group joins at the tail: its cursor is the seq of the last
                // published entry (0, i.e. "before seq 1", if the topic is empty),
                // so the next poll only sees entries published from here on. Seqs
                // are 1-based, so `next_seq` (the highest seq assigned so far)
                // already has exactly this meaning.
                let cursor_seq = state.next_seq;
                state.groups.insert(
                    group.to_string(),
                    GroupState {
                        cursor_seq,
                        pending: HashMap::new(),
                    },
                );
            }
        }
        Ok(Box::new(InMemorySubscription {
            state,
            group: group.to_string(),
            consumer: consumer.to_string(),
        }))
    }

    async fn scan_topics(&self, pattern: &str) -> Result<Vec<String>, BusError> {
        let glob = glob_prefix(pattern);
        Ok(self
            .topics
            .iter()
            .map(|e| e.key().clone())
            .filter(|name| match &glob {
                Some(prefix) => name.starts_with(prefix),
                None => name == pattern,
            })
            .collect())
    }
}

/// `scan_topics` patterns in this crate are always a literal prefix plus `*`
/// (e.g. `transcript.*`); this is enough to support discovery without a full
/// glob engine.
fn glob_prefix(pattern: &str) -> Option<&str> {
    pattern.strip_suffix('*')
}

struct InMemorySubscription {
    state: Arc<Mutex<TopicState>>,
    group: String,
    consumer: String,
}

#[async_trait]
impl BusSubscription for InMemorySubscription {
    async fn recv(&mut self) -> Result<Option<Delivery>, BusError> {
        let notified = {
            let mut state = self.state.lock();
            if let Some(delivery) = state.next_for_group(&self.group, &self.consumer) {
                return Ok(Some(delivery));
            }
            Arc::clone(&state.notify)
        };

        let waited = timeout(
            Duration::from_secs(BUS_BLOCKING_READ_TIMEOUT_SECS),
            notified.notified(),
        )
        .await;
        if waited.is_err() {
            return Ok(None);
        }

        let mut state = self.state.lock();
        Ok(state.next_for_group(&self.group, &self.consumer))
    }

    async fn ack(&mut self, message_id: &str) -> Result<(), BusError> {
        let mut state = self.state.lock();
        let group = state
            .groups
            .get_mut(&self.group)
            .ok_or_else(|| BusError::UnknownGroup {
                topic: String::new(),
                group: self.group.clone(),
            })?;
        group
            .pending
            .remove(message_id)
            .map(|_| ())
            .ok_or_else(|| BusError::UnknownMessageId(message_id.to_string()))
    }

    async fn reclaim(&mut self, min_idle_ms: u64) -> Result<Vec<Delivery>, BusError> {
        let mut state = self.state.lock();
        let now = now_millis();
        let group = state
            .groups
            .get_mut(&self.group)
            .ok_or_else(|| BusError::UnknownGroup {
                topic: String::new(),
                group: self.group.clone(),
            })?;

        let mut reclaimed = Vec::new();
        for entry in group.pending.values_mut() {
            if now.saturating_sub(entry.delivered_at_ms) >= min_idle_ms {
                entry.delivered_at_ms = now;
                entry.consumer = self.consumer.clone();
                reclaimed.push(Delivery {
                    message_id: entry.id.clone(),
                    payload: (*entry.payload).clone(),
                });
            }
        }
        // Keep deterministic ordering for callers/tests.
        reclaimed.sort_by_key(|d| d.message_id.clone());
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_subscribe_only_sees_future_messages() {
        let bus = InMemoryBus::new(100, 5);
        bus.publish("t1", b"before".to_vec()).await.unwrap();

        let mut sub = bus.subscribe("t1", "g1", "c1").await.unwrap();
        bus.publish("t1", b"after".to_vec()).await.unwrap();

        let delivery = sub.recv().await.unwrap().unwrap();
        assert_eq!(delivery.payload, b"after");
    }

    #[tokio::test]
    async fn fifo_within_a_group() {
        let bus = InMemoryBus::new(100, 5);
        let mut sub = bus.subscribe("t1", "g1", "c1").await.unwrap();
        bus.publish("t1", b"one".to_vec()).await.unwrap();
        bus.publish("t1", b"two".to_vec()).await.unwrap();

        let first = sub.recv().await.unwrap().unwrap();
        let second = sub.recv().await.unwrap().unwrap();
        assert_eq!(first.payload, b"one");
        assert_eq!(second.payload, b"two");
    }

    #[tokio::test]
    async fn distinct_groups_each_see_all_messages() {
        let bus = InMemoryBus::new(100, 5);
        let mut sub_a = bus.subscribe("t1", "group-a", "c1").await.unwrap();
        let mut sub_b = bus.subscribe("t1", "group-b", "c1").await.unwrap();
        bus.publish("t1", b"fanout".to_vec()).await.unwrap();

        assert_eq!(sub_a.recv().await.unwrap().unwrap().payload, b"fanout");
        assert_eq!(sub_b.recv().await.unwrap().unwrap().payload, b"fanout");
    }

    #[tokio::test]
    async fn ack_removes_from_pending_and_reclaim_skips_it() {
        let bus = InMemoryBus::new(100, 5);
        let mut sub = bus.subscribe("t1", "g1", "c1").await.unwrap();
        bus.publish("t1", b"msg".to_vec()).await.unwrap();
        let delivery = sub.recv().await.unwrap().unwrap();
        sub.ack(&delivery.message_id).await.unwrap();

        let reclaimed = sub.reclaim(0).await.unwrap();
        assert!(reclaimed.is_empty());
    }

    #[tokio::test]
    async fn unacked_message_is_reclaimable_after_idle() {
        let bus = InMemoryBus::new(100, 5);
        let mut sub = bus.subscribe("t1", "g1", "c1").await.unwrap();
        bus.publish("t1", b"msg".to_vec()).await.unwrap();
        let delivery = sub.recv().await.unwrap().unwrap();

        let reclaimed = sub.reclaim(0).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].message_id, delivery.message_id);
    }

    #[tokio::test]
    async fn count_trim_drops_oldest_transcript_messages() {
        let bus = InMemoryBus::new(2, 5);
        bus.publish("transcript.c1", b"1".to_vec()).await.unwrap();
        bus.publish("transcript.c1", b"2".to_vec()).await.unwrap();
        bus.publish("transcript.c1", b"3".to_vec()).await.unwrap();

        let state = bus.topic_state("transcript.c1");
        let state = state.lock();
        assert_eq!(state.entries.len(), 2);
        assert_eq!(*state.entries.front().unwrap().payload, b"2".to_vec());
    }

    #[tokio::test]
    async fn scan_topics_matches_prefix() {
        let bus = InMemoryBus::new(100, 5);
        bus.publish("transcript.c1", b"x".to_vec()).await.unwrap();
        bus.publish("transcript.c2", b"x".to_vec()).await.unwrap();
        bus.publish("audio_stream", b"x".to_vec()).await.unwrap();

        let mut topics = bus.scan_topics("transcript.*").await.unwrap();
        topics.sort();
        assert_eq!(topics, vec!["transcript.c1".to_string(), "transcript.c2".to_string()]);
    }
}
