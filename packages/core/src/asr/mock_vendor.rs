//! Scripted [`VendorStream`] double.
//!
//! First-class test infrastructure, not a throwaway stub: it backs both the
//! worker's own unit tests and `ASR_PROVIDER=mock` deployments that want the
//! rest of the pipeline exercised without a live vendor dependency.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::vendor::{VendorError, VendorEvent, VendorFactory, VendorStream};

/// A vendor connection that plays back a fixed script of events and records
/// every chunk handed to it.
pub struct MockVendor {
    script: VecDeque<VendorEvent>,
    sent_chunks: Arc<Mutex<Vec<Vec<u8>>>>,
    closed: Arc<Mutex<bool>>,
}

impl MockVendor {
    pub fn new(script: Vec<VendorEvent>) -> Self {
        Self {
            script: script.into(),
            sent_chunks: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(Mutex::new(false)),
        }
    }

    /// Chunks sent via [`VendorStream::send_audio`] so far, in order.
    pub fn sent_chunks(&self) -> Vec<Vec<u8>> {
        self.sent_chunks.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }
}

#[async_trait]
impl VendorStream for MockVendor {
    async fn send_audio(&mut self, pcm16le: &[u8]) -> Result<(), VendorError> {
        if *self.closed.lock() {
            return Err(VendorError::Closed("mock vendor already closed".into()));
        }
        self.sent_chunks.lock().push(pcm16le.to_vec());
        Ok(())
    }

    async fn next_event(&mut self) -> Option<VendorEvent> {
        self.script.pop_front()
    }

    async fn close(&mut self) {
        *self.closed.lock() = true;
    }
}

/// Builds [`MockVendor`]s from a registry of per-call scripts, and tracks how
/// many times `connect` was called per call — the worker's "exactly one
/// vendor connection per call" invariant is checked against this count.
#[derive(Default)]
pub struct MockVendorFactory {
    scripts: Mutex<HashMap<String, Vec<VendorEvent>>>,
    connect_counts: Mutex<HashMap<String, usize>>,
    fail_next_connects: Mutex<HashMap<String, usize>>,
    total_connects: AtomicUsize,
}

impl MockVendorFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the event script returned by the next `connect` for `interaction_id`.
    pub fn script_for(&self, interaction_id: &str, events: Vec<VendorEvent>) {
        self.scripts.lock().insert(interaction_id.to_string(), events);
    }

    /// Makes the next `count` connect attempts for `interaction_id` fail.
    pub fn fail_next_connects(&self, interaction_id: &str, count: usize) {
        self.fail_next_connects
            .lock()
            .insert(interaction_id.to_string(), count);
    }

    /// Number of successful or failed connect attempts for `interaction_id`.
    pub fn connect_count(&self, interaction_id: &str) -> usize {
        *self.connect_counts.lock().get(interaction_id).unwrap_or(&0)
    }

    pub fn total_connects(&self) -> usize {
        self.total_connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VendorFactory for MockVendorFactory {
    async fn connect(
        &self,
        interaction_id: &str,
        _sample_rate_hz: u32,
    ) -> Result<Box<dyn VendorStream>, VendorError> {
        self.total_connects.fetch_add(1, Ordering::SeqCst);
        *self
            .connect_counts
            .lock()
            .entry(interaction_id.to_string())
            .or_insert(0) += 1;

        let mut remaining_failures = self.fail_next_connects.lock();
        if let Some(count) = remaining_failures.get_mut(interaction_id) {
            if *count > 0 {
                *count -= 1;
                return Err(VendorError::Connect(format!(
                    "scripted failure for {interaction_id}"
                )));
            }
        }
        drop(remaining_failures);

        let script = self
            .scripts
            .lock()
            .remove(interaction_id)
            .unwrap_or_default();
        Ok(Box::new(MockVendor::new(script)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_sent_chunks_in_order() {
        let mut vendor = MockVendor::new(vec![]);
        vendor.send_audio(&[1, 2]).await.unwrap();
        vendor.send_audio(&[3, 4]).await.unwrap();
        assert_eq!(vendor.sent_chunks(), vec![vec![1, 2], vec![3, 4]]);
    }

    #[tokio::test]
    async fn factory_tracks_connect_count_per_call() {
        let factory = MockVendorFactory::new();
        factory.connect("call-1", 8_000).await.unwrap();
        factory.connect("call-1", 8_000).await.unwrap();
        factory.connect("call-2", 8_000).await.unwrap();

        assert_eq!(factory.connect_count("call-1"), 2);
        assert_eq!(factory.connect_count("call-2"), 1);
        assert_eq!(factory.total_connects(), 3);
    }

    #[tokio::test]
    async fn scripted_failure_then_success() {
        let factory = MockVendorFactory::new();
        factory.fail_next_connects("call-1", 1);
        assert!(factory.connect("call-1", 8_000).await.is_err());
        assert!(factory.connect("call-1", 8_000).await.is_ok());
    }
}
