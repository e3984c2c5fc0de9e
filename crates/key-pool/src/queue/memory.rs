//! Process-local key queue
//!
//! A `VecDeque` of handles behind a tokio `Mutex`. Handles share their
//! record, so state changes made by one caller are visible to whoever
//! dequeues the key next without any copying.

use std::collections::{HashSet, VecDeque};

use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{KeyQueue, QueueFuture};
use crate::record::{KeyHandle, KeyRecord};

/// In-memory FIFO of keys.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    entries: Mutex<VecDeque<KeyHandle>>,
}

impl MemoryQueue {
    /// Build a queue from the initial key set.
    ///
    /// Duplicate identifiers collapse to the first occurrence. Later
    /// `enqueue` calls do not deduplicate.
    pub fn new(records: impl IntoIterator<Item = KeyRecord>) -> Self {
        let mut seen = HashSet::new();
        let mut entries = VecDeque::new();
        for record in records {
            if seen.insert(record.id.clone()) {
                entries.push_back(KeyHandle::new(record));
            } else {
                debug!(key_id = record.id, "duplicate key identifier ignored");
            }
        }
        info!(keys = entries.len(), "memory queue initialized");
        Self {
            entries: Mutex::new(entries),
        }
    }
}

impl KeyQueue for MemoryQueue {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn enqueue(&self, key: KeyHandle) -> QueueFuture<'_, ()> {
        Box::pin(async move {
            self.entries.lock().await.push_back(key);
            Ok(())
        })
    }

    fn dequeue(&self) -> QueueFuture<'_, Option<KeyHandle>> {
        Box::pin(async move { Ok(self.entries.lock().await.pop_front()) })
    }

    fn contains<'a>(&'a self, key: &'a KeyHandle) -> QueueFuture<'a, bool> {
        Box::pin(async move {
            let entries = self.entries.lock().await;
            Ok(entries.iter().any(|queued| queued.same_record(key)))
        })
    }

    fn count(&self) -> QueueFuture<'_, usize> {
        Box::pin(async move { Ok(self.entries.lock().await.len()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::contract;
    use crate::record::RateLimits;

    #[tokio::test]
    async fn contract_empty_queue_dequeues_none() {
        contract::empty_queue_dequeues_none(&MemoryQueue::default()).await;
    }

    #[tokio::test]
    async fn contract_fifo_order() {
        contract::dequeues_in_fifo_order(&MemoryQueue::default()).await;
    }

    #[tokio::test]
    async fn contract_contains() {
        contract::contains_tracks_queued_keys(&MemoryQueue::default()).await;
    }

    #[tokio::test]
    async fn contract_runtime_duplicates() {
        contract::duplicates_allowed_at_runtime(&MemoryQueue::default()).await;
    }

    #[tokio::test]
    async fn contract_state_carried() {
        contract::enqueue_carries_record_state(&MemoryQueue::default()).await;
    }

    #[tokio::test]
    async fn construction_collapses_duplicate_ids() {
        let queue = MemoryQueue::new([
            KeyRecord::new("a", RateLimits::unlimited()),
            KeyRecord::new("b", RateLimits::unlimited()),
            KeyRecord::new("a", RateLimits::unlimited()),
        ]);
        assert_eq!(queue.count().await.unwrap(), 2);
        assert_eq!(queue.dequeue().await.unwrap().unwrap().id(), "a");
        assert_eq!(queue.dequeue().await.unwrap().unwrap().id(), "b");
    }

    #[tokio::test]
    async fn contains_is_identity_not_identifier() {
        let queue = MemoryQueue::new([KeyRecord::new("a", RateLimits::unlimited())]);
        let lookalike = KeyHandle::new(KeyRecord::new("a", RateLimits::unlimited()));
        assert!(!queue.contains(&lookalike).await.unwrap());
    }
}
