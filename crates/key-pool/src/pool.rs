//! Admission coordinator and round-robin rotation
//!
//! The pool hands out keys by cycling through its queue: pop the head, check
//! the key's windows under its lock, and push it back to the tail whether or
//! not it was admitted. A granted key therefore returns to rotation at once,
//! already debited, while the borrower still holds a handle to it.
//!
//! The scan is bounded by the queue length observed on entry. Concurrent
//! callers can grow or shrink the queue during a scan, so a caller may give
//! up before seeing every key or may see one key twice; no stronger fairness
//! is attempted.
//!
//! Ownership: a key is owned by whoever holds it dequeued. Nothing reclaims a
//! key from a caller that dequeues it and never re-enqueues it; such a caller
//! permanently shrinks the pool.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::queue::{KeyQueue, MemoryQueue};
use crate::record::{KeyHandle, KeyRecord};
use crate::status::{self, KeyStatus};

/// Rotating pool of rate-limited keys.
pub struct Pool {
    queue: Arc<dyn KeyQueue>,
    clock: Arc<dyn Clock>,
}

impl Pool {
    pub fn new(queue: Arc<dyn KeyQueue>, clock: Arc<dyn Clock>) -> Self {
        info!(backend = queue.backend(), "pool initialized");
        Self { queue, clock }
    }

    /// Pool over a process-local queue seeded with `records`.
    pub fn in_memory(records: impl IntoIterator<Item = KeyRecord>, clock: Arc<dyn Clock>) -> Self {
        Self::new(Arc::new(MemoryQueue::new(records)), clock)
    }

    pub fn backend(&self) -> &'static str {
        self.queue.backend()
    }

    /// Hand out the next key that is neither expired nor rate limited.
    ///
    /// Returns `Ok(None)` when every key tried is unavailable, and
    /// `Error::EmptyPool` when there is nothing to try at all. A corrupt
    /// record in the shared store costs one attempt and is skipped.
    pub async fn acquire(&self) -> Result<Option<KeyHandle>> {
        let max_attempts = self.queue.count().await?;
        if max_attempts == 0 {
            warn!("key requested from an empty pool");
            metrics::counter!("key_pool_acquire_total", "outcome" => "empty").increment(1);
            return Err(Error::EmptyPool);
        }

        for attempt in 1..=max_attempts {
            let key = match self.queue.dequeue().await {
                Ok(Some(key)) => key,
                Ok(None) => {
                    warn!(attempt, max_attempts, "pool drained during key search");
                    metrics::counter!("key_pool_acquire_total", "outcome" => "empty").increment(1);
                    return Err(Error::EmptyPool);
                }
                Err(Error::CorruptRecord { id, reason }) => {
                    warn!(key_id = id, reason, attempt, "skipping corrupt key record");
                    metrics::counter!("key_pool_corrupt_records_total").increment(1);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let now = self.clock.now();
            let admitted = {
                let mut record = key.lock().await;
                if record.is_rate_limited(now) {
                    false
                } else {
                    record.mark_used(now);
                    true
                }
            };

            self.requeue(&key).await?;

            if admitted {
                debug!(key_id = key.id(), attempt, "key granted");
                metrics::counter!("key_pool_acquire_total", "outcome" => "granted").increment(1);
                return Ok(Some(key));
            }
            debug!(key_id = key.id(), attempt, "key unavailable, rotating past it");
        }

        info!(attempts = max_attempts, "all keys rate limited or expired");
        metrics::counter!("key_pool_acquire_total", "outcome" => "exhausted").increment(1);
        Ok(None)
    }

    /// Push a key this pool dequeued back to the tail.
    ///
    /// Nothing else holds the key at this point, so a failure here takes it
    /// out of rotation for every caller of the store.
    async fn requeue(&self, key: &KeyHandle) -> Result<()> {
        self.queue.enqueue(key.clone()).await.inspect_err(|e| {
            error!(key_id = key.id(), error = %e, "re-enqueue failed, key dropped from rotation");
            metrics::counter!("key_pool_requeue_failures_total").increment(1);
        })
    }

    /// Return a key to the tail of the rotation.
    ///
    /// Independent of the re-enqueue `acquire` already performed, so calling
    /// this adds a second entry for the key.
    pub async fn release(&self, key: KeyHandle) -> Result<()> {
        debug!(key_id = key.id(), "key released");
        self.queue.enqueue(key).await
    }

    /// Whether `key` is expired or at a limit right now. Reconciles its windows.
    pub async fn is_rate_limited(&self, key: &KeyHandle) -> bool {
        let now = self.clock.now();
        key.lock().await.is_rate_limited(now)
    }

    /// Move the head key to the tail without consuming capacity.
    pub async fn rotate(&self) -> Result<()> {
        if let Some(key) = self.queue.dequeue().await? {
            debug!(key_id = key.id(), "rotated key to tail");
            self.requeue(&key).await?;
            metrics::counter!("key_pool_rotations_total").increment(1);
        }
        Ok(())
    }

    /// Add a key to the running pool. Identifiers are not checked for uniqueness.
    pub async fn insert(&self, record: KeyRecord) -> Result<KeyHandle> {
        let key = KeyHandle::new(record);
        self.queue.enqueue(key.clone()).await?;
        info!(key_id = key.id(), "key added to pool");
        Ok(key)
    }

    /// Advisory number of queued entries.
    pub async fn len(&self) -> Result<usize> {
        self.queue.count().await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Whether this exact key is currently queued.
    pub async fn contains(&self, key: &KeyHandle) -> Result<bool> {
        self.queue.contains(key).await
    }

    /// Usage snapshot of `key` as of now. Reconciles its windows.
    pub async fn status(&self, key: &KeyHandle) -> KeyStatus {
        let now = self.clock.now();
        key.lock().await.status(now)
    }

    /// Text report for `key`, or the no-key message for `None`.
    pub async fn format_status(&self, key: Option<&KeyHandle>) -> String {
        match key {
            Some(key) => status::render(&self.status(key).await),
            None => status::render_or_unavailable(None),
        }
    }

    /// Pool summary for health endpoints.
    ///
    /// `healthy` while at least one entry is queued, `unhealthy` when the
    /// queue is empty or the store cannot be read.
    pub async fn health(&self) -> serde_json::Value {
        match self.queue.count().await {
            Ok(queued) => serde_json::json!({
                "status": if queued > 0 { "healthy" } else { "unhealthy" },
                "backend": self.backend(),
                "keys_queued": queued,
            }),
            Err(e) => serde_json::json!({
                "status": "unhealthy",
                "backend": self.backend(),
                "error": e.to_string(),
            }),
        }
    }
}
