//! Key queue abstraction
//!
//! The pool rotates keys through an ordered queue. Two backings implement
//! the same contract: `MemoryQueue` for a single process and `RedisQueue`
//! for several processes sharing one rotation state. Both are exercised by
//! the contract suite below so their observable behavior stays aligned.
//!
//! Contract:
//! - `enqueue` appends to the tail and always succeeds against a healthy store
//! - `dequeue` pops the head, returning `Ok(None)` when the queue is empty
//! - `contains` checks whether a key with that identity is currently queued
//! - `count` is advisory and may be stale as soon as it returns

pub mod memory;
pub mod redis;

pub use self::memory::MemoryQueue;
pub use self::redis::{RedisQueue, StoreKeys};

use std::future::Future;
use std::pin::Pin;

use crate::error::Result;
use crate::record::KeyHandle;

/// Boxed future returned by queue operations.
pub type QueueFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Ordered container of keys with FIFO semantics.
///
/// Uses `Pin<Box<dyn Future>>` return types so the pool can hold an
/// `Arc<dyn KeyQueue>` chosen at startup.
pub trait KeyQueue: Send + Sync {
    /// Backing name for logs and health ("memory", "redis").
    fn backend(&self) -> &'static str;

    fn enqueue(&self, key: KeyHandle) -> QueueFuture<'_, ()>;

    fn dequeue(&self) -> QueueFuture<'_, Option<KeyHandle>>;

    fn contains<'a>(&'a self, key: &'a KeyHandle) -> QueueFuture<'a, bool>;

    fn count(&self) -> QueueFuture<'_, usize>;
}
