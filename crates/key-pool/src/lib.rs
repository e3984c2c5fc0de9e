//! Rotating pool of rate-limited API keys
//!
//! Hands out interchangeable credentials round-robin, skipping any key that
//! is expired or has reached one of its per-minute, per-hour, per-day or
//! per-month limits. Windows are calendar aligned and reconciled lazily on
//! every access; there is no background reset timer.
//!
//! Key lifecycle:
//! 1. Keys are seeded into a queue once at startup (in memory, or in Redis
//!    when several processes share the pool)
//! 2. `Pool::acquire` pops keys from the head until one passes its checks,
//!    debits it and pushes every popped key back to the tail
//! 3. The borrower may `Pool::release` the key when done, adding a second entry
//! 4. Counters reset when a window boundary is crossed; expired keys stay
//!    queued but are never handed out again

pub mod clock;
pub mod error;
pub mod pool;
pub mod queue;
pub mod record;
pub mod rotation;
pub mod status;
pub mod window;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use pool::Pool;
pub use queue::{KeyQueue, MemoryQueue, RedisQueue};
pub use record::{KeyHandle, KeyRecord, RateLimits};
pub use rotation::spawn_rotation_task;
pub use status::{KeyStatus, NO_KEY_AVAILABLE, WindowStatus};
pub use window::{Window, WindowState};
