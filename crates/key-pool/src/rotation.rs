//! Scheduled rotation
//!
//! Spawns a periodic task that nudges the rotation order by moving the head
//! key to the tail. No capacity is consumed. Useful when callers tend to
//! acquire in bursts and the operator wants the starting key to drift
//! between bursts.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::pool::Pool;

/// Spawn a background task that calls `Pool::rotate` every `interval`.
///
/// The immediate first tick is skipped. Store errors are logged and the
/// task carries on with the next tick.
pub fn spawn_rotation_task(pool: Arc<Pool>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            rotation_cycle(&pool).await;
        }
    })
}

async fn rotation_cycle(pool: &Pool) {
    match pool.rotate().await {
        Ok(()) => debug!("scheduled rotation complete"),
        Err(e) => warn!(error = %e, "scheduled rotation failed, will retry next tick"),
    }
}
