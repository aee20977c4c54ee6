use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use storage::MessageStore;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{error, info};

/// Deletes every message due at or before `now`, whatever its status.
pub async fn sweep_expired(store: &dyn MessageStore, now: DateTime<Utc>) -> anyhow::Result<u64> {
    let deleted = store.delete_expired(now).await?;
    if deleted > 0 {
        info!(deleted, cutoff = %now, "expired messages removed");
    }
    Ok(deleted)
}

/// Runs [`sweep_expired`] immediately and then every `every`. A failed pass
/// is logged and retried on the next tick.
pub fn spawn_expiry_sweeper(store: Arc<dyn MessageStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(error) = sweep_expired(store.as_ref(), Utc::now()).await {
                error!(%error, "expiry sweep failed");
            }
        }
    })
}

#[cfg(test)]
#[path = "tests/sweeper_tests.rs"]
mod tests;
