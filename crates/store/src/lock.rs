//! Per-run lock lease with background renewal.
//!
//! A run is owned by exactly one engine instance at a time.  The owner
//! keeps the lease alive with a renewal task; losing the lease (another
//! holder observed, or the backend refusing the renewal) stops the task.
//! Release is compare-and-delete through the store, so a lost-lease holder
//! can never release another instance's lock.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::traits::StateStore;

/// A held run lock.  Dropping it without calling [`RunLock::release`]
/// leaves the lease to expire on its own TTL.
pub struct RunLock {
    pub run_id: Uuid,
    pub holder: String,
    stop: watch::Sender<bool>,
    renewal: JoinHandle<()>,
}

impl RunLock {
    /// Stop the renewal task and compare-and-delete the lease.
    pub async fn release(self, store: &dyn StateStore) -> Result<bool, StoreError> {
        let _ = self.stop.send(true);
        let _ = self.renewal.await;
        store.release_lock(self.run_id, &self.holder).await
    }
}

/// Try to acquire the run lock; on success spawn a renewal task that
/// extends the lease every `renew_every` until released or lost.
pub async fn acquire_lock_with_renewal(
    store: Arc<dyn StateStore>,
    run_id: Uuid,
    holder: &str,
    ttl: Duration,
    renew_every: Duration,
) -> Result<Option<RunLock>, StoreError> {
    if !store.acquire_lock(run_id, holder, ttl).await? {
        return Ok(None);
    }

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let holder_owned = holder.to_string();
    let renewal_store = Arc::clone(&store);
    let renewal_holder = holder_owned.clone();

    let renewal = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(renew_every);
        // The first tick fires immediately; the lease was just written.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match renewal_store.renew_lock(run_id, &renewal_holder, ttl).await {
                        Ok(true) => debug!(%run_id, "run lock renewed"),
                        Ok(false) => {
                            warn!(%run_id, holder = %renewal_holder, "run lock lost; stopping renewal");
                            break;
                        }
                        Err(err) => {
                            // Transient backend trouble: the lease may still
                            // be live, keep trying until it is definitively
                            // lost or the ttl runs out.
                            warn!(%run_id, error = %err, "run lock renewal failed");
                        }
                    }
                }
                _ = stop_rx.changed() => break,
            }
        }
    });

    Ok(Some(RunLock {
        run_id,
        holder: holder_owned,
        stop: stop_tx,
        renewal,
    }))
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use model::{ManualClock, SystemClock};

    #[tokio::test]
    async fn only_one_caller_wins_the_lock() {
        let store: Arc<dyn StateStore> =
            Arc::new(MemoryStore::new(Default::default(), Arc::new(SystemClock)));
        let run_id = Uuid::new_v4();
        let ttl = Duration::from_secs(300);
        let every = Duration::from_secs(100);

        let first = acquire_lock_with_renewal(Arc::clone(&store), run_id, "engine-a", ttl, every)
            .await
            .unwrap();
        let second = acquire_lock_with_renewal(Arc::clone(&store), run_id, "engine-b", ttl, every)
            .await
            .unwrap();

        assert!(first.is_some());
        assert!(second.is_none());

        let released = first.unwrap().release(store.as_ref()).await.unwrap();
        assert!(released);
    }

    #[tokio::test]
    async fn release_is_holder_gated() {
        let store: Arc<dyn StateStore> =
            Arc::new(MemoryStore::new(Default::default(), Arc::new(SystemClock)));
        let run_id = Uuid::new_v4();

        assert!(store
            .acquire_lock(run_id, "engine-a", Duration::from_secs(300))
            .await
            .unwrap());

        // A non-holder cannot release.
        assert!(!store.release_lock(run_id, "engine-b").await.unwrap());
        assert!(store.release_lock(run_id, "engine-a").await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_can_be_reacquired() {
        let clock = Arc::new(ManualClock::starting_now());
        let store: Arc<dyn StateStore> =
            Arc::new(MemoryStore::new(Default::default(), clock.clone()));
        let run_id = Uuid::new_v4();

        assert!(store
            .acquire_lock(run_id, "engine-a", Duration::from_secs(10))
            .await
            .unwrap());
        assert!(!store
            .acquire_lock(run_id, "engine-b", Duration::from_secs(10))
            .await
            .unwrap());

        clock.advance_millis(11_000);
        assert!(store
            .acquire_lock(run_id, "engine-b", Duration::from_secs(10))
            .await
            .unwrap());
    }
}
