//! Lease timers.
//!
//! One cancellable one-shot timer per resource name. When a timer fires it
//! first removes its own entry under the map lock; `cancel` takes the same
//! lock, so for any lease exactly one of the two takes effect.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};
use utoipa::ToSchema;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct LeaseInfo {
    pub name: String,
    pub expires_at: DateTime<Utc>,
}

struct Lease {
    id: u64,
    expires_at: DateTime<Utc>,
    handle: JoinHandle<()>,
}

type Leases = Arc<Mutex<HashMap<String, Lease>>>;

#[derive(Default)]
pub struct LeaseScheduler {
    leases: Leases,
    next_id: AtomicU64,
}

impl LeaseScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a lease for `name` that calls `on_expiry(name)` after `duration`.
    ///
    /// Returns `false` without arming if `name` already has a live lease.
    pub async fn arm<F, Fut>(&self, name: &str, duration: Duration, on_expiry: F) -> bool
    where
        F: FnOnce(String) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut leases = self.leases.lock().await;
        if leases.contains_key(name) {
            debug!(resource = %name, "Lease already armed");
            return false;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + duration;
        let expires_at = chrono::Duration::from_std(duration)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let map = Arc::clone(&self.leases);
        let owned = name.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;

            // Claim the entry; a concurrent cancel may have won already.
            let claimed = {
                let mut leases = map.lock().await;
                match leases.get(&owned) {
                    Some(lease) if lease.id == id => {
                        leases.remove(&owned);
                        true
                    }
                    _ => false,
                }
            };
            if !claimed {
                return;
            }

            info!(resource = %owned, "Lease expired");
            on_expiry(owned).await;
        });

        leases.insert(
            name.to_string(),
            Lease {
                id,
                expires_at,
                handle,
            },
        );
        info!(resource = %name, expires_at = %expires_at, "Lease armed");
        true
    }

    /// Cancel the pending lease for `name`. Returns whether one was pending.
    pub async fn cancel(&self, name: &str) -> bool {
        match self.leases.lock().await.remove(name) {
            Some(lease) => {
                lease.handle.abort();
                debug!(resource = %name, "Lease cancelled");
                true
            }
            None => false,
        }
    }

    pub async fn active(&self) -> Vec<LeaseInfo> {
        let leases = self.leases.lock().await;
        let mut active: Vec<LeaseInfo> = leases
            .iter()
            .map(|(name, l)| LeaseInfo {
                name: name.clone(),
                expires_at: l.expires_at,
            })
            .collect();
        active.sort_by_key(|l| l.expires_at);
        active
    }

    /// Abort every pending lease without firing it.
    pub async fn shutdown(&self) {
        let mut leases = self.leases.lock().await;
        for (name, lease) in leases.drain() {
            lease.handle.abort();
            debug!(resource = %name, "Lease dropped on shutdown");
        }
    }
}
