//! Per-repository mutual exclusion.
//!
//! Two artifacts can resolve to the same repository (`repoA` under the
//! default namespace and `mirrors/repoA`, for example).  Their applies must
//! never interleave, so every mutation of a repository holds its lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Debug, Default)]
pub struct TargetLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl TargetLocks {
    /// Wait for exclusive access to `target`.
    pub async fn acquire(&self, target: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // Entries nobody else references are free; drop them so the map
            // only holds repositories currently in use.
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks.entry(target.to_string()).or_default().clone()
        };
        if let Ok(guard) = lock.clone().try_lock_owned() {
            return guard;
        }
        debug!(%target, "waiting for repository lock");
        lock.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap().len()
    }
}
