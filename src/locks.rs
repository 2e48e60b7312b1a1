//! Per-key async mutexes
//!
//! Serializes work on one key (e.g. a user's credential for a provider)
//! while unrelated keys proceed in parallel. In-process only; cross-process
//! writers are guarded by the credential `version` CAS.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::providers::Provider;

/// Key of per-user, per-provider state
pub type UserProviderKey = (Uuid, Provider);

#[derive(Debug)]
pub struct KeyedLocks<K> {
    entries: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        let entry = {
            let mut entries = self.entries.lock().await;
            // Drop entries nobody holds or waits on
            entries.retain(|k, lock| k == key || Arc::strong_count(lock) > 1);
            Arc::clone(entries.entry(key.clone()).or_default())
        };
        entry.lock_owned().await
    }
}
