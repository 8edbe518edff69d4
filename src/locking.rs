use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use crate::errors::{Error, Result};

#[derive(Default)]
struct LockEntry {
    locked: bool,
    owner: Option<String>,
    notify: Arc<Notify>,
}

/// Named try-locks over instance identifiers. Owners are advisory, recorded
/// for diagnostics only.
///
/// Passed explicitly to every component that needs it; there is no
/// process-wide registry.
#[derive(Clone, Default)]
pub struct KeyMuxRegistry {
    inner: Arc<Mutex<HashMap<String, LockEntry>>>,
}

impl KeyMuxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-blocking acquire. Returns false on contention without waiting.
    pub fn try_lock(&self, key: &str, owner: &str) -> bool {
        let mut map = self.inner.lock().expect("lock registry poisoned");
        let entry = map.entry(key.to_string()).or_default();
        if entry.locked {
            return false;
        }
        entry.locked = true;
        entry.owner = Some(owner.to_string());
        true
    }

    /// Blocking acquire.
    pub async fn lock(&self, key: &str, owner: &str) {
        loop {
            let notify = {
                let mut map = self.inner.lock().expect("lock registry poisoned");
                let entry = map.entry(key.to_string()).or_default();
                if !entry.locked {
                    entry.locked = true;
                    entry.owner = Some(owner.to_string());
                    return;
                }
                entry.notify.clone()
            };
            // notify_one leaves a permit behind, so a release between the
            // failed attempt above and this await is not lost.
            notify.notified().await;
        }
    }

    /// Blocking acquire bounded by `deadline`.
    pub async fn lock_with_deadline(
        &self,
        key: &str,
        owner: &str,
        deadline: Duration,
    ) -> Result<()> {
        tokio::time::timeout(deadline, self.lock(key, owner))
            .await
            .map_err(|_| Error::Timeout(format!("lock on {key}")))
    }

    /// Release. With `remove` the entry is dropped from the map atomically
    /// with the release, so a later `try_lock` starts from a clean slate.
    pub fn unlock(&self, key: &str, remove: bool) {
        let mut map = self.inner.lock().expect("lock registry poisoned");
        if let Some(entry) = map.get_mut(key) {
            entry.locked = false;
            entry.owner = None;
            let notify = entry.notify.clone();
            if remove {
                map.remove(key);
                notify.notify_waiters();
            }
            notify.notify_one();
        }
    }

    /// Inspect the recorded owner without changing state. The second value
    /// reports whether the entry is present at all.
    pub fn locked_by(&self, key: &str) -> (Option<String>, bool) {
        let map = self.inner.lock().expect("lock registry poisoned");
        match map.get(key) {
            Some(entry) => (entry.owner.clone(), true),
            None => (None, false),
        }
    }

    /// Force-remove an entry. The caller is responsible for making sure no
    /// holder is still relying on it.
    pub fn delete(&self, key: &str) {
        let mut map = self.inner.lock().expect("lock registry poisoned");
        if let Some(entry) = map.remove(key) {
            entry.notify.notify_waiters();
            entry.notify.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn try_lock_does_not_block_on_contention() {
        let registry = KeyMuxRegistry::new();
        assert!(registry.try_lock("r1", "first"));
        assert!(!registry.try_lock("r1", "second"));

        let (owner, present) = registry.locked_by("r1");
        assert_eq!(owner.as_deref(), Some("first"));
        assert!(present);
    }

    #[tokio::test]
    async fn unlock_with_remove_leaves_no_ghost() {
        let registry = KeyMuxRegistry::new();
        assert!(registry.try_lock("r1", "worker"));
        registry.unlock("r1", true);

        let (_, present) = registry.locked_by("r1");
        assert!(!present);
        assert!(registry.try_lock("r1", "worker"));
    }

    #[tokio::test]
    async fn blocking_lock_waits_for_release() {
        let registry = KeyMuxRegistry::new();
        assert!(registry.try_lock("r1", "holder"));

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry.lock("r1", "waiter").await;
                registry.unlock("r1", false);
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        registry.unlock("r1", false);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should acquire after release")
            .unwrap();
    }

    #[tokio::test]
    async fn lock_with_deadline_times_out_under_contention() {
        let registry = KeyMuxRegistry::new();
        assert!(registry.try_lock("r1", "holder"));

        let err = registry
            .lock_with_deadline("r1", "late", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        // The holder is unaffected.
        let (owner, present) = registry.locked_by("r1");
        assert_eq!(owner.as_deref(), Some("holder"));
        assert!(present);
    }

    #[tokio::test]
    async fn contended_removal_wakes_waiters() {
        let registry = KeyMuxRegistry::new();
        assert!(registry.try_lock("r1", "holder"));

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry.lock("r1", "waiter").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.unlock("r1", true);

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should acquire a fresh entry")
            .unwrap();
        let (owner, present) = registry.locked_by("r1");
        assert_eq!(owner.as_deref(), Some("waiter"));
        assert!(present);
    }
}
