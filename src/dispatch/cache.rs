//! Per-call-site bounded LRU map from receiver type name to guarded handle.
//!
//! All mutation happens under one lock owned by the call site. Resolution
//! never runs under that lock: on a miss the supplier runs unlocked and its
//! result is inserted only if no other thread got there first, so concurrent
//! first calls may resolve redundantly but converge on one entry.
//!
//! Entries hold the receiver class weakly. Entries whose class has been
//! dropped are swept whenever the map is written.

use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::trace;

use crate::dispatch::guard::GuardedHandle;
use crate::error::DispatchResult;
use crate::model::Class;

struct CacheEntry {
    handle: Arc<GuardedHandle>,
    class: Weak<Class>,
}

pub struct CallSiteCache {
    entries: Mutex<LruCache<Arc<str>, CacheEntry, ahash::RandomState>>,
}

impl CallSiteCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::with_hasher(capacity, ahash::RandomState::new())),
        }
    }

    /// Look up `key`, marking it most recently used.
    pub fn get(&self, key: &str) -> Option<Arc<GuardedHandle>> {
        self.entries.lock().get(key).map(|entry| entry.handle.clone())
    }

    /// Return the entry for `key`, computing and inserting it on a miss.
    ///
    /// The boolean is true when `supplier` ran. If another thread inserted
    /// the key while the supplier was running, its entry wins.
    pub fn get_or_compute<F>(
        &self,
        key: &Arc<str>,
        class: &Arc<Class>,
        supplier: F,
    ) -> DispatchResult<(Arc<GuardedHandle>, bool)>
    where
        F: FnOnce() -> DispatchResult<Arc<GuardedHandle>>,
    {
        if let Some(handle) = self.get(key) {
            return Ok((handle, false));
        }

        let computed = supplier()?;

        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(key.as_ref()) {
            trace!(key = %key, "lost insertion race, keeping existing entry");
            return Ok((existing.handle.clone(), true));
        }
        Self::sweep_locked(&mut entries);
        Self::insert_locked(&mut entries, key, class, computed.clone());
        Ok((computed, true))
    }

    /// Unconditionally replace the entry for `key`.
    pub fn put(&self, key: &Arc<str>, class: &Arc<Class>, handle: Arc<GuardedHandle>) {
        let mut entries = self.entries.lock();
        Self::sweep_locked(&mut entries);
        Self::insert_locked(&mut entries, key, class, handle);
    }

    fn insert_locked(
        entries: &mut LruCache<Arc<str>, CacheEntry, ahash::RandomState>,
        key: &Arc<str>,
        class: &Arc<Class>,
        handle: Arc<GuardedHandle>,
    ) {
        let entry = CacheEntry {
            handle,
            class: Arc::downgrade(class),
        };
        if let Some((evicted, _)) = entries.push(key.clone(), entry) {
            if evicted != *key {
                trace!(evicted = %evicted, "cache entry evicted");
            }
        }
    }

    /// Drop entries whose receiver class no longer exists.
    fn sweep_locked(entries: &mut LruCache<Arc<str>, CacheEntry, ahash::RandomState>) -> usize {
        let dead: Vec<Arc<str>> = entries
            .iter()
            .filter(|(_, entry)| entry.class.strong_count() == 0)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &dead {
            entries.pop(key.as_ref());
        }
        if !dead.is_empty() {
            trace!(swept = dead.len(), "dropped entries for unloaded classes");
        }
        dead.len()
    }

    pub fn sweep(&self) -> usize {
        Self::sweep_locked(&mut self.entries.lock())
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Keys, most recently used first.
    pub fn keys(&self) -> Vec<Arc<str>> {
        self.entries.lock().iter().map(|(key, _)| key.clone()).collect()
    }
}

impl std::fmt::Debug for CallSiteCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSiteCache").field("keys", &self.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::epoch::Epoch;
    use crate::dispatch::guard::{CategoryGuard, GuardSet, ReceiverGuard};
    use crate::dispatch::plan::DispatchPlan;
    use crate::model::ClassBuilder;
    use pretty_assertions::assert_eq;
    use smallvec::SmallVec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn handle(key: &str) -> Arc<GuardedHandle> {
        Arc::new(GuardedHandle::new(
            Arc::new(DispatchPlan::constant_null()),
            GuardSet {
                epoch: Epoch::new().current(),
                receiver: ReceiverGuard::Null,
                category: CategoryGuard::Absent,
                args: SmallVec::new(),
            },
            Arc::from(key),
        ))
    }

    fn key(name: &str) -> Arc<str> {
        Arc::from(name)
    }

    #[test]
    fn test_lru_eviction_keeps_most_recent() {
        let cache = CallSiteCache::new(2);
        let class = ClassBuilder::new("K").build();
        cache.put(&key("A"), &class, handle("A"));
        cache.put(&key("B"), &class, handle("B"));
        assert!(cache.get("A").is_some());
        cache.put(&key("C"), &class, handle("C"));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("B").is_none());
        assert_eq!(cache.keys(), vec![key("C"), key("A")]);
    }

    #[test]
    fn test_get_or_compute_runs_supplier_once_per_key() {
        let cache = CallSiteCache::new(4);
        let class = ClassBuilder::new("K").build();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let (h, _) = cache
                .get_or_compute(&key("A"), &class, || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(handle("A"))
                })
                .expect("computes");
            assert_eq!(h.key().as_ref(), "A");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_supplier_errors_are_not_cached() {
        let cache = CallSiteCache::new(4);
        let class = ClassBuilder::new("K").build();
        let result = cache.get_or_compute(&key("A"), &class, || {
            Err(crate::error::DispatchError::internal("nope"))
        });
        assert!(result.is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_concurrent_first_access_converges() {
        let cache = CallSiteCache::new(4);
        let class = ClassBuilder::new("K").build();
        let handles: Vec<Arc<GuardedHandle>> = crossbeam::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| scope.spawn(|_| cache.get_or_compute(&key("A"), &class, || Ok(handle("A")))))
                .collect();
            workers
                .into_iter()
                .map(|w| w.join().expect("thread panicked").expect("computes").0)
                .collect()
        })
        .expect("scope panicked");

        assert_eq!(cache.len(), 1);
        let stored = cache.get("A").expect("entry");
        assert!(handles.iter().filter(|h| Arc::ptr_eq(h, &stored)).count() >= 1);
    }

    #[test]
    fn test_entries_do_not_keep_classes_alive() {
        let cache = CallSiteCache::new(4);
        let keep = ClassBuilder::new("Keep").build();
        {
            let temp = ClassBuilder::new("Temp").build();
            cache.put(&key("Temp"), &temp, handle("Temp"));
        }
        cache.put(&key("Keep"), &keep, handle("Keep"));
        assert_eq!(cache.keys(), vec![key("Keep")]);
        assert_eq!(cache.sweep(), 0);
    }
}
