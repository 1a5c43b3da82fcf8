//! Live-swappable shared values.
//!
//! The chain's entries and every rotation pool sit behind a [`DynamicConfig`]: readers take a
//! snapshot that stays valid for as long as they hold it, writers publish a whole new value.
//! Default backend is `ArcSwap` (lock-free reads); feature `adaptive-rwlock` switches to a
//! `RwLock`.

use std::sync::Arc;

#[cfg(feature = "adaptive-rwlock")]
use std::sync::{PoisonError, RwLock};

#[cfg(not(feature = "adaptive-rwlock"))]
use arc_swap::ArcSwap;

/// Shared value with snapshot reads and atomic read-modify-write updates.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    #[cfg(not(feature = "adaptive-rwlock"))]
    inner: Arc<ArcSwap<T>>,
    #[cfg(feature = "adaptive-rwlock")]
    inner: Arc<RwLock<T>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> DynamicConfig<T> {
    pub fn new(value: T) -> Self {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            Self { inner: Arc::new(RwLock::new(value)) }
        }
    }

    /// Snapshot the current value.
    #[cfg(not(feature = "adaptive-rwlock"))]
    pub fn get(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Snapshot the current value (cloned under the RwLock backend).
    #[cfg(feature = "adaptive-rwlock")]
    pub fn get(&self) -> Arc<T>
    where
        T: Clone,
    {
        Arc::new(self.inner.read().unwrap_or_else(PoisonError::into_inner).clone())
    }

    /// Replace the value; existing snapshots are unaffected.
    pub fn set(&self, value: T) {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            self.inner.store(Arc::new(value));
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            *self.inner.write().unwrap_or_else(PoisonError::into_inner) = value;
        }
    }

    /// Derive a new value from the current one.
    ///
    /// Concurrent updates never lose each other's writes. Under the `ArcSwap` backend `f` may
    /// run more than once when it races another writer, so it must not have side effects
    /// beyond its return value and locals it resets on each call.
    pub fn update<F>(&self, mut f: F)
    where
        F: FnMut(&T) -> T,
    {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            self.inner.rcu(|current| Arc::new(f(current)));
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            let next = f(&guard);
            *guard = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::DynamicConfig;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn get_set_update() {
        let a = DynamicConfig::new(1);
        assert_eq!(*a.get(), 1);
        a.set(2);
        assert_eq!(*a.get(), 2);
        a.update(|v| v + 3);
        assert_eq!(*a.get(), 5);
    }

    #[test]
    fn snapshot_survives_replacement() {
        let pool = DynamicConfig::new(vec!["a", "b"]);
        let before = pool.get();
        pool.set(vec!["c"]);
        assert_eq!(*before, vec!["a", "b"]);
        assert_eq!(*pool.get(), vec!["c"]);
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let counter = Arc::new(DynamicConfig::new(0usize));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..250 {
                        counter.update(|v| v + 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*counter.get(), 1000);
    }
}
