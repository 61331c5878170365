//! Live-swappable configuration handle.
//!
//! [`BucketManager`](crate::BucketManager) keeps its [`LimiterConfig`](crate::LimiterConfig)
//! in a `DynamicConfig` so limits can be reloaded without rebuilding the manager. Takes
//! in flight keep the snapshot they started with.
//!
//! Default uses `ArcSwap` for lock-free reads; feature `adaptive-rwlock` switches to
//! `RwLock`.

use std::sync::Arc;

#[cfg(feature = "adaptive-rwlock")]
use std::sync::RwLock;

#[cfg(not(feature = "adaptive-rwlock"))]
use arc_swap::ArcSwap;

/// Shared, replaceable value with cheap snapshot reads.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    #[cfg(not(feature = "adaptive-rwlock"))]
    inner: Arc<ArcSwap<T>>,
    #[cfg(feature = "adaptive-rwlock")]
    inner: Arc<RwLock<Arc<T>>>,
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
            Self { inner: Arc::new(RwLock::new(Arc::new(value))) }
        }
    }

    /// Snapshot the current value.
    pub fn get(&self) -> Arc<T> {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            self.inner.load_full()
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            match self.inner.read() {
                Ok(guard) => guard.clone(),
                Err(poisoned) => poisoned.into_inner().clone(),
            }
        }
    }

    /// Replace the value; returns the previous snapshot.
    pub fn set(&self, value: T) -> Arc<T> {
        let next = Arc::new(value);
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            self.inner.swap(next)
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            let mut guard = match self.inner.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::replace(&mut *guard, next)
        }
    }
}
