//! Eviction predicates

use crate::slab::Slab;
use std::fmt;
use std::sync::Arc;

/// Decides whether the cache should evict after an access
#[derive(Clone)]
pub struct EvictionPredicate(Arc<dyn Fn() -> bool + Send + Sync>);

impl EvictionPredicate {
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn never() -> Self {
        Self::from_fn(|| false)
    }

    pub fn always() -> Self {
        Self::from_fn(|| true)
    }

    /// Evict while `slab` has more than `limit` bytes in use
    pub fn max_used_bytes(slab: Arc<dyn Slab>, limit: u64) -> Self {
        Self::from_fn(move || slab.used() > limit)
    }

    pub fn should_evict(&self) -> bool {
        (self.0)()
    }
}

impl Default for EvictionPredicate {
    fn default() -> Self {
        Self::never()
    }
}

impl fmt::Debug for EvictionPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EvictionPredicate(..)")
    }
}
