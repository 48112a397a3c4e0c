//! Slab factories used to populate pools

use super::{ManagedSlab, OffHeapSlab, RawSlab, Slab, SynchronizedSlab, ThreadLocalSlab};
use crate::error::Result;
use std::sync::Arc;

/// Creates slabs of a given size
pub trait SlabFactory: Send + Sync {
    fn create(&self, size_bytes: u64) -> Result<Arc<dyn Slab>>;
}

impl<F> SlabFactory for F
where
    F: Fn(u64) -> Result<Arc<dyn Slab>> + Send + Sync,
{
    fn create(&self, size_bytes: u64) -> Result<Arc<dyn Slab>> {
        self(size_bytes)
    }
}

/// Free-list managed slabs over fresh off-heap regions
#[derive(Debug, Clone, Copy, Default)]
pub struct ManagedSlabFactory {
    reserve_bytes: Option<u64>,
}

impl ManagedSlabFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `reserve_bytes` per slab so it can later expand in place
    pub fn with_reserve(reserve_bytes: u64) -> Self {
        Self {
            reserve_bytes: Some(reserve_bytes),
        }
    }
}

impl SlabFactory for ManagedSlabFactory {
    fn create(&self, size_bytes: u64) -> Result<Arc<dyn Slab>> {
        let reserve = self.reserve_bytes.unwrap_or(size_bytes).max(size_bytes);
        let raw: Arc<dyn RawSlab> = Arc::new(OffHeapSlab::with_reserve(size_bytes, reserve)?);
        Ok(Arc::new(ManagedSlab::from_raw_slab(raw)?))
    }
}

/// Wraps every slab of an inner factory in a [`ThreadLocalSlab`]
pub struct ThreadLocalSlabFactory<F> {
    tlab_size: u64,
    inner: F,
}

impl<F: SlabFactory> ThreadLocalSlabFactory<F> {
    pub fn new(tlab_size: u64, inner: F) -> Self {
        Self { tlab_size, inner }
    }
}

impl<F: SlabFactory> SlabFactory for ThreadLocalSlabFactory<F> {
    fn create(&self, size_bytes: u64) -> Result<Arc<dyn Slab>> {
        let slab = self.inner.create(size_bytes)?;
        Ok(Arc::new(ThreadLocalSlab::new(self.tlab_size, slab)))
    }
}

/// Wraps every slab of an inner factory in a [`SynchronizedSlab`]
pub struct SynchronizedSlabFactory<F> {
    inner: F,
}

impl<F: SlabFactory> SynchronizedSlabFactory<F> {
    pub fn new(inner: F) -> Self {
        Self { inner }
    }
}

impl<F: SlabFactory> SlabFactory for SynchronizedSlabFactory<F> {
    fn create(&self, size_bytes: u64) -> Result<Arc<dyn Slab>> {
        let slab = self.inner.create(size_bytes)?;
        Ok(Arc::new(SynchronizedSlab::new(slab)))
    }
}
