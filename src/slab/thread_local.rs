//! Thread-local allocation buffers (TLABs)
//!
//! Each allocation context gets a private bump window carved from a shared
//! backing slab, so the common path never touches the backing slab's lock.
//!
//! ```text
//! ┌──────────────────────── backing slab ─────────────────────────┐
//! │ ctx 1 TLAB [used|free] │ ctx 2 TLAB [used|free] │ (unallocated) │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! When a window is too small for a request, its unused tail goes back to
//! the backing slab and a fresh window is carved. Requests larger than a
//! whole window bypass the TLAB. A thread's window is released when the
//! thread exits.

use super::{AllocateOnlySlab, Address, Allocation, AllocationContext, RawSlab, Slab};
use crate::error::Result;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

type Tlab = AllocateOnlySlab<dyn Slab>;

/// Slab view handing out memory from per-context buffers
///
/// The plain [`Slab`] methods use [`AllocationContext::current`]; the
/// `_in` variants take the context explicitly.
pub struct ThreadLocalSlab {
    id: u64,
    tlab_size: u64,
    slab: Arc<dyn Slab>,
    tlabs: Arc<DashMap<u64, Tlab>>,
}

static NEXT_SLAB_ID: AtomicU64 = AtomicU64::new(1);

impl ThreadLocalSlab {
    pub fn new(tlab_size: u64, slab: Arc<dyn Slab>) -> Self {
        Self {
            id: NEXT_SLAB_ID.fetch_add(1, Ordering::Relaxed),
            tlab_size,
            slab,
            tlabs: Arc::new(DashMap::new()),
        }
    }

    pub fn tlab_size(&self) -> u64 {
        self.tlab_size
    }

    pub fn backing_slab(&self) -> &Arc<dyn Slab> {
        &self.slab
    }

    pub fn allocate_in(&self, ctx: &AllocationContext, size_bytes: u64) -> Result<Address> {
        if size_bytes > self.tlab_size {
            return self.slab.allocate(size_bytes);
        }
        if let Some(tlab) = self.tlabs.get(&ctx.id()) {
            if size_bytes <= tlab.free_bytes() {
                return tlab.allocate(size_bytes);
            }
        }

        let tlab = self.refill(ctx)?;
        // A fresh window can come up short when the backing slab is nearly full
        let result = if size_bytes <= tlab.free_bytes() {
            tlab.allocate(size_bytes)
        } else {
            self.slab.allocate(size_bytes)
        };
        self.install(ctx, tlab);
        result
    }

    pub fn try_allocate_in(&self, ctx: &AllocationContext, size_bytes: u64) -> Allocation {
        if size_bytes > self.tlab_size {
            return self.slab.try_allocate(size_bytes);
        }
        if let Some(tlab) = self.tlabs.get(&ctx.id()) {
            if size_bytes <= tlab.free_bytes() {
                return tlab.try_allocate(size_bytes);
            }
        }

        let tlab = match self.refill(ctx) {
            Ok(tlab) => tlab,
            Err(_) => return Allocation::empty(),
        };
        let allocation = tlab.try_allocate(size_bytes);
        self.install(ctx, tlab);
        allocation
    }

    /// Backing usage minus what this context still holds in reserve
    pub fn used_in(&self, ctx: &AllocationContext) -> u64 {
        let reserved = self.tlabs.get(&ctx.id()).map_or(0, |t| t.free_bytes());
        self.slab.used().saturating_sub(reserved)
    }

    /// Backing free space plus this context's reserve
    pub fn free_in(&self, ctx: &AllocationContext) -> u64 {
        let reserved = self.tlabs.get(&ctx.id()).map_or(0, |t| t.free_bytes());
        self.slab.free_bytes() + reserved
    }

    /// Give the context's unused window back to the backing slab
    ///
    /// Windows of [`AllocationContext::current`] contexts are released when
    /// their thread exits; explicit contexts are released here.
    pub fn release_in(&self, ctx: &AllocationContext) -> Result<()> {
        if release_window(&self.tlabs, self.slab.as_ref(), ctx.id())? {
            debug!(ctx = ctx.id(), "Released thread-local buffer");
        }
        Ok(())
    }

    /// Number of contexts currently holding a buffer
    pub fn active_buffers(&self) -> usize {
        self.tlabs.len()
    }

    fn carve_tlab(&self) -> Tlab {
        // May come back empty; a zero-sized window simply forces a refresh
        let allocation = self.slab.try_allocate(self.tlab_size);
        AllocateOnlySlab::new(self.slab.clone(), allocation.address, allocation.size)
    }

    /// Retire the context's window and carve a new one
    ///
    /// The map entry is not held meanwhile, so other contexts keep their fast
    /// path while the backing slab is busy.
    fn refill(&self, ctx: &AllocationContext) -> Result<Tlab> {
        release_window(&self.tlabs, self.slab.as_ref(), ctx.id())?;
        let tlab = self.carve_tlab();
        debug!(
            ctx = ctx.id(),
            base = %tlab.base(),
            capacity = tlab.capacity(),
            "Refreshed thread-local buffer"
        );
        Ok(tlab)
    }

    fn install(&self, ctx: &AllocationContext, tlab: Tlab) {
        self.tlabs.insert(ctx.id(), tlab);

        let tlabs = Arc::downgrade(&self.tlabs);
        let slab = Arc::downgrade(&self.slab);
        ctx.at_thread_exit(self.id, move |id| {
            let (Some(tlabs), Some(slab)) = (tlabs.upgrade(), slab.upgrade()) else {
                return;
            };
            if let Err(e) = release_window(&tlabs, slab.as_ref(), id) {
                error!(ctx = id, error = %e, "Failed to release buffer of exiting thread");
            }
        });
    }
}

/// Remove `id`'s window and free its unused tail; false if it had none
fn release_window(tlabs: &DashMap<u64, Tlab>, slab: &dyn Slab, id: u64) -> Result<bool> {
    let Some((_, tlab)) = tlabs.remove(&id) else {
        return Ok(false);
    };
    if let Some(tail) = tlab.unused_tail() {
        slab.free(tail.address, tail.size)?;
    }
    Ok(true)
}

impl RawSlab for ThreadLocalSlab {
    /// Base of the calling context's buffer, or of the backing slab when it
    /// has none yet
    fn base_address(&self) -> Result<Address> {
        match self.tlabs.get(&AllocationContext::current().id()) {
            Some(tlab) => Ok(tlab.base()),
            None => self.slab.base_address(),
        }
    }

    fn get_byte(&self, address: Address) -> Result<u8> {
        self.slab.get_byte(address)
    }

    fn put_byte(&self, address: Address, value: u8) -> Result<()> {
        self.slab.put_byte(address, value)
    }

    fn get(&self, address: Address, buf: &mut [u8]) -> Result<()> {
        self.slab.get(address, buf)
    }

    fn put(&self, address: Address, bytes: &[u8]) -> Result<()> {
        self.slab.put(address, bytes)
    }

    fn size(&self) -> Result<u64> {
        self.slab.size()
    }

    fn expand(&self, size_bytes: u64) -> Result<u64> {
        self.slab.expand(size_bytes)
    }

    fn free_slab(&self) -> Result<()> {
        self.tlabs.clear();
        self.slab.free_slab()
    }
}

impl Slab for ThreadLocalSlab {
    fn allocate(&self, size_bytes: u64) -> Result<Address> {
        self.allocate_in(&AllocationContext::current(), size_bytes)
    }

    fn try_allocate(&self, size_bytes: u64) -> Allocation {
        self.try_allocate_in(&AllocationContext::current(), size_bytes)
    }

    fn free(&self, address: Address, size_bytes: u64) -> Result<()> {
        self.slab.free(address, size_bytes)
    }

    fn used(&self) -> u64 {
        self.used_in(&AllocationContext::current())
    }

    fn free_bytes(&self) -> u64 {
        self.free_in(&AllocationContext::current())
    }
}

impl std::fmt::Debug for ThreadLocalSlab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadLocalSlab")
            .field("tlab_size", &self.tlab_size)
            .field("active_buffers", &self.tlabs.len())
            .field("slab", &self.slab)
            .finish()
    }
}
