//! Shard selection policies
//!
//! A policy picks the shard of a pool that serves an allocation and runs a
//! caller-supplied allocation closure against it:
//!
//! ```text
//! ShardedSlab::allocate(size)
//!   └─→ policy.allocate_with(ctx, |index, shard| shard.allocate(size))
//!        ├─→ ThreadLocal:   hash(ctx) % shards
//!        ├─→ MostFreeSpace: shard with the most free bytes
//!        └─→ Dual:          first policy, then the second on failure
//! ```

use super::{default_digest, Address, Allocation, AllocationContext, DefaultDigest, Slab, SlabPool};
use crate::error::{Error, Result};
use dashmap::DashSet;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::hash::BuildHasher;
use std::sync::Arc;
use tracing::debug;

/// Allocation closure run against the selected shard
pub type AllocateFn<'a> = dyn FnMut(usize, &dyn Slab) -> Result<Address> + 'a;

/// Capacity-bounded allocation closure run against the selected shard
pub type TryAllocateFn<'a> = dyn FnMut(usize, &dyn Slab) -> Allocation + 'a;

/// Chooses which shard of a pool serves an allocation
pub trait AllocationPolicy: Send + Sync + fmt::Debug {
    fn allocate_with(&self, ctx: &AllocationContext, allocate: &mut AllocateFn<'_>)
        -> Result<Address>;

    fn try_allocate_with(
        &self,
        ctx: &AllocationContext,
        allocate: &mut TryAllocateFn<'_>,
    ) -> Allocation;

    /// Note that the free space of shard `index` changed
    fn update_slab(&self, index: usize);
}

/// Policy selection for configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    ThreadLocal,
    MostFreeSpace,
    /// Thread-local shard first, most free space as fallback
    #[default]
    Dual,
}

impl PolicyKind {
    pub fn build(self, pool: Arc<dyn SlabPool>) -> Arc<dyn AllocationPolicy> {
        match self {
            PolicyKind::ThreadLocal => Arc::new(ThreadLocalAllocationPolicy::new(pool)),
            PolicyKind::MostFreeSpace => Arc::new(MostFreeSpaceAllocationPolicy::new(pool)),
            PolicyKind::Dual => Arc::new(DualAllocationPolicy::new(
                Arc::new(ThreadLocalAllocationPolicy::new(pool.clone())),
                Arc::new(MostFreeSpaceAllocationPolicy::new(pool)),
            )),
        }
    }
}

/// Pins each context to one shard by hashing its id
#[derive(Debug)]
pub struct ThreadLocalAllocationPolicy<S: BuildHasher = DefaultDigest> {
    pool: Arc<dyn SlabPool>,
    digest: S,
}

impl ThreadLocalAllocationPolicy {
    pub fn new(pool: Arc<dyn SlabPool>) -> Self {
        Self::with_digest(pool, default_digest())
    }
}

impl<S: BuildHasher> ThreadLocalAllocationPolicy<S> {
    pub fn with_digest(pool: Arc<dyn SlabPool>, digest: S) -> Self {
        Self { pool, digest }
    }

    /// Shard serving `ctx`
    pub fn shard_for(&self, ctx: &AllocationContext) -> Result<usize> {
        match self.pool.len() as u64 {
            0 => Err(Error::Allocation("pool has no shards".into())),
            shards => Ok((self.digest.hash_one(ctx.id()) % shards) as usize),
        }
    }
}

impl<S: BuildHasher + Send + Sync + fmt::Debug> AllocationPolicy for ThreadLocalAllocationPolicy<S> {
    fn allocate_with(
        &self,
        ctx: &AllocationContext,
        allocate: &mut AllocateFn<'_>,
    ) -> Result<Address> {
        let index = self.shard_for(ctx)?;
        let slab = self.pool.slab_by_index(index)?;
        allocate(index, slab.as_ref())
    }

    fn try_allocate_with(
        &self,
        ctx: &AllocationContext,
        allocate: &mut TryAllocateFn<'_>,
    ) -> Allocation {
        let index = match self.shard_for(ctx) {
            Ok(index) => index,
            Err(_) => return Allocation::empty(),
        };
        match self.pool.slab_by_index(index) {
            Ok(slab) => allocate(index, slab.as_ref()),
            Err(_) => Allocation::empty(),
        }
    }

    fn update_slab(&self, _index: usize) {}
}

#[derive(Debug)]
struct ShardQueue {
    ordered: BTreeSet<(u64, usize)>,
    /// Key each shard is queued under, `None` while popped
    keys: Vec<Option<u64>>,
}

impl ShardQueue {
    fn insert(&mut self, index: usize, free: u64) {
        if let Some(old) = self.keys[index].take() {
            self.ordered.remove(&(old, index));
        }
        self.ordered.insert((free, index));
        self.keys[index] = Some(free);
    }

    /// Re-key a queued shard; popped shards are re-queued by their allocator
    fn refresh(&mut self, index: usize, free: u64) {
        if self.keys[index].is_some() {
            self.insert(index, free);
        }
    }

    fn pop_most_free(&mut self) -> Option<usize> {
        let (_, index) = self.ordered.pop_last()?;
        self.keys[index] = None;
        Some(index)
    }
}

/// Sends each allocation to the shard with the most free space
///
/// Shards are kept in an ordered queue keyed by free bytes. Free-space
/// changes reported through `update_slab` are buffered and folded into the
/// queue by the next allocator that gets the merge lock uncontended.
#[derive(Debug)]
pub struct MostFreeSpaceAllocationPolicy {
    pool: Arc<dyn SlabPool>,
    queue: Mutex<ShardQueue>,
    pending: DashSet<usize>,
    merge_lock: RwLock<()>,
}

impl MostFreeSpaceAllocationPolicy {
    pub fn new(pool: Arc<dyn SlabPool>) -> Self {
        let mut queue = ShardQueue {
            ordered: BTreeSet::new(),
            keys: vec![None; pool.len()],
        };
        for (index, slab) in pool.slabs().iter().enumerate() {
            queue.insert(index, slab.free_bytes());
        }

        Self {
            pool,
            queue: Mutex::new(queue),
            pending: DashSet::new(),
            merge_lock: RwLock::new(()),
        }
    }

    /// Pick a shard; the flag says whether it was taken off the queue
    fn select(&self) -> (usize, bool) {
        if let Some(_guard) = self.merge_lock.try_write() {
            let updated: Vec<usize> = self.pending.iter().map(|index| *index).collect();
            if !updated.is_empty() {
                let mut queue = self.queue.lock();
                for index in updated {
                    self.pending.remove(&index);
                    queue.refresh(index, self.pool.slabs()[index].free_bytes());
                }
            }
        }

        if let Some(index) = self.queue.lock().pop_most_free() {
            return (index, true);
        }

        // Every shard is held by a concurrent allocator
        (self.scan_most_free(), false)
    }

    fn scan_most_free(&self) -> usize {
        self.pool
            .slabs()
            .iter()
            .enumerate()
            .max_by_key(|(index, slab)| (slab.free_bytes(), *index))
            .map_or(0, |(index, _)| index)
    }

    fn requeue(&self, index: usize, popped: bool) {
        if popped {
            let free = self.pool.slabs()[index].free_bytes();
            self.queue.lock().insert(index, free);
        }
    }
}

impl AllocationPolicy for MostFreeSpaceAllocationPolicy {
    fn allocate_with(
        &self,
        _ctx: &AllocationContext,
        allocate: &mut AllocateFn<'_>,
    ) -> Result<Address> {
        if self.pool.is_empty() {
            return Err(Error::Allocation("pool has no shards".into()));
        }

        let (index, popped) = self.select();
        let result = allocate(index, self.pool.slabs()[index].as_ref());
        self.requeue(index, popped);
        result
    }

    fn try_allocate_with(
        &self,
        _ctx: &AllocationContext,
        allocate: &mut TryAllocateFn<'_>,
    ) -> Allocation {
        if self.pool.is_empty() {
            return Allocation::empty();
        }

        let (index, popped) = self.select();
        let allocation = allocate(index, self.pool.slabs()[index].as_ref());
        self.requeue(index, popped);
        allocation
    }

    fn update_slab(&self, index: usize) {
        let _guard = self.merge_lock.read();
        self.pending.insert(index);
    }
}

/// Tries `first`, falling back to `second` when it cannot allocate
///
/// Both policies hear about every shard either of them allocated from.
#[derive(Debug)]
pub struct DualAllocationPolicy {
    first: Arc<dyn AllocationPolicy>,
    second: Arc<dyn AllocationPolicy>,
}

impl DualAllocationPolicy {
    pub fn new(first: Arc<dyn AllocationPolicy>, second: Arc<dyn AllocationPolicy>) -> Self {
        Self { first, second }
    }

    fn allocate_on(
        &self,
        policy: &dyn AllocationPolicy,
        ctx: &AllocationContext,
        allocate: &mut AllocateFn<'_>,
    ) -> Result<Address> {
        policy.allocate_with(ctx, &mut |index, slab| {
            let result = allocate(index, slab);
            self.update_slab(index);
            result
        })
    }

    fn try_allocate_on(
        &self,
        policy: &dyn AllocationPolicy,
        ctx: &AllocationContext,
        allocate: &mut TryAllocateFn<'_>,
    ) -> Allocation {
        policy.try_allocate_with(ctx, &mut |index, slab| {
            let allocation = allocate(index, slab);
            self.update_slab(index);
            allocation
        })
    }
}

impl AllocationPolicy for DualAllocationPolicy {
    fn allocate_with(
        &self,
        ctx: &AllocationContext,
        allocate: &mut AllocateFn<'_>,
    ) -> Result<Address> {
        match self.allocate_on(self.first.as_ref(), ctx, allocate) {
            Ok(address) if !address.is_none() => return Ok(address),
            Ok(_) => debug!(ctx = ctx.id(), "First policy returned no address, falling back"),
            Err(e) if e.is_allocation_failure() => {
                debug!(ctx = ctx.id(), error = %e, "First policy failed, falling back")
            }
            Err(e) => return Err(e),
        }

        self.allocate_on(self.second.as_ref(), ctx, allocate)
    }

    fn try_allocate_with(
        &self,
        ctx: &AllocationContext,
        allocate: &mut TryAllocateFn<'_>,
    ) -> Allocation {
        let allocation = self.try_allocate_on(self.first.as_ref(), ctx, allocate);
        if !allocation.is_empty() {
            return allocation;
        }

        debug!(ctx = ctx.id(), "First policy allocated nothing, falling back");
        self.try_allocate_on(self.second.as_ref(), ctx, allocate)
    }

    fn update_slab(&self, index: usize) {
        self.first.update_slab(index);
        self.second.update_slab(index);
    }
}
