//! Sharded slab
//!
//! Spreads allocations over the shards of a [`ShardedSlabPool`] through an
//! [`AllocationPolicy`]. Frees and byte access are routed back to the owning
//! shard by address.

use super::policy::{AllocationPolicy, PolicyKind};
use super::pool::{ShardedSlabPool, SlabPool};
use super::stats::{ShardStats, SlabStats};
use super::{Address, Allocation, AllocationContext, RawSlab, Slab};
use crate::error::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info};

/// A slab made of several independently locked shards
#[derive(Debug)]
pub struct ShardedSlab {
    pool: Arc<ShardedSlabPool>,
    policy: Arc<dyn AllocationPolicy>,
}

impl ShardedSlab {
    pub fn new(pool: Arc<ShardedSlabPool>, kind: PolicyKind) -> Self {
        let policy = kind.build(pool.clone());
        info!(shards = pool.len(), policy = ?kind, "Initialized sharded slab");
        Self { pool, policy }
    }

    pub fn with_policy(pool: Arc<ShardedSlabPool>, policy: Arc<dyn AllocationPolicy>) -> Self {
        Self { pool, policy }
    }

    pub fn pool(&self) -> &Arc<ShardedSlabPool> {
        &self.pool
    }

    pub fn allocate_in(&self, ctx: &AllocationContext, size_bytes: u64) -> Result<Address> {
        self.policy
            .allocate_with(ctx, &mut |_, slab| slab.allocate(size_bytes))
    }

    pub fn try_allocate_in(&self, ctx: &AllocationContext, size_bytes: u64) -> Allocation {
        self.policy
            .try_allocate_with(ctx, &mut |_, slab| slab.try_allocate(size_bytes))
    }

    /// Per-shard usage snapshot
    pub fn stats(&self) -> Result<SlabStats> {
        let mut stats = SlabStats::default();
        for (index, slab) in self.pool.iter().enumerate() {
            let shard = ShardStats {
                index,
                base_address: slab.base_address()?,
                size: slab.size()?,
                used: slab.used(),
                free: slab.free_bytes(),
            };
            stats.size += shard.size;
            stats.used += shard.used;
            stats.free += shard.free;
            stats.shards.push(shard);
        }
        Ok(stats)
    }

    fn shard_for(&self, address: Address) -> Result<&Arc<dyn Slab>> {
        self.pool.slab_by_address(address)
    }
}

impl RawSlab for ShardedSlab {
    fn base_address(&self) -> Result<Address> {
        Err(Error::Unsupported(
            "a sharded slab has no single base address".into(),
        ))
    }

    fn get_byte(&self, address: Address) -> Result<u8> {
        self.shard_for(address)?.get_byte(address)
    }

    fn put_byte(&self, address: Address, value: u8) -> Result<()> {
        self.shard_for(address)?.put_byte(address, value)
    }

    fn get(&self, address: Address, buf: &mut [u8]) -> Result<()> {
        self.shard_for(address)?.get(address, buf)
    }

    fn put(&self, address: Address, bytes: &[u8]) -> Result<()> {
        self.shard_for(address)?.put(address, bytes)
    }

    fn size(&self) -> Result<u64> {
        self.pool.iter().map(|slab| slab.size()).sum()
    }

    /// Grow every shard to `size_bytes / shards`
    fn expand(&self, size_bytes: u64) -> Result<u64> {
        let shards = self.pool.len() as u64;
        if shards == 0 {
            return Err(Error::Validation("cannot expand a slab with no shards".into()));
        }
        let per_shard = size_bytes / shards;
        let mut achieved = 0;
        for slab in self.pool.iter() {
            achieved += slab.expand(per_shard)?;
        }
        debug!(requested = size_bytes, achieved, "Expanded sharded slab");
        Ok(achieved)
    }

    fn free_slab(&self) -> Result<()> {
        self.pool.free_slab_pool()
    }
}

impl Slab for ShardedSlab {
    fn allocate(&self, size_bytes: u64) -> Result<Address> {
        self.allocate_in(&AllocationContext::current(), size_bytes)
    }

    fn try_allocate(&self, size_bytes: u64) -> Allocation {
        self.try_allocate_in(&AllocationContext::current(), size_bytes)
    }

    fn free(&self, address: Address, size_bytes: u64) -> Result<()> {
        let index = self.pool.index_by_address(address)?;
        self.pool.slabs()[index].free(address, size_bytes)?;
        self.policy.update_slab(index);
        Ok(())
    }

    fn used(&self) -> u64 {
        self.pool.iter().map(|slab| slab.used()).sum()
    }

    fn free_bytes(&self) -> u64 {
        self.pool.iter().map(|slab| slab.free_bytes()).sum()
    }
}
