//! Pools of shards with address-based lookup

use super::{Address, Slab, SlabFactory};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info};

/// An indexed collection of slabs covering disjoint address ranges
pub trait SlabPool: Send + Sync + fmt::Debug {
    /// Shard whose `[base, base + size)` contains `address`
    fn index_by_address(&self, address: Address) -> Result<usize>;

    fn slab_by_index(&self, index: usize) -> Result<&Arc<dyn Slab>>;

    fn slabs(&self) -> &[Arc<dyn Slab>];

    fn free_slab_pool(&self) -> Result<()>;

    fn slab_by_address(&self, address: Address) -> Result<&Arc<dyn Slab>> {
        self.slab_by_index(self.index_by_address(address)?)
    }

    fn len(&self) -> usize {
        self.slabs().len()
    }

    fn is_empty(&self) -> bool {
        self.slabs().is_empty()
    }
}

/// Fixed set of shards, looked up by base address in `O(log n)`
pub struct ShardedSlabPool {
    slabs: Vec<Arc<dyn Slab>>,
    by_base: BTreeMap<Address, usize>,
}

impl ShardedSlabPool {
    /// Create `num_shards` slabs of `shard_size` bytes each
    pub fn create(factory: &dyn SlabFactory, num_shards: usize, shard_size: u64) -> Result<Self> {
        if num_shards == 0 {
            return Err(Error::Validation("pool needs at least one shard".into()));
        }

        let slabs = (0..num_shards)
            .map(|_| factory.create(shard_size))
            .collect::<Result<Vec<_>>>()?;
        let pool = Self::from_slabs(slabs)?;

        info!(
            shards = num_shards,
            shard_size,
            "Initialized sharded slab pool"
        );
        Ok(pool)
    }

    /// Build a pool over existing slabs; their ranges must not overlap
    pub fn from_slabs(slabs: Vec<Arc<dyn Slab>>) -> Result<Self> {
        if slabs.is_empty() {
            return Err(Error::Validation("pool needs at least one shard".into()));
        }

        let mut by_base = BTreeMap::new();
        for (index, slab) in slabs.iter().enumerate() {
            by_base.insert(slab.base_address()?, index);
        }
        if by_base.len() != slabs.len() {
            return Err(Error::Validation("shards share a base address".into()));
        }

        let mut previous_end = 0u64;
        for (base, &index) in &by_base {
            if base.get() < previous_end {
                return Err(Error::Validation(format!(
                    "shard {} at {} overlaps its predecessor",
                    index, base
                )));
            }
            previous_end = base.get() + slabs[index].size()?;
        }

        Ok(Self { slabs, by_base })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Slab>> {
        self.slabs.iter()
    }
}

impl SlabPool for ShardedSlabPool {
    fn index_by_address(&self, address: Address) -> Result<usize> {
        let (base, &index) = self
            .by_base
            .range(..=address)
            .next_back()
            .ok_or_else(|| Error::Validation(format!("no shard owns address {}", address)))?;

        let size = self.slabs[index].size()?;
        match address.distance_from(*base) {
            Some(offset) if offset < size => Ok(index),
            _ => Err(Error::Validation(format!(
                "no shard owns address {}",
                address
            ))),
        }
    }

    fn slab_by_index(&self, index: usize) -> Result<&Arc<dyn Slab>> {
        self.slabs.get(index).ok_or_else(|| {
            Error::Validation(format!(
                "shard index {} out of range (pool has {})",
                index,
                self.slabs.len()
            ))
        })
    }

    fn slabs(&self) -> &[Arc<dyn Slab>] {
        &self.slabs
    }

    /// Free every shard; failures are logged and the first one returned
    fn free_slab_pool(&self) -> Result<()> {
        let mut first_error = None;
        for (index, slab) in self.slabs.iter().enumerate() {
            if let Err(e) = slab.free_slab() {
                error!(shard = index, error = %e, "Failed to free shard");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl fmt::Debug for ShardedSlabPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardedSlabPool")
            .field("shards", &self.slabs.len())
            .field("bases", &self.by_base.keys().collect::<Vec<_>>())
            .finish()
    }
}
