//! Point-in-time slab usage snapshots

use super::Address;
use serde::Serialize;

/// Usage of one shard of a sharded slab
#[derive(Debug, Clone, Serialize)]
pub struct ShardStats {
    pub index: usize,
    pub base_address: Address,
    pub size: u64,
    pub used: u64,
    pub free: u64,
}

/// Slab statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct SlabStats {
    pub size: u64,
    pub used: u64,
    pub free: u64,
    pub shards: Vec<ShardStats>,
}

impl SlabStats {
    /// Fraction of the slab in use, 0.0 for an empty slab
    pub fn utilization(&self) -> f64 {
        if self.size == 0 {
            0.0
        } else {
            self.used as f64 / self.size as f64
        }
    }
}

/// Free list shape of a managed slab
#[derive(Debug, Clone, Default, Serialize)]
pub struct ManagedSlabStats {
    pub size: u64,
    pub used: u64,
    pub free: u64,
    pub free_ranges: usize,
    pub largest_free_range: u64,
}
