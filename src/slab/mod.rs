//! Slab Allocators
//!
//! Raw memory regions outside the managed heap, and the allocators layered
//! on them. Everything is addressed by absolute [`Address`] values; nothing
//! here hands out Rust references into slab memory.
//!
//! # Architecture
//!
//! ```text
//! ThreadLocalSlab (per-context bump windows)
//!   └─→ ShardedSlab (AllocationPolicy picks a shard)
//!        └─→ ShardedSlabPool (address → shard lookup)
//!             ├─→ ManagedSlab(16MB) → FreeList: [0..4096), [8192..16MB)
//!             ├─→ ManagedSlab(16MB) → FreeList: [0..16MB)
//!             └─→ ManagedSlab(16MB) → FreeList: []
//!                  └─→ OffHeapSlab (std::alloc region)
//! ```
//!
//! `RawSlab` is byte access plus growth; `Slab` adds allocation. Views
//! (`ThreadLocalSlab`, `ShardedSlab`, `SynchronizedSlab`) delegate to an
//! underlying slab while changing placement or locking.

pub mod address;
pub mod allocate_only;
pub mod allocation;
pub mod context;
pub mod digest;
pub mod factory;
pub mod free_list;
pub mod managed;
pub mod offheap;
pub mod policy;
pub mod pool;
pub mod raw_adapter;
pub mod sharded;
pub mod size;
pub mod stats;
pub mod synchronized;
pub mod thread_local;

pub use address::Address;
pub use allocate_only::AllocateOnlySlab;
pub use allocation::{add_with_max, add_within_max, AddWithMaxResult, Allocation};
pub use context::AllocationContext;
pub use digest::{default_digest, DefaultDigest};
pub use factory::{
    ManagedSlabFactory, SlabFactory, SynchronizedSlabFactory, ThreadLocalSlabFactory,
};
pub use free_list::{FreeList, FreeRange, RangeExtractor};
pub use managed::ManagedSlab;
pub use offheap::OffHeapSlab;
pub use policy::{
    AllocationPolicy, DualAllocationPolicy, MostFreeSpaceAllocationPolicy, PolicyKind,
    ThreadLocalAllocationPolicy,
};
pub use pool::{ShardedSlabPool, SlabPool};
pub use raw_adapter::RawSlabAdapter;
pub use sharded::ShardedSlab;
pub use size::{parse_size, validate_size, MAX_SIZE_BYTES};
pub use stats::{ManagedSlabStats, ShardStats, SlabStats};
pub use synchronized::SynchronizedSlab;
pub use thread_local::ThreadLocalSlab;

use crate::error::Result;
use std::fmt;
use std::sync::Arc;

/// A contiguous region of raw memory with byte-level access
///
/// Every operation on a slab whose memory has been released with
/// [`RawSlab::free_slab`] fails with `Error::InvalidState`.
pub trait RawSlab: Send + Sync + fmt::Debug {
    /// Address of the first byte of the region
    fn base_address(&self) -> Result<Address>;

    fn get_byte(&self, address: Address) -> Result<u8>;

    fn put_byte(&self, address: Address, value: u8) -> Result<()>;

    /// Copy `buf.len()` bytes starting at `address` into `buf`
    fn get(&self, address: Address, buf: &mut [u8]) -> Result<()>;

    /// Copy `bytes` into the region starting at `address`
    fn put(&self, address: Address, bytes: &[u8]) -> Result<()>;

    /// Size of the region in bytes
    fn size(&self) -> Result<u64>;

    /// Grow the region to `size_bytes`, returning the size actually reached
    fn expand(&self, size_bytes: u64) -> Result<u64>;

    /// Release the whole region; the slab is invalid afterwards
    fn free_slab(&self) -> Result<()>;

    fn get_u32(&self, address: Address) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.get(address, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn put_u32(&self, address: Address, value: u32) -> Result<()> {
        self.put(address, &value.to_le_bytes())
    }

    fn get_u64(&self, address: Address) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.get(address, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn put_u64(&self, address: Address, value: u64) -> Result<()> {
        self.put(address, &value.to_le_bytes())
    }

    /// Read a pointer stored in slab memory
    fn get_address(&self, address: Address) -> Result<Address> {
        self.get_u64(address).map(Address::new)
    }

    fn put_address(&self, address: Address, value: Address) -> Result<()> {
        self.put_u64(address, value.get())
    }

    fn read_vec(&self, address: Address, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.get(address, &mut buf)?;
        Ok(buf)
    }
}

/// A raw slab that also hands out byte ranges
pub trait Slab: RawSlab {
    /// Reserve exactly `size_bytes`, failing with `Error::Allocation` when
    /// the request cannot be met
    fn allocate(&self, size_bytes: u64) -> Result<Address>;

    /// Reserve up to `size_bytes`; never fails, an empty allocation means
    /// nothing was reserved
    fn try_allocate(&self, size_bytes: u64) -> Allocation;

    /// Return a previously allocated range
    fn free(&self, address: Address, size_bytes: u64) -> Result<()>;

    fn used(&self) -> u64;

    fn free_bytes(&self) -> u64;
}

macro_rules! forward_slab {
    ($wrapper:ident) => {
        impl<S: RawSlab + ?Sized> RawSlab for $wrapper<S> {
            fn base_address(&self) -> Result<Address> {
                (**self).base_address()
            }

            fn get_byte(&self, address: Address) -> Result<u8> {
                (**self).get_byte(address)
            }

            fn put_byte(&self, address: Address, value: u8) -> Result<()> {
                (**self).put_byte(address, value)
            }

            fn get(&self, address: Address, buf: &mut [u8]) -> Result<()> {
                (**self).get(address, buf)
            }

            fn put(&self, address: Address, bytes: &[u8]) -> Result<()> {
                (**self).put(address, bytes)
            }

            fn size(&self) -> Result<u64> {
                (**self).size()
            }

            fn expand(&self, size_bytes: u64) -> Result<u64> {
                (**self).expand(size_bytes)
            }

            fn free_slab(&self) -> Result<()> {
                (**self).free_slab()
            }
        }

        impl<S: Slab + ?Sized> Slab for $wrapper<S> {
            fn allocate(&self, size_bytes: u64) -> Result<Address> {
                (**self).allocate(size_bytes)
            }

            fn try_allocate(&self, size_bytes: u64) -> Allocation {
                (**self).try_allocate(size_bytes)
            }

            fn free(&self, address: Address, size_bytes: u64) -> Result<()> {
                (**self).free(address, size_bytes)
            }

            fn used(&self) -> u64 {
                (**self).used()
            }

            fn free_bytes(&self) -> u64 {
                (**self).free_bytes()
            }
        }
    };
}

forward_slab!(Arc);
forward_slab!(Box);

/// Create a free-list managed slab over a fresh off-heap region
pub fn new_managed_slab(size_bytes: u64) -> Result<ManagedSlab> {
    let raw: Arc<dyn RawSlab> = Arc::new(OffHeapSlab::new(size_bytes)?);
    ManagedSlab::from_raw_slab(raw)
}

/// Create a bare off-heap region
pub fn new_raw_slab(size_bytes: u64) -> Result<OffHeapSlab> {
    OffHeapSlab::new(size_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwarding_through_arc() -> Result<()> {
        let slab: Arc<dyn Slab> = Arc::new(new_managed_slab(4096)?);
        let wrapped = Arc::new(slab.clone());

        let address = wrapped.allocate(64)?;
        wrapped.put_u64(address, 0xdead_beef)?;
        assert_eq!(slab.get_u64(address)?, 0xdead_beef);
        assert_eq!(wrapped.used(), 64);

        wrapped.free(address, 64)?;
        assert_eq!(slab.used(), 0);

        slab.free_slab()?;
        Ok(())
    }

    #[test]
    fn test_typed_accessors() -> Result<()> {
        let slab = new_managed_slab(1024)?;
        let address = slab.allocate(32)?;

        slab.put_u32(address, u32::MAX)?;
        slab.put_address(address.offset(8), address)?;
        slab.put(address.offset(16), b"abcd")?;

        assert_eq!(slab.get_u32(address)?, u32::MAX);
        assert_eq!(slab.get_address(address.offset(8))?, address);
        assert_eq!(slab.read_vec(address.offset(16), 4)?, b"abcd".to_vec());

        slab.free_slab()?;
        Ok(())
    }
}
