//! Doubly-linked LRU list entries in slab memory

use crate::error::Result;
use crate::slab::{Address, Slab};

const PREVIOUS_OFFSET: u64 = 0;
const NEXT_OFFSET: u64 = 8;
const DATA_OFFSET: u64 = 16;

/// Bytes of one entry: `[previous][next][data]`
pub const CACHE_ENTRY_BYTES: u64 = 24;

#[derive(Debug, Clone, Copy)]
pub struct OffHeapCacheEntry<'a> {
    slab: &'a dyn Slab,
    address: Address,
}

impl<'a> OffHeapCacheEntry<'a> {
    /// Allocate an unlinked entry pointing at `data`
    pub fn create(slab: &'a dyn Slab, data: Address) -> Result<Self> {
        let address = slab.allocate(CACHE_ENTRY_BYTES)?;
        let entry = Self { slab, address };
        entry.set_previous(Address::NONE)?;
        entry.set_next(Address::NONE)?;
        slab.put_address(address.offset(DATA_OFFSET), data)?;
        Ok(entry)
    }

    pub fn wrap(slab: &'a dyn Slab, address: Address) -> Self {
        Self { slab, address }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn previous(&self) -> Result<Address> {
        self.slab.get_address(self.address.offset(PREVIOUS_OFFSET))
    }

    pub fn set_previous(&self, previous: Address) -> Result<()> {
        self.slab
            .put_address(self.address.offset(PREVIOUS_OFFSET), previous)
    }

    pub fn next(&self) -> Result<Address> {
        self.slab.get_address(self.address.offset(NEXT_OFFSET))
    }

    pub fn set_next(&self, next: Address) -> Result<()> {
        self.slab.put_address(self.address.offset(NEXT_OFFSET), next)
    }

    /// Address of the cached item this entry tracks
    pub fn data(&self) -> Result<Address> {
        self.slab.get_address(self.address.offset(DATA_OFFSET))
    }

    pub fn free(self) -> Result<()> {
        self.slab.free(self.address, CACHE_ENTRY_BYTES)
    }
}
