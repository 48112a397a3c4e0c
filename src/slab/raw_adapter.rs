//! Bump allocation over a whole raw slab

use super::size::validate_size;
use super::{add_with_max, add_within_max, Address, Allocation, RawSlab, Slab};
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Presents a [`RawSlab`] as a [`Slab`]
///
/// Allocation bumps a pointer from the start of the region and `free` is a
/// no-op, so space only comes back with `free_slab`. Growth follows the
/// raw slab.
#[derive(Debug)]
pub struct RawSlabAdapter<R: RawSlab + ?Sized = dyn RawSlab> {
    raw: Arc<R>,
    offset: AtomicU64,
}

impl<R: RawSlab + ?Sized> RawSlabAdapter<R> {
    pub fn new(raw: Arc<R>) -> Self {
        Self {
            raw,
            offset: AtomicU64::new(0),
        }
    }

    fn capacity(&self) -> u64 {
        self.raw.size().unwrap_or(0)
    }
}

impl<R: RawSlab + ?Sized> RawSlab for RawSlabAdapter<R> {
    fn base_address(&self) -> Result<Address> {
        self.raw.base_address()
    }

    fn get_byte(&self, address: Address) -> Result<u8> {
        self.raw.get_byte(address)
    }

    fn put_byte(&self, address: Address, value: u8) -> Result<()> {
        self.raw.put_byte(address, value)
    }

    fn get(&self, address: Address, buf: &mut [u8]) -> Result<()> {
        self.raw.get(address, buf)
    }

    fn put(&self, address: Address, bytes: &[u8]) -> Result<()> {
        self.raw.put(address, bytes)
    }

    fn size(&self) -> Result<u64> {
        self.raw.size()
    }

    fn expand(&self, size_bytes: u64) -> Result<u64> {
        self.raw.expand(size_bytes)
    }

    fn free_slab(&self) -> Result<()> {
        self.raw.free_slab()
    }
}

impl<R: RawSlab + ?Sized> Slab for RawSlabAdapter<R> {
    fn allocate(&self, size_bytes: u64) -> Result<Address> {
        validate_size(size_bytes)?;
        let base = self.raw.base_address()?;
        let capacity = self.raw.size()?;
        add_within_max(&self.offset, size_bytes, capacity)
            .map(|previous| base.offset(previous))
            .ok_or_else(|| {
                Error::Allocation(format!(
                    "{} bytes requested, {} free in raw slab",
                    size_bytes,
                    capacity.saturating_sub(self.offset.load(Ordering::Acquire))
                ))
            })
    }

    fn try_allocate(&self, size_bytes: u64) -> Allocation {
        let base = match self.raw.base_address() {
            Ok(base) => base,
            Err(_) => return Allocation::empty(),
        };
        if size_bytes == 0 || validate_size(size_bytes).is_err() {
            return Allocation::empty();
        }

        let result = add_with_max(&self.offset, size_bytes, self.capacity());
        if result.actual_delta == 0 {
            Allocation::empty()
        } else {
            Allocation::new(base.offset(result.previous_value), result.actual_delta)
        }
    }

    fn free(&self, _address: Address, _size_bytes: u64) -> Result<()> {
        Ok(())
    }

    fn used(&self) -> u64 {
        self.offset.load(Ordering::Acquire).min(self.capacity())
    }

    fn free_bytes(&self) -> u64 {
        self.capacity()
            .saturating_sub(self.offset.load(Ordering::Acquire))
    }
}
