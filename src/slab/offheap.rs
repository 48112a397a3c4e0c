//! Off-heap memory regions
//!
//! `OffHeapSlab` is the only place that talks to the system allocator. It
//! reserves `reserve_bytes` up front and exposes the first `size` bytes;
//! `expand` moves the logical end inside the reservation so the base address
//! never changes while anything still points into the region.

use super::{Address, RawSlab};
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::alloc::{self, Layout};
use std::ptr::NonNull;
use tracing::{debug, info};

const ALIGNMENT: usize = 8;

struct Region {
    ptr: NonNull<u8>,
    layout: Layout,
    size: u64,
    valid: bool,
}

// SAFETY: Region owns its allocation exclusively; all access goes through
// the RwLock in OffHeapSlab.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    fn base(&self) -> Address {
        Address::from_ptr(self.ptr.as_ptr())
    }

    fn reserved(&self) -> u64 {
        self.layout.size() as u64
    }

    /// Offset of `[address, address + len)` inside the region
    fn check_range(&self, address: Address, len: usize) -> Result<usize> {
        if !self.valid {
            return Err(Error::InvalidState(format!(
                "slab at {} has been freed",
                self.base()
            )));
        }

        let offset = address.distance_from(self.base()).ok_or_else(|| {
            Error::Validation(format!("address {} below slab base {}", address, self.base()))
        })?;

        match offset.checked_add(len as u64) {
            Some(end) if end <= self.size => Ok(offset as usize),
            _ => Err(Error::Validation(format!(
                "access of {} bytes at {} outside slab [{}, +{})",
                len,
                address,
                self.base(),
                self.size
            ))),
        }
    }

    fn check_valid(&self) -> Result<()> {
        if self.valid {
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "slab at {} has been freed",
                self.base()
            )))
        }
    }

    fn release(&mut self) {
        if self.valid {
            // SAFETY: ptr was returned by alloc_zeroed with this layout and is
            // released at most once, guarded by `valid`.
            unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
            self.valid = false;
        }
    }
}

/// Raw memory region obtained from the system allocator
pub struct OffHeapSlab {
    region: RwLock<Region>,
}

impl OffHeapSlab {
    /// Allocate a zeroed region of `size_bytes`
    pub fn new(size_bytes: u64) -> Result<Self> {
        Self::with_reserve(size_bytes, size_bytes)
    }

    /// Allocate a zeroed region of `size_bytes` that can later grow in place
    /// up to `reserve_bytes`
    pub fn with_reserve(size_bytes: u64, reserve_bytes: u64) -> Result<Self> {
        if size_bytes == 0 {
            return Err(Error::Validation("slab size must be positive".into()));
        }
        if reserve_bytes < size_bytes {
            return Err(Error::Validation(format!(
                "reserve {} smaller than size {}",
                reserve_bytes, size_bytes
            )));
        }

        let reserve = usize::try_from(reserve_bytes)
            .map_err(|_| Error::Validation(format!("reserve {} too large", reserve_bytes)))?;
        let layout = Layout::from_size_align(reserve, ALIGNMENT)
            .map_err(|e| Error::Validation(format!("invalid slab layout: {}", e)))?;

        // SAFETY: layout has non-zero size (size_bytes > 0 and reserve >= size).
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            Error::Allocation(format!("system allocator refused {} bytes", reserve_bytes))
        })?;

        info!(
            base = %Address::from_ptr(ptr.as_ptr()),
            size = size_bytes,
            reserve = reserve_bytes,
            "Allocated off-heap slab"
        );

        Ok(Self {
            region: RwLock::new(Region {
                ptr,
                layout,
                size: size_bytes,
                valid: true,
            }),
        })
    }

    /// Bytes reserved for in-place growth
    pub fn reserve_bytes(&self) -> u64 {
        self.region.read().reserved()
    }

    pub fn is_valid(&self) -> bool {
        self.region.read().valid
    }
}

impl RawSlab for OffHeapSlab {
    fn base_address(&self) -> Result<Address> {
        let region = self.region.read();
        region.check_valid()?;
        Ok(region.base())
    }

    fn get_byte(&self, address: Address) -> Result<u8> {
        let region = self.region.read();
        let offset = region.check_range(address, 1)?;
        // SAFETY: offset is inside the live region.
        Ok(unsafe { region.ptr.as_ptr().add(offset).read() })
    }

    fn put_byte(&self, address: Address, value: u8) -> Result<()> {
        let region = self.region.read();
        let offset = region.check_range(address, 1)?;
        // SAFETY: offset is inside the live region.
        unsafe { region.ptr.as_ptr().add(offset).write(value) };
        Ok(())
    }

    fn get(&self, address: Address, buf: &mut [u8]) -> Result<()> {
        let region = self.region.read();
        let offset = region.check_range(address, buf.len())?;
        // SAFETY: [offset, offset + buf.len()) is inside the live region and
        // cannot overlap a Rust-owned buffer.
        unsafe {
            std::ptr::copy_nonoverlapping(
                region.ptr.as_ptr().add(offset),
                buf.as_mut_ptr(),
                buf.len(),
            )
        };
        Ok(())
    }

    fn put(&self, address: Address, bytes: &[u8]) -> Result<()> {
        let region = self.region.read();
        let offset = region.check_range(address, bytes.len())?;
        // SAFETY: [offset, offset + bytes.len()) is inside the live region.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                region.ptr.as_ptr().add(offset),
                bytes.len(),
            )
        };
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        let region = self.region.read();
        region.check_valid()?;
        Ok(region.size)
    }

    fn expand(&self, size_bytes: u64) -> Result<u64> {
        let mut region = self.region.write();
        region.check_valid()?;

        if size_bytes <= region.size {
            return Err(Error::Validation(format!(
                "cannot expand slab of {} bytes to {}",
                region.size, size_bytes
            )));
        }

        let achieved = size_bytes.min(region.reserved());
        debug!(
            base = %region.base(),
            from = region.size,
            to = achieved,
            requested = size_bytes,
            "Expanded off-heap slab"
        );
        region.size = achieved;
        Ok(achieved)
    }

    fn free_slab(&self) -> Result<()> {
        let mut region = self.region.write();
        region.check_valid()?;
        debug!(base = %region.base(), size = region.size, "Freeing off-heap slab");
        region.release();
        Ok(())
    }
}

impl Drop for OffHeapSlab {
    fn drop(&mut self) {
        self.region.get_mut().release();
    }
}

impl std::fmt::Debug for OffHeapSlab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let region = self.region.read();
        f.debug_struct("OffHeapSlab")
            .field("base", &region.base())
            .field("size", &region.size)
            .field("reserved", &region.reserved())
            .field("valid", &region.valid)
            .finish()
    }
}
