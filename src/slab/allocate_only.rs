//! Bump allocation over a window of a larger slab

use super::size::validate_size;
use super::{add_with_max, add_within_max, Address, Allocation, RawSlab, Slab};
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Lock-free bump allocator over `[base, base + capacity)` of `slab`
///
/// Nothing is ever given back individually; the window is dropped as a
/// whole. Thread-local buffers are built from these.
#[derive(Debug)]
pub struct AllocateOnlySlab<R: RawSlab + ?Sized = dyn RawSlab> {
    slab: Arc<R>,
    base: Address,
    capacity: u64,
    offset: AtomicU64,
}

impl<R: RawSlab + ?Sized> AllocateOnlySlab<R> {
    /// Bump allocate inside `[base, base + capacity)` of `slab`
    pub fn new(slab: Arc<R>, base: Address, capacity: u64) -> Self {
        Self {
            slab,
            base,
            capacity,
            offset: AtomicU64::new(0),
        }
    }

    /// Bump allocate over the whole of `slab`
    pub fn from_raw_slab(slab: Arc<R>) -> Result<Self> {
        let base = slab.base_address()?;
        let capacity = validate_size(slab.size()?)? as u64;
        Ok(Self::new(slab, base, capacity))
    }

    pub fn base(&self) -> Address {
        self.base
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// The part of the window nothing has been carved from yet
    pub fn unused_tail(&self) -> Option<Allocation> {
        let used = self.used();
        let free = self.capacity - used;
        (free > 0).then(|| Allocation::new(self.base.offset(used), free))
    }

    fn check_window(&self, address: Address, len: usize) -> Result<()> {
        let inside = address
            .distance_from(self.base)
            .and_then(|offset| offset.checked_add(len as u64))
            .is_some_and(|end| end <= self.capacity);
        if inside {
            Ok(())
        } else {
            Err(Error::Validation(format!(
                "access of {} bytes at {} outside window [{}, +{})",
                len, address, self.base, self.capacity
            )))
        }
    }
}

impl<R: RawSlab + ?Sized> RawSlab for AllocateOnlySlab<R> {
    fn base_address(&self) -> Result<Address> {
        Ok(self.base)
    }

    fn get_byte(&self, address: Address) -> Result<u8> {
        self.check_window(address, 1)?;
        self.slab.get_byte(address)
    }

    fn put_byte(&self, address: Address, value: u8) -> Result<()> {
        self.check_window(address, 1)?;
        self.slab.put_byte(address, value)
    }

    fn get(&self, address: Address, buf: &mut [u8]) -> Result<()> {
        self.check_window(address, buf.len())?;
        self.slab.get(address, buf)
    }

    fn put(&self, address: Address, bytes: &[u8]) -> Result<()> {
        self.check_window(address, bytes.len())?;
        self.slab.put(address, bytes)
    }

    fn size(&self) -> Result<u64> {
        Ok(self.capacity)
    }

    fn expand(&self, _size_bytes: u64) -> Result<u64> {
        Err(Error::Unsupported(
            "allocate-only slabs cannot expand".into(),
        ))
    }

    fn free_slab(&self) -> Result<()> {
        Err(Error::Unsupported(
            "allocate-only slabs are released with their parent".into(),
        ))
    }
}

impl<R: RawSlab + ?Sized> Slab for AllocateOnlySlab<R> {
    fn allocate(&self, size_bytes: u64) -> Result<Address> {
        validate_size(size_bytes)?;
        add_within_max(&self.offset, size_bytes, self.capacity)
            .map(|previous| self.base.offset(previous))
            .ok_or_else(|| {
                Error::Allocation(format!(
                    "{} bytes requested, {} free in window",
                    size_bytes,
                    self.free_bytes()
                ))
            })
    }

    fn try_allocate(&self, size_bytes: u64) -> Allocation {
        if size_bytes == 0 || validate_size(size_bytes).is_err() {
            return Allocation::empty();
        }

        let result = add_with_max(&self.offset, size_bytes, self.capacity);
        if result.actual_delta == 0 {
            Allocation::empty()
        } else {
            Allocation::new(self.base.offset(result.previous_value), result.actual_delta)
        }
    }

    fn free(&self, _address: Address, _size_bytes: u64) -> Result<()> {
        Err(Error::Unsupported(
            "allocate-only slabs do not free individual ranges".into(),
        ))
    }

    fn used(&self) -> u64 {
        self.offset.load(Ordering::Acquire).min(self.capacity)
    }

    fn free_bytes(&self) -> u64 {
        self.capacity
            .saturating_sub(self.offset.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slab::OffHeapSlab;
    use std::thread;

    #[test]
    fn test_bump_allocation() -> Result<()> {
        let raw = Arc::new(OffHeapSlab::new(1024)?);
        let slab = AllocateOnlySlab::from_raw_slab(raw.clone())?;
        let base = raw.base_address()?;

        assert_eq!(slab.allocate(100)?, base);
        assert_eq!(slab.allocate(100)?, base.offset(100));
        assert_eq!(slab.used(), 200);
        assert_eq!(slab.free_bytes(), 824);

        // All-or-nothing gives everything back
        assert!(matches!(slab.allocate(1000), Err(Error::Allocation(_))));
        assert_eq!(slab.used(), 200);

        let partial = slab.try_allocate(1000);
        assert_eq!(partial, Allocation::new(base.offset(200), 824));
        assert!(slab.try_allocate(1).is_empty());
        Ok(())
    }

    #[test]
    fn test_window_bounds() -> Result<()> {
        let raw = Arc::new(OffHeapSlab::new(1024)?);
        let base = raw.base_address()?;
        let window = AllocateOnlySlab::new(raw, base.offset(512), 256);

        let address = window.allocate(16)?;
        assert_eq!(address, base.offset(512));
        window.put_u64(address, 7)?;
        assert_eq!(window.get_u64(address)?, 7);

        assert!(window.get_byte(base).is_err());
        assert!(window.get_byte(base.offset(768)).is_err());
        assert_eq!(
            window.unused_tail(),
            Some(Allocation::new(base.offset(528), 240))
        );
        Ok(())
    }

    #[test]
    fn test_concurrent_allocations_disjoint() -> Result<()> {
        let raw = Arc::new(OffHeapSlab::new(64 * 1024)?);
        let slab = AllocateOnlySlab::from_raw_slab(raw)?;

        let mut grants: Vec<Allocation> = thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| s.spawn(|| (0..1000).map(|_| slab.try_allocate(24)).collect::<Vec<_>>()))
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .filter(|a| !a.is_empty())
                .collect()
        });

        grants.sort_by_key(|a| a.address);
        for pair in grants.windows(2) {
            assert!(pair[0].address.get() + pair[0].size <= pair[1].address.get());
        }
        let granted: u64 = grants.iter().map(|a| a.size).sum();
        assert_eq!(granted, 64 * 1024);
        assert_eq!(slab.used(), 64 * 1024);
        Ok(())
    }
}
