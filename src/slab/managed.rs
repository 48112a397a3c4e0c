//! Free-list managed slabs
//!
//! A `ManagedSlab` owns a window `[base, base + size)` of a raw slab and
//! hands out ranges from it through a [`FreeList`]. Accounting is checked
//! after every mutation:
//!
//! ```text
//! free_list.total_free() + used == size
//! ```

use super::free_list::{FreeList, FreeRange, RangeExtractor};
use super::size::validate_size;
use super::stats::ManagedSlabStats;
use super::{Address, Allocation, RawSlab, Slab};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

#[derive(Debug)]
struct ManagedState {
    free_list: FreeList,
    used: u64,
}

/// Slab supporting allocation and freeing of arbitrary ranges
#[derive(Debug)]
pub struct ManagedSlab {
    base: Address,
    raw: Arc<dyn RawSlab>,
    state: Mutex<ManagedState>,
    size: AtomicU64,
    used: AtomicU64,
    valid: AtomicBool,
}

impl ManagedSlab {
    /// Manage `[base, base + size)` of `raw`
    pub fn new(base: Address, raw: Arc<dyn RawSlab>, size: u64) -> Result<Self> {
        Self::with_extractor(base, raw, size, RangeExtractor::FirstFit)
    }

    pub fn with_extractor(
        base: Address,
        raw: Arc<dyn RawSlab>,
        size: u64,
        extractor: RangeExtractor,
    ) -> Result<Self> {
        let capacity = validate_size(size)?;

        let raw_base = raw.base_address()?;
        let raw_size = raw.size()?;
        let inside = base
            .distance_from(raw_base)
            .is_some_and(|offset| offset + size <= raw_size);
        if !inside {
            return Err(Error::Validation(format!(
                "window [{}, +{}) outside raw slab [{}, +{})",
                base, size, raw_base, raw_size
            )));
        }

        debug!(base = %base, size, ?extractor, "Created managed slab");

        Ok(Self {
            base,
            raw,
            state: Mutex::new(ManagedState {
                free_list: FreeList::with_extractor(capacity, extractor),
                used: 0,
            }),
            size: AtomicU64::new(size),
            used: AtomicU64::new(0),
            valid: AtomicBool::new(true),
        })
    }

    /// Manage the whole of `raw`
    pub fn from_raw_slab(raw: Arc<dyn RawSlab>) -> Result<Self> {
        let base = raw.base_address()?;
        let size = raw.size()?;
        Self::new(base, raw, size)
    }

    /// Free ranges in local offsets
    pub fn free_ranges(&self) -> Vec<FreeRange> {
        self.state.lock().free_list.ranges().collect()
    }

    pub fn stats(&self) -> ManagedSlabStats {
        let state = self.state.lock();
        let size = self.size.load(Ordering::Acquire);
        ManagedSlabStats {
            size,
            used: state.used,
            free: state.free_list.total_free(),
            free_ranges: state.free_list.range_count(),
            largest_free_range: state
                .free_list
                .largest_range()
                .map_or(0, |r| r.length as u64),
        }
    }

    /// Whether a compaction pass would help; compaction is not implemented
    pub fn should_compact(&self) -> bool {
        false
    }

    /// Compaction hook, does nothing
    pub fn compact(&self) {}

    fn check_valid(&self) -> Result<()> {
        if self.valid.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "managed slab at {} has been freed",
                self.base
            )))
        }
    }

    fn check_window(&self, address: Address, len: usize) -> Result<()> {
        self.check_valid()?;
        let size = self.size.load(Ordering::Acquire);
        let inside = address
            .distance_from(self.base)
            .and_then(|offset| offset.checked_add(len as u64))
            .is_some_and(|end| end <= size);
        if inside {
            Ok(())
        } else {
            Err(Error::Validation(format!(
                "access of {} bytes at {} outside managed slab [{}, +{})",
                len, address, self.base, size
            )))
        }
    }

    /// Count `range` as used; on a failed accounting check the range goes
    /// back to the free list and the check's error is returned
    fn commit(&self, state: &mut ManagedState, range: FreeRange) -> Result<()> {
        state.used += range.length as u64;
        self.used.store(state.used, Ordering::Release);

        if let Err(e) = self.verify(state) {
            state.used -= range.length as u64;
            self.used.store(state.used, Ordering::Release);
            if let Err(undo) = state.free_list.free(range.offset, range.length) {
                error!(
                    base = %self.base,
                    offset = range.offset,
                    length = range.length,
                    error = %undo,
                    "Could not return range after failed accounting check"
                );
            }
            return Err(e);
        }
        Ok(())
    }

    fn verify(&self, state: &ManagedState) -> Result<()> {
        let size = self.size.load(Ordering::Acquire);
        let free = state.free_list.total_free();
        if free + state.used != size {
            error!(
                base = %self.base,
                free,
                used = state.used,
                size,
                "Free list accounting diverged"
            );
            return Err(Error::InternalConsistency(format!(
                "free {} + used {} != size {} for slab at {}",
                free, state.used, size, self.base
            )));
        }
        Ok(())
    }
}

impl RawSlab for ManagedSlab {
    fn base_address(&self) -> Result<Address> {
        self.check_valid()?;
        Ok(self.base)
    }

    fn get_byte(&self, address: Address) -> Result<u8> {
        self.check_window(address, 1)?;
        self.raw.get_byte(address)
    }

    fn put_byte(&self, address: Address, value: u8) -> Result<()> {
        self.check_window(address, 1)?;
        self.raw.put_byte(address, value)
    }

    fn get(&self, address: Address, buf: &mut [u8]) -> Result<()> {
        self.check_window(address, buf.len())?;
        self.raw.get(address, buf)
    }

    fn put(&self, address: Address, bytes: &[u8]) -> Result<()> {
        self.check_window(address, bytes.len())?;
        self.raw.put(address, bytes)
    }

    fn size(&self) -> Result<u64> {
        self.check_valid()?;
        Ok(self.size.load(Ordering::Acquire))
    }

    /// Grow the managed window together with the raw slab
    ///
    /// Only possible when this slab manages the raw slab from its base to
    /// its end; sub-windows of a shared raw slab cannot grow.
    fn expand(&self, size_bytes: u64) -> Result<u64> {
        self.check_valid()?;
        let mut state = self.state.lock();

        let size = self.size.load(Ordering::Acquire);
        if self.raw.base_address()? != self.base || self.raw.size()? != size {
            return Err(Error::Unsupported(format!(
                "managed slab at {} is a sub-window and cannot expand",
                self.base
            )));
        }
        validate_size(size_bytes)?;

        let achieved = self.raw.expand(size_bytes)?;
        let added = achieved - size;
        state.free_list.extend(validate_size(added)?)?;
        self.size.store(achieved, Ordering::Release);

        debug!(base = %self.base, from = size, to = achieved, "Expanded managed slab");
        self.verify(&state)?;
        Ok(achieved)
    }

    fn free_slab(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !self.valid.swap(false, Ordering::AcqRel) {
            return Err(Error::InvalidState(format!(
                "managed slab at {} has been freed",
                self.base
            )));
        }
        state.free_list.reset(0);
        state.used = 0;
        self.used.store(0, Ordering::Release);
        self.raw.free_slab()
    }
}

impl Slab for ManagedSlab {
    fn allocate(&self, size_bytes: u64) -> Result<Address> {
        self.check_valid()?;
        let size = validate_size(size_bytes)?;

        let mut state = self.state.lock();
        let offset = state.free_list.allocate(size)?;
        self.commit(
            &mut state,
            FreeRange {
                offset,
                length: size,
            },
        )?;

        Ok(self.base.offset(offset as u64))
    }

    fn try_allocate(&self, size_bytes: u64) -> Allocation {
        if self.check_valid().is_err() {
            return Allocation::empty();
        }
        let size = match validate_size(size_bytes) {
            Ok(size) => size,
            Err(_) => return Allocation::empty(),
        };

        let mut state = self.state.lock();
        let range = match state.free_list.try_allocate(size) {
            Some(range) => range,
            None => return Allocation::empty(),
        };
        if self.commit(&mut state, range).is_err() {
            return Allocation::empty();
        }

        Allocation::new(self.base.offset(range.offset as u64), range.length as u64)
    }

    fn free(&self, address: Address, size_bytes: u64) -> Result<()> {
        self.check_valid()?;
        let size = validate_size(size_bytes)?;

        let offset = address.distance_from(self.base).ok_or_else(|| {
            Error::Validation(format!("address {} below slab base {}", address, self.base))
        })?;
        let slab_size = self.size.load(Ordering::Acquire);
        if offset.checked_add(size_bytes).map_or(true, |end| end > slab_size) {
            return Err(Error::Validation(format!(
                "range {} +{} outside slab [{}, +{})",
                address, size_bytes, self.base, slab_size
            )));
        }

        let mut state = self.state.lock();
        if size_bytes > state.used {
            return Err(Error::Validation(format!(
                "freeing {} bytes with only {} in use",
                size_bytes, state.used
            )));
        }

        state.free_list.free(offset as u32, size)?;
        state.used -= size_bytes;
        self.used.store(state.used, Ordering::Release);
        self.verify(&state)
    }

    fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    fn free_bytes(&self) -> u64 {
        self.size
            .load(Ordering::Acquire)
            .saturating_sub(self.used.load(Ordering::Acquire))
    }
}
