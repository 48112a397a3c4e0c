//! Interval free list
//!
//! Free space of a managed slab, kept as disjoint, maximally merged ranges
//! in local offsets. Two indexes are maintained:
//!
//! ```text
//! by_offset: 0 → 100, 300 → 50, 900 → 124      (first fit, neighbour merge)
//! by_size:   (50, 300), (100, 0), (124, 900)    (best fit, largest range)
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::size::validate_size;

/// A free range in slab-local coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct FreeRange {
    pub offset: u32,
    pub length: u32,
}

impl FreeRange {
    pub fn new(offset: u32, length: u32) -> Self {
        Self { offset, length }
    }

    /// One past the last byte
    pub fn end(&self) -> u64 {
        self.offset as u64 + self.length as u64
    }
}

/// Which free range an allocation is carved from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeExtractor {
    /// Lowest offset that fits
    #[default]
    FirstFit,
    /// Smallest range that fits
    BestFit,
    /// Always the largest range
    LargestRange,
}

/// Free list over `[0, capacity)`
#[derive(Debug, Clone)]
pub struct FreeList {
    by_offset: BTreeMap<u32, u32>,
    by_size: BTreeSet<(u32, u32)>,
    capacity: u32,
    total_free: u64,
    extractor: RangeExtractor,
}

impl FreeList {
    /// Create a free list with the whole capacity free
    pub fn new(capacity: u32) -> Self {
        Self::with_extractor(capacity, RangeExtractor::FirstFit)
    }

    pub fn with_extractor(capacity: u32, extractor: RangeExtractor) -> Self {
        let mut list = Self {
            by_offset: BTreeMap::new(),
            by_size: BTreeSet::new(),
            capacity: 0,
            total_free: 0,
            extractor,
        };
        list.reset(capacity);
        list
    }

    /// Forget all allocations; the whole of `capacity` is free again
    pub fn reset(&mut self, capacity: u32) {
        self.by_offset.clear();
        self.by_size.clear();
        self.capacity = capacity;
        self.total_free = 0;
        if capacity > 0 {
            self.insert_range(0, capacity);
        }
    }

    /// Allocate exactly `size` bytes, returning the offset
    ///
    /// The list is unchanged when nothing fits.
    pub fn allocate(&mut self, size: u32) -> Result<u32> {
        if size == 0 {
            return Err(Error::Validation("cannot allocate zero bytes".into()));
        }

        let range = self.find(size).ok_or_else(|| {
            Error::Allocation(format!(
                "no free range of {} bytes (free {}, largest {})",
                size,
                self.total_free,
                self.largest_range().map_or(0, |r| r.length)
            ))
        })?;

        self.consume(range, size);
        Ok(range.offset)
    }

    /// Allocate up to `size` bytes
    ///
    /// When no range fits the whole request the largest range is handed out
    /// instead. `None` only when the list is empty or `size` is zero.
    pub fn try_allocate(&mut self, size: u32) -> Option<FreeRange> {
        if size == 0 {
            return None;
        }

        let range = self.find(size).or_else(|| self.largest_range())?;
        let granted = range.length.min(size);
        self.consume(range, granted);
        Some(FreeRange::new(range.offset, granted))
    }

    /// Return `[offset, offset + size)` to the list, merging neighbours
    pub fn free(&mut self, offset: u32, size: u32) -> Result<()> {
        if size == 0 {
            return Err(Error::Validation("cannot free zero bytes".into()));
        }

        let end = offset as u64 + size as u64;
        if end > self.capacity as u64 {
            return Err(Error::Validation(format!(
                "range [{}, {}) exceeds capacity {}",
                offset, end, self.capacity
            )));
        }

        let lower = self
            .by_offset
            .range(..=offset)
            .next_back()
            .map(|(&o, &l)| FreeRange::new(o, l));
        let higher = self
            .by_offset
            .range(offset..)
            .next()
            .map(|(&o, &l)| FreeRange::new(o, l));

        if let Some(lower) = lower {
            if lower.end() > offset as u64 {
                return Err(Error::Validation(format!(
                    "range [{}, {}) overlaps free range [{}, {})",
                    offset,
                    end,
                    lower.offset,
                    lower.end()
                )));
            }
        }
        if let Some(higher) = higher {
            if (higher.offset as u64) < end {
                return Err(Error::Validation(format!(
                    "range [{}, {}) overlaps free range [{}, {})",
                    offset,
                    end,
                    higher.offset,
                    higher.end()
                )));
            }
        }

        let mut merged = FreeRange::new(offset, size);
        if let Some(lower) = lower.filter(|r| r.end() == offset as u64) {
            self.remove_range(lower);
            merged = FreeRange::new(lower.offset, lower.length + merged.length);
        }
        if let Some(higher) = higher.filter(|r| r.offset as u64 == end) {
            self.remove_range(higher);
            merged.length += higher.length;
        }

        self.insert_range(merged.offset, merged.length);
        Ok(())
    }

    /// Grow the capacity by `size` bytes, all of them free
    pub fn extend(&mut self, size: u32) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        let old_capacity = self.capacity;
        self.capacity = validate_size(old_capacity as u64 + size as u64)?;
        self.free(old_capacity, size)
    }

    pub fn total_free(&self) -> u64 {
        self.total_free
    }

    pub fn capacity(&self) -> u64 {
        self.capacity as u64
    }

    pub fn range_count(&self) -> usize {
        self.by_offset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_offset.is_empty()
    }

    pub fn extractor(&self) -> RangeExtractor {
        self.extractor
    }

    /// Free ranges in offset order
    pub fn ranges(&self) -> impl Iterator<Item = FreeRange> + '_ {
        self.by_offset.iter().map(|(&o, &l)| FreeRange::new(o, l))
    }

    pub fn largest_range(&self) -> Option<FreeRange> {
        self.by_size
            .iter()
            .next_back()
            .map(|&(length, offset)| FreeRange::new(offset, length))
    }

    fn find(&self, size: u32) -> Option<FreeRange> {
        match self.extractor {
            RangeExtractor::FirstFit => self
                .by_offset
                .iter()
                .find(|(_, &length)| length >= size)
                .map(|(&o, &l)| FreeRange::new(o, l)),
            RangeExtractor::BestFit => self
                .by_size
                .range((size, 0)..)
                .next()
                .map(|&(length, offset)| FreeRange::new(offset, length)),
            RangeExtractor::LargestRange => self.largest_range().filter(|r| r.length >= size),
        }
    }

    fn consume(&mut self, range: FreeRange, size: u32) {
        self.remove_range(range);
        if range.length > size {
            self.insert_range(range.offset + size, range.length - size);
        }
    }

    fn insert_range(&mut self, offset: u32, length: u32) {
        self.by_offset.insert(offset, length);
        self.by_size.insert((length, offset));
        self.total_free += length as u64;
    }

    fn remove_range(&mut self, range: FreeRange) {
        self.by_offset.remove(&range.offset);
        self.by_size.remove(&(range.length, range.offset));
        self.total_free -= range.length as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_allocations() -> Result<()> {
        let mut list = FreeList::new(4096);

        assert_eq!(list.allocate(100)?, 0);
        assert_eq!(list.allocate(100)?, 100);
        assert_eq!(list.allocate(500)?, 200);
        assert_eq!(list.allocate(1024)?, 700);
        assert_eq!(list.allocate(1024)?, 1724);

        assert_eq!(list.total_free(), 4096 - 2748);
        assert_eq!(list.range_count(), 1);
        Ok(())
    }

    #[test]
    fn test_failed_allocation_leaves_state() -> Result<()> {
        let mut list = FreeList::new(1000);
        list.allocate(600)?;

        assert!(matches!(list.allocate(500), Err(Error::Allocation(_))));
        assert_eq!(list.total_free(), 400);
        assert_eq!(list.ranges().collect::<Vec<_>>(), vec![FreeRange::new(600, 400)]);
        Ok(())
    }

    #[test]
    fn test_contiguous_free_merges() -> Result<()> {
        let mut list = FreeList::new(1000);
        let offsets: Vec<u32> = (0..10).map(|_| list.allocate(100)).collect::<Result<_>>()?;
        assert!(list.is_empty());

        // Free out of order: 0, 2 → two ranges, then 1 joins them
        list.free(offsets[0], 100)?;
        list.free(offsets[2], 100)?;
        assert_eq!(list.range_count(), 2);
        list.free(offsets[1], 100)?;
        assert_eq!(list.range_count(), 1);

        for &offset in offsets[3..].iter().rev() {
            list.free(offset, 100)?;
        }
        assert_eq!(list.range_count(), 1);
        assert_eq!(list.total_free(), 1000);
        Ok(())
    }

    #[test]
    fn test_free_equal_size_ranges() -> Result<()> {
        let mut list = FreeList::new(300);
        let a = list.allocate(100)?;
        let _b = list.allocate(100)?;
        let c = list.allocate(100)?;

        // Two separate ranges of identical length must both be tracked
        list.free(a, 100)?;
        list.free(c, 100)?;
        assert_eq!(list.range_count(), 2);
        assert_eq!(list.total_free(), 200);
        Ok(())
    }

    #[test]
    fn test_double_free_rejected() -> Result<()> {
        let mut list = FreeList::new(1000);
        let offset = list.allocate(100)?;
        list.free(offset, 100)?;

        assert!(matches!(list.free(offset, 100), Err(Error::Validation(_))));
        assert!(matches!(list.free(50, 100), Err(Error::Validation(_))));
        assert!(matches!(list.free(950, 100), Err(Error::Validation(_))));
        assert_eq!(list.total_free(), 1000);
        Ok(())
    }

    #[test]
    fn test_try_allocate_grants_largest() -> Result<()> {
        let mut list = FreeList::new(1000);
        list.allocate(900)?;

        let range = list.try_allocate(500).unwrap();
        assert_eq!(range, FreeRange::new(900, 100));
        assert!(list.try_allocate(1).is_none());
        Ok(())
    }

    #[test]
    fn test_extend_merges_with_tail() -> Result<()> {
        let mut list = FreeList::new(1000);
        list.allocate(500)?;
        list.extend(1000)?;

        assert_eq!(list.capacity(), 2000);
        assert_eq!(list.ranges().collect::<Vec<_>>(), vec![FreeRange::new(500, 1500)]);

        // Fully allocated list grows a fresh range
        list.allocate(1500)?;
        list.extend(24)?;
        assert_eq!(list.ranges().collect::<Vec<_>>(), vec![FreeRange::new(2000, 24)]);
        Ok(())
    }

    #[test]
    fn test_best_fit_and_largest() -> Result<()> {
        for (extractor, expected) in [
            (RangeExtractor::FirstFit, 0),
            (RangeExtractor::BestFit, 300),
            (RangeExtractor::LargestRange, 500),
        ] {
            let mut list = FreeList::with_extractor(1000, extractor);
            // Free ranges afterwards: [0, 200), [300, 400), [500, 1000)
            let a = list.allocate(200)?;
            list.allocate(100)?;
            let c = list.allocate(100)?;
            list.allocate(100)?;
            list.free(a, 200)?;
            list.free(c, 100)?;

            assert_eq!(list.allocate(50)?, expected, "{:?}", extractor);
        }
        Ok(())
    }
}
