//! Allocation results and lock-free bounded counters

use super::Address;
use std::sync::atomic::{AtomicU64, Ordering};

/// Result of a capacity-bounded allocation
///
/// `size` may be smaller than what was asked for; a zero size means nothing
/// was reserved and `address` is [`Address::NONE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Allocation {
    pub address: Address,
    pub size: u64,
}

impl Allocation {
    pub const fn new(address: Address, size: u64) -> Self {
        Self { address, size }
    }

    pub const fn empty() -> Self {
        Self {
            address: Address::NONE,
            size: 0,
        }
    }

    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// Outcome of [`add_with_max`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddWithMaxResult {
    /// Counter value before the add
    pub previous_value: u64,
    /// Amount actually granted, `<= delta`
    pub actual_delta: u64,
}

/// Add up to `delta` to `counter` without letting the granted total pass `max`
///
/// One `fetch_add`, plus one compensating `fetch_sub` when the add overshot.
/// The counter may transiently exceed `max` between the two; concurrent
/// callers still never receive overlapping grants.
pub fn add_with_max(counter: &AtomicU64, delta: u64, max: u64) -> AddWithMaxResult {
    let previous_value = counter.fetch_add(delta, Ordering::AcqRel);
    let actual_delta = if previous_value.saturating_add(delta) <= max {
        delta
    } else {
        let granted = max.saturating_sub(previous_value);
        counter.fetch_sub(delta - granted, Ordering::AcqRel);
        granted
    };

    AddWithMaxResult {
        previous_value,
        actual_delta,
    }
}

/// All-or-nothing version of [`add_with_max`]
///
/// Returns the previous counter value when the whole `delta` fits under
/// `max`; otherwise gives the whole delta back and returns `None`.
pub fn add_within_max(counter: &AtomicU64, delta: u64, max: u64) -> Option<u64> {
    let previous_value = counter.fetch_add(delta, Ordering::AcqRel);
    if previous_value.saturating_add(delta) <= max {
        Some(previous_value)
    } else {
        counter.fetch_sub(delta, Ordering::AcqRel);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_add_with_max_partial_grant() {
        let counter = AtomicU64::new(90);

        let result = add_with_max(&counter, 20, 100);
        assert_eq!(result.previous_value, 90);
        assert_eq!(result.actual_delta, 10);
        assert_eq!(counter.load(Ordering::Acquire), 100);

        // Already full
        let result = add_with_max(&counter, 5, 100);
        assert_eq!(result.actual_delta, 0);
        assert_eq!(counter.load(Ordering::Acquire), 100);
    }

    #[test]
    fn test_add_within_max_gives_back_everything() {
        let counter = AtomicU64::new(90);

        assert_eq!(add_within_max(&counter, 20, 100), None);
        assert_eq!(counter.load(Ordering::Acquire), 90);

        assert_eq!(add_within_max(&counter, 10, 100), Some(90));
        assert_eq!(counter.load(Ordering::Acquire), 100);
    }

    #[test]
    fn test_concurrent_grants_stay_bounded() {
        const MAX: u64 = 10_000;
        let counter = AtomicU64::new(0);

        let granted: u64 = thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        (0..1000)
                            .map(|_| add_with_max(&counter, 7, MAX).actual_delta)
                            .sum::<u64>()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        // 8 * 1000 * 7 = 56000 requested
        assert_eq!(granted, MAX);
        assert_eq!(counter.load(Ordering::Acquire), MAX);
    }

    #[test]
    fn test_empty_allocation() {
        assert!(Allocation::empty().is_empty());
        assert!(Allocation::empty().address.is_none());
        assert!(!Allocation::new(Address::new(64), 8).is_empty());
    }
}
