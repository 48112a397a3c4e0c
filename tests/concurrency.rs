//! Multi-threaded allocation tests

use offheap_memory::error::Result;
use offheap_memory::slab::{
    add_with_max, add_within_max, new_managed_slab, ManagedSlabFactory, PolicyKind, SlabPool,
    SynchronizedSlabFactory, ThreadLocalSlab,
};
use offheap_memory::{Address, AllocationContext, RawSlab, ShardedSlab, ShardedSlabPool, Slab};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

const THREADS: usize = 8;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn assert_disjoint(mut ranges: Vec<(u64, u64)>) {
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        let (start, len) = pair[0];
        assert!(
            start + len <= pair[1].0,
            "ranges overlap: {:#x}+{} and {:#x}",
            start,
            len,
            pair[1].0
        );
    }
}

#[test]
fn test_bounded_counter_never_overgrants() {
    let counter = Arc::new(AtomicU64::new(0));
    let max = 10_000;

    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let counter = counter.clone();
            thread::spawn(move || {
                let mut granted = 0;
                for _ in 0..500 {
                    granted += add_with_max(&counter, 3 + i as u64, max).actual_delta;
                }
                granted
            })
        })
        .collect();

    let granted: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(granted, max);
    assert_eq!(counter.load(Ordering::Acquire), max);
}

#[test]
fn test_all_or_nothing_counter() {
    let counter = Arc::new(AtomicU64::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let counter = counter.clone();
            thread::spawn(move || {
                (0..100)
                    .filter(|_| add_within_max(&counter, 7, 1000).is_some())
                    .count() as u64
            })
        })
        .collect();

    let successes: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(successes, 1000 / 7);
    assert_eq!(counter.load(Ordering::Acquire), successes * 7);
}

#[test]
fn test_managed_slab_concurrent_allocate_free() -> Result<()> {
    init_tracing();
    let slab = Arc::new(new_managed_slab(1024 * 1024)?);

    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let slab = slab.clone();
            thread::spawn(move || -> Result<Vec<(u64, u64)>> {
                let mut kept = Vec::new();
                for round in 0..200u64 {
                    let size = 16 + (i as u64 * 8) + round % 32;
                    let address = slab.allocate(size)?;
                    slab.put_byte(address, i as u8)?;
                    if round % 2 == 0 {
                        slab.free(address, size)?;
                    } else {
                        kept.push((address.get(), size));
                    }
                }
                Ok(kept)
            })
        })
        .collect();

    let mut ranges = Vec::new();
    for handle in handles {
        ranges.extend(handle.join().unwrap()?);
    }

    let kept_bytes: u64 = ranges.iter().map(|(_, len)| len).sum();
    assert_eq!(slab.used(), kept_bytes);
    assert_eq!(slab.used() + slab.free_bytes(), slab.size()?);
    assert_disjoint(ranges);
    Ok(())
}

#[test]
fn test_thread_local_buffers_are_disjoint() -> Result<()> {
    init_tracing();
    let backing: Arc<dyn Slab> = Arc::new(new_managed_slab(1024 * 1024)?);
    let tlabs = Arc::new(ThreadLocalSlab::new(4096, backing.clone()));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let tlabs = tlabs.clone();
            thread::spawn(move || -> Result<Vec<(u64, u64)>> {
                let ctx = AllocationContext::current();
                let mut ranges = Vec::new();
                // 6400 bytes per thread forces at least one refresh
                for _ in 0..100 {
                    let address = tlabs.allocate_in(&ctx, 64)?;
                    tlabs.put(address, &[0xab; 64])?;
                    ranges.push((address.get(), 64));
                }
                tlabs.release_in(&ctx)?;
                Ok(ranges)
            })
        })
        .collect();

    let mut ranges = Vec::new();
    for handle in handles {
        ranges.extend(handle.join().unwrap()?);
    }

    assert_eq!(ranges.len(), THREADS * 100);
    assert_eq!(tlabs.active_buffers(), 0);
    // Every unused tail went back, so the backing slab holds exactly the allocations
    assert_eq!(backing.used(), (THREADS * 100 * 64) as u64);
    assert_disjoint(ranges);
    Ok(())
}

#[test]
fn test_sharded_slab_under_contention() -> Result<()> {
    init_tracing();
    let factory = SynchronizedSlabFactory::new(ManagedSlabFactory::new());
    let pool = Arc::new(ShardedSlabPool::create(&factory, 4, 256 * 1024)?);
    let slab = Arc::new(ShardedSlab::new(pool.clone(), PolicyKind::Dual));

    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let slab = slab.clone();
            thread::spawn(move || -> Result<Vec<Address>> {
                let mut addresses = Vec::new();
                for _ in 0..100 {
                    let address = slab.allocate(128)?;
                    slab.put_byte(address, i as u8)?;
                    addresses.push(address);
                }
                for address in &addresses {
                    assert_eq!(slab.get_byte(*address)?, i as u8);
                }
                Ok(addresses)
            })
        })
        .collect();

    let mut addresses = Vec::new();
    for handle in handles {
        addresses.extend(handle.join().unwrap()?);
    }
    assert_eq!(slab.used(), (THREADS * 100 * 128) as u64);

    // Each address routes back to the shard that holds it
    for address in &addresses {
        let owner = pool.slab_by_address(*address)?;
        let base = owner.base_address()?;
        assert!(*address >= base && address.get() < base.get() + owner.size()?);
        slab.free(*address, 128)?;
    }
    assert_eq!(slab.used(), 0);
    assert_disjoint(addresses.iter().map(|a| (a.get(), 128)).collect());
    Ok(())
}

#[test]
fn test_worker_threads_leave_only_live_allocations() -> Result<()> {
    init_tracing();
    let backing: Arc<dyn Slab> = Arc::new(new_managed_slab(64 * 1024)?);
    let tlabs = Arc::new(ThreadLocalSlab::new(2048, backing.clone()));

    // Several waves of short-lived workers; leaked windows would exhaust the slab
    let mut live = Vec::new();
    for _ in 0..10 {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let tlabs = tlabs.clone();
                thread::spawn(move || -> Result<(u64, u64)> {
                    let scratch = tlabs.allocate(96)?;
                    let kept = tlabs.allocate(32)?;
                    tlabs.free(scratch, 96)?;
                    Ok((kept.get(), 32))
                })
            })
            .collect();
        for handle in handles {
            live.push(handle.join().unwrap()?);
        }
    }

    assert_eq!(tlabs.active_buffers(), 0);
    assert_eq!(backing.used(), live.iter().map(|(_, len)| len).sum::<u64>());
    assert_disjoint(live);
    Ok(())
}
