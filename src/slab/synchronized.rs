//! Mutex-serialized slab view

use super::{Address, Allocation, RawSlab, Slab};
use crate::error::Result;
use parking_lot::Mutex;
use std::sync::Arc;

/// Serializes every operation on the wrapped slab behind one mutex
#[derive(Debug)]
pub struct SynchronizedSlab<S: Slab + ?Sized = dyn Slab> {
    lock: Mutex<()>,
    slab: Arc<S>,
}

impl<S: Slab + ?Sized> SynchronizedSlab<S> {
    pub fn new(slab: Arc<S>) -> Self {
        Self {
            lock: Mutex::new(()),
            slab,
        }
    }

    pub fn inner(&self) -> &Arc<S> {
        &self.slab
    }
}

impl<S: Slab + ?Sized> RawSlab for SynchronizedSlab<S> {
    fn base_address(&self) -> Result<Address> {
        let _guard = self.lock.lock();
        self.slab.base_address()
    }

    fn get_byte(&self, address: Address) -> Result<u8> {
        let _guard = self.lock.lock();
        self.slab.get_byte(address)
    }

    fn put_byte(&self, address: Address, value: u8) -> Result<()> {
        let _guard = self.lock.lock();
        self.slab.put_byte(address, value)
    }

    fn get(&self, address: Address, buf: &mut [u8]) -> Result<()> {
        let _guard = self.lock.lock();
        self.slab.get(address, buf)
    }

    fn put(&self, address: Address, bytes: &[u8]) -> Result<()> {
        let _guard = self.lock.lock();
        self.slab.put(address, bytes)
    }

    fn size(&self) -> Result<u64> {
        let _guard = self.lock.lock();
        self.slab.size()
    }

    fn expand(&self, size_bytes: u64) -> Result<u64> {
        let _guard = self.lock.lock();
        self.slab.expand(size_bytes)
    }

    fn free_slab(&self) -> Result<()> {
        let _guard = self.lock.lock();
        self.slab.free_slab()
    }
}

impl<S: Slab + ?Sized> Slab for SynchronizedSlab<S> {
    fn allocate(&self, size_bytes: u64) -> Result<Address> {
        let _guard = self.lock.lock();
        self.slab.allocate(size_bytes)
    }

    fn try_allocate(&self, size_bytes: u64) -> Allocation {
        let _guard = self.lock.lock();
        self.slab.try_allocate(size_bytes)
    }

    fn free(&self, address: Address, size_bytes: u64) -> Result<()> {
        let _guard = self.lock.lock();
        self.slab.free(address, size_bytes)
    }

    fn used(&self) -> u64 {
        let _guard = self.lock.lock();
        self.slab.used()
    }

    fn free_bytes(&self) -> u64 {
        let _guard = self.lock.lock();
        self.slab.free_bytes()
    }
}
