//! Cache policies
//!
//! A policy tracks cached items by an opaque data address and names the
//! item to drop next. [`LruCachePolicy`] keeps a doubly-linked list of
//! [`OffHeapCacheEntry`] values in slab memory, most recently used first:
//!
//! ```text
//! head ─→ [e3] ⇄ [e1] ⇄ [e2] ←─ tail      token_to_remove() = e2.data
//! ```

use super::entry::OffHeapCacheEntry;
use super::eviction::EvictionPredicate;
use crate::error::{Error, Result};
use crate::slab::{Address, Slab};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Handle a policy returns for a tracked item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CachePolicyKey(Address);

impl CachePolicyKey {
    pub fn new(address: Address) -> Self {
        Self(address)
    }

    pub fn address(&self) -> Address {
        self.0
    }
}

/// Tracks item usage and picks eviction victims
pub trait CachePolicy: Send + Sync {
    /// Start tracking `data`
    fn add_entry(&self, data: Address) -> Result<CachePolicyKey>;

    /// Record a use of the item behind `key`
    fn update_entry(&self, key: CachePolicyKey) -> Result<()>;

    /// Stop tracking the item behind `key`
    fn remove_entry(&self, key: CachePolicyKey) -> Result<()>;

    /// Data address of the next victim, [`Address::NONE`] when empty
    fn token_to_remove(&self) -> Result<Address>;

    fn should_evict(&self) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
struct LruList {
    head: Address,
    tail: Address,
    len: usize,
}

/// Least-recently-used policy over off-heap list entries
pub struct LruCachePolicy {
    slab: Arc<dyn Slab>,
    list: Mutex<LruList>,
    predicate: EvictionPredicate,
}

impl LruCachePolicy {
    pub fn new(slab: Arc<dyn Slab>, predicate: EvictionPredicate) -> Self {
        Self {
            slab,
            list: Mutex::new(LruList {
                head: Address::NONE,
                tail: Address::NONE,
                len: 0,
            }),
            predicate,
        }
    }

    fn entry(&self, address: Address) -> OffHeapCacheEntry<'_> {
        OffHeapCacheEntry::wrap(self.slab.as_ref(), address)
    }

    fn insert_at_head(&self, list: &mut LruList, entry: OffHeapCacheEntry<'_>) -> Result<()> {
        entry.set_previous(Address::NONE)?;
        if list.head.is_none() {
            entry.set_next(Address::NONE)?;
            list.tail = entry.address();
        } else {
            self.entry(list.head).set_previous(entry.address())?;
            entry.set_next(list.head)?;
        }
        list.head = entry.address();
        Ok(())
    }

    fn unlink(&self, list: &mut LruList, entry: OffHeapCacheEntry<'_>) -> Result<()> {
        if list.head.is_none() {
            return Err(Error::InvalidState(
                "cannot remove from an empty LRU list".into(),
            ));
        }

        let previous = entry.previous()?;
        let next = entry.next()?;

        if previous.is_none() {
            list.head = next;
            if !next.is_none() {
                self.entry(next).set_previous(Address::NONE)?;
            }
        } else {
            self.entry(previous).set_next(next)?;
        }

        if next.is_none() {
            list.tail = previous;
            if !previous.is_none() {
                self.entry(previous).set_next(Address::NONE)?;
            }
        } else {
            self.entry(next).set_previous(previous)?;
        }
        Ok(())
    }
}

impl CachePolicy for LruCachePolicy {
    fn add_entry(&self, data: Address) -> Result<CachePolicyKey> {
        let mut list = self.list.lock();
        let entry = OffHeapCacheEntry::create(self.slab.as_ref(), data)?;
        self.insert_at_head(&mut list, entry)?;
        list.len += 1;
        Ok(CachePolicyKey::new(entry.address()))
    }

    fn update_entry(&self, key: CachePolicyKey) -> Result<()> {
        let mut list = self.list.lock();
        if list.head == key.address() {
            return Ok(());
        }
        let entry = self.entry(key.address());
        self.unlink(&mut list, entry)?;
        self.insert_at_head(&mut list, entry)
    }

    fn remove_entry(&self, key: CachePolicyKey) -> Result<()> {
        let mut list = self.list.lock();
        let entry = self.entry(key.address());
        self.unlink(&mut list, entry)?;
        list.len -= 1;
        entry.free()
    }

    fn token_to_remove(&self) -> Result<Address> {
        let list = self.list.lock();
        if list.tail.is_none() {
            return Ok(Address::NONE);
        }
        self.entry(list.tail).data()
    }

    fn should_evict(&self) -> bool {
        self.predicate.should_evict()
    }

    fn len(&self) -> usize {
        self.list.lock().len
    }
}

impl fmt::Debug for LruCachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let list = self.list.lock();
        f.debug_struct("LruCachePolicy")
            .field("head", &list.head)
            .field("tail", &list.tail)
            .field("len", &list.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slab::new_managed_slab;

    fn policy() -> Result<LruCachePolicy> {
        let slab: Arc<dyn Slab> = Arc::new(new_managed_slab(64 * 1024)?);
        Ok(LruCachePolicy::new(slab, EvictionPredicate::never()))
    }

    const D1: Address = Address::new(0x101);
    const D2: Address = Address::new(0x202);
    const D3: Address = Address::new(0x303);

    #[test]
    fn test_add() -> Result<()> {
        let policy = policy()?;

        policy.add_entry(D1)?;
        assert_eq!(policy.token_to_remove()?, D1);
        policy.add_entry(D2)?;
        assert_eq!(policy.token_to_remove()?, D1);
        assert_eq!(policy.len(), 2);
        Ok(())
    }

    #[test]
    fn test_remove_head_then_tail() -> Result<()> {
        let policy = policy()?;
        let k1 = policy.add_entry(D1)?;
        let k2 = policy.add_entry(D2)?;

        policy.remove_entry(k2)?;
        assert_eq!(policy.token_to_remove()?, D1);
        policy.remove_entry(k1)?;
        assert_eq!(policy.token_to_remove()?, Address::NONE);
        assert!(policy.is_empty());
        Ok(())
    }

    #[test]
    fn test_remove_tail() -> Result<()> {
        let policy = policy()?;
        let k1 = policy.add_entry(D1)?;
        let k2 = policy.add_entry(D2)?;

        policy.remove_entry(k1)?;
        assert_eq!(policy.token_to_remove()?, D2);
        policy.remove_entry(k2)?;
        assert_eq!(policy.token_to_remove()?, Address::NONE);
        Ok(())
    }

    #[test]
    fn test_update_moves_to_front() -> Result<()> {
        let policy = policy()?;
        let k1 = policy.add_entry(D1)?;
        let k2 = policy.add_entry(D2)?;
        let k3 = policy.add_entry(D3)?;

        // A is least recent until touched
        assert_eq!(policy.token_to_remove()?, D1);
        policy.update_entry(k1)?;
        assert_eq!(policy.token_to_remove()?, D2);
        policy.update_entry(k2)?;
        assert_eq!(policy.token_to_remove()?, D3);

        // Middle entry removal keeps the links intact
        policy.remove_entry(k2)?;
        assert_eq!(policy.token_to_remove()?, D3);
        policy.remove_entry(k3)?;
        assert_eq!(policy.token_to_remove()?, D1);
        policy.remove_entry(k1)?;
        assert_eq!(policy.token_to_remove()?, Address::NONE);
        Ok(())
    }

    #[test]
    fn test_remove_from_empty_list() -> Result<()> {
        let policy = policy()?;
        let key = policy.add_entry(D1)?;
        policy.remove_entry(key)?;

        assert!(matches!(
            policy.remove_entry(key),
            Err(Error::InvalidState(_))
        ));
        Ok(())
    }

    #[test]
    fn test_entries_live_in_slab() -> Result<()> {
        let slab: Arc<dyn Slab> = Arc::new(new_managed_slab(1024)?);
        let policy = LruCachePolicy::new(slab.clone(), EvictionPredicate::always());

        let key = policy.add_entry(D1)?;
        assert_eq!(slab.used(), 24);
        assert!(policy.should_evict());
        policy.remove_entry(key)?;
        assert_eq!(slab.used(), 0);
        Ok(())
    }
}
