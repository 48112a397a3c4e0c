//! Off-heap byte-array hash map with policy-driven eviction

use super::bucket::{BucketNode, LinkedListBucket, PutOutcome};
use super::eviction::EvictionPredicate;
use super::lru::{CachePolicy, CachePolicyKey, LruCachePolicy};
use crate::error::{Error, Result};
use crate::slab::{default_digest, Address, DefaultDigest, Slab};
use parking_lot::RwLock;
use std::fmt;
use std::hash::BuildHasher;
use std::sync::Arc;
use tracing::{debug, info};

/// Hash map from byte keys to byte values, stored in a slab
///
/// Bucket `hash(key) % bucket_count` holds a chain of nodes; each node is
/// registered with the cache policy. After every `get` and `put` the
/// policy is asked whether to evict, and if so its victim is removed
/// before the call returns.
pub struct ByteArrayHashMap<P: CachePolicy = LruCachePolicy, S: BuildHasher = DefaultDigest> {
    slab: Arc<dyn Slab>,
    buckets: RwLock<Box<[Address]>>,
    cache_policy: P,
    digest: S,
}

impl ByteArrayHashMap {
    /// LRU-evicting map with the default digest
    pub fn new(
        slab: Arc<dyn Slab>,
        bucket_count: usize,
        predicate: EvictionPredicate,
    ) -> Result<Self> {
        let policy = LruCachePolicy::new(slab.clone(), predicate);
        Self::with_policy_and_digest(slab, bucket_count, policy, default_digest())
    }
}

impl<P: CachePolicy, S: BuildHasher> ByteArrayHashMap<P, S> {
    pub fn with_policy_and_digest(
        slab: Arc<dyn Slab>,
        bucket_count: usize,
        cache_policy: P,
        digest: S,
    ) -> Result<Self> {
        if bucket_count == 0 {
            return Err(Error::Validation("bucket count must be positive".into()));
        }

        info!(buckets = bucket_count, "Initializing off-heap hash map");

        Ok(Self {
            slab,
            buckets: RwLock::new(vec![Address::NONE; bucket_count].into_boxed_slice()),
            cache_policy,
            digest,
        })
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.read().len()
    }

    pub fn cache_policy(&self) -> &P {
        &self.cache_policy
    }

    pub fn slab(&self) -> &Arc<dyn Slab> {
        &self.slab
    }

    /// Look up `key`, marking it as used on a hit
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut buckets = self.buckets.write();
        let node = match self.find_node(&buckets, key)? {
            Some(node) => node,
            None => return Ok(None),
        };

        let value = node.value()?.to_vec()?;
        self.cache_policy
            .update_entry(CachePolicyKey::new(node.annotation()?))?;
        self.enforce_cache_policy(&mut buckets)?;
        Ok(Some(value))
    }

    /// Insert or replace the value for `key`
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut buckets = self.buckets.write();
        let index = self.bucket_index(key, buckets.len());

        let created = buckets[index].is_none();
        if created {
            buckets[index] = LinkedListBucket::create(self.slab.as_ref())?.address();
        }
        let bucket = LinkedListBucket::wrap(self.slab.as_ref(), buckets[index])?;

        let outcome = match bucket.put(key, value) {
            Ok(outcome) => outcome,
            Err(e) => {
                if created {
                    bucket.free()?;
                    buckets[index] = Address::NONE;
                }
                return Err(e);
            }
        };

        match outcome {
            PutOutcome::Inserted(node) => match self.cache_policy.add_entry(node.address()) {
                Ok(policy_key) => node.set_annotation(policy_key.address())?,
                Err(e) => {
                    bucket.remove(key)?;
                    return Err(e);
                }
            },
            PutOutcome::Replaced(node) => self
                .cache_policy
                .update_entry(CachePolicyKey::new(node.annotation()?))?,
        }

        self.enforce_cache_policy(&mut buckets)
    }

    /// Remove `key`, returning whether it was present
    pub fn remove(&self, key: &[u8]) -> Result<bool> {
        let mut buckets = self.buckets.write();
        self.remove_locked(&mut buckets, key)
    }

    pub fn contains_key(&self, key: &[u8]) -> Result<bool> {
        let buckets = self.buckets.read();
        Ok(self.find_node(&buckets, key)?.is_some())
    }

    pub fn len(&self) -> Result<usize> {
        let buckets = self.buckets.read();
        let mut len = 0;
        for &address in buckets.iter().filter(|a| !a.is_none()) {
            len += LinkedListBucket::wrap(self.slab.as_ref(), address)?.len()? as usize;
        }
        Ok(len)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Remove every entry and release all bucket headers
    pub fn clear(&self) -> Result<()> {
        let mut buckets = self.buckets.write();
        let mut removed = 0usize;

        for slot in buckets.iter_mut().filter(|a| !a.is_none()) {
            let bucket = LinkedListBucket::wrap(self.slab.as_ref(), *slot)?;
            for annotation in bucket.clear()? {
                if !annotation.is_none() {
                    self.cache_policy
                        .remove_entry(CachePolicyKey::new(annotation))?;
                }
                removed += 1;
            }
            bucket.free()?;
            *slot = Address::NONE;
        }

        debug!(removed, "Cleared off-heap hash map");
        Ok(())
    }

    fn bucket_index(&self, key: &[u8], bucket_count: usize) -> usize {
        (self.digest.hash_one(key) % bucket_count as u64) as usize
    }

    fn find_node(&self, buckets: &[Address], key: &[u8]) -> Result<Option<BucketNode<'_>>> {
        let address = buckets[self.bucket_index(key, buckets.len())];
        if address.is_none() {
            return Ok(None);
        }
        LinkedListBucket::wrap(self.slab.as_ref(), address)?.find(key)
    }

    fn remove_locked(&self, buckets: &mut [Address], key: &[u8]) -> Result<bool> {
        let address = buckets[self.bucket_index(key, buckets.len())];
        if address.is_none() {
            return Ok(false);
        }

        match LinkedListBucket::wrap(self.slab.as_ref(), address)?.remove(key)? {
            Some(annotation) => {
                if !annotation.is_none() {
                    self.cache_policy
                        .remove_entry(CachePolicyKey::new(annotation))?;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn enforce_cache_policy(&self, buckets: &mut [Address]) -> Result<()> {
        if !self.cache_policy.should_evict() {
            return Ok(());
        }

        let token = self.cache_policy.token_to_remove()?;
        if token.is_none() {
            return Ok(());
        }

        let key = BucketNode::wrap(self.slab.as_ref(), token).key()?;
        debug!(node = %token, key_len = key.len(), "Evicting entry");
        self.remove_locked(buckets, &key)?;
        Ok(())
    }
}

impl<P: CachePolicy + fmt::Debug, S: BuildHasher> fmt::Debug for ByteArrayHashMap<P, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteArrayHashMap")
            .field("buckets", &self.buckets.read().len())
            .field("cache_policy", &self.cache_policy)
            .finish()
    }
}
