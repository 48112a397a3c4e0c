//! Separate-chaining buckets in slab memory
//!
//! ```text
//! bucket header:  [head: u64][size: u32]
//! node:           [next: u64][annotation: u64][value: u64][key_len: u32][key bytes]
//! value:          [len: u32][bytes]           (separate allocation)
//! ```
//!
//! New nodes are linked at the head of the chain. Keys are always compared
//! byte for byte, so colliding hashes only cost a longer walk.

use super::byte_array::OffHeapByteArray;
use crate::error::{Error, Result};
use crate::slab::{validate_size, Address, Slab};

const NEXT_OFFSET: u64 = 0;
const ANNOTATION_OFFSET: u64 = 8;
const VALUE_OFFSET: u64 = 16;
const KEY_LENGTH_OFFSET: u64 = 24;
const KEY_OFFSET: u64 = 28;

/// Node bytes before the key
pub const NODE_HEADER_BYTES: u64 = KEY_OFFSET;

const HEAD_OFFSET: u64 = 0;
const SIZE_OFFSET: u64 = 8;

/// Bytes of a bucket header
pub const BUCKET_HEADER_BYTES: u64 = 12;

/// One key/value entry of a chain
#[derive(Debug, Clone, Copy)]
pub struct BucketNode<'a> {
    slab: &'a dyn Slab,
    address: Address,
}

impl<'a> BucketNode<'a> {
    /// Allocate a node holding copies of `key` and `value`
    pub fn create(slab: &'a dyn Slab, key: &[u8], value: &[u8]) -> Result<Self> {
        let key_length = validate_size(key.len() as u64)?;
        let value = OffHeapByteArray::from_bytes(slab, value)?;

        let address = match slab.allocate(NODE_HEADER_BYTES + key_length as u64) {
            Ok(address) => address,
            Err(e) => {
                value.free()?;
                return Err(e);
            }
        };

        slab.put_address(address.offset(NEXT_OFFSET), Address::NONE)?;
        slab.put_address(address.offset(ANNOTATION_OFFSET), Address::NONE)?;
        slab.put_address(address.offset(VALUE_OFFSET), value.address())?;
        slab.put_u32(address.offset(KEY_LENGTH_OFFSET), key_length)?;
        slab.put(address.offset(KEY_OFFSET), key)?;

        Ok(Self { slab, address })
    }

    pub fn wrap(slab: &'a dyn Slab, address: Address) -> Self {
        Self { slab, address }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn next(&self) -> Result<Address> {
        self.slab.get_address(self.address.offset(NEXT_OFFSET))
    }

    pub fn set_next(&self, next: Address) -> Result<()> {
        self.slab.put_address(self.address.offset(NEXT_OFFSET), next)
    }

    /// Cache policy key of this entry
    pub fn annotation(&self) -> Result<Address> {
        self.slab.get_address(self.address.offset(ANNOTATION_OFFSET))
    }

    pub fn set_annotation(&self, annotation: Address) -> Result<()> {
        self.slab
            .put_address(self.address.offset(ANNOTATION_OFFSET), annotation)
    }

    pub fn value(&self) -> Result<OffHeapByteArray<'a>> {
        let address = self.slab.get_address(self.address.offset(VALUE_OFFSET))?;
        OffHeapByteArray::wrap(self.slab, address)
    }

    fn set_value(&self, value: &OffHeapByteArray<'_>) -> Result<()> {
        self.slab
            .put_address(self.address.offset(VALUE_OFFSET), value.address())
    }

    pub fn key_length(&self) -> Result<u32> {
        self.slab.get_u32(self.address.offset(KEY_LENGTH_OFFSET))
    }

    pub fn key(&self) -> Result<Vec<u8>> {
        let length = self.key_length()?;
        self.slab
            .read_vec(self.address.offset(KEY_OFFSET), length as usize)
    }

    pub fn key_equals(&self, key: &[u8]) -> Result<bool> {
        if self.key_length()? as usize != key.len() {
            return Ok(false);
        }
        Ok(self.key()? == key)
    }

    /// Free the value and then the node itself
    pub fn free(self) -> Result<()> {
        let key_length = self.key_length()?;
        self.value()?.free()?;
        self.slab
            .free(self.address, NODE_HEADER_BYTES + key_length as u64)
    }
}

/// Result of [`LinkedListBucket::put`]
#[derive(Debug, Clone, Copy)]
pub enum PutOutcome<'a> {
    /// A new node was linked at the head
    Inserted(BucketNode<'a>),
    /// The key existed; its value was swapped in place
    Replaced(BucketNode<'a>),
}

impl<'a> PutOutcome<'a> {
    pub fn node(&self) -> BucketNode<'a> {
        match self {
            PutOutcome::Inserted(node) | PutOutcome::Replaced(node) => *node,
        }
    }
}

/// A chain of nodes hanging off a slab-resident header
#[derive(Debug, Clone, Copy)]
pub struct LinkedListBucket<'a> {
    slab: &'a dyn Slab,
    address: Address,
}

impl<'a> LinkedListBucket<'a> {
    /// Allocate an empty bucket header
    pub fn create(slab: &'a dyn Slab) -> Result<Self> {
        let address = slab.allocate(BUCKET_HEADER_BYTES)?;
        slab.put_address(address.offset(HEAD_OFFSET), Address::NONE)?;
        slab.put_u32(address.offset(SIZE_OFFSET), 0)?;
        Ok(Self { slab, address })
    }

    pub fn wrap(slab: &'a dyn Slab, address: Address) -> Result<Self> {
        if address.is_none() {
            return Err(Error::Validation("cannot wrap a null bucket".into()));
        }
        Ok(Self { slab, address })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn head(&self) -> Result<Address> {
        self.slab.get_address(self.address.offset(HEAD_OFFSET))
    }

    fn set_head(&self, head: Address) -> Result<()> {
        self.slab.put_address(self.address.offset(HEAD_OFFSET), head)
    }

    pub fn len(&self) -> Result<u32> {
        self.slab.get_u32(self.address.offset(SIZE_OFFSET))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.head()?.is_none())
    }

    fn set_len(&self, len: u32) -> Result<()> {
        self.slab.put_u32(self.address.offset(SIZE_OFFSET), len)
    }

    pub fn find(&self, key: &[u8]) -> Result<Option<BucketNode<'a>>> {
        let mut current = self.head()?;
        while !current.is_none() {
            let node = BucketNode::wrap(self.slab, current);
            if node.key_equals(key)? {
                return Ok(Some(node));
            }
            current = node.next()?;
        }
        Ok(None)
    }

    /// Insert `key` or replace its value
    ///
    /// On replacement the new value is written before the old one is freed,
    /// and the node keeps its address.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<PutOutcome<'a>> {
        if let Some(node) = self.find(key)? {
            let old_value = node.value()?;
            let new_value = OffHeapByteArray::from_bytes(self.slab, value)?;
            node.set_value(&new_value)?;
            old_value.free()?;
            return Ok(PutOutcome::Replaced(node));
        }

        let node = BucketNode::create(self.slab, key, value)?;
        node.set_next(self.head()?)?;
        self.set_head(node.address())?;
        self.set_len(self.len()? + 1)?;
        Ok(PutOutcome::Inserted(node))
    }

    /// Unlink and free the node for `key`, returning its annotation
    pub fn remove(&self, key: &[u8]) -> Result<Option<Address>> {
        let mut previous: Option<BucketNode<'a>> = None;
        let mut current = self.head()?;

        while !current.is_none() {
            let node = BucketNode::wrap(self.slab, current);
            let next = node.next()?;

            if node.key_equals(key)? {
                match previous {
                    Some(previous) => previous.set_next(next)?,
                    None => self.set_head(next)?,
                }
                self.set_len(self.len()?.saturating_sub(1))?;

                let annotation = node.annotation()?;
                node.free()?;
                return Ok(Some(annotation));
            }

            previous = Some(node);
            current = next;
        }
        Ok(None)
    }

    /// Free every node, returning their annotations
    pub fn clear(&self) -> Result<Vec<Address>> {
        let mut annotations = Vec::with_capacity(self.len()? as usize);
        let mut current = self.head()?;
        while !current.is_none() {
            let node = BucketNode::wrap(self.slab, current);
            current = node.next()?;
            annotations.push(node.annotation()?);
            node.free()?;
        }
        self.set_head(Address::NONE)?;
        self.set_len(0)?;
        Ok(annotations)
    }

    /// Free the header; nodes must have been cleared first
    pub fn free(self) -> Result<()> {
        if !self.head()?.is_none() {
            return Err(Error::InvalidState(format!(
                "bucket at {} still has entries",
                self.address
            )));
        }
        self.slab.free(self.address, BUCKET_HEADER_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slab::new_managed_slab;

    #[test]
    fn test_put_find_remove() -> Result<()> {
        let slab = new_managed_slab(64 * 1024)?;
        let bucket = LinkedListBucket::create(&slab)?;

        assert!(matches!(bucket.put(b"a", b"1")?, PutOutcome::Inserted(_)));
        assert!(matches!(bucket.put(b"b", b"2")?, PutOutcome::Inserted(_)));
        assert!(matches!(bucket.put(b"c", b"3")?, PutOutcome::Inserted(_)));
        assert_eq!(bucket.len()?, 3);

        // Head insertion
        assert_eq!(BucketNode::wrap(&slab, bucket.head()?).key()?, b"c".to_vec());

        let node = bucket.find(b"b")?.unwrap();
        assert_eq!(node.value()?.to_vec()?, b"2".to_vec());
        assert!(bucket.find(b"z")?.is_none());

        // Middle, head, tail
        assert!(bucket.remove(b"b")?.is_some());
        assert!(bucket.remove(b"c")?.is_some());
        assert!(bucket.remove(b"missing")?.is_none());
        assert_eq!(bucket.len()?, 1);
        assert!(bucket.remove(b"a")?.is_some());
        assert!(bucket.is_empty()?);

        bucket.free()?;
        assert_eq!(slab.used(), 0);
        Ok(())
    }

    #[test]
    fn test_replace_keeps_node() -> Result<()> {
        let slab = new_managed_slab(64 * 1024)?;
        let bucket = LinkedListBucket::create(&slab)?;

        let inserted = bucket.put(b"key", b"short")?.node();
        inserted.set_annotation(Address::new(0x1234))?;
        let used = slab.used();

        let replaced = bucket.put(b"key", b"a much longer value")?;
        assert!(matches!(replaced, PutOutcome::Replaced(_)));
        assert_eq!(replaced.node().address(), inserted.address());
        assert_eq!(replaced.node().annotation()?, Address::new(0x1234));
        assert_eq!(
            bucket.find(b"key")?.unwrap().value()?.to_vec()?,
            b"a much longer value".to_vec()
        );
        // Old value freed, new one allocated
        assert_eq!(slab.used(), used - 5 + 19);
        assert_eq!(bucket.len()?, 1);
        Ok(())
    }

    #[test]
    fn test_prefix_keys_are_distinct() -> Result<()> {
        let slab = new_managed_slab(64 * 1024)?;
        let bucket = LinkedListBucket::create(&slab)?;

        bucket.put(b"ab", b"1")?;
        bucket.put(b"abc", b"2")?;

        assert_eq!(bucket.find(b"ab")?.unwrap().value()?.to_vec()?, b"1".to_vec());
        assert_eq!(bucket.find(b"abc")?.unwrap().value()?.to_vec()?, b"2".to_vec());
        assert!(bucket.find(b"a")?.is_none());
        Ok(())
    }

    #[test]
    fn test_clear_returns_annotations() -> Result<()> {
        let slab = new_managed_slab(64 * 1024)?;
        let bucket = LinkedListBucket::create(&slab)?;

        for (i, key) in [b"x", b"y", b"z"].iter().enumerate() {
            bucket
                .put(*key, b"v")?
                .node()
                .set_annotation(Address::new(i as u64 + 1))?;
        }

        let mut annotations = bucket.clear()?;
        annotations.sort();
        assert_eq!(
            annotations,
            vec![Address::new(1), Address::new(2), Address::new(3)]
        );
        assert!(bucket.is_empty()?);
        bucket.free()?;
        assert_eq!(slab.used(), 0);
        Ok(())
    }

    #[test]
    fn test_failed_node_allocation_frees_value() -> Result<()> {
        // Room for the value array but not the node
        let slab = new_managed_slab(64)?;
        let err = BucketNode::create(&slab, &[0u8; 40], b"0123456789").unwrap_err();

        assert!(err.is_allocation_failure());
        assert_eq!(slab.used(), 0);
        Ok(())
    }
}
