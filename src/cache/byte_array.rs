//! Length-prefixed byte arrays in slab memory

use crate::error::{Error, Result};
use crate::slab::{validate_size, Address, Slab};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Bytes taken by the length prefix
pub const LENGTH_PREFIX_BYTES: u64 = 4;

/// View of `[length: u32][bytes]` stored at `address`
///
/// Equality and hashing are by content.
#[derive(Clone, Copy)]
pub struct OffHeapByteArray<'a> {
    slab: &'a dyn Slab,
    address: Address,
    length: u32,
}

impl<'a> OffHeapByteArray<'a> {
    /// Allocate a zero-filled array of `length` bytes
    pub fn allocate(slab: &'a dyn Slab, length: u32) -> Result<Self> {
        let address = slab.allocate(LENGTH_PREFIX_BYTES + length as u64)?;
        slab.put_u32(address, length)?;
        slab.put(address.offset(LENGTH_PREFIX_BYTES), &vec![0u8; length as usize])?;
        Ok(Self {
            slab,
            address,
            length,
        })
    }

    /// Copy `bytes` into a new array
    pub fn from_bytes(slab: &'a dyn Slab, bytes: &[u8]) -> Result<Self> {
        let length = validate_size(bytes.len() as u64)?;
        let address = slab.allocate(LENGTH_PREFIX_BYTES + length as u64)?;
        slab.put_u32(address, length)?;
        slab.put(address.offset(LENGTH_PREFIX_BYTES), bytes)?;
        Ok(Self {
            slab,
            address,
            length,
        })
    }

    /// View an existing array
    pub fn wrap(slab: &'a dyn Slab, address: Address) -> Result<Self> {
        if address.is_none() {
            return Err(Error::Validation("cannot wrap a null byte array".into()));
        }
        let length = slab.get_u32(address)?;
        Ok(Self {
            slab,
            address,
            length,
        })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn len(&self) -> u32 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Bytes occupied in the slab, prefix included
    pub fn size(&self) -> u64 {
        LENGTH_PREFIX_BYTES + self.length as u64
    }

    pub fn get(&self, position: u32) -> Result<u8> {
        self.check_position(position)?;
        self.slab.get_byte(self.data().offset(position as u64))
    }

    pub fn put(&self, position: u32, value: u8) -> Result<()> {
        self.check_position(position)?;
        self.slab.put_byte(self.data().offset(position as u64), value)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        self.slab.read_vec(self.data(), self.length as usize)
    }

    pub fn content_equals(&self, bytes: &[u8]) -> Result<bool> {
        if bytes.len() != self.length as usize {
            return Ok(false);
        }
        Ok(self.to_vec()? == bytes)
    }

    /// Return the array's memory to the slab
    pub fn free(self) -> Result<()> {
        self.slab.free(self.address, self.size())
    }

    fn data(&self) -> Address {
        self.address.offset(LENGTH_PREFIX_BYTES)
    }

    fn check_position(&self, position: u32) -> Result<()> {
        if position >= self.length {
            return Err(Error::Validation(format!(
                "position {} out of bounds for array of {} bytes",
                position, self.length
            )));
        }
        Ok(())
    }
}

impl PartialEq for OffHeapByteArray<'_> {
    fn eq(&self, other: &Self) -> bool {
        if self.length != other.length {
            return false;
        }
        match (self.to_vec(), other.to_vec()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for OffHeapByteArray<'_> {}

impl Hash for OffHeapByteArray<'_> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Unreadable arrays hash as empty
        self.to_vec().unwrap_or_default().hash(state);
    }
}

impl fmt::Debug for OffHeapByteArray<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OffHeapByteArray")
            .field("address", &self.address)
            .field("length", &self.length)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slab::new_managed_slab;
    use std::collections::HashSet;

    #[test]
    fn test_round_trip() -> Result<()> {
        let slab = new_managed_slab(4096)?;
        let array = OffHeapByteArray::from_bytes(&slab, b"hello world")?;

        assert_eq!(array.len(), 11);
        assert_eq!(array.get(4)?, b'o');
        assert_eq!(array.to_vec()?, b"hello world".to_vec());
        assert_eq!(slab.used(), 15);

        let wrapped = OffHeapByteArray::wrap(&slab, array.address())?;
        assert_eq!(wrapped.to_vec()?, b"hello world".to_vec());

        array.free()?;
        assert_eq!(slab.used(), 0);
        Ok(())
    }

    #[test]
    fn test_bounds_and_mutation() -> Result<()> {
        let slab = new_managed_slab(1024)?;
        let array = OffHeapByteArray::allocate(&slab, 3)?;

        assert_eq!(array.to_vec()?, vec![0, 0, 0]);
        array.put(2, 9)?;
        assert_eq!(array.get(2)?, 9);
        assert!(matches!(array.get(3), Err(Error::Validation(_))));
        assert!(OffHeapByteArray::wrap(&slab, Address::NONE).is_err());
        Ok(())
    }

    #[test]
    fn test_content_equality() -> Result<()> {
        let slab = new_managed_slab(1024)?;
        let a = OffHeapByteArray::from_bytes(&slab, b"same")?;
        let b = OffHeapByteArray::from_bytes(&slab, b"same")?;
        let c = OffHeapByteArray::from_bytes(&slab, b"diff")?;

        assert_ne!(a.address(), b.address());
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.content_equals(b"same")?);
        assert!(!a.content_equals(b"sam")?);

        let set: HashSet<_> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);

        let empty = OffHeapByteArray::from_bytes(&slab, b"")?;
        assert!(empty.is_empty());
        assert_eq!(empty.size(), LENGTH_PREFIX_BYTES);
        Ok(())
    }
}
