//! Absolute addresses into slab memory

use serde::{Deserialize, Serialize};
use std::fmt;

/// An absolute address in the process address space
///
/// Slab memory is never exposed as Rust references; structures stored in a
/// slab link to each other through `Address` values read and written with
/// [`RawSlab::get_address`](super::RawSlab::get_address) and friends.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Address(u64);

impl Address {
    /// The "no address" sentinel
    pub const NONE: Address = Address(0);

    /// Bytes occupied by an address stored in slab memory
    pub const SIZE: u64 = 8;

    pub const fn new(raw: u64) -> Self {
        Address(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` past this one
    pub(crate) const fn offset(self, bytes: u64) -> Address {
        Address(self.0 + bytes)
    }

    /// Distance from `base` up to this address, `None` when below `base`
    pub(crate) fn distance_from(self, base: Address) -> Option<u64> {
        self.0.checked_sub(base.0)
    }

    pub(crate) fn from_ptr(ptr: *const u8) -> Address {
        Address(ptr as usize as u64)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
