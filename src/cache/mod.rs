//! Off-heap cache structures
//!
//! A byte-array hash map whose buckets, entries and LRU list all live in
//! slab memory. The only on-heap state is the bucket table and a few list
//! heads.
//!
//! ```text
//! buckets: [hdr | NONE | hdr | ...]           (on heap)
//!            │            │
//!            ▼            ▼
//!          node ─→ node  node                 (slab)
//!           │  └─→ value bytes
//!           └─ annotation ─→ LRU entry ⇄ LRU entry ⇄ ...
//! ```

pub mod bucket;
pub mod byte_array;
pub mod entry;
pub mod eviction;
pub mod hash_map;
pub mod lru;

pub use bucket::{BucketNode, LinkedListBucket, PutOutcome};
pub use byte_array::OffHeapByteArray;
pub use entry::OffHeapCacheEntry;
pub use eviction::EvictionPredicate;
pub use hash_map::ByteArrayHashMap;
pub use lru::{CachePolicy, CachePolicyKey, LruCachePolicy};
