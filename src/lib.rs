// Off-heap memory - Rust Implementation
// Slab allocators and cache data structures living outside the managed heap

#![warn(rust_2018_idioms)]

pub mod cache;
pub mod config;
pub mod slab;

// Re-exports for convenience
pub use cache::{ByteArrayHashMap, CachePolicy, EvictionPredicate, LruCachePolicy};
pub use config::MemoryConfig;
pub use slab::{
    Address, Allocation, AllocationContext, ManagedSlab, OffHeapSlab, RawSlab, ShardedSlab,
    ShardedSlabPool, Slab,
};

/// Off-heap memory error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum Error {
        #[error("Allocation failed: {0}")]
        Allocation(String),

        #[error("Invalid state: {0}")]
        InvalidState(String),

        #[error("Validation failed: {0}")]
        Validation(String),

        #[error("Internal consistency failure: {0}")]
        InternalConsistency(String),

        #[error("Unsupported operation: {0}")]
        Unsupported(String),

        #[error("Configuration error: {0}")]
        Config(String),
    }

    impl Error {
        /// True for failures a fallback allocation policy may retry elsewhere
        pub fn is_allocation_failure(&self) -> bool {
            matches!(self, Error::Allocation(_))
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::error::Error;
    use super::*;

    #[test]
    fn test_version_format() {
        let _version: &str = VERSION;
    }

    #[test]
    fn test_allocation_failure_classification() {
        assert!(Error::Allocation("full".into()).is_allocation_failure());
        assert!(!Error::InvalidState("freed".into()).is_allocation_failure());
        assert!(!Error::Validation("too big".into()).is_allocation_failure());
    }
}
