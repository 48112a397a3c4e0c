//! Memory configuration
//!
//! Loaded from an optional TOML file with `OFFHEAP_`-prefixed environment
//! overrides (`OFFHEAP_SLAB__SHARDS=4`), or parsed from a TOML string.
//!
//! ```toml
//! [slab]
//! shards = 16
//! shard_size = "16mb"
//! tlab_size = "1mb"
//! policy = "dual"
//!
//! [map]
//! buckets = 65536
//! max_used_bytes = "200mb"
//! ```

use crate::cache::{ByteArrayHashMap, EvictionPredicate};
use crate::error::{Error, Result};
use crate::slab::{
    parse_size, validate_size, ManagedSlabFactory, PolicyKind, ShardedSlab, ShardedSlabPool,
    Slab, SynchronizedSlabFactory, ThreadLocalSlab,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "OFFHEAP";

const DEFAULT_SHARDS: usize = 16;
const DEFAULT_SHARD_SIZE: u64 = 16 * 1024 * 1024;
const DEFAULT_TLAB_SIZE: u64 = 1024 * 1024;
const DEFAULT_BUCKETS: usize = 65536;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub slab: SlabConfig,
    pub map: MapConfig,
}

/// Slab stack configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlabConfig {
    /// Total bytes over all shards; derived from `shard_size` when absent
    #[serde(deserialize_with = "deserialize_optional_size")]
    pub total_size: Option<u64>,

    pub shards: usize,

    #[serde(deserialize_with = "deserialize_optional_size")]
    pub shard_size: Option<u64>,

    /// Per-shard reservation for in-place growth
    #[serde(deserialize_with = "deserialize_optional_size")]
    pub shard_reserve: Option<u64>,

    /// Thread-local buffer size, 0 disables buffers
    #[serde(deserialize_with = "deserialize_size")]
    pub tlab_size: u64,

    pub policy: PolicyKind,

    /// Serialize each shard behind a mutex
    pub synchronized: bool,
}

impl Default for SlabConfig {
    fn default() -> Self {
        Self {
            total_size: None,
            shards: DEFAULT_SHARDS,
            shard_size: None,
            shard_reserve: None,
            tlab_size: DEFAULT_TLAB_SIZE,
            policy: PolicyKind::default(),
            synchronized: false,
        }
    }
}

impl SlabConfig {
    /// Effective size of one shard
    pub fn shard_size_bytes(&self) -> u64 {
        match (self.shard_size, self.total_size) {
            (Some(shard_size), _) => shard_size,
            (None, Some(total)) => total / self.shards.max(1) as u64,
            (None, None) => DEFAULT_SHARD_SIZE,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.shards == 0 {
            return Err(Error::Validation("slab.shards must be at least 1".into()));
        }

        let shard_size = self.shard_size_bytes();
        check_size("slab.shard_size", shard_size)?;
        if shard_size == 0 {
            return Err(Error::Validation("slab.shard_size must be positive".into()));
        }

        if let Some(total) = self.total_size {
            check_size("slab.total_size", total)?;
            if self.shard_size.is_some() && total != shard_size * self.shards as u64 {
                return Err(Error::Validation(format!(
                    "slab.total_size {} != {} shards * {} bytes",
                    total, self.shards, shard_size
                )));
            }
        }

        if let Some(reserve) = self.shard_reserve {
            check_size("slab.shard_reserve", reserve)?;
            if reserve < shard_size {
                return Err(Error::Validation(format!(
                    "slab.shard_reserve {} smaller than shard size {}",
                    reserve, shard_size
                )));
            }
        }

        check_size("slab.tlab_size", self.tlab_size)?;
        if self.tlab_size > shard_size {
            return Err(Error::Validation(format!(
                "slab.tlab_size {} larger than shard size {}",
                self.tlab_size, shard_size
            )));
        }
        Ok(())
    }
}

/// Hash map configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapConfig {
    pub buckets: usize,

    /// Evict while the slab uses more than this many bytes
    #[serde(deserialize_with = "deserialize_optional_size")]
    pub max_used_bytes: Option<u64>,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            buckets: DEFAULT_BUCKETS,
            max_used_bytes: None,
        }
    }
}

impl MemoryConfig {
    /// Load from an optional file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: MemoryConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;

        info!(
            shards = config.slab.shards,
            shard_size = config.slab.shard_size_bytes(),
            policy = ?config.slab.policy,
            "Loaded memory configuration"
        );
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: MemoryConfig =
            toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.slab.validate()?;

        if self.map.buckets == 0 {
            return Err(Error::Validation("map.buckets must be at least 1".into()));
        }
        check_size("map.buckets", self.map.buckets as u64)?;
        if let Some(limit) = self.map.max_used_bytes {
            check_size("map.max_used_bytes", limit)?;
        }
        Ok(())
    }

    /// Assemble the configured slab stack
    ///
    /// ```text
    /// ThreadLocalSlab (tlab_size > 0)
    ///   └─→ ShardedSlab(policy)
    ///        └─→ shards × [SynchronizedSlab] ManagedSlab
    /// ```
    pub fn build_slab(&self) -> Result<Arc<dyn Slab>> {
        self.validate()?;

        let shard_size = self.slab.shard_size_bytes();
        let managed = match self.slab.shard_reserve {
            Some(reserve) => ManagedSlabFactory::with_reserve(reserve),
            None => ManagedSlabFactory::new(),
        };
        let pool = if self.slab.synchronized {
            ShardedSlabPool::create(
                &SynchronizedSlabFactory::new(managed),
                self.slab.shards,
                shard_size,
            )?
        } else {
            ShardedSlabPool::create(&managed, self.slab.shards, shard_size)?
        };

        let sharded: Arc<dyn Slab> = Arc::new(ShardedSlab::new(Arc::new(pool), self.slab.policy));
        if self.slab.tlab_size == 0 {
            return Ok(sharded);
        }
        Ok(Arc::new(ThreadLocalSlab::new(self.slab.tlab_size, sharded)))
    }

    /// Build a map over `slab`
    ///
    /// Without an explicit predicate, `map.max_used_bytes` bounds slab usage
    /// if set; otherwise nothing is ever evicted.
    pub fn build_map(
        &self,
        slab: Arc<dyn Slab>,
        predicate: Option<EvictionPredicate>,
    ) -> Result<ByteArrayHashMap> {
        let predicate = match (predicate, self.map.max_used_bytes) {
            (Some(predicate), _) => predicate,
            (None, Some(limit)) => EvictionPredicate::max_used_bytes(slab.clone(), limit),
            (None, None) => EvictionPredicate::never(),
        };
        ByteArrayHashMap::new(slab, self.map.buckets, predicate)
    }
}

fn check_size(field: &str, size: u64) -> Result<()> {
    validate_size(size)
        .map(|_| ())
        .map_err(|e| Error::Validation(format!("{}: {}", field, e)))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SizeValue {
    Number(u64),
    String(String),
}

impl SizeValue {
    fn bytes(self) -> Result<u64> {
        match self {
            SizeValue::Number(n) => Ok(n),
            SizeValue::String(s) => parse_size(&s),
        }
    }
}

fn deserialize_size<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    SizeValue::deserialize(deserializer)?
        .bytes()
        .map_err(D::Error::custom)
}

fn deserialize_optional_size<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    Option::<SizeValue>::deserialize(deserializer)?
        .map(SizeValue::bytes)
        .transpose()
        .map_err(D::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slab::MAX_SIZE_BYTES;

    #[test]
    fn test_defaults() -> Result<()> {
        let config = MemoryConfig::from_toml_str("")?;

        assert_eq!(config.slab.shards, 16);
        assert_eq!(config.slab.shard_size_bytes(), 16 * 1024 * 1024);
        assert_eq!(config.slab.tlab_size, 1024 * 1024);
        assert_eq!(config.slab.policy, PolicyKind::Dual);
        assert_eq!(config.map.buckets, 65536);
        Ok(())
    }

    #[test]
    fn test_sizes_with_units() -> Result<()> {
        let config = MemoryConfig::from_toml_str(
            r#"
            [slab]
            total_size = "64mb"
            shards = 4
            shard_size = "16MB"
            shard_reserve = 33554432
            tlab_size = "64k"
            policy = "most_free_space"
            synchronized = true

            [map]
            buckets = 1024
            max_used_bytes = "1g"
            "#,
        )?;

        assert_eq!(config.slab.total_size, Some(64 * 1024 * 1024));
        assert_eq!(config.slab.shard_reserve, Some(32 * 1024 * 1024));
        assert_eq!(config.slab.tlab_size, 64 * 1024);
        assert_eq!(config.slab.policy, PolicyKind::MostFreeSpace);
        assert!(config.slab.synchronized);
        assert_eq!(config.map.max_used_bytes, Some(1024 * 1024 * 1024));
        Ok(())
    }

    #[test]
    fn test_total_size_derives_shard_size() -> Result<()> {
        let config = MemoryConfig::from_toml_str(
            r#"
            [slab]
            total_size = "8mb"
            shards = 8
            "#,
        )?;
        assert_eq!(config.slab.shard_size_bytes(), 1024 * 1024);
        Ok(())
    }

    #[test]
    fn test_validation_failures() {
        let cases = [
            "[slab]\nshards = 0",
            "[map]\nbuckets = 0",
            "[slab]\nshard_size = \"2g\"",
            "[slab]\ntotal_size = \"64mb\"\nshards = 2\nshard_size = \"16mb\"",
            "[slab]\nshard_size = \"1mb\"\nshard_reserve = \"512k\"",
            "[slab]\nshard_size = \"1mb\"\ntlab_size = \"2mb\"",
        ];
        for case in cases {
            assert!(
                matches!(MemoryConfig::from_toml_str(case), Err(Error::Validation(_))),
                "accepted: {}",
                case
            );
        }

        let mut config = MemoryConfig::default();
        config.map.max_used_bytes = Some(MAX_SIZE_BYTES);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            MemoryConfig::from_toml_str("[slab]\ntlab_size = \"12 parsecs\""),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            MemoryConfig::from_toml_str("[slab]\npolicy = \"random\""),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_load_from_file() -> Result<()> {
        let path = std::env::temp_dir().join(format!("offheap-config-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            "[slab]\nshards = 3\nshard_size = \"1mb\"\ntlab_size = 0\n",
        )
        .map_err(|e| Error::Config(e.to_string()))?;

        let config = MemoryConfig::load(Some(&path));
        let _ = std::fs::remove_file(&path);
        let config = config?;

        assert_eq!(config.slab.shards, 3);
        assert_eq!(config.slab.shard_size_bytes(), 1024 * 1024);
        assert_eq!(config.slab.tlab_size, 0);
        Ok(())
    }

    #[test]
    fn test_build_stack() -> Result<()> {
        let config = MemoryConfig::from_toml_str(
            r#"
            [slab]
            shards = 2
            shard_size = "256k"
            tlab_size = "4k"

            [map]
            buckets = 64
            "#,
        )?;

        let slab = config.build_slab()?;
        assert_eq!(slab.size()?, 512 * 1024);

        let map = config.build_map(slab.clone(), None)?;
        map.put(b"hello", b"world")?;
        assert_eq!(map.get(b"hello")?, Some(b"world".to_vec()));
        assert_eq!(map.bucket_count(), 64);

        assert!(slab.used() > 0);
        Ok(())
    }
}
