//! Deterministic hashing for shard and bucket selection

/// Hasher builder used when none is supplied
pub type DefaultDigest = ahash::RandomState;

const SEEDS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];

/// Fixed-seed hasher builder, stable across runs of the same build
pub fn default_digest() -> DefaultDigest {
    ahash::RandomState::with_seeds(SEEDS[0], SEEDS[1], SEEDS[2], SEEDS[3])
}
