//! Size validation and human-readable size parsing

use crate::error::{Error, Result};

/// Exclusive upper bound for any single slab, allocation or configured size
pub const MAX_SIZE_BYTES: u64 = i32::MAX as u64;

/// Check that `size_bytes` fits the 31-bit offsets used inside a slab
pub fn validate_size(size_bytes: u64) -> Result<u32> {
    if size_bytes >= MAX_SIZE_BYTES {
        return Err(Error::Validation(format!(
            "size {} must be less than {}",
            size_bytes, MAX_SIZE_BYTES
        )));
    }
    Ok(size_bytes as u32)
}

/// Parse a size such as `"4096"`, `"64k"`, `"16mb"` or `"1g"`
///
/// Units are powers of 1024 and case-insensitive.
pub fn parse_size(text: &str) -> Result<u64> {
    let trimmed = text.trim().to_ascii_lowercase();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);

    if digits.is_empty() {
        return Err(Error::Validation(format!("invalid size: {:?}", text)));
    }

    let value: u64 = digits
        .parse()
        .map_err(|e| Error::Validation(format!("invalid size {:?}: {}", text, e)))?;

    let multiplier: u64 = match unit.trim() {
        "" | "b" => 1,
        "k" | "kb" => 1024,
        "m" | "mb" => 1024 * 1024,
        "g" | "gb" => 1024 * 1024 * 1024,
        other => {
            return Err(Error::Validation(format!(
                "unknown size unit {:?} in {:?}",
                other, text
            )))
        }
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| Error::Validation(format!("size overflows: {:?}", text)))
}
