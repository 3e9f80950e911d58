//! # Key-Space Enumeration
//!
//! The canonical bijection between `[0, base^length)` and the set of
//! strings of `length` characters over a charset: base-N positional
//! encoding with the least-significant character at the rightmost position.

use crate::types::{FabricError, FabricResult};

/// Map an index to its combination.
pub fn index_to_combination(mut idx: u64, charset: &[char], length: usize) -> String {
    let base = charset.len() as u64;
    let mut result = vec![charset[0]; length];
    for pos in (0..length).rev() {
        result[pos] = charset[(idx % base) as usize];
        idx /= base;
    }
    result.into_iter().collect()
}

/// Total size of the key space, refusing spaces that overflow u64.
pub fn total_combinations(charset_len: usize, length: usize) -> FabricResult<u64> {
    let base = charset_len as u64;
    if base < 2 {
        return Err(FabricError::bad_request("charset needs at least 2 characters"));
    }
    if length == 0 {
        return Err(FabricError::bad_request("length must be at least 1"));
    }
    let mut total: u64 = 1;
    for _ in 0..length {
        total = total
            .checked_mul(base)
            .ok_or_else(|| FabricError::bad_request("key space exceeds u64 range"))?;
    }
    Ok(total)
}
