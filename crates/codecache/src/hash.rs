//! Content hashing.
//!
//! All integrity checks in the cache use a single 64-bit XXH3 content hash,
//! over guest bytes when validating a fetched record and over host bytes
//! when recording a translation.

use xxhash_rust::xxh3::xxh3_64;

/// Hash a byte range.
#[must_use]
pub fn content_hash(bytes: &[u8]) -> u64 {
    xxh3_64(bytes)
}
