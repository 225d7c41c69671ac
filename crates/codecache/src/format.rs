//! On-disk region cache file layout.
//!
//! File format (little endian, native alignment, no padding between
//! records):
//!
//! ```text
//! [ header: packed config (16B) | orig_base (8) | orig_off (8) |
//!   total_code_size (8) | num_records (8) | num_reloc_to (8) | total_reloc (8) ]
//! [ record 0: prefix (56B) | host_code[host_code_len] | relocs[relocation_size] ]
//! [ record 1: ... ] ...
//! ```
//!
//! Records are walked strictly by the header's `num_records` count; trailing
//! bytes beyond that (a torn append from a crashed writer) are ignored on
//! load and overwritten by future appends.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::CacheError;

/// Packed 16-byte form of [`crate::CacheConfig`] as stored in the header.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct PackedConfig {
    pub cookie: u64,
    pub max_inst_per_block: i32,
    /// arch in bits [0,4), smc_checks in [4,6), option flags from bit 6.
    pub bits: u32,
}

/// Fixed-size header at file offset 0.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FileHeader {
    pub config: PackedConfig,
    /// Guest virtual base of the region when the file was first built.
    pub original_base: u64,
    /// File-offset-within-the-backing-executable at first build.
    pub original_offset: u64,
    /// Total bytes of host code recorded.
    pub total_code_size: u64,
    /// Count of code records.
    pub num_records: u64,
    /// Count of relocations into this region from other regions.
    pub num_relocations_to: u64,
    /// Total count of relocations originating in this region.
    pub total_relocations: u64,
}

/// Fixed prefix of every code record.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RecordPrefix {
    /// Guest RIP offset within the region, relative to the original base.
    pub rip_offset: u64,
    /// Hash over the host code bytes.
    pub host_code_hash: u64,
    /// Host code byte length.
    pub host_code_len: u64,
    /// Number of relocation entries for this record.
    pub num_relocations: u64,
    /// Byte length of the packed relocation blob.
    pub relocation_size: u64,
    /// Hash over the guest bytes of the translated block.
    pub guest_code_hash: u64,
    /// Guest code byte length.
    pub guest_code_len: u64,
}

/// Byte size of [`FileHeader`].
pub const HEADER_SIZE: usize = size_of::<FileHeader>();
/// Byte size of [`RecordPrefix`].
pub const PREFIX_SIZE: usize = size_of::<RecordPrefix>();

impl FileHeader {
    /// Parse a header from the front of a file image.
    #[must_use]
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        Self::read_from_bytes(bytes.get(..HEADER_SIZE)?).ok()
    }

    /// The configuration the file was built under.
    #[must_use]
    pub fn cache_config(&self) -> crate::CacheConfig {
        crate::CacheConfig::unpack(&self.config)
    }
}

/// One record located inside a file image.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecordBounds {
    pub prefix: RecordPrefix,
    /// Byte offset of the host code body.
    pub host_off: usize,
    /// Byte offset of the relocation blob.
    pub reloc_off: usize,
    /// Byte offset one past the record.
    pub end: usize,
}

/// Parse the record starting at `off`, bounds-checking every segment
/// against the file image.
pub(crate) fn walk_record(data: &[u8], off: usize) -> Result<RecordBounds, CacheError> {
    let prefix_end = off
        .checked_add(PREFIX_SIZE)
        .filter(|&end| end <= data.len())
        .ok_or(CacheError::Corrupt("record prefix past end of file"))?;
    let prefix = RecordPrefix::read_from_bytes(&data[off..prefix_end])
        .map_err(|_| CacheError::Corrupt("short record prefix"))?;

    let host_len =
        usize::try_from(prefix.host_code_len).map_err(|_| CacheError::Corrupt("host code length"))?;
    let reloc_len = usize::try_from(prefix.relocation_size)
        .map_err(|_| CacheError::Corrupt("relocation blob length"))?;

    let host_off = prefix_end;
    let reloc_off = host_off
        .checked_add(host_len)
        .filter(|&end| end <= data.len())
        .ok_or(CacheError::Corrupt("host code past end of file"))?;
    let end = reloc_off
        .checked_add(reloc_len)
        .filter(|&end| end <= data.len())
        .ok_or(CacheError::Corrupt("relocation blob past end of file"))?;

    Ok(RecordBounds {
        prefix,
        host_off,
        reloc_off,
        end,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    #[test]
    fn layout_sizes_are_frozen() {
        // The on-disk layout depends on these; a change here is a format
        // version bump.
        assert_eq!(size_of::<PackedConfig>(), 16);
        assert_eq!(HEADER_SIZE, 64);
        assert_eq!(PREFIX_SIZE, 56);
    }

    #[test]
    fn walk_record_locates_segments() {
        let prefix = RecordPrefix {
            rip_offset: 0x10,
            host_code_hash: 1,
            host_code_len: 4,
            num_relocations: 0,
            relocation_size: 2,
            guest_code_hash: 2,
            guest_code_len: 3,
        };
        let mut image = vec![0u8; 8];
        image.extend_from_slice(prefix.as_bytes());
        image.extend_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd]);
        image.extend_from_slice(&[0x01, 0x02]);

        let rec = walk_record(&image, 8).unwrap();
        assert_eq!(rec.prefix.rip_offset, 0x10);
        assert_eq!(&image[rec.host_off..rec.reloc_off], &[0xaa, 0xbb, 0xcc, 0xdd]);
        assert_eq!(&image[rec.reloc_off..rec.end], &[0x01, 0x02]);
        assert_eq!(rec.end, image.len());
    }

    #[test]
    fn walk_record_rejects_truncated_segments() {
        let prefix = RecordPrefix {
            rip_offset: 0,
            host_code_hash: 0,
            host_code_len: 100,
            num_relocations: 0,
            relocation_size: 0,
            guest_code_hash: 0,
            guest_code_len: 0,
        };
        let mut image = Vec::new();
        image.extend_from_slice(prefix.as_bytes());
        image.extend_from_slice(&[0u8; 10]);

        assert!(walk_record(&image, 0).is_err());
        assert!(walk_record(&image, image.len() - 4).is_err());
    }
}
