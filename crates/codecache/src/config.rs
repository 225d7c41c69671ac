//! Translator configuration fingerprint and cache service options.
//!
//! A cache file is only valid for one host-arch/translator-config
//! combination. The fingerprint packs every codegen-affecting option into a
//! 128-bit value stored in the file header; any field mismatch on load
//! invalidates the file. The fingerprint hash (which skips the cookie)
//! additionally distinguishes same-named files produced under different
//! settings through the on-disk file name.

use std::path::PathBuf;

use bitflags::bitflags;

use crate::format::PackedConfig;

/// Current on-disk format version. Increment whenever code emission or the
/// file layout changes.
const FORMAT_VERSION: u32 = 0;

/// Format-version cookie baked into every file header.
pub const CACHE_COOKIE: u64 = pack_cookie(*b"AOTC", FORMAT_VERSION);

const fn pack_cookie(tag: [u8; 4], version: u32) -> u64 {
    ((u32::from_le_bytes(tag) as u64) << 32) | version as u64
}

bitflags! {
    /// Boolean codegen options that participate in the fingerprint.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ConfigFlags: u32 {
        /// Multiblock translation enabled
        const MULTIBLOCK = 1 << 0;
        /// TSO memory-model emulation enabled
        const TSO = 1 << 1;
        /// ABI local-flags unsafe optimization
        const ABI_LOCAL_FLAGS = 1 << 2;
        /// ABI no-PF unsafe optimization
        const ABI_NO_PF = 1 << 3;
        /// Static register allocation enabled
        const STATIC_REGISTER_ALLOCATION = 1 << 4;
        /// Paranoid TSO mode enabled
        const PARANOID_TSO = 1 << 5;
        /// 64-bit guest execution mode
        const MODE_64BIT = 1 << 6;
    }
}

/// Codegen configuration fingerprint.
///
/// Two fingerprints match iff every field matches; the cookie alone gates
/// the file format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Format-version cookie; a mismatch unconditionally rejects a file.
    pub cookie: u64,
    /// Maximum guest instructions translated per block.
    pub max_inst_per_block: i32,
    /// Host architecture id, 4 bits.
    pub arch: u8,
    /// Self-modifying-code check style, 2 bits.
    pub smc_checks: u8,
    /// Boolean codegen options.
    pub flags: ConfigFlags,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cookie: CACHE_COOKIE,
            max_inst_per_block: 0,
            arch: 0,
            smc_checks: 0,
            flags: ConfigFlags::empty(),
        }
    }
}

impl CacheConfig {
    /// 64-bit fingerprint hash used in cache file names.
    ///
    /// Packs every field except the cookie, each by its real bit width. The
    /// result is stable for the life of a configuration and only serves to
    /// keep differently-configured caches in differently-named files; the
    /// header comparison on load is the authoritative match check.
    #[must_use]
    pub fn hash(&self) -> u64 {
        let mut hash = 0u64;
        hash = (hash << 32) | u64::from(self.max_inst_per_block as u32);
        hash = (hash << 4) | u64::from(self.arch & 0xF);
        hash = (hash << 2) | u64::from(self.smc_checks & 0x3);
        hash = (hash << 7) | u64::from(self.flags.bits() & 0x7F);
        hash
    }

    pub(crate) fn pack(&self) -> PackedConfig {
        PackedConfig {
            cookie: self.cookie,
            max_inst_per_block: self.max_inst_per_block,
            bits: u32::from(self.arch & 0xF)
                | (u32::from(self.smc_checks & 0x3) << 4)
                | (self.flags.bits() << 6),
        }
    }

    pub(crate) fn unpack(packed: &PackedConfig) -> Self {
        Self {
            cookie: packed.cookie,
            max_inst_per_block: packed.max_inst_per_block,
            arch: (packed.bits & 0xF) as u8,
            smc_checks: ((packed.bits >> 4) & 0x3) as u8,
            flags: ConfigFlags::from_bits_truncate(packed.bits >> 6),
        }
    }
}

/// What the service is allowed to do with cache files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Service is inert; every operation is a no-op.
    Disabled,
    /// Load and fetch existing caches, never create or write files.
    ReadOnly,
    /// Full read/write operation.
    #[default]
    ReadWrite,
}

/// Policy for an add-region job that collides with a region whose load has
/// not completed yet. The colliding add is a guest programming error either
/// way; the policy only decides how loud the cache is about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OvermapPolicy {
    /// Log and discard the new add; the original load continues.
    #[default]
    Drop,
    /// Panic. For embedders who want the error to surface immediately.
    Panic,
}

/// Cache service options.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Directory holding the per-region cache files; created on first use.
    pub cache_dir: PathBuf,
    /// Read/write mode.
    pub mode: CacheMode,
    /// Behavior when an add overlaps a still-loading region.
    pub overmap_during_load: OvermapPolicy,
    /// Whether a forked child restarts the cache service. When false the
    /// child clears all state and stays disabled.
    pub service_after_fork: bool,
}

impl CacheOptions {
    /// Options with defaults for everything but the cache directory.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            mode: CacheMode::default(),
            overmap_during_load: OvermapPolicy::default(),
            service_after_fork: false,
        }
    }
}
