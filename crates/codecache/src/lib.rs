//! Persistent AOT translation cache for a user-mode x86 binary translator.
//!
//! The translator compiles guest machine code into host code at runtime;
//! this crate persists those translations keyed by the guest memory regions
//! they came from, so later runs of the same guest binary skip
//! retranslation. Guest address-space layout changes between runs (ASLR),
//! so each region's file stores translations in the address space of the
//! run that first built it, and a relocation layer maps current-run
//! addresses to stored addresses and back.
//!
//! ## Data flow
//!
//! Translator threads call [`CacheService::add_named_region`] /
//! [`CacheService::remove_named_region`] as the guest maps and unmaps
//! executable regions, [`CacheService::fetch`] before translating a new
//! guest RIP, and [`CacheService::submit_translation`] with each completed
//! translation. A single background worker drains region registration
//! ahead of serialization; removes block until every pending write for the
//! region has drained. Cooperating processes share the per-region files
//! under whole-file OFD locks.
//!
//! The cache is strictly an optimization: every failure (corrupt file,
//! configuration mismatch, stale guest code) degrades the affected region
//! and never the translator's ability to run the guest.

mod config;
mod error;
mod filelock;
mod format;
mod guest;
mod hash;
mod maps;
mod region;
mod reloc;
mod service;
mod sync;
mod writer;

pub use config::{CACHE_COOKIE, CacheConfig, CacheMode, CacheOptions, ConfigFlags, OvermapPolicy};
pub use error::CacheError;
pub use format::{FileHeader, HEADER_SIZE, PackedConfig, RecordPrefix};
pub use guest::GuestMemory;
pub use hash::content_hash;
pub use region::CachedCode;
pub use reloc::Relocation;
pub use service::{AotData, CacheService, ForkSide};
pub use sync::ThreadToken;
