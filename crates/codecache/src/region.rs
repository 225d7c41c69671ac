//! Per-region cache state.
//!
//! A [`Region`] tracks one registered guest executable mapping and its
//! backing cache file. The file is loaded once, on the worker thread, while
//! fetch callers park on the region's latch; after that the record index
//! and the read-only file view are immutable apart from integrity-miss
//! evictions. The original guest layout the file was baked under is sealed
//! into `original` at load completion and never changes again.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use memmap2::{Mmap, MmapOptions};
use parking_lot::Mutex;
use tracing::{debug, warn};
use zerocopy::{FromBytes, IntoBytes};

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::filelock::lock_whole_file;
use crate::format::{FileHeader, HEADER_SIZE, PREFIX_SIZE, RecordBounds, RecordPrefix, walk_record};
use crate::reloc::Relocation;
use crate::sync::{Latch, RefCounter};

/// Guest layout of the region at the moment its cache file was first built.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OriginalSpan {
    pub base: u64,
    pub offset: u64,
}

/// Where a known RIP offset lives.
#[derive(Debug, Clone, Copy)]
pub(crate) enum IndexSlot {
    /// Byte offset of the record prefix inside the loaded file view.
    Loaded(usize),
    /// Serialized this run; present only to suppress duplicate records.
    Written,
}

pub(crate) struct RegionState {
    /// In-memory copy of the file header, counts included.
    pub header: FileHeader,
    /// RIP offset → record location.
    pub index: HashMap<u64, IndexSlot>,
    /// Long-lived serialize FD, open and OFD-locked while writes are in
    /// flight; dropped (unlocking the file) when the last writer leaves.
    pub serialize_file: Option<File>,
    /// Cleared irreversibly on corruption or write failure.
    pub still_serializing: bool,
    /// Whether closure may delete the file. False while a foreign-config
    /// file occupies our path.
    pub owns_file: bool,
}

/// One registered guest executable region.
pub(crate) struct Region {
    pub current_base: u64,
    pub current_len: u64,
    pub current_offset: u64,
    /// Canonical path of the backing guest executable.
    pub source_path: String,
    /// Derived on-disk cache file path.
    pub cache_path: PathBuf,
    pub executable: bool,
    /// Sealed at load completion; equal to the current layout on a file's
    /// first-ever build.
    pub original: OnceLock<OriginalSpan>,
    /// Read-only view of the cache file, present only when a valid
    /// pre-existing file was loaded. Dropped with the region, never
    /// earlier, so fetched records cannot dangle.
    map: OnceLock<Mmap>,
    pub state: Mutex<RegionState>,
    /// Shared while an add job holds a reference to this entry.
    pub named_jobs: RefCounter,
    /// Shared per enqueued-or-writing translation.
    pub write_jobs: RefCounter,
    /// Fetch callers arriving before load completes block here.
    pub loaded: Latch,
}

pub(crate) fn default_header(config: &CacheConfig, base: u64, offset: u64) -> FileHeader {
    FileHeader {
        config: config.pack(),
        original_base: base,
        original_offset: offset,
        total_code_size: 0,
        num_records: 0,
        num_relocations_to: 0,
        total_relocations: 0,
    }
}

impl Region {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        current_base: u64,
        current_len: u64,
        current_offset: u64,
        source_path: &str,
        cache_path: PathBuf,
        executable: bool,
        header: FileHeader,
    ) -> Self {
        Self {
            current_base,
            current_len,
            current_offset,
            source_path: source_path.to_owned(),
            cache_path,
            executable,
            original: OnceLock::new(),
            map: OnceLock::new(),
            state: Mutex::new(RegionState {
                header,
                index: HashMap::new(),
                serialize_file: None,
                still_serializing: true,
                owns_file: false,
            }),
            named_jobs: RefCounter::new(),
            write_jobs: RefCounter::new(),
            loaded: Latch::new(),
        }
    }

    pub fn contains_current(&self, rip: u64) -> bool {
        rip >= self.current_base && rip - self.current_base < self.current_len
    }

    pub fn original_span(&self) -> OriginalSpan {
        self.original.get().copied().unwrap_or(OriginalSpan {
            base: self.current_base,
            offset: self.current_offset,
        })
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        self.map.get().map(|m| &m[..])
    }

    /// Load or create this region's cache file. Runs once, on the worker.
    pub fn load(&self, config: &CacheConfig, can_create: bool) {
        match File::open(&self.cache_path) {
            Ok(file) => self.load_existing(&file, config),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if can_create {
                    self.create_empty();
                }
            }
            Err(err) => {
                warn!(
                    "couldn't open cache file {}: {err}",
                    self.cache_path.display()
                );
            }
        }

        // First-ever build (or rejected file): the original layout is the
        // current one.
        let _ = self.original.set(OriginalSpan {
            base: self.current_base,
            offset: self.current_offset,
        });
    }

    fn load_existing(&self, file: &File, config: &CacheConfig) {
        match self.try_load(file, config) {
            Ok(entries) => {
                if entries > 0 {
                    debug!(
                        "loaded {entries} entries from code cache {}",
                        self.cache_path.display()
                    );
                }
            }
            Err(err @ CacheError::CookieMismatch { .. }) => {
                warn!("ignoring cache file {}: {err}", self.cache_path.display());
            }
            Err(err @ CacheError::ConfigMismatch) => {
                // Baked under other settings; leave it alone and run fresh.
                debug!("ignoring cache file {}: {err}", self.cache_path.display());
            }
            Err(err) => {
                // Corrupt or unreadable: drop the view, never serialize
                // here again.
                warn!("corrupt code cache {}: {err}", self.cache_path.display());
                let mut st = self.state.lock();
                st.index.clear();
                st.still_serializing = false;
            }
        }
    }

    fn try_load(&self, file: &File, config: &CacheConfig) -> Result<usize, CacheError> {
        let mut raw = [0u8; HEADER_SIZE];
        file.read_exact_at(&mut raw, 0)?;
        let header = FileHeader::read_from_bytes(&raw)
            .map_err(|_| CacheError::Corrupt("short header"))?;
        let disk_config = CacheConfig::unpack(&header.config);
        if disk_config.cookie != config.cookie {
            return Err(CacheError::CookieMismatch {
                expected: config.cookie,
                actual: disk_config.cookie,
            });
        }
        if disk_config != *config {
            return Err(CacheError::ConfigMismatch);
        }

        let _ = self.original.set(OriginalSpan {
            base: header.original_base,
            offset: header.original_offset,
        });
        {
            let mut st = self.state.lock();
            st.header = header;
            st.owns_file = true;
        }

        if header.total_code_size == 0 {
            return Ok(0);
        }

        // MAP_POPULATE keeps a cold cache from stalling translator threads
        // on page faults mid-JIT.
        // SAFETY: the mapping is read-only and private to this region; a
        // concurrent truncation of the file by an external actor is the
        // same hazard every mmap-backed reader of shared caches accepts.
        let data = unsafe { MmapOptions::new().populate().map(file)? };
        let index = Self::build_index(&data, &header)?;
        let entries = index.len();
        self.state.lock().index = index;
        let _ = self.map.set(data);
        Ok(entries)
    }

    fn build_index(data: &[u8], header: &FileHeader) -> Result<HashMap<u64, IndexSlot>, CacheError> {
        let num_records =
            usize::try_from(header.num_records).map_err(|_| CacheError::Corrupt("record count"))?;
        // A record can't be smaller than its prefix, so the header can't
        // honestly claim more records than the body has room for.
        if num_records > data.len().saturating_sub(HEADER_SIZE) / PREFIX_SIZE {
            return Err(CacheError::Corrupt("record count exceeds file size"));
        }
        let mut index = HashMap::with_capacity(num_records);
        let mut off = HEADER_SIZE;
        for _ in 0..num_records {
            let record = walk_record(data, off)?;
            if record.prefix.host_code_len > header.total_code_size {
                return Err(CacheError::Corrupt("record host code exceeds total"));
            }
            index.insert(record.prefix.rip_offset, IndexSlot::Loaded(off));
            off = record.end;
        }
        Ok(index)
    }

    /// Create the cache file exclusively and write the initial header.
    /// Losing the `O_EXCL` race to a cooperating process is fine; both
    /// share the file on subsequent opens.
    fn create_empty(&self) {
        match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&self.cache_path)
        {
            Ok(file) => {
                let mut st = self.state.lock();
                st.owns_file = true;
                if lock_whole_file(&file, true)
                    .and_then(|()| file.write_all_at(st.header.as_bytes(), 0))
                    .is_err()
                {
                    warn!(
                        "couldn't write initial cache header to {}",
                        self.cache_path.display()
                    );
                    st.still_serializing = false;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                self.state.lock().owns_file = true;
            }
            Err(err) => {
                warn!(
                    "couldn't create cache file {}: {err}",
                    self.cache_path.display()
                );
            }
        }
    }

    /// Closure: delete the file unless it holds records or other regions'
    /// relocations point into it.
    pub fn run_closure(&self) {
        let st = self.state.lock();
        let keep = st.header.num_records > 0 || st.header.num_relocations_to > 0;
        if !keep && st.owns_file {
            debug!("removing empty cache file {}", self.cache_path.display());
            let _ = fs::remove_file(&self.cache_path);
        }
    }

    /// Drop the serialize FD (releasing its OFD lock) and stop writing.
    /// Used when the region is evicted by an overmap or torn down.
    pub fn stop_serializing(&self) {
        let mut st = self.state.lock();
        st.still_serializing = false;
        st.serialize_file = None;
    }

    /// Close the serialize FD without touching anything else. The forked
    /// child uses this to release inherited file locks.
    pub fn close_serialize_fd(&self) {
        self.state.lock().serialize_file = None;
    }
}

/// A fetched, ready-to-install cached translation.
///
/// Holds its region alive, so the borrowed host code and relocation bytes
/// stay valid even if the region is removed while the caller installs the
/// record.
pub struct CachedCode {
    region: Arc<Region>,
    bounds: RecordBounds,
}

impl CachedCode {
    pub(crate) fn new(region: Arc<Region>, bounds: RecordBounds) -> Self {
        Self { region, bounds }
    }

    /// The record's fixed prefix.
    #[must_use]
    pub fn prefix(&self) -> RecordPrefix {
        self.bounds.prefix
    }

    /// Guest RIP offset of this record within its region.
    #[must_use]
    pub fn rip_offset(&self) -> u64 {
        self.bounds.prefix.rip_offset
    }

    /// The recorded host code bytes.
    #[must_use]
    pub fn host_code(&self) -> &[u8] {
        self.region
            .bytes()
            .map_or(&[][..], |b| &b[self.bounds.host_off..self.bounds.reloc_off])
    }

    /// Decode the record's relocation entries. `GuestRipMove` targets are
    /// in the original address space of the region that owned the referent
    /// at bake time.
    pub fn relocations(&self) -> Result<Vec<Relocation>, CacheError> {
        let blob = self
            .region
            .bytes()
            .map_or(&[][..], |b| &b[self.bounds.reloc_off..self.bounds.end]);
        Relocation::decode_all(blob)
    }
}
