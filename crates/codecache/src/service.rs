//! The cache service: region registry, job queues, and the worker thread.
//!
//! Translator threads enqueue add-region, remove-region, and
//! completed-translation jobs; a single background worker drains them,
//! named-region jobs strictly first so a translation can never be written
//! into a region that has not finished loading. Fetch is synchronous and
//! may only block on a region's load latch.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::config::{CacheConfig, CacheMode, CacheOptions, OvermapPolicy};
use crate::guest::GuestMemory;
use crate::hash::content_hash;
use crate::maps::AddressMaps;
use crate::region::{CachedCode, IndexSlot, Region, default_header};
use crate::reloc::Relocation;
use crate::sync::{ThreadToken, WorkEvent};

/// Which side of a fork the caller is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkSide {
    Parent,
    Child,
}

/// One completed translation, ready for asynchronous serialization.
pub struct AotData {
    /// Current-run guest RIP of the translated block.
    pub guest_rip: u64,
    /// Emitted host code.
    pub host_code: Vec<u8>,
    /// Hash over `host_code`; 0 means "compute at submit".
    pub host_code_hash: u64,
    /// Guest byte length of the translated block.
    pub guest_code_len: u64,
    /// Hash over the guest bytes; 0 means "compute at write".
    pub guest_code_hash: u64,
    /// Fix-ups the host code needs at install time. `GuestRipMove` targets
    /// are current-run addresses here; the write path rewrites them.
    pub relocations: Vec<Relocation>,
    /// The submitting translator thread's accounting token.
    pub thread_token: ThreadToken,
}

pub(crate) struct WriteJob {
    pub data: AotData,
    pub region: Arc<Region>,
}

struct AddJob {
    region: Arc<Region>,
}

pub(crate) struct ServiceInner {
    pub config: CacheConfig,
    pub options: CacheOptions,
    pub guest: Arc<dyn GuestMemory>,

    /// Exclusive around region-set mutations, shared around fetch/submit.
    region_modifying: RwLock<()>,
    /// Shared-held by the worker for the duration of one drain cycle.
    working: RwLock<()>,
    pub maps: AddressMaps,

    named_queue: Mutex<VecDeque<AddJob>>,
    /// Pending named jobs, readable without the queue mutex.
    named_pending: AtomicU64,
    write_queue: Mutex<VecDeque<WriteJob>>,
    work_event: WorkEvent,
    shutting_down: AtomicBool,
}

/// The AOT code cache service.
///
/// See the crate docs for the data flow. All methods are callable from any
/// thread; `shutdown` (also run on drop) drains both queues, joins the
/// worker, and runs closure on every region.
pub struct CacheService {
    inner: Arc<ServiceInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CacheService {
    pub fn new(
        config: CacheConfig,
        options: CacheOptions,
        guest: Arc<dyn GuestMemory>,
    ) -> std::io::Result<Self> {
        let inner = Arc::new(ServiceInner {
            config,
            options,
            guest,
            region_modifying: RwLock::new(()),
            working: RwLock::new(()),
            maps: AddressMaps::new(),
            named_queue: Mutex::new(VecDeque::new()),
            named_pending: AtomicU64::new(0),
            write_queue: Mutex::new(VecDeque::new()),
            work_event: WorkEvent::new(),
            shutting_down: AtomicBool::new(false),
        });

        let service = Self {
            inner,
            worker: Mutex::new(None),
        };
        if service.inner.options.mode != CacheMode::Disabled {
            service.spawn_worker()?;
        }
        Ok(service)
    }

    fn spawn_worker(&self) -> std::io::Result<()> {
        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("code-cache".into())
            .spawn(move || inner.worker_loop())?;
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    fn disabled(&self) -> bool {
        self.inner.options.mode == CacheMode::Disabled
    }

    /// Register a guest executable region. Returns immediately; the cache
    /// file is opened and loaded on the worker, and fetch callers for this
    /// region block until that completes.
    pub fn add_named_region(
        &self,
        base: u64,
        size: u64,
        offset: u64,
        filename: &str,
        executable: bool,
    ) {
        if self.disabled() {
            return;
        }
        let Some(base_name) = Path::new(filename)
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_owned)
        else {
            return;
        };

        let cache_path = self.inner.cache_file_path(&base_name, offset);
        let region = Arc::new(Region::new(
            base,
            size,
            offset,
            filename,
            cache_path,
            executable,
            default_header(&self.inner.config, base, offset),
        ));
        // The add job holds a reference until the load completes.
        region.named_jobs.acquire_shared();

        let _guard = self.inner.region_modifying.write();
        {
            let mut current = self.inner.maps.current.write();
            if let Some(existing) = current.get(&base).cloned() {
                if !existing.loaded.is_open() {
                    // The guest overmapped a region whose load hasn't
                    // finished. See CacheOptions::overmap_during_load.
                    region.named_jobs.release_shared();
                    match self.inner.options.overmap_during_load {
                        OvermapPolicy::Drop => {
                            warn!(
                                "overmap of still-loading region at {base:#x} ({} over {}), dropping add",
                                region.source_path, existing.source_path
                            );
                            return;
                        }
                        OvermapPolicy::Panic => {
                            panic!(
                                "overmap of still-loading region at {base:#x} \
                                 ({} over {})",
                                region.source_path, existing.source_path
                            );
                        }
                    }
                }
                // Overmap of a loaded region: evict the old entry.
                debug!(
                    "replacing overwritten named region at {base:#x} ({} over {})",
                    region.source_path, existing.source_path
                );
                existing.named_jobs.lock_exclusive();
                existing.named_jobs.unlock_exclusive();
                existing.run_closure();
                existing.stop_serializing();
                self.inner
                    .maps
                    .original
                    .write()
                    .remove(&existing.original_span().base);
            }
            current.insert(base, Arc::clone(&region));
        }

        {
            let mut queue = self.inner.named_queue.lock();
            queue.push_back(AddJob { region });
            self.inner.named_pending.fetch_add(1, Ordering::Release);
        }
        self.inner.work_event.notify();
    }

    /// Unregister a region. Returns only after every pending job targeting
    /// it has drained and the entry is gone from both maps; records already
    /// accepted are persisted, never cancelled.
    pub fn remove_named_region(&self, base: u64, _size: u64) {
        if self.disabled() {
            return;
        }
        // No regions change and no new translations enter while we drain.
        let _guard = self.inner.region_modifying.write();
        let mut write_queue = self.inner.write_queue.lock();

        let Some(region) = self.inner.maps.get_exact(base) else {
            return;
        };
        debug!("removing named region {} at {base:#x}", region.source_path);

        if !region.named_jobs.try_lock_exclusive() {
            // Still loading: run the named queue ourselves (the worker may
            // be blocked on the write-queue mutex we hold), then wait out
            // a load the worker already started.
            self.inner.drain_named_queue();
            region.named_jobs.lock_exclusive();
        }
        region.named_jobs.unlock_exclusive();

        if !region.write_jobs.try_lock_exclusive() {
            // Pending writes: serialize everything queued right now, then
            // wait for the worker's in-flight job.
            while let Some(job) = write_queue.pop_front() {
                self.inner.serialize_job(job);
            }
            region.write_jobs.lock_exclusive();
        }
        region.write_jobs.unlock_exclusive();
        drop(write_queue);

        region.run_closure();
        region.stop_serializing();
        self.inner.maps.remove_pair(&region);
    }

    /// Enqueue one completed translation for asynchronous write. Dropped
    /// silently when no registered region owns its RIP, when the region has
    /// stopped serializing, or in read-only mode.
    pub fn submit_translation(&self, mut data: AotData) {
        if self.disabled() || self.inner.options.mode != CacheMode::ReadWrite {
            return;
        }
        // Hash host code before handing it to the worker so later
        // backpatching can't change what gets recorded.
        if data.host_code_hash == 0 {
            data.host_code_hash = content_hash(&data.host_code);
        }

        let _guard = self.inner.region_modifying.read();
        let Some(region) = self.inner.maps.find_current(data.guest_rip) else {
            return;
        };
        if !region.state.lock().still_serializing {
            return;
        }
        // A remove can't be draining this region (it holds region-modifying
        // exclusively), so this only ever waits out the worker's brief
        // close-the-serialize-FD window.
        region.write_jobs.acquire_shared();
        data.thread_token.begin();
        self.inner
            .write_queue
            .lock()
            .push_back(WriteJob { data, region });
        self.inner.work_event.notify();
    }

    /// Look up a cached translation for a current-run guest RIP.
    ///
    /// Blocks only while the owning region's cache file is still loading.
    /// The returned record has passed the guest-code integrity check
    /// against current guest memory.
    pub fn fetch(&self, guest_rip: u64) -> Option<CachedCode> {
        if self.disabled() {
            return None;
        }
        let _guard = self.inner.region_modifying.read();
        let region = self.inner.maps.find_current(guest_rip)?;
        if !region.loaded.is_open() {
            debug!("waiting for {} code cache to load", region.source_path);
            region.loaded.wait();
        }

        let offset = guest_rip - region.current_base;
        let mut state = region.state.lock();
        let slot = state.index.get(&offset).copied()?;
        let IndexSlot::Loaded(prefix_off) = slot else {
            return None;
        };
        let bytes = region.bytes()?;
        let record = crate::format::walk_record(bytes, prefix_off).ok()?;

        let guest_hash = crate::guest::hash_guest_code(
            &*self.inner.guest,
            guest_rip,
            record.prefix.guest_code_len,
        );
        if guest_hash != Some(record.prefix.guest_code_hash) {
            // Guest code changed since the cache was baked (in-place
            // relocations, patched PLT, ...). Drop it from the index; the
            // file is left alone.
            debug!(
                "guest code at {guest_rip:#x} doesn't match {} cache, ignoring record",
                region.source_path
            );
            state.index.remove(&offset);
            return None;
        }

        // The host hash is carried for forward compatibility; a mismatch
        // here means the cache file itself was tampered with.
        let host_hash = content_hash(&bytes[record.host_off..record.reloc_off]);
        if host_hash != record.prefix.host_code_hash {
            debug!(
                "host code hash mismatch at {guest_rip:#x} in {} cache file",
                region.source_path
            );
        }

        drop(state);
        debug!("code cache hit at {guest_rip:#x}");
        Some(CachedCode::new(region, record))
    }

    /// Translate a current-run guest address into the original address
    /// space of the region it belongs to; used by the translator when
    /// emitting relocations that cross regions. `None` when no named
    /// region owns the address (`.bss`-like destinations).
    pub fn relocate_addr(&self, guest_rip: u64) -> Option<u64> {
        if self.disabled() {
            return None;
        }
        let _guard = self.inner.region_modifying.read();
        self.inner.maps.relocate_current_to_original(guest_rip)
    }

    /// Translate an original-space address from a loaded record back into
    /// the current run's address space; used when installing a cached
    /// `GuestRipMove`.
    pub fn resolve_original_addr(&self, original_rip: u64) -> Option<u64> {
        if self.disabled() {
            return None;
        }
        let _guard = self.inner.region_modifying.read();
        self.inner.maps.resolve_original_to_current(original_rip)
    }

    /// Drain both queues, stop the worker, and run closure on every region.
    pub fn shutdown(&self) {
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        self.inner.shutting_down.store(true, Ordering::Release);
        self.inner.work_event.notify();
        let _ = handle.join();
    }

    /// Quiesce every service lock ahead of fork, in the fixed order:
    /// region-modifying, working, named queue, write queue, current map,
    /// worker event. The calling thread's in-flight submissions are drained
    /// first.
    pub fn prepare_for_fork(&self, thread: &ThreadToken) {
        if self.disabled() {
            return;
        }
        thread.wait_idle();

        std::mem::forget(self.inner.region_modifying.write());
        std::mem::forget(self.inner.working.write());
        std::mem::forget(self.inner.named_queue.lock());
        std::mem::forget(self.inner.write_queue.lock());
        std::mem::forget(self.inner.maps.current.write());
        self.inner.work_event.lock_for_fork();
        thread.lock_exclusive();
    }

    /// Undo [`Self::prepare_for_fork`]. The child additionally clears both
    /// queues and both maps and closes every serialize FD to release the
    /// inherited advisory locks; whether it restarts the worker is governed
    /// by `CacheOptions::service_after_fork`.
    pub fn cleanup_after_fork(&self, thread: &ThreadToken, side: ForkSide) {
        if self.disabled() {
            return;
        }
        thread.unlock_exclusive();
        // SAFETY: every lock below was locked-and-forgotten by
        // prepare_for_fork on this thread (parent), or is exclusively owned
        // because the child has exactly one thread. Unlock order is the
        // reverse of the acquisition order.
        unsafe {
            self.inner.work_event.force_unlock();
            self.inner.maps.current.force_unlock_write();
            self.inner.write_queue.force_unlock();
            self.inner.named_queue.force_unlock();
            self.inner.working.force_unlock_write();
            self.inner.region_modifying.force_unlock_write();
        }

        if side == ForkSide::Child {
            // The worker thread did not survive the fork.
            drop(self.worker.lock().take());

            self.inner.named_queue.lock().clear();
            self.inner.named_pending.store(0, Ordering::Release);
            self.inner.write_queue.lock().clear();
            for region in self.inner.maps.snapshot_current() {
                region.close_serialize_fd();
                region.named_jobs.reset();
                region.write_jobs.reset();
            }
            self.inner.maps.clear();

            if self.inner.options.service_after_fork {
                if let Err(err) = self.spawn_worker() {
                    warn!("couldn't restart cache worker after fork: {err}");
                }
            }
        }
    }

    /// Drain the calling thread's in-flight submissions ahead of exec. The
    /// serialize FDs are `CLOEXEC`, so exec itself releases the file locks.
    pub fn prepare_for_execve(&self, thread: &ThreadToken) {
        if self.disabled() {
            return;
        }
        thread.wait_idle();
    }

    pub fn cleanup_after_execve(&self) {}
}

impl Drop for CacheService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ServiceInner {
    fn cache_file_path(&self, base_name: &str, offset: u64) -> PathBuf {
        self.options.cache_dir.join(format!(
            "{}-{:x}-{:x}.code",
            base_name,
            self.config.hash(),
            offset
        ))
    }

    fn worker_loop(&self) {
        loop {
            self.work_event.wait();
            let _working = self.working.read();

            loop {
                // Named-region jobs outrank serialization: a translation
                // enqueued after an add must never reach a region that
                // hasn't loaded.
                self.drain_named_queue();
                let Some(job) = self.write_queue.lock().pop_front() else {
                    break;
                };
                self.serialize_job(job);
            }

            if self.shutting_down.load(Ordering::Acquire) {
                break;
            }
        }

        for region in self.maps.snapshot_current() {
            region.run_closure();
            region.close_serialize_fd();
        }
        self.maps.clear();
    }

    pub(crate) fn drain_named_queue(&self) {
        while self.named_pending.load(Ordering::Acquire) != 0 {
            let job = {
                let mut queue = self.named_queue.lock();
                let job = queue.pop_front();
                if job.is_some() {
                    self.named_pending.fetch_sub(1, Ordering::Release);
                }
                job
            };
            let Some(job) = job else {
                break;
            };
            self.execute_add(job);
        }
    }

    fn execute_add(&self, job: AddJob) {
        let region = job.region;
        debug!(
            "adding named region {} at {:#x} (executable: {})",
            region.source_path, region.current_base, region.executable
        );
        let _ = fs::create_dir_all(&self.options.cache_dir);
        region.load(&self.config, self.options.mode == CacheMode::ReadWrite);
        self.maps.insert_original(&region);
        region.named_jobs.release_shared();
        region.loaded.open();
    }
}
