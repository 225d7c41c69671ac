//! The serialization write path.
//!
//! Runs on the worker thread (or inline on a remover draining the queue).
//! A record is appended only after it survives the duplicate check and the
//! escape-relocation pre-filter; the append itself is a single vectored
//! `RWF_APPEND` write under the region's whole-file OFD lock, followed by
//! the header rewrite. A failed append leaves the header untouched, so a
//! torn tail is invisible to every future load.

use std::io::IoSlice;
use std::os::unix::fs::FileExt;

use tracing::{debug, trace, warn};
use zerocopy::{FromBytes, IntoBytes};

use crate::config::CacheConfig;
use crate::filelock::{append_vectored, lock_whole_file, open_for_append};
use crate::format::{FileHeader, HEADER_SIZE, RecordPrefix};
use crate::guest::hash_guest_code;
use crate::region::{IndexSlot, Region};
use crate::reloc::Relocation;
use crate::service::{AotData, ServiceInner, WriteJob};

impl ServiceInner {
    pub(crate) fn serialize_job(&self, job: WriteJob) {
        let WriteJob { mut data, region } = job;
        self.serialize_to_region(&region, &mut data);

        region.write_jobs.release_shared();
        if region.write_jobs.try_lock_exclusive() {
            // Last writer out closes the serialize FD, releasing the
            // whole-file lock for cooperating processes.
            region.close_serialize_fd();
            region.write_jobs.unlock_exclusive();
        }
        data.thread_token.end();
    }

    fn serialize_to_region(&self, region: &Region, data: &mut AotData) {
        let mut guard = region.state.lock();
        let state = &mut *guard;
        if !state.still_serializing {
            return;
        }

        let rip_offset = data.guest_rip.wrapping_sub(region.current_base);
        if state.index.contains_key(&rip_offset) {
            // Already persisted, by an earlier run or another thread.
            trace!("record at {:#x} already serialized, skipping", data.guest_rip);
            return;
        }

        // Reject the whole record if any guest-RIP relocation leaves the
        // region: a cross-region target would tie two regions' lifetimes
        // together inside the stored file.
        for reloc in &data.relocations {
            if let Relocation::GuestRipMove { guest_rip, .. } = reloc {
                if guest_rip.wrapping_sub(region.current_base) >= region.current_len {
                    debug!(
                        "relocation from {:#x} to {guest_rip:#x} escapes the region, dropping record",
                        data.guest_rip
                    );
                    return;
                }
            }
        }

        if data.guest_code_hash == 0 {
            match hash_guest_code(&*self.guest, data.guest_rip, data.guest_code_len) {
                Some(hash) => data.guest_code_hash = hash,
                None => {
                    debug!(
                        "guest code at {:#x} unreadable, dropping record",
                        data.guest_rip
                    );
                    return;
                }
            }
        }

        if state.serialize_file.is_none() {
            let opened = open_for_append(&region.cache_path).and_then(|file| {
                lock_whole_file(&file, true)?;
                Ok(file)
            });
            match opened {
                Ok(file) => state.serialize_file = Some(file),
                Err(err) => {
                    // Did the user delete the file mid-run? Stop writing
                    // to this region for good.
                    warn!(
                        "couldn't open cache file {} for append: {err}",
                        region.cache_path.display()
                    );
                    state.still_serializing = false;
                    return;
                }
            }
        }
        let Some(file) = state.serialize_file.as_ref() else {
            return;
        };

        // Re-read the header under the file lock: peer processes may have
        // appended since we last saw it, or replaced the file wholesale.
        let mut raw = [0u8; HEADER_SIZE];
        if file.read_exact_at(&mut raw, 0).is_err() {
            warn!(
                "couldn't re-read cache header of {}",
                region.cache_path.display()
            );
            state.still_serializing = false;
            return;
        }
        let Ok(disk_header) = FileHeader::read_from_bytes(&raw) else {
            return;
        };
        if CacheConfig::unpack(&disk_header.config) != self.config {
            warn!(
                "cache file {} was rewritten under a different configuration, aborting write",
                region.cache_path.display()
            );
            return;
        }
        let inbound = state
            .header
            .num_relocations_to
            .max(disk_header.num_relocations_to);
        state.header = disk_header;
        state.header.num_relocations_to = inbound;

        // Guest-RIP relocation targets arrive in the current address space;
        // store them in the space the file was baked under. On a fresh
        // file original == current and this is a no-op.
        let original = region.original_span();
        for reloc in &mut data.relocations {
            if let Relocation::GuestRipMove { guest_rip, .. } = reloc {
                *guest_rip = guest_rip
                    .wrapping_sub(region.current_base)
                    .wrapping_add(original.base);
            }
        }

        let reloc_blobs: Vec<Vec<u8>> = data
            .relocations
            .iter()
            .map(|reloc| {
                let mut blob = Vec::with_capacity(reloc.encoded_len());
                reloc.encode_into(&mut blob);
                blob
            })
            .collect();
        let relocation_size: usize = reloc_blobs.iter().map(Vec::len).sum();

        let prefix = RecordPrefix {
            rip_offset,
            host_code_hash: data.host_code_hash,
            host_code_len: data.host_code.len() as u64,
            num_relocations: data.relocations.len() as u64,
            relocation_size: relocation_size as u64,
            guest_code_hash: data.guest_code_hash,
            guest_code_len: data.guest_code_len,
        };

        let mut slices = Vec::with_capacity(2 + reloc_blobs.len());
        slices.push(IoSlice::new(prefix.as_bytes()));
        slices.push(IoSlice::new(&data.host_code));
        for blob in &reloc_blobs {
            slices.push(IoSlice::new(blob));
        }

        if let Err(err) = append_vectored(file, &slices) {
            warn!("append to {} failed: {err}", region.cache_path.display());
            state.still_serializing = false;
            return;
        }

        state.header.total_code_size += prefix.host_code_len;
        state.header.total_relocations += prefix.num_relocations;
        state.header.num_records += 1;
        if file
            .write_all_at(state.header.as_bytes(), 0)
            .and_then(|()| file.sync_data())
            .is_err()
        {
            warn!(
                "header rewrite of {} failed",
                region.cache_path.display()
            );
            state.still_serializing = false;
            return;
        }

        state.index.insert(rip_offset, IndexSlot::Written);
        trace!(
            "serialized {} host bytes and {} relocations for {:#x}",
            prefix.host_code_len, prefix.num_relocations, data.guest_rip
        );
    }
}
