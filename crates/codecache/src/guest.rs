//! Guest-memory access seam.

use crate::hash::content_hash;

/// Read access to the guest address space, supplied by the embedding
/// translator.
///
/// The cache only ever reads: guest code bytes are hashed when a
/// translation is recorded and re-hashed when a cached record is fetched,
/// so that code patched since the cache was baked is detected and skipped.
pub trait GuestMemory: Send + Sync {
    /// Fill `buf` from guest memory starting at current-run address `addr`.
    /// Returns false if any part of the range is inaccessible.
    fn read_exact(&self, addr: u64, buf: &mut [u8]) -> bool;
}

/// Hash `len` guest bytes at `addr`, or `None` if the range is unreadable.
pub(crate) fn hash_guest_code(mem: &dyn GuestMemory, addr: u64, len: u64) -> Option<u64> {
    let len = usize::try_from(len).ok()?;
    let mut buf = vec![0u8; len];
    if !mem.read_exact(addr, &mut buf) {
        return None;
    }
    Some(content_hash(&buf))
}
