//! Whole-file advisory locking and append-mode I/O.
//!
//! Cross-process coordination on a region's cache file uses open-file-
//! description (OFD) locks: the lock travels with the file description, so
//! it is inherited by fork and by exec unless `CLOEXEC` closes the FD
//! first. Every lock covers the whole file (`start = 0, len = 0,
//! whence = SEEK_CUR`).

use std::fs::{File, OpenOptions};
use std::io::{self, IoSlice};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

/// Acquire an OFD lock over the entire file, blocking until granted.
pub(crate) fn lock_whole_file(file: &File, exclusive: bool) -> io::Result<()> {
    // SAFETY: zero-initialized flock is a valid value for every libc
    // target; only the fields below are inspected by F_OFD_SETLKW.
    let mut lk: libc::flock = unsafe { std::mem::zeroed() };
    lk.l_type = if exclusive {
        libc::F_WRLCK as libc::c_short
    } else {
        libc::F_RDLCK as libc::c_short
    };
    lk.l_whence = libc::SEEK_CUR as libc::c_short;
    lk.l_start = 0;
    lk.l_len = 0;

    loop {
        // SAFETY: `file` owns a valid descriptor for the duration of the
        // call and `lk` outlives it.
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_OFD_SETLKW, &lk) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Open an existing cache file for serialization.
///
/// Tries `O_NOATIME` first and falls back without it on `EPERM`; some
/// filesystems (sshfs among them) refuse the flag. `O_CLOEXEC` is
/// deliberate: it drops the OFD lock across exec.
pub(crate) fn open_for_append(path: &Path) -> io::Result<File> {
    let open = |noatime: bool| {
        let mut opts = OpenOptions::new();
        opts.read(true).write(true);
        let mut flags = libc::O_CLOEXEC;
        if noatime {
            flags |= libc::O_NOATIME;
        }
        opts.custom_flags(flags).open(path)
    };

    match open(true) {
        Err(err) if err.raw_os_error() == Some(libc::EPERM) => open(false),
        other => other,
    }
}

/// Append all buffers at end-of-file in a single atomic vectored write.
///
/// Uses `pwritev2(RWF_APPEND)` so concurrent appenders through other file
/// descriptions never interleave inside one record.
pub(crate) fn append_vectored(file: &File, bufs: &[IoSlice<'_>]) -> io::Result<()> {
    let total: usize = bufs.iter().map(|b| b.len()).sum();
    loop {
        // SAFETY: IoSlice is ABI-compatible with iovec, the slices outlive
        // the call, and the descriptor is valid.
        let rc = unsafe {
            libc::pwritev2(
                file.as_raw_fd(),
                bufs.as_ptr().cast::<libc::iovec>(),
                bufs.len() as libc::c_int,
                -1,
                libc::RWF_APPEND,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if rc as usize != total {
            // A short append would tear the record; the caller stops
            // serializing to this file.
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "short vectored append",
            ));
        }
        return Ok(());
    }
}
