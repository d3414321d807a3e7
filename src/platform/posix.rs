// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// POSIX shared memory: shm_open + ftruncate + mmap, with a cross-process
// reference counter in a small leading header.
//
// The counter sits at offset 0 so every opener agrees on its location even
// when openers request different sizes (an opener must accept any existing
// object at least as big as its request). User data starts at a fixed
// 16-byte offset, which also keeps user structs 16-byte aligned.

use std::ffi::CString;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::error::{Error, Result};
use crate::name;

/// Bytes reserved at the front of every region for the reference counter.
pub(crate) const REGION_HEADER: usize = 16;

pub(crate) fn total_size(user_size: usize) -> usize {
    REGION_HEADER + user_size
}

/// The region's reference counter, at offset 0 of the raw mapping.
///
/// # Safety
/// `mem` must point to a live mapping of at least `REGION_HEADER` bytes.
unsafe fn refcount(mem: *mut u8) -> &'static AtomicI32 {
    &*(mem as *const AtomicI32)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsShmMode {
    Create,
    Open,
    CreateOrOpen,
}

pub struct OsShm {
    mem: *mut u8,     // raw mapping base (header included)
    size: usize,      // mapped size, header included
    user_size: usize, // caller-requested size
    os_name: String,  // canonical name handed to the OS
    prev_ref: i32,    // counter value before our own increment
}

// The region is process-shared by design; all interior mutability goes
// through atomics or caller-provided synchronisation.
unsafe impl Send for OsShm {}
unsafe impl Sync for OsShm {}

impl OsShm {
    pub fn acquire(logical: &str, user_size: usize, mode: OsShmMode) -> Result<Self> {
        if user_size == 0 {
            return Err(Error::NameInvalid(format!("{logical}: zero size")));
        }
        let os_name = name::canonical(logical)?;
        let c_name =
            CString::new(os_name.as_bytes()).map_err(|_| Error::NameInvalid(os_name.clone()))?;

        let perms: libc::mode_t = 0o666;
        let want = total_size(user_size);

        // Undersized stale objects (a prior run created the name with a
        // smaller layout) are unlinked and recreated; the bounded retry
        // covers unlink/create races with a concurrent creator.
        for _attempt in 0..4 {
            let (fd, created) = match Self::open_fd(&c_name, mode, perms)? {
                Some(pair) => pair,
                None => continue, // lost an EEXIST/ENOENT race, go around
            };

            unsafe { libc::fchmod(fd, perms) };

            if created {
                if unsafe { libc::ftruncate(fd, want as libc::off_t) } != 0 {
                    let err = io::Error::last_os_error();
                    // Some platforms round object sizes up to the page and
                    // refuse to resize in place; an object already at least
                    // as big as requested counts as success.
                    if err.raw_os_error() == Some(libc::EINVAL) {
                        if let Ok(actual) = Self::fd_size(fd) {
                            if actual >= want {
                                return Self::map(fd, actual, user_size, os_name);
                            }
                        }
                    }
                    unsafe { libc::close(fd) };
                    return Err(Error::Os(err));
                }
                return Self::map(fd, want, user_size, os_name);
            }

            // Opened an existing object: adopt it if it is big enough,
            // recreate otherwise.
            let actual = match Self::fd_size(fd) {
                Ok(n) => n,
                Err(e) => {
                    unsafe { libc::close(fd) };
                    return Err(e);
                }
            };
            if actual >= want {
                // Map the whole object, not just the requested prefix: a
                // peer that created the region with a larger layout (say a
                // bigger ring capacity) expects every participant to see
                // all of it.
                return Self::map(fd, actual, user_size, os_name);
            }
            unsafe { libc::close(fd) };
            if mode == OsShmMode::Open {
                return Err(Error::Os(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("{os_name}: existing object smaller than requested"),
                )));
            }
            tracing::debug!(name = %os_name, actual, want, "recreating undersized shm object");
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }

        Err(Error::Os(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("{os_name}: lost create/open race repeatedly"),
        )))
    }

    /// Open or create the fd per `mode`. `Ok(None)` means a create/open
    /// race was lost and the caller should retry.
    fn open_fd(
        c_name: &CString,
        mode: OsShmMode,
        perms: libc::mode_t,
    ) -> Result<Option<(i32, bool)>> {
        let excl = libc::O_RDWR | libc::O_CREAT | libc::O_EXCL;
        match mode {
            OsShmMode::Create => {
                let fd = unsafe { libc::shm_open(c_name.as_ptr(), excl, perms as libc::c_uint) };
                if fd == -1 {
                    return Err(Error::Os(io::Error::last_os_error()));
                }
                Ok(Some((fd, true)))
            }
            OsShmMode::Open => {
                let fd =
                    unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, perms as libc::c_uint) };
                if fd == -1 {
                    return Err(Error::Os(io::Error::last_os_error()));
                }
                Ok(Some((fd, false)))
            }
            OsShmMode::CreateOrOpen => {
                // Exclusive create first, so ftruncate only ever runs on an
                // object we own; truncating an already-sized object can
                // zero a peer's live data on some platforms.
                let fd = unsafe { libc::shm_open(c_name.as_ptr(), excl, perms as libc::c_uint) };
                if fd != -1 {
                    return Ok(Some((fd, true)));
                }
                let e = io::Error::last_os_error();
                if e.raw_os_error() != Some(libc::EEXIST) {
                    return Err(Error::Os(e));
                }
                let fd =
                    unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, perms as libc::c_uint) };
                if fd != -1 {
                    return Ok(Some((fd, false)));
                }
                let e = io::Error::last_os_error();
                if e.raw_os_error() == Some(libc::ENOENT) {
                    // The creator unlinked between our two shm_opens.
                    return Ok(None);
                }
                Err(Error::Os(e))
            }
        }
    }

    fn fd_size(fd: i32) -> Result<usize> {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut st) } != 0 {
            return Err(Error::Os(io::Error::last_os_error()));
        }
        Ok(st.st_size as usize)
    }

    fn map(fd: i32, size: usize, user_size: usize, os_name: String) -> Result<Self> {
        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if mem == libc::MAP_FAILED {
            return Err(Error::Os(io::Error::last_os_error()));
        }

        let prev = unsafe { refcount(mem as *mut u8).fetch_add(1, Ordering::AcqRel) };

        Ok(Self {
            mem: mem as *mut u8,
            size,
            user_size,
            os_name,
            prev_ref: prev,
        })
    }

    /// Base of the user-visible region (past the counter header).
    pub fn as_mut_ptr(&self) -> *mut u8 {
        unsafe { self.mem.add(REGION_HEADER) }
    }

    pub fn mapped_size(&self) -> usize {
        self.size
    }

    pub fn user_size(&self) -> usize {
        self.user_size
    }

    pub fn os_name(&self) -> &str {
        &self.os_name
    }

    /// Counter value before our own increment; 0 means this handle mapped
    /// the region first (or first since the last teardown).
    pub fn prev_ref(&self) -> i32 {
        self.prev_ref
    }

    pub fn ref_count(&self) -> i32 {
        unsafe { refcount(self.mem).load(Ordering::Acquire) }
    }

    /// Remove the backing name. Existing mappings stay valid.
    pub fn unlink(&self) {
        if let Ok(c) = CString::new(self.os_name.as_bytes()) {
            unsafe { libc::shm_unlink(c.as_ptr()) };
        }
    }

    pub fn unlink_by_name(logical: &str) {
        let Ok(os_name) = name::canonical(logical) else {
            return;
        };
        if let Ok(c) = CString::new(os_name.as_bytes()) {
            unsafe { libc::shm_unlink(c.as_ptr()) };
        }
    }
}

impl Drop for OsShm {
    fn drop(&mut self) {
        if self.mem.is_null() {
            return;
        }
        let prev = unsafe { refcount(self.mem).fetch_sub(1, Ordering::AcqRel) };
        unsafe { libc::munmap(self.mem as *mut libc::c_void, self.size) };
        if prev <= 1 {
            self.unlink();
        }
    }
}

/// Whether `pid` names a live process. EPERM means alive but unsignalable,
/// which still counts as alive.
pub(crate) fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
