// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Windows shared memory: pagefile-backed file mappings, with the same
// leading reference-counter header as the POSIX side.
//
// There is no name to unlink on Windows — the kernel object dies with its
// last handle — so unlink paths are no-ops and teardown is automatic.

use std::io;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::error::{Error, Result};
use crate::name;

pub(crate) const REGION_HEADER: usize = 16;

pub(crate) fn total_size(user_size: usize) -> usize {
    REGION_HEADER + user_size
}

unsafe fn refcount(mem: *mut u8) -> &'static AtomicI32 {
    &*(mem as *const AtomicI32)
}

fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsShmMode {
    Create,
    Open,
    CreateOrOpen,
}

pub struct OsShm {
    handle: windows_sys::Win32::Foundation::HANDLE,
    mem: *mut u8,
    size: usize,
    user_size: usize,
    os_name: String,
    prev_ref: i32,
}

unsafe impl Send for OsShm {}
unsafe impl Sync for OsShm {}

impl OsShm {
    pub fn acquire(logical: &str, user_size: usize, mode: OsShmMode) -> Result<Self> {
        use windows_sys::Win32::Foundation::*;
        use windows_sys::Win32::System::Memory::*;

        if user_size == 0 {
            return Err(Error::NameInvalid(format!("{logical}: zero size")));
        }
        let os_name = name::canonical(logical)?;
        let wide = to_wide(&os_name);
        let want = total_size(user_size);

        let handle;
        let mut adopted = false;

        if mode == OsShmMode::Open {
            handle = unsafe { OpenFileMappingW(FILE_MAP_ALL_ACCESS, FALSE, wide.as_ptr()) };
            if handle == 0 {
                return Err(Error::Os(io::Error::last_os_error()));
            }
            adopted = true;
        } else {
            handle = unsafe {
                CreateFileMappingW(
                    INVALID_HANDLE_VALUE,
                    ptr::null(),
                    PAGE_READWRITE | SEC_COMMIT,
                    0,
                    want as u32,
                    wide.as_ptr(),
                )
            };
            let last = unsafe { GetLastError() };
            if handle == 0 {
                return Err(Error::Os(io::Error::last_os_error()));
            }
            if last == ERROR_ALREADY_EXISTS {
                if mode == OsShmMode::Create {
                    unsafe { CloseHandle(handle) };
                    return Err(Error::Os(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("{os_name}: already exists"),
                    )));
                }
                adopted = true;
            }
        }

        let mem = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, 0) };
        if mem.is_null() {
            let e = io::Error::last_os_error();
            unsafe { CloseHandle(handle) };
            return Err(Error::Os(e));
        }

        // When adopting, verify the existing object is big enough for our
        // layout. A mapping object cannot be resized in place; an
        // undersized one is a build-configuration mismatch.
        let size = if adopted {
            let mut info: MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
            let ret = unsafe {
                VirtualQuery(
                    mem as *const _,
                    &mut info,
                    std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
                )
            };
            if ret == 0 {
                let e = io::Error::last_os_error();
                unsafe {
                    UnmapViewOfFile(mem);
                    CloseHandle(handle);
                }
                return Err(Error::Os(e));
            }
            let actual = info.RegionSize;
            if actual < want {
                unsafe {
                    UnmapViewOfFile(mem);
                    CloseHandle(handle);
                }
                return Err(Error::Os(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("{os_name}: existing mapping smaller than requested"),
                )));
            }
            actual
        } else {
            want
        };

        let prev = unsafe { refcount(mem as *mut u8).fetch_add(1, Ordering::AcqRel) };

        Ok(Self {
            handle,
            mem: mem as *mut u8,
            size,
            user_size,
            os_name,
            prev_ref: prev,
        })
    }

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

    pub fn prev_ref(&self) -> i32 {
        self.prev_ref
    }

    pub fn ref_count(&self) -> i32 {
        unsafe { refcount(self.mem).load(Ordering::Acquire) }
    }

    pub fn unlink(&self) {}

    pub fn unlink_by_name(_logical: &str) {}
}

impl Drop for OsShm {
    fn drop(&mut self) {
        use windows_sys::Win32::Foundation::CloseHandle;
        use windows_sys::Win32::System::Memory::UnmapViewOfFile;

        if !self.mem.is_null() {
            unsafe { refcount(self.mem).fetch_sub(1, Ordering::AcqRel) };
            unsafe { UnmapViewOfFile(self.mem as *const _) };
        }
        if self.handle != 0 {
            unsafe { CloseHandle(self.handle) };
        }
    }
}

/// Whether `pid` names a live process.
pub(crate) fn pid_alive(pid: u32) -> bool {
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Threading::{OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION};

    if pid == 0 {
        return false;
    }
    let h = unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid) };
    if h == 0 {
        return false;
    }
    unsafe { CloseHandle(h) };
    true
}
