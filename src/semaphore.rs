// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named counting semaphore.
//
// POSIX: the OS named semaphore (`sem_open`). `sem_timedwait` is used
// where the platform has it; macOS does not, so the timed wait there is
// `sem_trywait` polling on the adaptive back-off ladder against a
// monotonic deadline.

use std::time::Duration;

use crate::error::Result;

/// A named, non-negative counting semaphore shared between processes.
pub struct NamedSemaphore {
    #[cfg(unix)]
    inner: PosixSemaphore,
    #[cfg(windows)]
    inner: WindowsSemaphore,
}

impl NamedSemaphore {
    /// Open (or create) the named semaphore; `initial` only applies to the
    /// creator.
    pub fn open(name: &str, initial: u32) -> Result<Self> {
        #[cfg(unix)]
        let inner = PosixSemaphore::open(name, initial)?;
        #[cfg(windows)]
        let inner = WindowsSemaphore::open(name, initial)?;
        Ok(Self { inner })
    }

    /// Increment the counter `n` times, waking up to `n` waiters.
    pub fn post(&self, n: u32) -> Result<()> {
        self.inner.post(n)
    }

    /// Decrement the counter, blocking while it is zero. `None` blocks
    /// indefinitely; otherwise returns `Ok(false)` on timeout.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        self.inner.wait(timeout)
    }

    /// Remove the backing storage for a named semaphore.
    pub fn clear_storage(name: &str) {
        #[cfg(unix)]
        PosixSemaphore::clear_storage(name);
        #[cfg(windows)]
        {
            let _ = name;
        }
    }
}

// ---------------------------------------------------------------------------
// POSIX implementation
// ---------------------------------------------------------------------------

#[cfg(unix)]
use posix_impl::PosixSemaphore;

#[cfg(unix)]
mod posix_impl {
    use std::ffi::CString;
    use std::io;
    use std::time::Duration;
    #[cfg(target_os = "macos")]
    use std::time::Instant;

    #[cfg(target_os = "macos")]
    use crate::backoff::Backoff;
    use crate::error::{Error, Result};
    use crate::name;

    pub(super) struct PosixSemaphore {
        sem: *mut libc::sem_t,
    }

    unsafe impl Send for PosixSemaphore {}
    unsafe impl Sync for PosixSemaphore {}

    impl PosixSemaphore {
        pub(super) fn open(logical: &str, initial: u32) -> Result<Self> {
            let key = name::canonical(logical)?;
            let c_name =
                CString::new(key.as_bytes()).map_err(|_| Error::NameInvalid(key.clone()))?;
            let sem = unsafe {
                libc::sem_open(
                    c_name.as_ptr(),
                    libc::O_CREAT,
                    0o666 as libc::c_uint,
                    initial as libc::c_uint,
                )
            };
            if sem == libc::SEM_FAILED {
                return Err(Error::Os(io::Error::last_os_error()));
            }
            Ok(Self { sem })
        }

        pub(super) fn post(&self, n: u32) -> Result<()> {
            for _ in 0..n {
                if unsafe { libc::sem_post(self.sem) } != 0 {
                    return Err(Error::Os(io::Error::last_os_error()));
                }
            }
            Ok(())
        }

        pub(super) fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
            match timeout {
                None => loop {
                    if unsafe { libc::sem_wait(self.sem) } == 0 {
                        return Ok(true);
                    }
                    let e = io::Error::last_os_error();
                    if e.raw_os_error() != Some(libc::EINTR) {
                        return Err(Error::Os(e));
                    }
                },
                Some(dur) => self.timed_wait(dur),
            }
        }

        #[cfg(not(target_os = "macos"))]
        fn timed_wait(&self, dur: Duration) -> Result<bool> {
            let mut now: libc::timespec = unsafe { std::mem::zeroed() };
            unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };
            let ns_total = now.tv_nsec as u64 + dur.subsec_nanos() as u64;
            let ts = libc::timespec {
                tv_sec: now.tv_sec
                    + dur.as_secs() as libc::time_t
                    + (ns_total / 1_000_000_000) as libc::time_t,
                tv_nsec: (ns_total % 1_000_000_000) as libc::c_long,
            };
            loop {
                if unsafe { libc::sem_timedwait(self.sem, &ts) } == 0 {
                    return Ok(true);
                }
                let e = io::Error::last_os_error();
                match e.raw_os_error() {
                    Some(libc::ETIMEDOUT) => return Ok(false),
                    Some(libc::EINTR) => continue,
                    _ => return Err(Error::Os(e)),
                }
            }
        }

        #[cfg(target_os = "macos")]
        fn timed_wait(&self, dur: Duration) -> Result<bool> {
            // No sem_timedwait here: trywait polling on the back-off ladder.
            let deadline = Instant::now() + dur;
            let mut b = Backoff::new();
            loop {
                if unsafe { libc::sem_trywait(self.sem) } == 0 {
                    return Ok(true);
                }
                let e = io::Error::last_os_error();
                match e.raw_os_error() {
                    Some(libc::EAGAIN) | Some(libc::EINTR) => {}
                    _ => return Err(Error::Os(e)),
                }
                if Instant::now() >= deadline {
                    return Ok(false);
                }
                b.pause();
            }
        }

        pub(super) fn clear_storage(logical: &str) {
            let Ok(key) = name::canonical(logical) else {
                return;
            };
            if let Ok(c) = CString::new(key.as_bytes()) {
                unsafe { libc::sem_unlink(c.as_ptr()) };
            }
        }
    }

    impl Drop for PosixSemaphore {
        fn drop(&mut self) {
            unsafe { libc::sem_close(self.sem) };
        }
    }
}

// ---------------------------------------------------------------------------
// Windows implementation
// ---------------------------------------------------------------------------

#[cfg(windows)]
use windows_impl::WindowsSemaphore;

#[cfg(windows)]
mod windows_impl {
    use std::io;
    use std::ptr;
    use std::time::Duration;

    use crate::error::{Error, Result};
    use crate::name;

    fn to_wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

    pub(super) struct WindowsSemaphore {
        handle: windows_sys::Win32::Foundation::HANDLE,
    }

    unsafe impl Send for WindowsSemaphore {}
    unsafe impl Sync for WindowsSemaphore {}

    impl WindowsSemaphore {
        pub(super) fn open(logical: &str, initial: u32) -> Result<Self> {
            use windows_sys::Win32::System::Threading::CreateSemaphoreW;

            let key = name::canonical(logical)?;
            let wide = to_wide(&key);
            let h = unsafe {
                CreateSemaphoreW(ptr::null(), initial as i32, i32::MAX, wide.as_ptr())
            };
            if h == 0 {
                return Err(Error::Os(io::Error::last_os_error()));
            }
            Ok(Self { handle: h })
        }

        pub(super) fn post(&self, n: u32) -> Result<()> {
            use windows_sys::Win32::System::Threading::ReleaseSemaphore;
            if n == 0 {
                return Ok(());
            }
            if unsafe { ReleaseSemaphore(self.handle, n as i32, ptr::null_mut()) } == 0 {
                return Err(Error::Os(io::Error::last_os_error()));
            }
            Ok(())
        }

        pub(super) fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
            use windows_sys::Win32::Foundation::{WAIT_OBJECT_0, WAIT_TIMEOUT};
            use windows_sys::Win32::System::Threading::{WaitForSingleObject, INFINITE};

            let millis = match timeout {
                None => INFINITE,
                Some(d) => d.as_millis().min(u128::from(u32::MAX - 1)) as u32,
            };
            let ret = unsafe { WaitForSingleObject(self.handle, millis) };
            match ret {
                WAIT_OBJECT_0 => Ok(true),
                WAIT_TIMEOUT => Ok(false),
                _ => Err(Error::Os(io::Error::last_os_error())),
            }
        }
    }

    impl Drop for WindowsSemaphore {
        fn drop(&mut self) {
            use windows_sys::Win32::Foundation::CloseHandle;
            if self.handle != 0 {
                unsafe { CloseHandle(self.handle) };
            }
        }
    }
}
