// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named inter-process mutex.
//
// POSIX: a `pthread_mutex_t` with PTHREAD_PROCESS_SHARED (and
// PTHREAD_MUTEX_ROBUST where the platform has it) in a one-object shared
// segment, followed by the holder's PID. Where the platform lacks robust
// mutexes and `pthread_mutex_timedlock` (macOS), timed acquisition is
// emulated with try-lock polling on the adaptive back-off ladder, and a
// waiter that has been blocked past a probe threshold checks the holder
// PID for liveness; a dead holder gets the mutex reinitialised in place.
// Recovery is silent — the caller acquires normally and is none the wiser.
//
// Windows: a kernel named mutex; WAIT_ABANDONED is the dead-holder signal
// and is likewise consumed silently.

use crate::error::Result;

/// A named mutex shared between processes.
pub struct NamedMutex {
    #[cfg(unix)]
    inner: PosixMutex,
    #[cfg(windows)]
    inner: WindowsMutex,
}

impl NamedMutex {
    /// Open (or create) the named mutex.
    pub fn open(name: &str) -> Result<Self> {
        #[cfg(unix)]
        let inner = PosixMutex::open(name)?;
        #[cfg(windows)]
        let inner = WindowsMutex::open(name)?;
        Ok(Self { inner })
    }

    /// Acquire, blocking indefinitely.
    pub fn lock(&self) -> Result<()> {
        self.inner.lock()
    }

    /// Acquire if free; `Ok(false)` when contended.
    pub fn try_lock(&self) -> Result<bool> {
        self.inner.try_lock()
    }

    /// Acquire within `timeout`; `Ok(false)` when the deadline passes.
    pub fn lock_timeout(&self, timeout: std::time::Duration) -> Result<bool> {
        self.inner.lock_timeout(timeout)
    }

    pub fn unlock(&self) -> Result<()> {
        self.inner.unlock()
    }

    /// Remove the backing storage for a named mutex.
    pub fn clear_storage(name: &str) {
        #[cfg(unix)]
        PosixMutex::clear_storage(name);
        #[cfg(windows)]
        {
            let _ = name;
        }
    }

    /// Raw pointer to the native mutex word, for condvar waits.
    #[cfg(unix)]
    pub(crate) fn native_ptr(&self) -> *mut libc::pthread_mutex_t {
        self.inner.block().native.get()
    }
}

// ---------------------------------------------------------------------------
// POSIX implementation
// ---------------------------------------------------------------------------

#[cfg(unix)]
use posix_impl::PosixMutex;

#[cfg(unix)]
mod posix_impl {
    use std::cell::UnsafeCell;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    #[cfg(target_os = "macos")]
    use std::time::Instant;

    #[cfg(target_os = "macos")]
    use crate::backoff::Backoff;
    use crate::cache::{self, CachedSegment};
    use crate::error::{Error, Result};
    use crate::name;
    #[cfg(target_os = "macos")]
    use crate::platform::pid_alive;
    use crate::shm::Segment;

    /// How long a waiter tolerates a stuck lock before probing the holder
    /// PID for liveness.
    #[cfg(target_os = "macos")]
    const DEAD_HOLDER_PROBE: Duration = Duration::from_millis(100);

    #[cfg(not(target_os = "macos"))]
    extern "C" {
        fn pthread_mutexattr_setrobust(
            attr: *mut libc::pthread_mutexattr_t,
            robustness: libc::c_int,
        ) -> libc::c_int;
        fn pthread_mutex_consistent(mutex: *mut libc::pthread_mutex_t) -> libc::c_int;
        fn pthread_mutex_timedlock(
            mutex: *mut libc::pthread_mutex_t,
            abstime: *const libc::timespec,
        ) -> libc::c_int;
    }

    #[cfg(not(target_os = "macos"))]
    const PTHREAD_MUTEX_ROBUST: libc::c_int = 1;

    /// Shared-segment layout: the native mutex word, then the holder PID.
    #[repr(C)]
    pub(super) struct MutexBlock {
        pub(super) native: UnsafeCell<libc::pthread_mutex_t>,
        holder: AtomicU32,
    }

    pub(super) struct PosixMutex {
        cached: Arc<CachedSegment>,
        key: String,
    }

    impl PosixMutex {
        pub(super) fn open(logical: &str) -> Result<Self> {
            // Cache key is the canonical form so slashed and slashless
            // spellings of one name share a single local mapping.
            let key = name::canonical(logical)?;
            let cached = cache::acquire(&key, std::mem::size_of::<MutexBlock>(), |base| {
                init_block(base as *mut MutexBlock)
            })?;
            Ok(Self { cached, key })
        }

        pub(super) fn block(&self) -> &MutexBlock {
            unsafe { &*(self.cached.seg.get() as *const MutexBlock) }
        }

        fn native(&self) -> *mut libc::pthread_mutex_t {
            self.block().native.get()
        }

        pub(super) fn lock(&self) -> Result<()> {
            #[cfg(not(target_os = "macos"))]
            {
                let eno = unsafe { libc::pthread_mutex_lock(self.native()) };
                match eno {
                    0 => {}
                    libc::EOWNERDEAD => self.make_consistent()?,
                    _ => return Err(Error::from_raw_os(eno)),
                }
                self.note_acquired();
                Ok(())
            }
            #[cfg(target_os = "macos")]
            {
                // No robust mutexes: a plain blocking lock could hang on an
                // abandoned word forever, so even the infinite lock runs the
                // polling path (with no deadline).
                self.acquire_polling(None).map(|_| ())
            }
        }

        pub(super) fn try_lock(&self) -> Result<bool> {
            let eno = unsafe { libc::pthread_mutex_trylock(self.native()) };
            match eno {
                0 => {
                    self.note_acquired();
                    Ok(true)
                }
                libc::EBUSY => Ok(false),
                #[cfg(not(target_os = "macos"))]
                libc::EOWNERDEAD => {
                    self.make_consistent()?;
                    self.note_acquired();
                    Ok(true)
                }
                _ => Err(Error::from_raw_os(eno)),
            }
        }

        pub(super) fn lock_timeout(&self, timeout: Duration) -> Result<bool> {
            #[cfg(not(target_os = "macos"))]
            {
                let ts = realtime_deadline(timeout);
                loop {
                    let eno = unsafe { pthread_mutex_timedlock(self.native(), &ts) };
                    match eno {
                        0 => {
                            self.note_acquired();
                            return Ok(true);
                        }
                        libc::ETIMEDOUT => return Ok(false),
                        libc::EOWNERDEAD => {
                            self.make_consistent()?;
                            self.note_acquired();
                            return Ok(true);
                        }
                        libc::EINTR => continue,
                        _ => return Err(Error::from_raw_os(eno)),
                    }
                }
            }
            #[cfg(target_os = "macos")]
            {
                self.acquire_polling(Some(Instant::now() + timeout))
            }
        }

        /// Try-lock polling against an optional monotonic deadline, with
        /// dead-holder probing once the wait has dragged on.
        #[cfg(target_os = "macos")]
        fn acquire_polling(&self, deadline: Option<Instant>) -> Result<bool> {
            let started = Instant::now();
            let mut last_probe = started;
            let mut b = Backoff::new();
            loop {
                let eno = unsafe { libc::pthread_mutex_trylock(self.native()) };
                match eno {
                    0 => {
                        self.note_acquired();
                        return Ok(true);
                    }
                    libc::EBUSY => {}
                    _ => return Err(Error::from_raw_os(eno)),
                }
                let now = Instant::now();
                if let Some(dl) = deadline {
                    if now >= dl {
                        return Ok(false);
                    }
                }
                if now.duration_since(started) >= DEAD_HOLDER_PROBE
                    && now.duration_since(last_probe) >= DEAD_HOLDER_PROBE
                {
                    last_probe = now;
                    self.recover_if_holder_dead();
                }
                b.pause();
            }
        }

        /// If the recorded holder is a dead process, reinitialise the mutex
        /// word in place. The CAS on the holder word elects one recoverer.
        #[cfg(target_os = "macos")]
        fn recover_if_holder_dead(&self) {
            let block = self.block();
            let holder = block.holder.load(Ordering::Acquire);
            if holder == 0 || pid_alive(holder) {
                return;
            }
            if block
                .holder
                .compare_exchange(holder, 0, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                return;
            }
            tracing::warn!(name = %self.key, dead_pid = holder, "reinitialising mutex abandoned by dead holder");
            // Peers spinning in trylock meanwhile see EBUSY or EINVAL and
            // keep polling until the fresh word is in place.
            let _ = init_block(self.cached.seg.get() as *mut MutexBlock);
        }

        #[cfg(not(target_os = "macos"))]
        fn make_consistent(&self) -> Result<()> {
            let eno = unsafe { pthread_mutex_consistent(self.native()) };
            if eno != 0 {
                return Err(Error::from_raw_os(eno));
            }
            Ok(())
        }

        fn note_acquired(&self) {
            self.block()
                .holder
                .store(std::process::id(), Ordering::Release);
        }

        pub(super) fn unlock(&self) -> Result<()> {
            // Clear the holder before releasing: a PID left behind after
            // unlock would make a later waiter probe the wrong process.
            self.block().holder.store(0, Ordering::Release);
            let eno = unsafe { libc::pthread_mutex_unlock(self.native()) };
            if eno != 0 {
                return Err(Error::from_raw_os(eno));
            }
            Ok(())
        }

        pub(super) fn clear_storage(logical: &str) {
            if let Ok(key) = name::canonical(logical) {
                cache::purge(&key);
                Segment::clear_storage(&key);
            }
        }
    }

    impl Drop for PosixMutex {
        fn drop(&mut self) {
            // Never destroy the native word in place: after unmap the
            // virtual address can be recycled to a different segment, and
            // a destroy would corrupt whatever lives there now. Unmapping
            // via the cache is the entire teardown.
            cache::release(&self.key);
        }
    }

    fn init_block(block: *mut MutexBlock) -> Result<()> {
        unsafe {
            std::ptr::write_bytes(block, 0, 1);
            let native = (*block).native.get();

            let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
            let mut eno = libc::pthread_mutexattr_init(&mut attr);
            if eno != 0 {
                return Err(Error::from_raw_os(eno));
            }

            eno = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
            if eno != 0 {
                libc::pthread_mutexattr_destroy(&mut attr);
                return Err(Error::from_raw_os(eno));
            }

            #[cfg(not(target_os = "macos"))]
            {
                eno = pthread_mutexattr_setrobust(&mut attr, PTHREAD_MUTEX_ROBUST);
                if eno != 0 {
                    libc::pthread_mutexattr_destroy(&mut attr);
                    return Err(Error::from_raw_os(eno));
                }
            }

            eno = libc::pthread_mutex_init(native, &attr);
            libc::pthread_mutexattr_destroy(&mut attr);
            if eno != 0 {
                return Err(Error::from_raw_os(eno));
            }
        }
        Ok(())
    }

    /// Absolute CLOCK_REALTIME timespec `timeout` from now. Deadline loops
    /// at the call sites recompute per attempt, so a wall-clock jump can
    /// only stretch a single wait.
    #[cfg(not(target_os = "macos"))]
    fn realtime_deadline(timeout: Duration) -> libc::timespec {
        let mut now: libc::timespec = unsafe { std::mem::zeroed() };
        unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };
        let ns_total = now.tv_nsec as u64 + timeout.subsec_nanos() as u64;
        libc::timespec {
            tv_sec: now.tv_sec
                + timeout.as_secs() as libc::time_t
                + (ns_total / 1_000_000_000) as libc::time_t,
            tv_nsec: (ns_total % 1_000_000_000) as libc::c_long,
        }
    }
}

// ---------------------------------------------------------------------------
// Windows implementation
// ---------------------------------------------------------------------------

#[cfg(windows)]
use windows_impl::WindowsMutex;

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

    pub(super) struct WindowsMutex {
        handle: windows_sys::Win32::Foundation::HANDLE,
    }

    unsafe impl Send for WindowsMutex {}
    unsafe impl Sync for WindowsMutex {}

    impl WindowsMutex {
        pub(super) fn open(logical: &str) -> Result<Self> {
            use windows_sys::Win32::System::Threading::CreateMutexW;

            let key = name::canonical(logical)?;
            let wide = to_wide(&key);
            let h = unsafe { CreateMutexW(ptr::null(), 0, wide.as_ptr()) };
            if h == 0 {
                return Err(Error::Os(io::Error::last_os_error()));
            }
            Ok(Self { handle: h })
        }

        fn wait(&self, millis: u32) -> Result<bool> {
            use windows_sys::Win32::Foundation::{WAIT_ABANDONED, WAIT_OBJECT_0, WAIT_TIMEOUT};
            use windows_sys::Win32::System::Threading::WaitForSingleObject;

            let ret = unsafe { WaitForSingleObject(self.handle, millis) };
            match ret {
                WAIT_OBJECT_0 => Ok(true),
                // Previous owner died; the kernel hands us the lock.
                WAIT_ABANDONED => Ok(true),
                WAIT_TIMEOUT => Ok(false),
                _ => Err(Error::Os(io::Error::last_os_error())),
            }
        }

        pub(super) fn lock(&self) -> Result<()> {
            use windows_sys::Win32::System::Threading::INFINITE;
            self.wait(INFINITE).map(|_| ())
        }

        pub(super) fn try_lock(&self) -> Result<bool> {
            self.wait(0)
        }

        pub(super) fn lock_timeout(&self, timeout: Duration) -> Result<bool> {
            self.wait(timeout.as_millis().min(u128::from(u32::MAX - 1)) as u32)
        }

        pub(super) fn unlock(&self) -> Result<()> {
            use windows_sys::Win32::System::Threading::ReleaseMutex;
            if unsafe { ReleaseMutex(self.handle) } == 0 {
                return Err(Error::Os(io::Error::last_os_error()));
            }
            Ok(())
        }
    }

    impl Drop for WindowsMutex {
        fn drop(&mut self) {
            use windows_sys::Win32::Foundation::CloseHandle;
            if self.handle != 0 {
                unsafe { CloseHandle(self.handle) };
            }
        }
    }
}
