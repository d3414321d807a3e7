// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named inter-process condition variable.
//
// POSIX: a `pthread_cond_t` with PTHREAD_PROCESS_SHARED in a one-object
// shared segment. Windows: emulated from a named semaphore, a named mutex,
// and a wait counter.

use std::time::Duration;

use crate::error::Result;
use crate::mutex::NamedMutex;

/// A named condition variable shared between processes.
///
/// `wait` pairs with an external [`NamedMutex`] supplied at wait time; the
/// caller must hold it, and the wait atomically releases and re-acquires.
pub struct NamedCondvar {
    #[cfg(unix)]
    inner: PosixCondvar,
    #[cfg(windows)]
    inner: WindowsCondvar,
}

impl NamedCondvar {
    /// Open (or create) the named condition variable.
    pub fn open(name: &str) -> Result<Self> {
        #[cfg(unix)]
        let inner = PosixCondvar::open(name)?;
        #[cfg(windows)]
        let inner = WindowsCondvar::open(name)?;
        Ok(Self { inner })
    }

    /// Wait for a signal. `None` blocks indefinitely; otherwise returns
    /// `Ok(false)` when `timeout` passes unsignalled.
    pub fn wait(&self, mutex: &NamedMutex, timeout: Option<Duration>) -> Result<bool> {
        self.inner.wait(mutex, timeout)
    }

    /// Wake one waiter.
    pub fn notify_one(&self) -> Result<()> {
        self.inner.notify_one()
    }

    /// Wake all waiters.
    pub fn notify_all(&self) -> Result<()> {
        self.inner.notify_all()
    }

    /// Remove the backing storage for a named condition variable.
    pub fn clear_storage(name: &str) {
        #[cfg(unix)]
        PosixCondvar::clear_storage(name);
        #[cfg(windows)]
        WindowsCondvar::clear_storage(name);
    }
}

// ---------------------------------------------------------------------------
// POSIX implementation
// ---------------------------------------------------------------------------

#[cfg(unix)]
use posix_impl::PosixCondvar;

#[cfg(unix)]
mod posix_impl {
    use std::sync::Arc;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use crate::cache::{self, CachedSegment};
    use crate::error::{Error, Result};
    use crate::mutex::NamedMutex;
    use crate::name;
    use crate::shm::Segment;

    #[cfg(not(target_os = "macos"))]
    extern "C" {
        fn pthread_mutex_consistent(mutex: *mut libc::pthread_mutex_t) -> libc::c_int;
    }

    /// Map a wait result, absorbing a robust-mutex owner death: the wait
    /// re-acquired an inconsistent mutex, which counts as a wake-up once
    /// the mutex is made consistent again.
    fn wait_result(eno: i32, mtx: *mut libc::pthread_mutex_t) -> Option<Result<bool>> {
        #[cfg(target_os = "macos")]
        let _ = mtx;
        match eno {
            0 => Some(Ok(true)),
            libc::ETIMEDOUT => Some(Ok(false)),
            libc::EINTR => None,
            #[cfg(not(target_os = "macos"))]
            libc::EOWNERDEAD => {
                let fixed = unsafe { pthread_mutex_consistent(mtx) };
                if fixed != 0 {
                    return Some(Err(Error::from_raw_os(fixed)));
                }
                Some(Ok(true))
            }
            _ => Some(Err(Error::from_raw_os(eno))),
        }
    }

    pub(super) struct PosixCondvar {
        cached: Arc<CachedSegment>,
        key: String,
    }

    impl PosixCondvar {
        pub(super) fn open(logical: &str) -> Result<Self> {
            let key = name::canonical(logical)?;
            let cached = cache::acquire(&key, std::mem::size_of::<libc::pthread_cond_t>(), |base| {
                init_cond(base as *mut libc::pthread_cond_t)
            })?;
            Ok(Self { cached, key })
        }

        fn native(&self) -> *mut libc::pthread_cond_t {
            self.cached.seg.get() as *mut libc::pthread_cond_t
        }

        pub(super) fn wait(&self, mutex: &NamedMutex, timeout: Option<Duration>) -> Result<bool> {
            let mtx = mutex.native_ptr();
            match timeout {
                None => loop {
                    let eno = unsafe { libc::pthread_cond_wait(self.native(), mtx) };
                    if let Some(r) = wait_result(eno, mtx) {
                        return r;
                    }
                },
                Some(dur) => {
                    let now = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .unwrap_or_default();
                    let abs = now + dur;
                    let ts = libc::timespec {
                        tv_sec: abs.as_secs() as libc::time_t,
                        tv_nsec: abs.subsec_nanos() as libc::c_long,
                    };
                    loop {
                        let eno = unsafe { libc::pthread_cond_timedwait(self.native(), mtx, &ts) };
                        if let Some(r) = wait_result(eno, mtx) {
                            return r;
                        }
                    }
                }
            }
        }

        pub(super) fn notify_one(&self) -> Result<()> {
            let eno = unsafe { libc::pthread_cond_signal(self.native()) };
            if eno != 0 {
                return Err(Error::from_raw_os(eno));
            }
            Ok(())
        }

        pub(super) fn notify_all(&self) -> Result<()> {
            let eno = unsafe { libc::pthread_cond_broadcast(self.native()) };
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

    impl Drop for PosixCondvar {
        fn drop(&mut self) {
            // Never destroy the native word in place; see the mutex drop.
            cache::release(&self.key);
        }
    }

    fn init_cond(cond: *mut libc::pthread_cond_t) -> Result<()> {
        unsafe {
            std::ptr::write_bytes(cond, 0, 1);

            let mut attr: libc::pthread_condattr_t = std::mem::zeroed();
            let mut eno = libc::pthread_condattr_init(&mut attr);
            if eno != 0 {
                return Err(Error::from_raw_os(eno));
            }

            eno = libc::pthread_condattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
            if eno != 0 {
                libc::pthread_condattr_destroy(&mut attr);
                return Err(Error::from_raw_os(eno));
            }

            eno = libc::pthread_cond_init(cond, &attr);
            libc::pthread_condattr_destroy(&mut attr);
            if eno != 0 {
                return Err(Error::from_raw_os(eno));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Windows implementation — semaphore + mutex + wait counter
// ---------------------------------------------------------------------------

#[cfg(windows)]
use windows_impl::WindowsCondvar;

#[cfg(windows)]
mod windows_impl {
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::time::Duration;

    use crate::error::Result;
    use crate::mutex::NamedMutex;
    use crate::semaphore::NamedSemaphore;

    pub(super) struct WindowsCondvar {
        sem: NamedSemaphore,
        lock: NamedMutex,
        waiters: AtomicI32,
    }

    impl WindowsCondvar {
        pub(super) fn open(name: &str) -> Result<Self> {
            let sem = NamedSemaphore::open(&format!("{name}.cvs"), 0)?;
            let lock = NamedMutex::open(&format!("{name}.cvl"))?;
            Ok(Self {
                sem,
                lock,
                waiters: AtomicI32::new(0),
            })
        }

        pub(super) fn wait(&self, mutex: &NamedMutex, timeout: Option<Duration>) -> Result<bool> {
            self.lock.lock()?;
            self.waiters.fetch_add(1, Ordering::Relaxed);
            self.lock.unlock()?;

            mutex.unlock()?;
            let signalled = self.sem.wait(timeout)?;
            mutex.lock()?;

            if !signalled {
                self.lock.lock()?;
                self.waiters.fetch_sub(1, Ordering::Relaxed);
                self.lock.unlock()?;
            }
            Ok(signalled)
        }

        pub(super) fn notify_one(&self) -> Result<()> {
            self.lock.lock()?;
            if self.waiters.load(Ordering::Relaxed) > 0 {
                self.sem.post(1)?;
                self.waiters.fetch_sub(1, Ordering::Relaxed);
            }
            self.lock.unlock()?;
            Ok(())
        }

        pub(super) fn notify_all(&self) -> Result<()> {
            self.lock.lock()?;
            let n = self.waiters.load(Ordering::Relaxed);
            if n > 0 {
                self.sem.post(n as u32)?;
                self.waiters.store(0, Ordering::Relaxed);
            }
            self.lock.unlock()?;
            Ok(())
        }

        pub(super) fn clear_storage(name: &str) {
            NamedSemaphore::clear_storage(&format!("{name}.cvs"));
            NamedMutex::clear_storage(&format!("{name}.cvl"));
        }
    }
}
