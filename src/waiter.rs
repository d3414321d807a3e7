// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Composite waiter: a named mutex, a named condition variable, and a
// shared wake-generation counter.
//
// This is the blocking building block of the transport: readers park here
// while the ring is empty, writers while their slot is occupied, and
// `wait_for_recv` while too few receivers are connected. The generation
// counter is bumped under the mutex on every wake-up, so a late waiter can
// observe that signals happened while it was between its predicate check
// and the condition wait.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::{self, CachedSegment};
use crate::condvar::NamedCondvar;
use crate::error::Result;
use crate::mutex::NamedMutex;
use crate::name;

pub struct Waiter {
    lock: NamedMutex,
    cond: NamedCondvar,
    counter: Arc<CachedSegment>,
    counter_key: String,
    quit: AtomicBool,
}

impl Waiter {
    /// Open a named waiter; the mutex, condvar, and counter segments are
    /// derived from `name`.
    pub fn open(name: &str) -> Result<Self> {
        let lock = NamedMutex::open(&format!("{name}.mx"))?;
        let cond = NamedCondvar::open(&format!("{name}.cv"))?;
        let counter_key = name::canonical(&format!("{name}.gen"))?;
        // Fresh segments are zero-filled; generation zero needs no init.
        let counter = cache::acquire(&counter_key, std::mem::size_of::<AtomicU64>(), |_| Ok(()))?;
        Ok(Self {
            lock,
            cond,
            counter,
            counter_key,
            quit: AtomicBool::new(false),
        })
    }

    fn generation_word(&self) -> &AtomicU64 {
        unsafe { &*(self.counter.seg.get() as *const AtomicU64) }
    }

    /// Number of wake-ups broadcast so far on this waiter.
    pub fn generation(&self) -> u64 {
        self.generation_word().load(Ordering::Acquire)
    }

    /// Block while `pred` holds. Returns `Ok(true)` when the predicate
    /// turned false or quit was signalled, `Ok(false)` on timeout.
    ///
    /// `pred` runs with the waiter mutex held and must stay cheap.
    pub fn wait_while<F>(&self, pred: F, timeout: Option<Duration>) -> Result<bool>
    where
        F: Fn() -> bool,
    {
        let deadline = timeout.map(|d| Instant::now() + d);
        self.lock.lock()?;
        while !self.quit.load(Ordering::Acquire) && pred() {
            let slice = match deadline {
                None => None,
                Some(dl) => {
                    let remaining = dl.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        self.lock.unlock()?;
                        return Ok(false);
                    }
                    Some(remaining)
                }
            };
            if !self.cond.wait(&self.lock, slice)? {
                self.lock.unlock()?;
                return Ok(false);
            }
        }
        self.lock.unlock()?;
        Ok(true)
    }

    /// Wake one waiter.
    pub fn notify_one(&self) -> Result<()> {
        // Taking the lock orders this signal after any in-progress
        // predicate check, so the waiter either saw the new state or is
        // already parked in the condition wait.
        self.lock.lock()?;
        self.generation_word().fetch_add(1, Ordering::Release);
        self.lock.unlock()?;
        self.cond.notify_one()
    }

    /// Wake all waiters.
    pub fn broadcast(&self) -> Result<()> {
        self.lock.lock()?;
        self.generation_word().fetch_add(1, Ordering::Release);
        self.lock.unlock()?;
        self.cond.notify_all()
    }

    /// Make every current and future `wait_while` on this handle return
    /// immediately, then wake everyone.
    pub fn quit_waiting(&self) -> Result<()> {
        self.quit.store(true, Ordering::Release);
        self.broadcast()
    }

    /// Remove the backing storage for a named waiter.
    pub fn clear_storage(name: &str) {
        NamedMutex::clear_storage(&format!("{name}.mx"));
        NamedCondvar::clear_storage(&format!("{name}.cv"));
        if let Ok(key) = name::canonical(&format!("{name}.gen")) {
            cache::purge(&key);
            crate::shm::Segment::clear_storage(&key);
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        cache::release(&self.counter_key);
    }
}
