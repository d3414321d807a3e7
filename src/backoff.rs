// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Adaptive back-off for contended waits, and the spin lock built on it.
//
// The ladder: a short spin phase with a CPU pause hint (PAUSE on x86, ISB
// on ARM64 via `std::hint::spin_loop`) to absorb momentary contention,
// then escalating sleeps — 1µs × 100, 10µs × 100, 100µs × 100, then 1ms —
// until the caller's deadline. Timed-lock and timed-wait emulation on
// platforms without `_timedlock`/`_timedwait` runs entirely on this
// schedule.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Iterations of pure spinning before the ladder starts sleeping.
const SPIN_ROUNDS: u32 = 1_000;
/// Rounds per sleep tier.
const TIER_ROUNDS: u32 = 100;

/// Escalating wait state for one contended operation.
///
/// Create one per acquisition attempt and call [`Backoff::pause`] between
/// retries; the caller owns deadline checks.
pub struct Backoff {
    step: u32,
}

impl Backoff {
    pub const fn new() -> Self {
        Self { step: 0 }
    }

    /// Whether the next `pause` will sleep rather than spin.
    pub fn is_sleeping(&self) -> bool {
        self.step >= SPIN_ROUNDS
    }

    /// Burn one step of the ladder.
    pub fn pause(&mut self) {
        let s = self.step;
        self.step = s.saturating_add(1);
        if s < SPIN_ROUNDS {
            std::hint::spin_loop();
        } else if s < SPIN_ROUNDS + TIER_ROUNDS {
            std::thread::sleep(Duration::from_micros(1));
        } else if s < SPIN_ROUNDS + 2 * TIER_ROUNDS {
            std::thread::sleep(Duration::from_micros(10));
        } else if s < SPIN_ROUNDS + 3 * TIER_ROUNDS {
            std::thread::sleep(Duration::from_micros(100));
        } else {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// A test-and-set spin lock with adaptive back-off.
///
/// Suitable for shared memory: a single `AtomicU32` word, zero-initialised
/// state is unlocked, and `repr` transparency is irrelevant because the
/// word is the whole lock. Hold times must stay bounded — this never
/// parks in the OS.
#[repr(transparent)]
pub struct SpinLock {
    word: AtomicU32,
}

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            word: AtomicU32::new(0),
        }
    }

    pub fn lock(&self) {
        let mut b = Backoff::new();
        while self.word.swap(1, Ordering::Acquire) != 0 {
            b.pause();
        }
    }

    pub fn try_lock(&self) -> bool {
        self.word.swap(1, Ordering::Acquire) == 0
    }

    pub fn unlock(&self) {
        self.word.store(0, Ordering::Release);
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}
