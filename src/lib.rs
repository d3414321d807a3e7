// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// shmbus: low-latency inter-process message passing over shared memory.
//
// Two transports — `Route` (one writer broadcasting to many readers) and
// `Channel` (many writers, same fan-out) — built on a lock-free slot ring
// with per-reader connection tracking, a size-classed chunk store for
// payloads larger than a slot, and cross-process mutex / condvar /
// semaphore / waiter primitives living in named shared-memory regions.

pub mod name;

mod platform;

mod error;
pub use error::{Error, Result};

mod backoff;
pub use backoff::{Backoff, SpinLock};

mod shm;
pub use shm::{OpenMode, Segment};

mod cache;

mod mutex;
pub use mutex::NamedMutex;

mod condvar;
pub use condvar::NamedCondvar;

mod semaphore;
pub use semaphore::NamedSemaphore;

mod waiter;
pub use waiter::Waiter;

pub mod ring;

pub mod chunk;

mod transport;
pub use transport::{Channel, Mode, Route};

mod spsc;
pub use spsc::SpscRing;
