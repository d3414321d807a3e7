// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Crate-wide error type. Every fallible library path returns `Result<T>`;
// no path uses unwinding for control flow.

use std::io;

/// Errors surfaced by shmbus operations.
///
/// `Timeout` and `WouldBlock` are recoverable and commonly retried by
/// callers. `Os` and `ResourceExhausted` are surfaced verbatim. A mutex
/// that was recovered from a dead holder never produces an error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The logical name is unusable: empty, or contains an interior NUL.
    #[error("invalid name: {0}")]
    NameInvalid(String),

    /// The OS refused an allocation, mapping, semaphore, or signal.
    #[error("os error: {0}")]
    Os(#[from] io::Error),

    /// The deadline passed before the operation could proceed.
    #[error("timed out")]
    Timeout,

    /// A `try_*` operation could not proceed immediately.
    #[error("would block")]
    WouldBlock,

    /// The peer end went away; further I/O on this handle is meaningless.
    #[error("closed")]
    Closed,

    /// Chunk pool or connection table is full.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// Operation applied to a handle in the wrong mode, or to a region
    /// created with an incompatible layout.
    #[error("invalid handle: {0}")]
    InvalidHandle(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Convenience constructor from a raw OS errno / last-error code.
    pub(crate) fn from_raw_os(code: i32) -> Self {
        Error::Os(io::Error::from_raw_os_error(code))
    }
}
