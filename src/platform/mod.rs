// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors

#[cfg(unix)]
pub(crate) mod posix;

#[cfg(windows)]
pub(crate) mod windows;

#[cfg(unix)]
pub(crate) use posix::{pid_alive, OsShm};

#[cfg(windows)]
pub(crate) use windows::{pid_alive, OsShm};
