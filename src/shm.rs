// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named shared-memory regions.
//
// A `Segment` maps one named region into this process. The region carries
// a cross-process reference counter; the logical lifetime of the region is
// the longest-living mapping, and the name is unlinked when the last
// mapping anywhere goes away. `clear_storage` force-unlinks a name without
// needing a handle.

use crate::error::Result;
use crate::platform::OsShm;

/// Open mode for named regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Create exclusively; fail if the name already exists.
    Create,
    /// Open an existing region; fail if the name does not exist.
    Open,
    /// Create if missing, adopt if present. An existing region at least as
    /// large as requested is adopted unchanged; a smaller one is unlinked
    /// and recreated.
    CreateOrOpen,
}

/// A named, reference-counted shared-memory region mapped into this
/// process.
pub struct Segment {
    inner: OsShm,
}

impl Segment {
    /// Acquire a named region of at least `size` user-visible bytes.
    pub fn acquire(name: &str, size: usize, mode: OpenMode) -> Result<Self> {
        #[cfg(unix)]
        let os_mode = match mode {
            OpenMode::Create => crate::platform::posix::OsShmMode::Create,
            OpenMode::Open => crate::platform::posix::OsShmMode::Open,
            OpenMode::CreateOrOpen => crate::platform::posix::OsShmMode::CreateOrOpen,
        };
        #[cfg(windows)]
        let os_mode = match mode {
            OpenMode::Create => crate::platform::windows::OsShmMode::Create,
            OpenMode::Open => crate::platform::windows::OsShmMode::Open,
            OpenMode::CreateOrOpen => crate::platform::windows::OsShmMode::CreateOrOpen,
        };

        let inner = OsShm::acquire(name, size, os_mode)?;
        Ok(Self { inner })
    }

    /// Base pointer of the user-visible region. Freshly created regions
    /// are zero-filled by the OS.
    pub fn get(&self) -> *mut u8 {
        self.inner.as_mut_ptr()
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.inner.as_mut_ptr()
    }

    /// Caller-requested size. The mapped region may be larger.
    pub fn user_size(&self) -> usize {
        self.inner.user_size()
    }

    /// Total mapped size, bookkeeping header included.
    pub fn mapped_size(&self) -> usize {
        self.inner.mapped_size()
    }

    /// The canonical name handed to the OS.
    pub fn os_name(&self) -> &str {
        self.inner.os_name()
    }

    /// Snapshot of the cross-process reference count.
    pub fn ref_count(&self) -> i32 {
        self.inner.ref_count()
    }

    /// True when this handle found the region unreferenced, i.e. it is the
    /// first mapping and owns one-time initialisation.
    pub fn is_first(&self) -> bool {
        self.inner.prev_ref() == 0
    }

    /// Force-remove the backing name. Existing mappings stay valid.
    pub fn unlink(&self) {
        self.inner.unlink();
    }

    /// Remove the backing storage for `name` without an open handle.
    /// Idempotent; unknown names are ignored.
    pub fn clear_storage(name: &str) {
        OsShm::unlink_by_name(name);
    }
}
