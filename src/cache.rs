// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Process-local cache of mapped segments.
//
// Process-shared pthread objects must live at a single virtual address per
// process: some libcs key internal state to the address the object was
// initialised at, and a second mapping of the same physical page at a
// different address fails with EINVAL. All primitives therefore acquire
// their backing segments through this cache, which hands every thread in
// the process the same mapping and only really unmaps when the local
// reference count drains.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::error::Result;
use crate::shm::{OpenMode, Segment};

pub(crate) struct CachedSegment {
    pub(crate) seg: Segment,
    local_refs: AtomicUsize,
}

fn cache() -> &'static Mutex<HashMap<String, Arc<CachedSegment>>> {
    static CACHE: OnceLock<Mutex<HashMap<String, Arc<CachedSegment>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Acquire (or reuse) the process-wide mapping for `name`.
///
/// On the first local open of a freshly created region, `init` runs with
/// the base pointer while the cache lock is still held, so no other thread
/// can observe the segment before one-time initialisation finishes.
pub(crate) fn acquire<F>(name: &str, size: usize, init: F) -> Result<Arc<CachedSegment>>
where
    F: FnOnce(*mut u8) -> Result<()>,
{
    let mut map = cache().lock();
    if let Some(entry) = map.get(name) {
        entry.local_refs.fetch_add(1, Ordering::Relaxed);
        return Ok(Arc::clone(entry));
    }
    let seg = Segment::acquire(name, size, OpenMode::CreateOrOpen)?;
    if seg.is_first() {
        init(seg.get())?;
    }
    let entry = Arc::new(CachedSegment {
        seg,
        local_refs: AtomicUsize::new(1),
    });
    map.insert(name.to_string(), Arc::clone(&entry));
    Ok(entry)
}

/// Release one local reference; the mapping goes away with the last one.
pub(crate) fn release(name: &str) {
    let mut map = cache().lock();
    if let Some(entry) = map.get(name) {
        let prev = entry.local_refs.fetch_sub(1, Ordering::AcqRel);
        if prev <= 1 {
            map.remove(name);
        }
    }
}

/// Drop a cache entry outright, so the next open maps fresh state. Used
/// after `clear_storage` has unlinked the underlying name.
pub(crate) fn purge(name: &str) {
    cache().lock().remove(name);
}
