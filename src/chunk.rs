// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Overflow store for payloads larger than a ring slot.
//
// One named region holds every size class: powers of two from 128 bytes
// to 1 MiB, a fixed number of chunks per class, and a per-class free list
// (u32 links) guarded by a spin word in the store header. Each chunk
// starts with an `AtomicU64` reader mask that mirrors the referencing
// slot's outstanding mask: readers clear their bit after copying the
// payload out, and whoever clears the last bit pushes the chunk back on
// its free list. The region is large but lazily committed — only classes
// actually used ever touch physical pages.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::backoff::SpinLock;
use crate::error::{Error, Result};
use crate::ring::SLOT_DATA;
use crate::shm::{OpenMode, Segment};

/// Smallest chunk class in bytes.
pub const MIN_CLASS: usize = 128;
/// Number of size classes: 128 B, 256 B, …, 1 MiB.
pub const NUM_CLASSES: usize = 14;
/// Chunks per class.
pub const CHUNKS_PER_CLASS: usize = 32;
/// Largest payload the store accepts.
pub const MAX_PAYLOAD: usize = MIN_CLASS << (NUM_CLASSES - 1);

/// Free-list terminator.
const FREE_END: u32 = CHUNKS_PER_CLASS as u32;

/// Bytes of chunk header (reader mask, padded to 16 for payload
/// alignment).
const CHUNK_HEADER: usize = 16;

const fn class_bytes(class: usize) -> usize {
    MIN_CLASS << class
}

const fn class_stride(class: usize) -> usize {
    CHUNK_HEADER + class_bytes(class)
}

/// Byte offset of `class`'s chunk array, measured from the end of the
/// store header.
const fn class_offset(class: usize) -> usize {
    let mut off = 0;
    let mut c = 0;
    while c < class {
        off += class_stride(c) * CHUNKS_PER_CLASS;
        c += 1;
    }
    off
}

/// Total region size for the store.
pub const fn region_size() -> usize {
    std::mem::size_of::<StoreHeader>() + class_offset(NUM_CLASSES)
}

#[repr(C)]
struct ClassPool {
    lock: SpinLock,
    /// 0 until the free list has been threaded.
    primed: AtomicU32,
    free_head: AtomicU32,
    _pad: u32,
    next: [AtomicU32; CHUNKS_PER_CLASS],
}

#[repr(C)]
struct StoreHeader {
    pools: [ClassPool; NUM_CLASSES],
}

/// Descriptor of one allocated chunk, as carried inside a ring slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkTicket {
    pub len: u32,
    pub class: u8,
    pub index: u8,
}

impl ChunkTicket {
    pub const WIRE_LEN: usize = 8;

    pub fn to_wire(self) -> [u8; Self::WIRE_LEN] {
        let mut w = [0u8; Self::WIRE_LEN];
        w[..4].copy_from_slice(&self.len.to_ne_bytes());
        w[4] = self.class;
        w[5] = self.index;
        w
    }

    /// Decode from the first `WIRE_LEN` bytes of a slot payload. Returns
    /// `None` for out-of-range class or index values.
    pub fn from_wire(slot: &[u8; SLOT_DATA]) -> Option<Self> {
        let len = u32::from_ne_bytes([slot[0], slot[1], slot[2], slot[3]]);
        let class = slot[4];
        let index = slot[5];
        if (class as usize) >= NUM_CLASSES || (index as usize) >= CHUNKS_PER_CLASS {
            return None;
        }
        Some(Self { len, class, index })
    }
}

/// A mapped view of the chunk-store region.
pub struct ChunkStore {
    seg: Segment,
}

impl ChunkStore {
    /// Open (or create) the store region for a transport.
    pub fn open(name: &str) -> Result<Self> {
        let seg = Segment::acquire(name, region_size(), OpenMode::CreateOrOpen)?;
        Ok(Self { seg })
    }

    fn header(&self) -> &StoreHeader {
        unsafe { &*(self.seg.get() as *const StoreHeader) }
    }

    fn chunk_base(&self, class: usize, index: usize) -> *mut u8 {
        unsafe {
            self.seg
                .get()
                .add(std::mem::size_of::<StoreHeader>())
                .add(class_offset(class))
                .add(class_stride(class) * index)
        }
    }

    fn readers_word(&self, class: usize, index: usize) -> &AtomicU64 {
        unsafe { &*(self.chunk_base(class, index) as *const AtomicU64) }
    }

    /// Smallest class fitting `len` bytes, or `None` beyond the largest.
    pub fn class_for(len: usize) -> Option<usize> {
        (0..NUM_CLASSES).find(|&c| class_bytes(c) >= len)
    }

    /// Allocate a chunk for `len` payload bytes. The reader mask starts
    /// at zero; the publisher installs it once the referencing slot is
    /// claimed. Fails with `ResourceExhausted` when the payload exceeds
    /// the largest class or the class pool is dry.
    pub fn acquire(&self, len: usize) -> Result<(ChunkTicket, *mut u8)> {
        let class = Self::class_for(len)
            .ok_or(Error::ResourceExhausted("payload exceeds largest chunk class"))?;
        let pool = &self.header().pools[class];

        pool.lock.lock();
        if pool.primed.load(Ordering::Relaxed) == 0 {
            // Fresh region: thread the free list 0 → 1 → … → END.
            for i in 0..CHUNKS_PER_CLASS {
                pool.next[i].store(i as u32 + 1, Ordering::Relaxed);
            }
            pool.free_head.store(0, Ordering::Relaxed);
            pool.primed.store(1, Ordering::Relaxed);
        }
        let head = pool.free_head.load(Ordering::Relaxed);
        if head >= FREE_END {
            pool.lock.unlock();
            return Err(Error::ResourceExhausted("chunk pool full"));
        }
        let next = pool.next[head as usize].load(Ordering::Relaxed);
        pool.free_head.store(next, Ordering::Relaxed);
        pool.lock.unlock();

        let index = head as usize;
        self.readers_word(class, index).store(0, Ordering::Release);
        let payload = unsafe { self.chunk_base(class, index).add(CHUNK_HEADER) };
        Ok((
            ChunkTicket {
                len: len as u32,
                class: class as u8,
                index: index as u8,
            },
            payload,
        ))
    }

    /// Payload pointer for an allocated chunk.
    pub fn payload_ptr(&self, t: ChunkTicket) -> *const u8 {
        unsafe {
            self.chunk_base(t.class as usize, t.index as usize)
                .add(CHUNK_HEADER)
        }
    }

    /// Install the reader mask. Runs on the publisher after the ring slot
    /// is claimed and before the slot's outstanding mask is released, so
    /// the two masks always start equal.
    pub fn set_readers(&self, t: ChunkTicket, mask: u64) {
        self.readers_word(t.class as usize, t.index as usize)
            .store(mask, Ordering::Release);
    }

    /// Reader-mask snapshot (diagnostics and tests).
    pub fn readers(&self, t: ChunkTicket) -> u64 {
        self.readers_word(t.class as usize, t.index as usize)
            .load(Ordering::Acquire)
    }

    /// Drop `bits` of interest in the chunk; whoever clears the last bit
    /// frees it. Clearing bits that are already clear is a no-op, which
    /// keeps racing releases from double-freeing.
    pub fn release(&self, t: ChunkTicket, bits: u64) {
        let word = self.readers_word(t.class as usize, t.index as usize);
        let prev = word.fetch_and(!bits, Ordering::AcqRel);
        if prev & bits != 0 && prev & !bits == 0 {
            self.free(t.class as usize, t.index as usize);
        }
    }

    /// Return an allocated-but-never-published chunk straight to its free
    /// list. Only valid before `set_readers` has made the chunk visible.
    pub fn abort(&self, t: ChunkTicket) {
        self.free(t.class as usize, t.index as usize);
    }

    fn free(&self, class: usize, index: usize) {
        let pool = &self.header().pools[class];
        pool.lock.lock();
        let head = pool.free_head.load(Ordering::Relaxed);
        pool.next[index].store(head, Ordering::Relaxed);
        pool.free_head.store(index as u32, Ordering::Relaxed);
        pool.lock.unlock();
    }

    /// Remove the backing region.
    pub fn clear_storage(name: &str) {
        Segment::clear_storage(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_selection_is_smallest_fit() {
        assert_eq!(ChunkStore::class_for(1), Some(0));
        assert_eq!(ChunkStore::class_for(128), Some(0));
        assert_eq!(ChunkStore::class_for(129), Some(1));
        assert_eq!(ChunkStore::class_for(65536), Some(9));
        assert_eq!(ChunkStore::class_for(MAX_PAYLOAD), Some(NUM_CLASSES - 1));
        assert_eq!(ChunkStore::class_for(MAX_PAYLOAD + 1), None);
    }

    #[test]
    fn ticket_wire_round_trip() {
        let t = ChunkTicket {
            len: 65536,
            class: 9,
            index: 31,
        };
        let mut slot = [0u8; SLOT_DATA];
        slot[..ChunkTicket::WIRE_LEN].copy_from_slice(&t.to_wire());
        assert_eq!(ChunkTicket::from_wire(&slot), Some(t));
    }

    #[test]
    fn ticket_rejects_out_of_range() {
        let mut slot = [0u8; SLOT_DATA];
        slot[4] = NUM_CLASSES as u8; // class out of range
        assert_eq!(ChunkTicket::from_wire(&slot), None);
    }
}
