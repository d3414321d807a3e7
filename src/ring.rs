// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The shared circulation ring.
//
// Layout: `[RingHeader][RingSlot; capacity]` in one named region, fixed at
// first-creator time. The producer cursor (`head`) and the per-connection
// cursors are 64-bit and monotonically non-decreasing; slot indexing is
// `cursor % capacity` and cursor wrap-around is a non-concern at 64 bits.
//
// Each slot carries an outstanding-reader bitmask and the sequence number
// it was last published at. A slot is writable iff no *live* reader still
// has to consume it, where live means: the reader's bit is in the
// connection bitmask AND its cursor has not moved past the slot's
// sequence. Bits failing that test are leftovers of dead or departed
// readers; the producer reclaims them (dropping the slot's chunk
// reference, if any) instead of back-pressuring on them.
//
// Two head-update variants share the layout: broadcast has a single
// writer and publishes directly; unicast serialises its N writers with a
// test-and-set spin word around the claim/write/publish step.
//
// Ordering protocol: payload and slot metadata are written before
// `outstanding` is stored with Release and before `head` advances with
// Release; readers acquire-load `head` (and `outstanding`) before touching
// payload bytes. Connection changes publish with Release on the
// connection bitmask and are acquire-loaded by everyone else.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::backoff::SpinLock;
use crate::error::{Error, Result};

/// Payload bytes carried inline by one slot.
pub const SLOT_DATA: usize = 64;

/// Width of the connection bitmask: concurrent receivers per ring.
pub const MAX_CONNECTIONS: usize = 64;

/// Default slot count; any capacity in `2..=MAX_CAPACITY` works.
pub const DEFAULT_CAPACITY: usize = 256;
pub const MAX_CAPACITY: usize = 4096;

/// Layout guard stamped into the header by the first creator. Changing
/// the slot geometry means changing this value.
const MAGIC: u64 = u64::from_le_bytes(*b"SBRING01");

/// Flag bit in the slot `len` word: payload is a chunk descriptor.
pub const LEN_CHUNK: u32 = 0x8000_0000;
/// Low bits of the `len` word: payload byte count.
pub const LEN_MASK: u32 = 0x7fff_ffff;

/// Head-update rule, fixed per ring at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingKind {
    /// One writer; readers fan out.
    Broadcast = 1,
    /// N writers serialised on the producer spin word.
    Unicast = 2,
}

// Per-connection tenancy states.
const CONN_EMPTY: u32 = 0;
const CONN_CONNECTED: u32 = 1;
const CONN_DISCONNECTED: u32 = 2;

/// One receiver's record in the header: its cursor, its PID (for liveness
/// probing), and the tenancy state machine Empty → Connected →
/// Disconnected (→ Empty once drained, making the record reclaimable).
#[repr(C)]
struct ConnRecord {
    cursor: AtomicU64,
    pid: AtomicU32,
    state: AtomicU32,
}

// The header is mapped at a fixed 16-byte offset into the region, so its
// alignment must not exceed that of its atomics. Hot words are kept off
// each other's cache lines with explicit padding instead of an
// over-aligned wrapper type.
#[repr(C)]
struct RingHeader {
    magic: AtomicU64,
    kind: AtomicU64,
    capacity: AtomicU64,
    ready: AtomicU32,
    init_lock: SpinLock,
    sender_count: AtomicU32,
    _pad0: [u8; 28],
    head: AtomicU64,
    _pad1: [u8; 64 - 8],
    producer_lock: SpinLock,
    _pad2: [u8; 64 - 4],
    conn_mask: AtomicU64,
    _pad3: [u8; 64 - 8],
    conns: [ConnRecord; MAX_CONNECTIONS],
}

const _: () = assert!(std::mem::size_of::<RingHeader>() == 4 * 64 + MAX_CONNECTIONS * 16);
const _: () = assert!(std::mem::align_of::<RingHeader>() == 8);

#[repr(C)]
pub struct RingSlot {
    data: UnsafeCell<[u8; SLOT_DATA]>,
    len: AtomicU32,
    _pad: u32,
    /// Sequence (head value) this slot was last published at.
    seq: AtomicU64,
    /// Bit per receiver that has not consumed this publication yet.
    outstanding: AtomicU64,
}

/// Bytes of shared memory needed for a ring of `capacity` slots.
pub const fn region_size(capacity: usize) -> usize {
    std::mem::size_of::<RingHeader>() + capacity * std::mem::size_of::<RingSlot>()
}

/// Outcome of one non-blocking publish attempt.
pub enum PublishOutcome {
    Published,
    /// Connection bitmask was empty; nothing was written.
    NoReceivers,
    /// The target slot still has live unconsumed readers.
    Busy { live: u64 },
}

/// Outcome of one non-blocking consume attempt.
pub enum ConsumeOutcome {
    /// Nothing published past this reader's cursor.
    Empty,
    /// The slot at the cursor was not addressed to this reader; the
    /// cursor was advanced.
    Skipped,
    /// A message was consumed.
    Msg {
        len_word: u32,
        data: [u8; SLOT_DATA],
        /// No live reader still holds the slot; the producer can be woken.
        slot_freed: bool,
    },
}

/// A mapped view of one ring region.
///
/// Cheap to copy around inside an endpoint; the owning `Segment` must
/// outlive it.
pub struct RingView {
    base: *mut u8,
    capacity: u64,
}

unsafe impl Send for RingView {}

impl RingView {
    /// Attach to (and if first, initialise) the ring at `base`.
    ///
    /// The first creator's `capacity` and `kind` win; later opens adopt
    /// the existing geometry and fail on a variant or layout mismatch.
    ///
    /// # Safety
    /// `base` must point to a zero-initialised-or-previously-initialised
    /// region of at least `region_size(capacity)` bytes that stays mapped
    /// for the view's lifetime.
    pub unsafe fn attach(base: *mut u8, kind: RingKind, capacity: usize) -> Result<Self> {
        let hdr = &*(base as *const RingHeader);

        if hdr.ready.load(Ordering::Acquire) == 0 {
            hdr.init_lock.lock();
            if hdr.ready.load(Ordering::Relaxed) == 0 {
                hdr.magic.store(MAGIC, Ordering::Relaxed);
                hdr.kind.store(kind as u64, Ordering::Relaxed);
                hdr.capacity.store(capacity as u64, Ordering::Relaxed);
                // Cursors, masks, records, and slots rely on the region
                // being zero-filled at creation.
                hdr.ready.store(1, Ordering::Release);
            }
            hdr.init_lock.unlock();
        }

        if hdr.magic.load(Ordering::Acquire) != MAGIC {
            return Err(Error::InvalidHandle("ring layout mismatch"));
        }
        if hdr.kind.load(Ordering::Acquire) != kind as u64 {
            return Err(Error::InvalidHandle(
                "ring was created for the other transport variant",
            ));
        }
        let capacity = hdr.capacity.load(Ordering::Acquire);
        if capacity < 2 || capacity > MAX_CAPACITY as u64 {
            return Err(Error::InvalidHandle("ring capacity out of range"));
        }

        Ok(Self { base, capacity })
    }

    fn header(&self) -> &RingHeader {
        unsafe { &*(self.base as *const RingHeader) }
    }

    fn slot_at(&self, cursor: u64) -> &RingSlot {
        let idx = (cursor % self.capacity) as usize;
        unsafe {
            let slots = self.base.add(std::mem::size_of::<RingHeader>()) as *const RingSlot;
            &*slots.add(idx)
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    pub fn head(&self) -> u64 {
        self.header().head.load(Ordering::Acquire)
    }

    pub fn conn_mask(&self) -> u64 {
        self.header().conn_mask.load(Ordering::Acquire)
    }

    /// Number of connected receivers.
    pub fn conn_count(&self) -> usize {
        self.conn_mask().count_ones() as usize
    }

    pub fn is_reader_connected(&self, idx: usize) -> bool {
        self.conn_mask() & (1u64 << idx) != 0
    }

    pub fn reader_cursor(&self, idx: usize) -> u64 {
        self.header().conns[idx].cursor.load(Ordering::Acquire)
    }

    pub fn reader_pid(&self, idx: usize) -> u32 {
        self.header().conns[idx].pid.load(Ordering::Acquire)
    }

    // -- sender accounting ---------------------------------------------------

    /// Register a writer. Broadcast rings admit exactly one.
    pub fn register_sender(&self, kind: RingKind) -> Result<()> {
        let hdr = self.header();
        match kind {
            RingKind::Broadcast => {
                if hdr
                    .sender_count
                    .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    return Err(Error::ResourceExhausted("route already has a sender"));
                }
                Ok(())
            }
            RingKind::Unicast => {
                hdr.sender_count.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
        }
    }

    pub fn unregister_sender(&self) {
        self.header().sender_count.fetch_sub(1, Ordering::AcqRel);
    }

    // -- connection registration ---------------------------------------------

    /// Claim a connection record for a receiver in this process.
    ///
    /// The record's cursor is initialised to the current head *before* its
    /// bit appears in the connection bitmask, so the receiver observes
    /// only messages published after it joined and the producer never
    /// back-pressures on a half-registered reader.
    pub fn connect_reader(&self) -> Result<usize> {
        let hdr = self.header();
        let pid = std::process::id();
        for idx in 0..MAX_CONNECTIONS {
            let rec = &hdr.conns[idx];
            let st = rec.state.load(Ordering::Acquire);
            if st == CONN_CONNECTED {
                continue;
            }
            if rec
                .state
                .compare_exchange(st, CONN_CONNECTED, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            rec.pid.store(pid, Ordering::Release);
            rec.cursor
                .store(hdr.head.load(Ordering::Acquire), Ordering::Release);
            hdr.conn_mask.fetch_or(1u64 << idx, Ordering::AcqRel);
            tracing::debug!(conn = idx, pid, "receiver connected");
            return Ok(idx);
        }
        Err(Error::ResourceExhausted("connection table full"))
    }

    /// Tear down connection `idx`: drain its bit from every slot (handing
    /// chunk descriptors to `release_chunk` so their references die with
    /// it), drop the bit from the connection bitmask, and recycle the
    /// record.
    ///
    /// Safe against concurrent producers: while the bit is still in the
    /// mask, every slot carrying it is live-blocking, so no producer can
    /// reclaim those slots under us. Installs that were in flight while
    /// the bit was being cleared leave a stale bit behind; the producer's
    /// claim-time reclamation sweeps those up.
    ///
    /// Returns false when the record was not connected (already retired).
    pub fn retire_reader(
        &self,
        idx: usize,
        release_chunk: &mut dyn FnMut(&[u8; SLOT_DATA], u64),
    ) -> bool {
        let hdr = self.header();
        let rec = &hdr.conns[idx];
        if rec
            .state
            .compare_exchange(
                CONN_CONNECTED,
                CONN_DISCONNECTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        let bit = 1u64 << idx;
        let cursor = rec.cursor.load(Ordering::Acquire);

        for s in 0..self.capacity {
            let slot = self.slot_at(s);
            let out = slot.outstanding.load(Ordering::Acquire);
            if out & bit == 0 {
                continue;
            }
            // cursor <= seq holds for every unconsumed slot of a live
            // tenancy, which is exactly what guarantees the producer is
            // blocked on us and cannot rewrite the descriptor mid-read.
            if cursor <= slot.seq.load(Ordering::Acquire)
                && slot.len.load(Ordering::Acquire) & LEN_CHUNK != 0
            {
                let data = unsafe { *slot.data.get() };
                release_chunk(&data, bit);
            }
            slot.outstanding.fetch_and(!bit, Ordering::AcqRel);
        }

        hdr.conn_mask.fetch_and(!bit, Ordering::AcqRel);
        rec.pid.store(0, Ordering::Release);
        rec.state.store(CONN_EMPTY, Ordering::Release);
        tracing::debug!(conn = idx, "receiver disconnected");
        true
    }

    // -- producer side -------------------------------------------------------

    /// Bits of `out` that belong to connected readers which still have to
    /// consume sequence `seq`. Anything else is debris of departed
    /// readers.
    fn live_mask(&self, out: u64, cc: u64, seq: u64) -> u64 {
        let mut candidates = out & cc;
        let mut live = 0u64;
        while candidates != 0 {
            let idx = candidates.trailing_zeros() as usize;
            let bit = 1u64 << idx;
            candidates &= !bit;
            if self.header().conns[idx].cursor.load(Ordering::Acquire) <= seq {
                live |= bit;
            }
        }
        live
    }

    /// One non-blocking publish attempt.
    ///
    /// `frame` is the slot payload (inline bytes or a chunk descriptor,
    /// flagged through `len_word`). `set_chunk_readers` runs after the
    /// slot is claimed and receives the connection mask being installed,
    /// so a chunk's reference count matches the slot's outstanding mask
    /// exactly. `reclaim_chunk` receives the old descriptor and leftover
    /// mask of an abandoned chunk-carrying publication found in the slot.
    pub fn try_publish(
        &self,
        kind: RingKind,
        frame: &[u8],
        len_word: u32,
        set_chunk_readers: &mut dyn FnMut(u64),
        reclaim_chunk: &mut dyn FnMut(&[u8; SLOT_DATA], u64),
    ) -> PublishOutcome {
        debug_assert!(frame.len() <= SLOT_DATA);
        match kind {
            RingKind::Broadcast => {
                self.publish_inner(frame, len_word, set_chunk_readers, reclaim_chunk)
            }
            RingKind::Unicast => {
                let hdr = self.header();
                hdr.producer_lock.lock();
                let out = self.publish_inner(frame, len_word, set_chunk_readers, reclaim_chunk);
                hdr.producer_lock.unlock();
                out
            }
        }
    }

    /// Non-mutating recheck of the publish gate: `Some(live)` while the
    /// next slot is pinned by live readers, `None` once a publish could
    /// proceed (or there is nobody to deliver to).
    pub fn would_block(&self) -> Option<u64> {
        let hdr = self.header();
        let cc = hdr.conn_mask.load(Ordering::Acquire);
        if cc == 0 {
            return None;
        }
        let h = hdr.head.load(Ordering::Acquire);
        let slot = self.slot_at(h);
        let out = slot.outstanding.load(Ordering::Acquire);
        if out == 0 {
            return None;
        }
        let live = self.live_mask(out, cc, slot.seq.load(Ordering::Acquire));
        if live == 0 {
            None
        } else {
            Some(live)
        }
    }

    fn publish_inner(
        &self,
        frame: &[u8],
        len_word: u32,
        set_chunk_readers: &mut dyn FnMut(u64),
        reclaim_chunk: &mut dyn FnMut(&[u8; SLOT_DATA], u64),
    ) -> PublishOutcome {
        let hdr = self.header();
        // Mask before outstanding: retirement clears slot bits before the
        // mask bit, so a mask without some reader implies its slot bits
        // (minus in-flight installs) are already gone.
        let cc = hdr.conn_mask.load(Ordering::Acquire);
        if cc == 0 {
            return PublishOutcome::NoReceivers;
        }
        let h = hdr.head.load(Ordering::Acquire);
        let slot = self.slot_at(h);

        let out = slot.outstanding.load(Ordering::Acquire);
        if out != 0 {
            let seq = slot.seq.load(Ordering::Acquire);
            let live = self.live_mask(out, cc, seq);
            if live != 0 {
                return PublishOutcome::Busy { live };
            }
            // Only departed readers left: the old publication will never
            // be consumed. Drop its chunk reference before overwriting.
            if slot.len.load(Ordering::Acquire) & LEN_CHUNK != 0 {
                let data = unsafe { *slot.data.get() };
                reclaim_chunk(&data, out);
            }
        }

        unsafe {
            let dst = slot.data.get() as *mut u8;
            std::ptr::copy_nonoverlapping(frame.as_ptr(), dst, frame.len());
        }
        slot.len.store(len_word, Ordering::Relaxed);
        slot.seq.store(h, Ordering::Relaxed);
        if len_word & LEN_CHUNK != 0 {
            set_chunk_readers(cc);
        }
        slot.outstanding.store(cc, Ordering::Release);
        hdr.head.store(h.wrapping_add(1), Ordering::Release);
        PublishOutcome::Published
    }

    // -- consumer side -------------------------------------------------------

    /// One non-blocking consume attempt for reader `idx`.
    ///
    /// `before_clear` runs for chunk-flagged slots after the descriptor is
    /// copied out and before this reader's bit is cleared — the moment to
    /// copy the chunk payload and drop this reader's chunk reference,
    /// while the slot still pins the chunk.
    pub fn try_consume(
        &self,
        idx: usize,
        before_clear: &mut dyn FnMut(&[u8; SLOT_DATA]),
    ) -> ConsumeOutcome {
        let hdr = self.header();
        let rec = &hdr.conns[idx];
        let bit = 1u64 << idx;

        let cur = rec.cursor.load(Ordering::Acquire);
        if hdr.head.load(Ordering::Acquire) == cur {
            return ConsumeOutcome::Empty;
        }

        let slot = self.slot_at(cur);
        let out = slot.outstanding.load(Ordering::Acquire);
        if out & bit == 0 || slot.seq.load(Ordering::Acquire) != cur {
            // Not addressed to this tenancy (published around a reconnect
            // or a forced retirement); step over it.
            rec.cursor.store(cur.wrapping_add(1), Ordering::Release);
            return ConsumeOutcome::Skipped;
        }

        let len_word = slot.len.load(Ordering::Acquire);
        let data = unsafe { *slot.data.get() };
        if len_word & LEN_CHUNK != 0 {
            before_clear(&data);
        }

        let prev = slot.outstanding.fetch_and(!bit, Ordering::AcqRel);
        rec.cursor.store(cur.wrapping_add(1), Ordering::Release);

        let remaining = prev & !bit;
        let slot_freed = remaining == 0
            || self.live_mask(remaining, hdr.conn_mask.load(Ordering::Acquire), cur) == 0;

        ConsumeOutcome::Msg {
            len_word,
            data,
            slot_freed,
        }
    }
}
