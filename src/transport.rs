// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The user-facing transports.
//
// `Route` is one writer broadcasting to up to 64 readers; `Channel` admits
// any number of writers with the same broadcast fan-out. Both are a thin
// shell over one shared endpoint: a named ring region, the chunk store
// for oversized payloads, and three named waiters — `wt` where writers
// park while their slot is occupied, `rd` where readers park while the
// ring is empty, and `cn` where `wait_for_recv` parks until enough
// receivers have joined.
//
// Payloads up to one slot travel inline; anything bigger goes through the
// chunk store and the slot carries only a descriptor. Send never
// fragments: a payload the store cannot hold is refused outright.

use std::time::{Duration, Instant};

use crate::chunk::{ChunkStore, ChunkTicket};
use crate::error::{Error, Result};
use crate::platform::pid_alive;
use crate::ring::{
    region_size, ConsumeOutcome, PublishOutcome, RingKind, RingView, DEFAULT_CAPACITY, LEN_CHUNK,
    LEN_MASK, MAX_CAPACITY, SLOT_DATA,
};
use crate::shm::{OpenMode, Segment};
use crate::waiter::Waiter;

/// Whether a handle writes into or reads from the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Sender,
    Receiver,
}

/// Longest stretch a blocked operation goes without rechecking the world:
/// senders probe blocking readers' PIDs, receivers notice eviction.
const PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Cheap spin before parking on a waiter.
const SPIN_TRIES: u32 = 64;

fn deadline_of(timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|d| Instant::now() + d)
}

// ---------------------------------------------------------------------------
// Endpoint — shared internals of Route and Channel
// ---------------------------------------------------------------------------

struct Endpoint {
    name: String,
    kind: RingKind,
    mode: Mode,
    _seg: Segment, // keeps the ring region mapped
    ring: RingView,
    chunks: ChunkStore,
    wt: Waiter,
    rd: Waiter,
    cn: Waiter,
    conn_idx: Option<usize>,
    detached: bool,
}

impl Endpoint {
    fn open(name: &str, kind: RingKind, mode: Mode, capacity: usize) -> Result<Self> {
        if capacity < 2 || capacity > MAX_CAPACITY {
            return Err(Error::InvalidHandle("ring capacity out of range"));
        }

        let seg = Segment::acquire(
            &format!("{name}.ring"),
            region_size(capacity),
            OpenMode::CreateOrOpen,
        )?;
        let ring = unsafe { RingView::attach(seg.get(), kind, capacity)? };
        let chunks = ChunkStore::open(&format!("{name}.chunks"))?;
        let wt = Waiter::open(&format!("{name}.wt"))?;
        let rd = Waiter::open(&format!("{name}.rd"))?;
        let cn = Waiter::open(&format!("{name}.cn"))?;

        let conn_idx = match mode {
            Mode::Sender => {
                ring.register_sender(kind)?;
                None
            }
            Mode::Receiver => {
                let idx = ring.connect_reader()?;
                // Tell anyone parked in wait_for_recv.
                let _ = cn.broadcast();
                Some(idx)
            }
        };

        Ok(Self {
            name: name.to_string(),
            kind,
            mode,
            _seg: seg,
            ring,
            chunks,
            wt,
            rd,
            cn,
            conn_idx,
            detached: false,
        })
    }

    fn recv_count(&self) -> usize {
        self.ring.conn_count()
    }

    /// Drop a chunk reference recorded in a slot descriptor, for `bits`
    /// worth of readers that will never consume it.
    fn release_ticket(chunks: &ChunkStore, slot: &[u8; SLOT_DATA], bits: u64) {
        if let Some(t) = ChunkTicket::from_wire(slot) {
            chunks.release(t, bits);
        }
    }

    /// Force-disconnect every connection in `mask` whose process is gone.
    /// Returns true when at least one was evicted.
    fn evict_dead(&self, mask: u64) -> bool {
        let mut evicted = false;
        let mut rest = mask;
        while rest != 0 {
            let idx = rest.trailing_zeros() as usize;
            rest &= !(1u64 << idx);
            let pid = self.ring.reader_pid(idx);
            if pid != 0 && !pid_alive(pid) {
                tracing::warn!(name = %self.name, conn = idx, pid, "evicting receiver of dead process");
                let chunks = &self.chunks;
                if self
                    .ring
                    .retire_reader(idx, &mut |slot, bits| Self::release_ticket(chunks, slot, bits))
                {
                    evicted = true;
                }
            }
        }
        if evicted {
            let _ = self.cn.broadcast();
        }
        evicted
    }

    /// Spin briefly, then park on `waiter` until `ready` holds, one probe
    /// slice at a time. Returns false once the deadline is reached.
    fn spin_then_park<F>(&self, waiter: &Waiter, ready: F, deadline: Option<Instant>) -> Result<bool>
    where
        F: Fn() -> bool,
    {
        for _ in 0..SPIN_TRIES {
            if ready() {
                return Ok(true);
            }
            std::hint::spin_loop();
        }
        let slice = match deadline {
            None => PROBE_INTERVAL,
            Some(dl) => {
                let remaining = dl.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Ok(false);
                }
                remaining.min(PROBE_INTERVAL)
            }
        };
        waiter.wait_while(|| !ready(), Some(slice))?;
        Ok(ready() || deadline.map_or(true, |dl| Instant::now() < dl))
    }

    // -- send ----------------------------------------------------------------

    fn send(&mut self, data: &[u8], timeout: Option<Duration>) -> Result<()> {
        if self.mode != Mode::Sender {
            return Err(Error::InvalidHandle("send on a receiver handle"));
        }

        // Build the slot frame: inline bytes, or a chunk descriptor.
        let mut ticket: Option<ChunkTicket> = None;
        let mut frame_buf = [0u8; SLOT_DATA];
        let (frame_len, len_word) = if data.len() <= SLOT_DATA {
            frame_buf[..data.len()].copy_from_slice(data);
            (data.len(), data.len() as u32)
        } else {
            let (t, payload) = self.chunks.acquire(data.len())?;
            unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), payload, data.len());
            }
            let wire = t.to_wire();
            frame_buf[..wire.len()].copy_from_slice(&wire);
            ticket = Some(t);
            (wire.len(), LEN_CHUNK | wire.len() as u32)
        };
        let frame = &frame_buf[..frame_len];

        let try_only = timeout == Some(Duration::ZERO);
        let deadline = deadline_of(timeout);
        let mut next_probe = Instant::now() + PROBE_INTERVAL;

        loop {
            let chunks = &self.chunks;
            let outcome = self.ring.try_publish(
                self.kind,
                frame,
                len_word,
                &mut |cc| {
                    if let Some(t) = ticket {
                        chunks.set_readers(t, cc);
                    }
                },
                &mut |slot, bits| Self::release_ticket(chunks, slot, bits),
            );

            match outcome {
                PublishOutcome::Published => {
                    let _ = self.rd.broadcast();
                    return Ok(());
                }
                PublishOutcome::NoReceivers => {
                    // Vacuously delivered to every receiver connected at
                    // send time. Nothing written, nothing retained.
                    if let Some(t) = ticket {
                        self.chunks.abort(t);
                    }
                    return Ok(());
                }
                PublishOutcome::Busy { live } => {
                    if try_only {
                        if let Some(t) = ticket {
                            self.chunks.abort(t);
                        }
                        return Err(Error::WouldBlock);
                    }
                    if let Some(dl) = deadline {
                        if Instant::now() >= dl {
                            // Last chance: a dead blocking reader should
                            // not turn into a spurious timeout.
                            if self.evict_dead(live) {
                                continue;
                            }
                            if let Some(t) = ticket {
                                self.chunks.abort(t);
                            }
                            return Err(Error::Timeout);
                        }
                    }
                    let ring = &self.ring;
                    self.spin_then_park(&self.wt, || ring.would_block().is_none(), deadline)?;
                    if Instant::now() >= next_probe {
                        next_probe = Instant::now() + PROBE_INTERVAL;
                        self.evict_dead(live);
                    }
                }
            }
        }
    }

    // -- recv ----------------------------------------------------------------

    fn recv(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        if self.mode != Mode::Receiver {
            return Err(Error::InvalidHandle("recv on a sender handle"));
        }
        let idx = self
            .conn_idx
            .ok_or(Error::InvalidHandle("receiver without a connection"))?;
        let bit = 1u64 << idx;

        let try_only = timeout == Some(Duration::ZERO);
        let deadline = deadline_of(timeout);

        loop {
            if self.detached || !self.ring.is_reader_connected(idx) {
                // Explicitly disconnected, evicted by a producer that saw
                // our process as dead, or torn down via clear_storage.
                return Err(Error::Closed);
            }

            let chunks = &self.chunks;
            let mut chunk_payload: Option<Vec<u8>> = None;
            let outcome = self.ring.try_consume(idx, &mut |slot| {
                if let Some(t) = ChunkTicket::from_wire(slot) {
                    let src = chunks.payload_ptr(t);
                    let v = unsafe {
                        std::slice::from_raw_parts(src, t.len as usize).to_vec()
                    };
                    chunk_payload = Some(v);
                    chunks.release(t, bit);
                }
            });

            match outcome {
                ConsumeOutcome::Msg {
                    len_word,
                    data,
                    slot_freed,
                } => {
                    if slot_freed {
                        let _ = self.wt.broadcast();
                    }
                    if len_word & LEN_CHUNK != 0 {
                        return Ok(chunk_payload.unwrap_or_default());
                    }
                    let len = ((len_word & LEN_MASK) as usize).min(SLOT_DATA);
                    return Ok(data[..len].to_vec());
                }
                ConsumeOutcome::Skipped => continue,
                ConsumeOutcome::Empty => {
                    if try_only {
                        return Err(Error::WouldBlock);
                    }
                    if let Some(dl) = deadline {
                        if Instant::now() >= dl {
                            return Err(Error::Timeout);
                        }
                    }
                    let ring = &self.ring;
                    let cur = ring.reader_cursor(idx);
                    self.spin_then_park(
                        &self.rd,
                        || ring.head() != cur || !ring.is_reader_connected(idx),
                        deadline,
                    )?;
                }
            }
        }
    }

    // -- wait_for_recv -------------------------------------------------------

    fn wait_for_recv(&self, count: usize, timeout: Option<Duration>) -> Result<bool> {
        let deadline = deadline_of(timeout);
        loop {
            if self.ring.conn_count() >= count {
                return Ok(true);
            }
            if let Some(dl) = deadline {
                if Instant::now() >= dl {
                    return Ok(false);
                }
            }
            let ring = &self.ring;
            self.spin_then_park(&self.cn, || ring.conn_count() >= count, deadline)?;
        }
    }

    // -- teardown ------------------------------------------------------------

    fn shutdown(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        match self.mode {
            Mode::Sender => {
                self.ring.unregister_sender();
            }
            Mode::Receiver => {
                if let Some(idx) = self.conn_idx {
                    let chunks = &self.chunks;
                    self.ring.retire_reader(idx, &mut |slot, bits| {
                        Self::release_ticket(chunks, slot, bits)
                    });
                    // Slots we were pinning are free now.
                    let _ = self.wt.broadcast();
                    let _ = self.cn.broadcast();
                }
            }
        }
    }

    fn clear_storage(name: &str) {
        Segment::clear_storage(&format!("{name}.ring"));
        ChunkStore::clear_storage(&format!("{name}.chunks"));
        Waiter::clear_storage(&format!("{name}.wt"));
        Waiter::clear_storage(&format!("{name}.rd"));
        Waiter::clear_storage(&format!("{name}.cn"));
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Route — one writer, broadcast fan-out
// ---------------------------------------------------------------------------

/// A single-producer broadcast transport: every message is observed, in
/// order, by every receiver connected at send time.
pub struct Route {
    inner: Endpoint,
}

impl Route {
    /// Connect to the named route with the default ring capacity.
    pub fn connect(name: &str, mode: Mode) -> Result<Self> {
        Self::connect_with_capacity(name, mode, DEFAULT_CAPACITY)
    }

    /// Connect with an explicit slot count. The first creator's capacity
    /// wins; later connects adopt it.
    pub fn connect_with_capacity(name: &str, mode: Mode, capacity: usize) -> Result<Self> {
        Ok(Self {
            inner: Endpoint::open(name, RingKind::Broadcast, mode, capacity)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn mode(&self) -> Mode {
        self.inner.mode
    }

    /// Number of currently connected receivers.
    pub fn recv_count(&self) -> usize {
        self.inner.recv_count()
    }

    /// Block until at least `count` receivers are connected.
    pub fn wait_for_recv(&self, count: usize, timeout: Option<Duration>) -> Result<bool> {
        self.inner.wait_for_recv(count, timeout)
    }

    /// Send `data`, blocking up to `timeout` for a free slot. `None`
    /// waits forever; `Some(ZERO)` behaves like [`Route::try_send`].
    pub fn send(&mut self, data: &[u8], timeout: Option<Duration>) -> Result<()> {
        self.inner.send(data, timeout)
    }

    pub fn try_send(&mut self, data: &[u8]) -> Result<()> {
        self.inner.send(data, Some(Duration::ZERO))
    }

    /// Receive the next message, blocking up to `timeout`.
    pub fn recv(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        self.inner.recv(timeout)
    }

    pub fn try_recv(&mut self) -> Result<Vec<u8>> {
        self.inner.recv(Some(Duration::ZERO))
    }

    /// Tear the handle down. Equivalent to dropping it.
    pub fn disconnect(self) {}

    /// Remove all backing storage for the named route. Idempotent.
    pub fn clear_storage(name: &str) {
        Endpoint::clear_storage(name);
    }
}

// ---------------------------------------------------------------------------
// Channel — N writers, broadcast fan-out
// ---------------------------------------------------------------------------

/// A multi-producer broadcast transport. Ordering between messages of
/// distinct producers is unspecified; each producer's own messages arrive
/// in order at every receiver.
pub struct Channel {
    inner: Endpoint,
}

impl Channel {
    pub fn connect(name: &str, mode: Mode) -> Result<Self> {
        Self::connect_with_capacity(name, mode, DEFAULT_CAPACITY)
    }

    pub fn connect_with_capacity(name: &str, mode: Mode, capacity: usize) -> Result<Self> {
        Ok(Self {
            inner: Endpoint::open(name, RingKind::Unicast, mode, capacity)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn mode(&self) -> Mode {
        self.inner.mode
    }

    pub fn recv_count(&self) -> usize {
        self.inner.recv_count()
    }

    pub fn wait_for_recv(&self, count: usize, timeout: Option<Duration>) -> Result<bool> {
        self.inner.wait_for_recv(count, timeout)
    }

    pub fn send(&mut self, data: &[u8], timeout: Option<Duration>) -> Result<()> {
        self.inner.send(data, timeout)
    }

    pub fn try_send(&mut self, data: &[u8]) -> Result<()> {
        self.inner.send(data, Some(Duration::ZERO))
    }

    pub fn recv(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        self.inner.recv(timeout)
    }

    pub fn try_recv(&mut self) -> Result<Vec<u8>> {
        self.inner.recv(Some(Duration::ZERO))
    }

    pub fn disconnect(self) {}

    pub fn clear_storage(name: &str) {
        Endpoint::clear_storage(name);
    }
}
