// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Chunk store: class selection, reader-mask reference counting, pool
// exhaustion, and free-list recycling.

use std::sync::atomic::{AtomicUsize, Ordering};

use shmbus::chunk::{ChunkStore, CHUNKS_PER_CLASS, MAX_PAYLOAD};
use shmbus::Error;

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_cs_{}_{n}", std::process::id())
}

#[test]
fn acquire_release_frees_on_last_reader() {
    let name = unique_name("refcount");
    ChunkStore::clear_storage(&name);

    let store = ChunkStore::open(&name).expect("open");
    let (ticket, payload) = store.acquire(1000).expect("acquire");
    unsafe {
        std::ptr::write_bytes(payload, 0x42, 1000);
    }

    store.set_readers(ticket, 0b101);
    assert_eq!(store.readers(ticket), 0b101);

    store.release(ticket, 0b001);
    assert_eq!(store.readers(ticket), 0b100);

    // Last reader: the mask drains to zero and the slot is reusable.
    store.release(ticket, 0b100);
    assert_eq!(store.readers(ticket), 0);
}

#[test]
fn payload_round_trips() {
    let name = unique_name("payload");
    ChunkStore::clear_storage(&name);

    let store = ChunkStore::open(&name).expect("open");
    let data: Vec<u8> = (0..5000).map(|i| (i % 251) as u8).collect();
    let (ticket, payload) = store.acquire(data.len()).expect("acquire");
    unsafe {
        std::ptr::copy_nonoverlapping(data.as_ptr(), payload, data.len());
    }

    let read = unsafe {
        std::slice::from_raw_parts(store.payload_ptr(ticket), ticket.len as usize)
    };
    assert_eq!(read, &data[..]);
    store.abort(ticket);
}

#[test]
fn class_pool_exhausts_then_recovers() {
    let name = unique_name("exhaust");
    ChunkStore::clear_storage(&name);

    let store = ChunkStore::open(&name).expect("open");
    let mut tickets = Vec::new();
    for _ in 0..CHUNKS_PER_CLASS {
        let (t, _) = store.acquire(200).expect("acquire");
        tickets.push(t);
    }

    let r = store.acquire(200);
    assert!(matches!(r, Err(Error::ResourceExhausted(_))));

    // Distinct classes are unaffected by one class running dry.
    let (other, _) = store.acquire(10_000).expect("other class");
    store.abort(other);

    // Freeing one chunk makes the class usable again.
    store.set_readers(tickets[0], 0b1);
    store.release(tickets[0], 0b1);
    let (again, _) = store.acquire(200).expect("reacquire");
    assert_eq!(again.class, tickets[0].class);
}

#[test]
fn oversized_payload_is_refused() {
    let name = unique_name("oversize");
    ChunkStore::clear_storage(&name);

    let store = ChunkStore::open(&name).expect("open");
    let r = store.acquire(MAX_PAYLOAD + 1);
    assert!(matches!(r, Err(Error::ResourceExhausted(_))));
}

#[test]
fn store_is_shared_between_handles() {
    let name = unique_name("shared");
    ChunkStore::clear_storage(&name);

    let a = ChunkStore::open(&name).expect("a");
    let b = ChunkStore::open(&name).expect("b");

    let (ticket, payload) = a.acquire(300).expect("acquire");
    unsafe {
        std::ptr::write_bytes(payload, 0x7e, 300);
    }
    a.set_readers(ticket, 0b1);

    let via_b = unsafe {
        std::slice::from_raw_parts(b.payload_ptr(ticket), 300)
    };
    assert!(via_b.iter().all(|&x| x == 0x7e));
    b.release(ticket, 0b1);
    assert_eq!(a.readers(ticket), 0);
}
