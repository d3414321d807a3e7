// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// End-to-end transport behaviour: round-trips, broadcast fan-out,
// back-pressure, chunked overflow, connection waiting, and the error
// surface of mismatched or misused handles.

use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serial_test::serial;
use shmbus::{Channel, Error, Mode, Route};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_tp_{}_{n}", std::process::id())
}

/// Route library tracing to the test output; RUST_LOG controls verbosity.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

const SECOND: Option<Duration> = Some(Duration::from_secs(1));

// ========== Route ==========

#[test]
fn route_connect_reports_name_and_mode() {
    let name = unique_name("ctor");
    Route::clear_storage(&name);

    let r = Route::connect(&name, Mode::Sender).expect("connect");
    assert_eq!(r.name(), name);
    assert_eq!(r.mode(), Mode::Sender);
}

#[test]
fn route_round_trip_1k() {
    let name = unique_name("round_trip");
    Route::clear_storage(&name);

    let payload = vec![0x41u8; 1024];

    let name2 = name.clone();
    let expected = payload.clone();
    let sender = thread::spawn(move || {
        let mut s = Route::connect(&name2, Mode::Sender).expect("sender");
        assert!(s.wait_for_recv(1, SECOND).expect("wait_for_recv"));
        s.send(&expected, SECOND).expect("send");
    });

    let mut r = Route::connect(&name, Mode::Receiver).expect("receiver");
    let got = r.recv(SECOND).expect("recv");

    sender.join().unwrap();
    assert_eq!(got, payload);
}

#[test]
fn route_inline_round_trip() {
    let name = unique_name("inline");
    Route::clear_storage(&name);

    let name2 = name.clone();
    let sender = thread::spawn(move || {
        let mut s = Route::connect(&name2, Mode::Sender).expect("sender");
        assert!(s.wait_for_recv(1, SECOND).expect("wait"));
        s.send(b"hello bus", SECOND).expect("send");
    });

    let mut r = Route::connect(&name, Mode::Receiver).expect("receiver");
    let got = r.recv(Some(Duration::from_secs(2))).expect("recv");

    sender.join().unwrap();
    assert_eq!(got, b"hello bus");
}

#[test]
fn route_round_trips_every_size_class() {
    let name = unique_name("sizes");
    Route::clear_storage(&name);

    let sizes = [1usize, 2, 63, 64, 65, 127, 128, 129, 1024, 65536, 1 << 20];

    let name2 = name.clone();
    let sender = thread::spawn(move || {
        let mut s = Route::connect(&name2, Mode::Sender).expect("sender");
        assert!(s.wait_for_recv(1, Some(Duration::from_secs(2))).expect("wait"));
        for (i, &sz) in sizes.iter().enumerate() {
            let msg: Vec<u8> = (0..sz).map(|j| ((i * 31 + j) % 256) as u8).collect();
            s.send(&msg, Some(Duration::from_secs(5))).expect("send");
        }
    });

    let mut r = Route::connect(&name, Mode::Receiver).expect("receiver");
    for (i, &sz) in sizes.iter().enumerate() {
        let got = r.recv(Some(Duration::from_secs(5))).expect("recv");
        let want: Vec<u8> = (0..sz).map(|j| ((i * 31 + j) % 256) as u8).collect();
        assert_eq!(got.len(), sz, "size mismatch at case {i}");
        assert_eq!(got, want, "content mismatch at case {i}");
    }

    sender.join().unwrap();
}

#[test]
fn route_preserves_order() {
    let name = unique_name("order");
    Route::clear_storage(&name);

    let count = 50;
    let name2 = name.clone();
    let sender = thread::spawn(move || {
        let mut s = Route::connect(&name2, Mode::Sender).expect("sender");
        assert!(s.wait_for_recv(1, SECOND).expect("wait"));
        for i in 0..count {
            let msg = format!("message {i}");
            s.send(msg.as_bytes(), Some(Duration::from_secs(2))).expect("send");
        }
    });

    let mut r = Route::connect(&name, Mode::Receiver).expect("receiver");
    for i in 0..count {
        let got = r.recv(Some(Duration::from_secs(2))).expect("recv");
        assert_eq!(got, format!("message {i}").as_bytes());
    }

    sender.join().unwrap();
}

// Broadcast to four receivers: 100 messages of LCG-derived sizes, every
// receiver observes the identical sequence in order.
#[test]
fn route_broadcast_four_receivers_lcg() {
    let name = unique_name("bench_route");
    Route::clear_storage(&name);

    const LCG_MUL: u64 = 6364136223846793005;
    const LCG_ADD: u64 = 1442695040888963407;
    let mut state = 1u64;
    let mut messages = Vec::with_capacity(100);
    for i in 0..100u64 {
        state = state.wrapping_mul(LCG_MUL).wrapping_add(LCG_ADD);
        let size = 2 + ((state >> 33) % 255) as usize; // 2..=256
        let msg: Vec<u8> = (0..size).map(|j| ((i as usize * 131 + j) % 256) as u8).collect();
        messages.push(msg);
    }
    let messages = Arc::new(messages);

    let num_receivers = 4;
    let mut handles = Vec::new();
    for _ in 0..num_receivers {
        let n = name.clone();
        let expected = Arc::clone(&messages);
        handles.push(thread::spawn(move || {
            let mut r = Route::connect(&n, Mode::Receiver).expect("receiver");
            for (i, want) in expected.iter().enumerate() {
                let got = r.recv(Some(Duration::from_secs(10))).expect("recv");
                assert_eq!(&got, want, "receiver diverged at message {i}");
            }
        }));
    }

    let mut s = Route::connect(&name, Mode::Sender).expect("sender");
    assert!(s
        .wait_for_recv(num_receivers, Some(Duration::from_secs(5)))
        .expect("wait"));
    for msg in messages.iter() {
        // The chunk pool is finite; a momentarily dry class is retryable.
        loop {
            match s.send(msg, Some(Duration::from_secs(10))) {
                Ok(()) => break,
                Err(Error::ResourceExhausted(_)) => thread::sleep(Duration::from_millis(1)),
                Err(e) => panic!("send failed: {e}"),
            }
        }
    }

    for h in handles {
        h.join().unwrap();
    }
}

// Back-pressure: capacity 4, a receiver that never reads. The 5th send
// times out; one recv frees a slot and the next send is accepted.
#[test]
#[serial]
fn route_backpressure_with_slow_reader() {
    init_tracing();
    let name = unique_name("backpressure");
    Route::clear_storage(&name);

    let mut s = Route::connect_with_capacity(&name, Mode::Sender, 4).expect("sender");
    let mut r = Route::connect_with_capacity(&name, Mode::Receiver, 4).expect("receiver");

    for i in 0..4 {
        s.send(format!("m{i}").as_bytes(), Some(Duration::from_millis(100)))
            .unwrap_or_else(|e| panic!("send {i} failed: {e}"));
    }

    let fifth = s.send(b"m4", Some(Duration::from_millis(10)));
    assert!(matches!(fifth, Err(Error::Timeout)));

    let got = r.recv(SECOND).expect("recv");
    assert_eq!(got, b"m0");

    s.send(b"m4", Some(Duration::from_millis(10)))
        .expect("send after one slot freed");
}

#[test]
#[serial]
fn route_try_send_would_block_when_full() {
    let name = unique_name("try_full");
    Route::clear_storage(&name);

    let mut s = Route::connect_with_capacity(&name, Mode::Sender, 2).expect("sender");
    let _r = Route::connect_with_capacity(&name, Mode::Receiver, 2).expect("receiver");

    s.try_send(b"a").expect("first");
    s.try_send(b"b").expect("second");
    assert!(matches!(s.try_send(b"c"), Err(Error::WouldBlock)));
}

#[test]
fn route_send_without_receiver_is_vacuous() {
    let name = unique_name("no_recv");
    Route::clear_storage(&name);

    let mut s = Route::connect(&name, Mode::Sender).expect("sender");
    // Delivered to every receiver connected at send time: all zero of them.
    s.send(b"into the void", Some(Duration::from_millis(10)))
        .expect("send");
    s.try_send(b"still nothing").expect("try_send");
}

#[test]
fn route_try_recv_would_block_when_empty() {
    let name = unique_name("try_empty");
    Route::clear_storage(&name);

    let mut r = Route::connect(&name, Mode::Receiver).expect("receiver");
    assert!(matches!(r.try_recv(), Err(Error::WouldBlock)));
}

#[test]
fn route_recv_times_out() {
    let name = unique_name("recv_timeout");
    Route::clear_storage(&name);

    let mut r = Route::connect(&name, Mode::Receiver).expect("receiver");
    let got = r.recv(Some(Duration::from_millis(50)));
    assert!(matches!(got, Err(Error::Timeout)));
}

#[test]
fn route_receivers_see_only_later_messages() {
    let name = unique_name("late_join");
    Route::clear_storage(&name);

    let mut s = Route::connect(&name, Mode::Sender).expect("sender");
    let mut early = Route::connect(&name, Mode::Receiver).expect("early");

    s.send(b"first", SECOND).expect("send first");

    let mut late = Route::connect(&name, Mode::Receiver).expect("late");
    s.send(b"second", SECOND).expect("send second");

    assert_eq!(early.recv(SECOND).expect("early recv"), b"first");
    assert_eq!(early.recv(SECOND).expect("early recv 2"), b"second");
    // The late joiner never observes the message sent before it connected.
    assert_eq!(late.recv(SECOND).expect("late recv"), b"second");
    assert!(matches!(late.try_recv(), Err(Error::WouldBlock)));
}

#[test]
fn route_recv_count_tracks_connections() {
    let name = unique_name("recv_count");
    Route::clear_storage(&name);

    let s = Route::connect(&name, Mode::Sender).expect("sender");
    assert_eq!(s.recv_count(), 0);

    let r1 = Route::connect(&name, Mode::Receiver).expect("r1");
    assert_eq!(s.recv_count(), 1);

    let r2 = Route::connect(&name, Mode::Receiver).expect("r2");
    assert_eq!(s.recv_count(), 2);

    drop(r1);
    assert_eq!(s.recv_count(), 1);
    drop(r2);
    assert_eq!(s.recv_count(), 0);
}

#[test]
#[serial]
fn route_wait_for_recv_reached_by_late_receivers() {
    let name = unique_name("wait_recv");
    Route::clear_storage(&name);

    let s = Route::connect(&name, Mode::Sender).expect("sender");

    let name2 = name.clone();
    let receivers = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        let a = Route::connect(&name2, Mode::Receiver).expect("a");
        thread::sleep(Duration::from_millis(100));
        let b = Route::connect(&name2, Mode::Receiver).expect("b");
        thread::sleep(Duration::from_millis(300)); // outlive the wait
        drop((a, b));
    });

    let reached = s
        .wait_for_recv(2, Some(Duration::from_secs(5)))
        .expect("wait_for_recv");
    assert!(reached);

    receivers.join().unwrap();
}

#[test]
fn route_wait_for_recv_times_out() {
    let name = unique_name("wait_recv_to");
    Route::clear_storage(&name);

    let s = Route::connect(&name, Mode::Sender).expect("sender");
    let reached = s
        .wait_for_recv(1, Some(Duration::from_millis(80)))
        .expect("wait_for_recv");
    assert!(!reached);
}

#[test]
fn route_single_writer_is_enforced() {
    let name = unique_name("one_writer");
    Route::clear_storage(&name);

    let first = Route::connect(&name, Mode::Sender).expect("first sender");
    let second = Route::connect(&name, Mode::Sender);
    assert!(matches!(second, Err(Error::ResourceExhausted(_))));

    // The seat frees up when the writer leaves.
    drop(first);
    let _third = Route::connect(&name, Mode::Sender).expect("third sender");
}

#[test]
fn chunk_pool_recycles_across_many_large_sends() {
    let name = unique_name("recycle");
    Route::clear_storage(&name);

    // More large messages than the pool holds per class: only works if
    // consumed chunks return to the free list.
    let rounds = 40;
    let name2 = name.clone();
    let sender = thread::spawn(move || {
        let mut s = Route::connect(&name2, Mode::Sender).expect("sender");
        assert!(s.wait_for_recv(1, Some(Duration::from_secs(2))).expect("wait"));
        for i in 0..rounds {
            let msg = vec![(i % 256) as u8; 70_000];
            loop {
                match s.send(&msg, Some(Duration::from_secs(5))) {
                    Ok(()) => break,
                    Err(Error::ResourceExhausted(_)) => thread::sleep(Duration::from_millis(1)),
                    Err(e) => panic!("send {i} failed: {e}"),
                }
            }
        }
    });

    let mut r = Route::connect(&name, Mode::Receiver).expect("receiver");
    for i in 0..rounds {
        let got = r.recv(Some(Duration::from_secs(5))).expect("recv");
        assert_eq!(got.len(), 70_000);
        assert!(got.iter().all(|&b| b == (i % 256) as u8), "round {i}");
    }

    sender.join().unwrap();
}

// ========== handle misuse ==========

#[test]
fn send_on_receiver_handle_is_refused() {
    let name = unique_name("wrong_send");
    Route::clear_storage(&name);

    let mut r = Route::connect(&name, Mode::Receiver).expect("receiver");
    assert!(matches!(
        r.send(b"nope", SECOND),
        Err(Error::InvalidHandle(_))
    ));
}

#[test]
fn recv_on_sender_handle_is_refused() {
    let name = unique_name("wrong_recv");
    Route::clear_storage(&name);

    let mut s = Route::connect(&name, Mode::Sender).expect("sender");
    assert!(matches!(s.recv(SECOND), Err(Error::InvalidHandle(_))));
}

#[test]
fn empty_transport_name_is_rejected() {
    assert!(matches!(
        Route::connect("", Mode::Sender),
        Err(Error::NameInvalid(_))
    ));
}

#[test]
fn route_and_channel_do_not_share_a_ring() {
    let name = unique_name("kind_mismatch");
    Route::clear_storage(&name);

    let _route = Route::connect(&name, Mode::Sender).expect("route");
    let ch = Channel::connect(&name, Mode::Sender);
    assert!(matches!(ch, Err(Error::InvalidHandle(_))));
}

// ========== dead-peer recovery ==========

/// Child half of `dead_receiver_is_evicted`: connects a receiver, leaks
/// the handle so no disconnect runs, and dies. Inert unless spawned with
/// the env var set.
#[test]
fn dead_receiver_child() {
    let Ok(name) = std::env::var("SHMBUS_DEAD_RECEIVER_ROUTE") else {
        return;
    };
    let r = Route::connect_with_capacity(&name, Mode::Receiver, 4).expect("child receiver");
    std::mem::forget(r);
    std::process::exit(7);
}

#[test]
#[serial]
fn dead_receiver_is_evicted() {
    init_tracing();
    let name = unique_name("dead_recv");
    Route::clear_storage(&name);

    let exe = std::env::current_exe().expect("current_exe");
    let status = Command::new(exe)
        .args(["--exact", "dead_receiver_child", "--test-threads=1"])
        .env("SHMBUS_DEAD_RECEIVER_ROUTE", &name)
        .status()
        .expect("spawn child");
    assert_eq!(status.code(), Some(7));

    let mut s = Route::connect_with_capacity(&name, Mode::Sender, 4).expect("sender");
    assert_eq!(s.recv_count(), 1, "dead connection should still be visible");

    // Filling the ring past capacity forces the producer onto the dead
    // connection; the liveness probe evicts it instead of timing out.
    for i in 0..6 {
        s.send(format!("m{i}").as_bytes(), Some(Duration::from_secs(2)))
            .unwrap_or_else(|e| panic!("send {i} blocked on a dead receiver: {e}"));
    }
    assert_eq!(s.recv_count(), 0);

    Route::clear_storage(&name);
}

// ========== Channel ==========

#[test]
fn channel_round_trip() {
    let name = unique_name("ch_round");
    Channel::clear_storage(&name);

    let name2 = name.clone();
    let sender = thread::spawn(move || {
        let mut ch = Channel::connect(&name2, Mode::Sender).expect("sender");
        assert!(ch.wait_for_recv(1, SECOND).expect("wait"));
        ch.send(b"via channel", SECOND).expect("send");
    });

    let mut ch = Channel::connect(&name, Mode::Receiver).expect("receiver");
    let got = ch.recv(Some(Duration::from_secs(2))).expect("recv");

    sender.join().unwrap();
    assert_eq!(got, b"via channel");
}

#[test]
fn channel_admits_multiple_senders() {
    let name = unique_name("ch_multi");
    Channel::clear_storage(&name);

    let num_senders = 3;
    let per_sender = 5;

    let name_r = name.clone();
    let receiver = thread::spawn(move || {
        let mut ch = Channel::connect(&name_r, Mode::Receiver).expect("receiver");
        let mut got = 0;
        for _ in 0..num_senders * per_sender {
            let msg = ch.recv(Some(Duration::from_secs(5))).expect("recv");
            assert!(!msg.is_empty());
            got += 1;
        }
        got
    });

    thread::sleep(Duration::from_millis(50));

    let mut senders = Vec::new();
    for i in 0..num_senders {
        let n = name.clone();
        senders.push(thread::spawn(move || {
            let mut ch = Channel::connect(&n, Mode::Sender).expect("sender");
            assert!(ch.wait_for_recv(1, Some(Duration::from_secs(2))).expect("wait"));
            for j in 0..per_sender {
                let msg = format!("s{i}m{j}");
                ch.send(msg.as_bytes(), Some(Duration::from_secs(5)))
                    .expect("send");
            }
        }));
    }

    for s in senders {
        s.join().unwrap();
    }
    assert_eq!(receiver.join().unwrap(), num_senders * per_sender);
}

#[test]
fn channel_broadcasts_to_all_receivers() {
    let name = unique_name("ch_bcast");
    Channel::clear_storage(&name);

    let num_senders = 2usize;
    let num_receivers = 2usize;
    let per_sender = 3usize;
    let total = num_senders * per_sender;

    let received = Arc::new(AtomicUsize::new(0));

    let mut receivers = Vec::new();
    for _ in 0..num_receivers {
        let n = name.clone();
        let received = Arc::clone(&received);
        receivers.push(thread::spawn(move || {
            let mut ch = Channel::connect(&n, Mode::Receiver).expect("receiver");
            for _ in 0..total {
                let msg = ch.recv(Some(Duration::from_secs(5))).expect("recv");
                if !msg.is_empty() {
                    received.fetch_add(1, Ordering::Relaxed);
                }
            }
        }));
    }

    thread::sleep(Duration::from_millis(100));

    let mut senders = Vec::new();
    for i in 0..num_senders {
        let n = name.clone();
        senders.push(thread::spawn(move || {
            let mut ch = Channel::connect(&n, Mode::Sender).expect("sender");
            assert!(ch
                .wait_for_recv(num_receivers, Some(Duration::from_secs(2)))
                .expect("wait"));
            for j in 0..per_sender {
                let msg = format!("s{i}m{j}");
                ch.send(msg.as_bytes(), Some(Duration::from_secs(5)))
                    .expect("send");
            }
        }));
    }

    for s in senders {
        s.join().unwrap();
    }
    for r in receivers {
        r.join().unwrap();
    }
    assert_eq!(received.load(Ordering::Relaxed), total * num_receivers);
}

#[test]
fn clear_storage_twice_is_indistinguishable_from_once() {
    let name = unique_name("clear2");
    {
        let _s = Route::connect(&name, Mode::Sender).expect("sender");
    }
    Route::clear_storage(&name);
    Route::clear_storage(&name);

    // A fresh transport on the same name starts from scratch.
    let s = Route::connect(&name, Mode::Sender).expect("fresh");
    assert_eq!(s.recv_count(), 0);
}
