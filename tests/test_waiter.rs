// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Composite waiter: predicate waits, broadcast wake-ups, the shared
// generation counter, and quit signalling.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use shmbus::Waiter;

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_wtr_{}_{n}", std::process::id())
}

#[test]
fn wait_returns_immediately_when_predicate_false() {
    let name = unique_name("immediate");
    Waiter::clear_storage(&name);

    let w = Waiter::open(&name).expect("open");
    let done = w
        .wait_while(|| false, Some(Duration::from_secs(1)))
        .expect("wait");
    assert!(done);
}

#[test]
fn wait_times_out_while_predicate_holds() {
    let name = unique_name("timeout");
    Waiter::clear_storage(&name);

    let w = Waiter::open(&name).expect("open");
    let started = Instant::now();
    let done = w
        .wait_while(|| true, Some(Duration::from_millis(60)))
        .expect("wait");
    assert!(!done);
    assert!(started.elapsed() >= Duration::from_millis(50));
}

#[test]
fn broadcast_wakes_predicate_change() {
    let name = unique_name("wake");
    Waiter::clear_storage(&name);

    let flag = Arc::new(AtomicBool::new(true));

    let name2 = name.clone();
    let flag2 = Arc::clone(&flag);
    let waiter = thread::spawn(move || {
        let w = Waiter::open(&name2).expect("open");
        w.wait_while(|| flag2.load(Ordering::Acquire), Some(Duration::from_secs(3)))
            .expect("wait")
    });

    thread::sleep(Duration::from_millis(50));

    let w = Waiter::open(&name).expect("open");
    flag.store(false, Ordering::Release);
    w.broadcast().expect("broadcast");

    assert!(waiter.join().unwrap());
}

#[test]
fn generation_counts_wakeups() {
    let name = unique_name("gen");
    Waiter::clear_storage(&name);

    let w = Waiter::open(&name).expect("open");
    let before = w.generation();
    w.broadcast().expect("broadcast");
    w.notify_one().expect("notify");
    assert_eq!(w.generation(), before + 2);

    // A second handle observes the same shared counter.
    let other = Waiter::open(&name).expect("open 2");
    assert_eq!(other.generation(), before + 2);
}

#[test]
fn quit_waiting_releases_blocked_waiters() {
    let name = unique_name("quit");
    Waiter::clear_storage(&name);

    let w = Arc::new(Waiter::open(&name).expect("open"));

    let w2 = Arc::clone(&w);
    let blocked = thread::spawn(move || {
        w2.wait_while(|| true, Some(Duration::from_secs(5)))
            .expect("wait")
    });

    thread::sleep(Duration::from_millis(50));
    w.quit_waiting().expect("quit");

    // Quit counts as completion, not timeout.
    assert!(blocked.join().unwrap());
}

#[test]
fn many_waiters_all_released() {
    let name = unique_name("many");
    Waiter::clear_storage(&name);

    let released = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(AtomicBool::new(true));
    let count = 4;

    let mut handles = Vec::new();
    for _ in 0..count {
        let n = name.clone();
        let released = Arc::clone(&released);
        let gate = Arc::clone(&gate);
        handles.push(thread::spawn(move || {
            let w = Waiter::open(&n).expect("open");
            if w.wait_while(|| gate.load(Ordering::Acquire), Some(Duration::from_secs(3)))
                .expect("wait")
            {
                released.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }

    thread::sleep(Duration::from_millis(100));
    let w = Waiter::open(&name).expect("open");
    gate.store(false, Ordering::Release);
    w.broadcast().expect("broadcast");

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(released.load(Ordering::Relaxed), count);
}
