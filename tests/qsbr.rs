// QSBR tests: registration, offline exemption, grace periods and dumps.
// Run with: cargo test --test qsbr -- --nocapture

use dmxp_core::error::Error;
use dmxp_core::Rcu::{Qsbr, QSBR_CNT_INIT, QSBR_CNT_THR_OFFLINE};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[test]
fn test_new_and_memsize() {
    assert!(matches!(Qsbr::new(0), Err(Error::InvalidArgument(_))));
    assert!(Qsbr::memsize(0).is_err());

    let small = Qsbr::memsize(4).unwrap();
    let large = Qsbr::memsize(128).unwrap();
    assert!(large > small);

    let v = Qsbr::new(4).unwrap();
    assert_eq!(v.token(), QSBR_CNT_INIT);
    assert_eq!(v.max_threads(), 4);
    assert_eq!(v.num_threads(), 0);
}

#[test]
fn test_register_is_idempotent() {
    init_tracing();
    let v = Qsbr::new(70).unwrap();

    v.register(3).unwrap();
    v.register(3).unwrap();
    v.register(69).unwrap();
    assert_eq!(v.num_threads(), 2);
    assert!(v.is_registered(3));
    assert!(v.is_registered(69));
    assert!(!v.is_registered(4));

    v.unregister(3).unwrap();
    v.unregister(3).unwrap();
    // Never registered: still a no-op.
    v.unregister(5).unwrap();
    assert_eq!(v.num_threads(), 1);
    assert!(!v.is_registered(3));
}

#[test]
fn test_invalid_thread_id() {
    init_tracing();
    let v = Qsbr::new(4).unwrap();
    let err = v.register(4).unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidThreadId { thread_id: 4, max_threads: 4 }
    ));
    assert_eq!(err.errno(), -libc::EINVAL);
    assert!(v.unregister(100).is_err());
    assert!(!v.is_registered(100));
    assert_eq!(v.num_threads(), 0);
}

#[test]
#[should_panic]
fn test_quiescent_rejects_out_of_range_id() {
    let v = Qsbr::new(4).unwrap();
    v.quiescent(4);
}

#[test]
#[should_panic]
fn test_thread_offline_rejects_out_of_range_id() {
    let v = Qsbr::new(4).unwrap();
    v.thread_offline(64);
}

#[test]
fn test_check_without_readers() {
    let v = Qsbr::new(8).unwrap();
    let t = v.start();
    assert_eq!(t, QSBR_CNT_INIT + 1);
    assert!(v.check(t, false));
    v.synchronize(None);
}

#[test]
fn test_check_selective_path() {
    let v = Qsbr::new(8).unwrap();
    v.register(1).unwrap();
    v.register(6).unwrap();
    v.thread_online(1);
    v.thread_online(6);

    let t = v.start();
    assert!(!v.check(t, false));
    v.quiescent(1);
    assert!(!v.check(t, false));
    v.quiescent(6);
    assert!(v.check(t, false));

    // A reader registered but not yet online does not hold anything up.
    v.register(3).unwrap();
    assert!(v.check(t, false));
    v.thread_online(3);
    assert!(!v.check(v.start(), false));
}

#[test]
fn test_check_all_path() {
    let v = Qsbr::new(3).unwrap();
    for id in 0..3 {
        v.register(id).unwrap();
        v.thread_online(id);
    }
    assert_eq!(v.num_threads(), v.max_threads());

    let t = v.start();
    v.quiescent(0);
    v.quiescent(2);
    assert!(!v.check(t, false));
    v.thread_offline(1);
    assert_eq!(v.counter(1), Some(QSBR_CNT_THR_OFFLINE));
    assert!(v.check(t, false));
}

#[test]
fn test_offline_reader_does_not_block() {
    // max_threads 4, readers 0..=2, reader 0 offline. The writer must wait
    // for 1 and 2 only.
    init_tracing();
    let v = Arc::new(Qsbr::new(4).unwrap());
    for id in 0..3 {
        v.register(id).unwrap();
        v.thread_online(id);
    }
    v.thread_offline(0);

    let t = v.start();
    let finished = Arc::new(AtomicBool::new(false));
    let writer = {
        let v = Arc::clone(&v);
        let finished = Arc::clone(&finished);
        thread::spawn(move || {
            assert!(v.check(t, true));
            finished.store(true, Ordering::Release);
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!finished.load(Ordering::Acquire), "check returned before readers reported");

    v.quiescent(1);
    thread::sleep(Duration::from_millis(50));
    assert!(!finished.load(Ordering::Acquire), "check returned before reader 2 reported");

    v.quiescent(2);
    writer.join().unwrap();
    assert!(finished.load(Ordering::Acquire));
}

#[test]
fn test_unregister_releases_waiting_writer() {
    let v = Arc::new(Qsbr::new(4).unwrap());
    v.register(0).unwrap();
    v.register(1).unwrap();
    v.thread_online(0);
    v.thread_online(1);
    v.quiescent(0);

    let t = v.start();
    let writer = {
        let v = Arc::clone(&v);
        thread::spawn(move || v.check(t, true))
    };
    thread::sleep(Duration::from_millis(20));
    v.quiescent(0);
    v.unregister(1).unwrap();
    assert!(writer.join().unwrap());
}

#[test]
fn test_synchronize_from_reader() {
    let v = Qsbr::new(2).unwrap();
    v.register(0).unwrap();
    v.thread_online(0);
    // Would deadlock on itself without passing its own id.
    v.synchronize(Some(0));
    assert_eq!(v.counter(0), Some(v.token()));
}

#[test]
fn test_grace_period_protects_readers() {
    // Readers hold a "pointer" (the published generation) between quiescent
    // points; the writer retires a generation only after a grace period and
    // poisons it. No reader may ever observe a poisoned generation.
    const READERS: u32 = 3;
    const GENERATIONS: u64 = 2_000;

    let v = Arc::new(Qsbr::new(READERS).unwrap());
    let slots: Arc<Vec<AtomicU64>> = Arc::new((0..2).map(|_| AtomicU64::new(0)).collect());
    let current = Arc::new(AtomicU64::new(0));
    let stop = Arc::new(AtomicBool::new(false));
    let barrier = Arc::new(Barrier::new(READERS as usize + 1));

    let readers: Vec<_> = (0..READERS)
        .map(|id| {
            let (v, slots, current, stop, barrier) = (
                Arc::clone(&v),
                Arc::clone(&slots),
                Arc::clone(&current),
                Arc::clone(&stop),
                Arc::clone(&barrier),
            );
            thread::spawn(move || {
                v.register(id).unwrap();
                v.thread_online(id);
                barrier.wait();
                let mut reads = 0u64;
                while !stop.load(Ordering::Acquire) {
                    let gen = current.load(Ordering::Acquire);
                    let slot = &slots[(gen % 2) as usize];
                    for _ in 0..4 {
                        assert_ne!(slot.load(Ordering::Acquire), u64::MAX, "read after free");
                    }
                    reads += 1;
                    v.quiescent(id);
                }
                v.thread_offline(id);
                v.unregister(id).unwrap();
                reads
            })
        })
        .collect();

    barrier.wait();
    for gen in 1..=GENERATIONS {
        let old = &slots[((gen - 1) % 2) as usize];
        slots[(gen % 2) as usize].store(gen, Ordering::Release);
        current.store(gen, Ordering::Release);
        v.synchronize(None);
        old.store(u64::MAX, Ordering::Release);
    }
    stop.store(true, Ordering::Release);

    let total: u64 = readers.into_iter().map(|r| r.join().unwrap()).sum();
    println!("{GENERATIONS} generations retired under {total} reads");
    assert_eq!(v.num_threads(), 0);
}

#[test]
fn test_dump() {
    let v = Qsbr::new(4).unwrap();
    v.register(0).unwrap();
    v.register(2).unwrap();
    v.thread_online(2);
    v.start();
    v.quiescent(2);

    let mut out = Vec::new();
    v.dump(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    println!("{text}");

    assert!(text.contains("Quiescent State Variable @0x"));
    assert!(text.contains(&format!("  QS variable memory size = {}\n", Qsbr::memsize(4).unwrap())));
    assert!(text.contains("  Given # max threads = 4\n"));
    assert!(text.contains("  Current # threads = 2\n"));
    assert!(text.contains("  Registered thread ID mask = 0x5\n"));
    assert!(text.contains("  Token = 2\n"));
    assert!(text.contains("thread ID = 0, count = 0\n"));
    assert!(text.contains("thread ID = 2, count = 2\n"));
}
