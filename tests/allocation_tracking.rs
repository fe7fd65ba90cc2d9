// Allocation tracking tests for the ring, the lock-free ring, the stack and
// QSBR hot paths.
//
// Note: Tests using dhat are marked with #[serial_test::serial] because
// dhat only allows one profiler to run at a time, and heap stats are
// process-wide. Every test in this file is serial for the same reason.
//
// # Run all allocation tracking tests
// cargo test --test allocation_tracking -- --nocapture
//
// # Run a specific test
// cargo test --test allocation_tracking test_ring_hot_path_with_dhat -- --nocapture

use dmxp_core::Core::HeapAllocator;
use dmxp_core::Rcu::Qsbr;
use dmxp_core::Ring::{BulkQueue, LfRing, Ring, RingBuilder};
use dmxp_core::Stack::{Stack, StackBuilder};
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::thread;

#[global_allocator]
static ALLOC: dhat::Alloc = dhat::Alloc;

fn blocks_during<F: FnOnce()>(f: F) -> u64 {
    let before = dhat::HeapStats::get();
    f();
    let after = dhat::HeapStats::get();
    after.total_blocks - before.total_blocks
}

#[test]
#[serial_test::serial]
fn test_ring_hot_path_with_dhat() {
    println!("\n--- Running standard ring with dhat ---");
    let _dhat = dhat::Profiler::new_heap();

    let ring: Ring<u64> = RingBuilder::new("dhat_ring", 1024).build(&HeapAllocator).unwrap();
    let mut out = [0u64; 32];
    let batch: Vec<u64> = (0..32).collect();
    // Warm up lazily initialized state outside the measured window.
    ring.enqueue_burst(&batch);
    ring.dequeue_burst(&mut out);

    let allocs = blocks_during(|| {
        for i in 0..10_000u64 {
            ring.enqueue(i);
            ring.dequeue();
            ring.enqueue_burst(&batch);
            ring.dequeue_burst(&mut out);
        }
    });
    println!("Allocations during 10,000 rounds: {allocs}");
    assert_eq!(allocs, 0, "ring enqueue/dequeue must not allocate");
}

#[test]
#[serial_test::serial]
fn test_lf_ring_mpmc_with_dhat() {
    println!("\n--- Running lock-free ring MPMC stress with dhat ---");
    let _dhat = dhat::Profiler::new_heap();

    let ring: Arc<LfRing<u32>> = Arc::new(
        RingBuilder::new("dhat_lf", 4096)
            .build_lock_free(&HeapAllocator)
            .unwrap(),
    );
    let producers = 4u64;
    let consumers = 4u64;
    let per_producer = 10_000u64;
    let total = per_producer * producers;
    let consumed = Arc::new(AtomicU64::new(0));

    // Threads are spawned outside the measured window; only the ring
    // operations they run are counted.
    let start = Arc::new(std::sync::Barrier::new((producers + consumers + 1) as usize));
    let done = Arc::new(std::sync::Barrier::new((producers + consumers + 1) as usize));
    let mut handles = Vec::new();
    for _ in 0..producers {
        let (ring, start, done) = (ring.clone(), start.clone(), done.clone());
        handles.push(thread::spawn(move || {
            start.wait();
            for i in 0..per_producer {
                while !ring.enqueue(i as u32) {
                    std::hint::spin_loop();
                }
            }
            done.wait();
        }));
    }
    for _ in 0..consumers {
        let (ring, consumed, start, done) = (ring.clone(), consumed.clone(), start.clone(), done.clone());
        handles.push(thread::spawn(move || {
            start.wait();
            while consumed.load(Relaxed) < total {
                if ring.dequeue().is_some() {
                    consumed.fetch_add(1, Relaxed);
                } else {
                    std::hint::spin_loop();
                }
            }
            done.wait();
        }));
    }

    let allocs = blocks_during(|| {
        start.wait();
        done.wait();
    });
    for h in handles {
        h.join().unwrap();
    }
    println!("Consumed: {}, allocations while running: {allocs}", consumed.load(Relaxed));
    assert_eq!(consumed.load(Relaxed), total);
    assert_eq!(allocs, 0, "lock-free ring operations must not allocate");
}

#[test]
#[serial_test::serial]
fn test_stack_and_qsbr_with_dhat() {
    println!("\n--- Running stack and QSBR with dhat ---");
    let _dhat = dhat::Profiler::new_heap();

    let stack: Stack<u32> = StackBuilder::new("dhat_stk", 64).build(&HeapAllocator).unwrap();
    let qsbr = Qsbr::new(4).unwrap();
    qsbr.register(0).unwrap();
    qsbr.thread_online(0);
    let mut out = [0u32; 8];
    stack.push(&[1, 2, 3, 4, 5, 6, 7, 8]);
    stack.pop(&mut out);
    qsbr.quiescent(0);
    qsbr.check(qsbr.start(), false);

    let allocs = blocks_during(|| {
        for _ in 0..10_000 {
            stack.push(&[1, 2, 3, 4, 5, 6, 7, 8]);
            stack.pop(&mut out);
            let t = qsbr.start();
            qsbr.quiescent(0);
            assert!(qsbr.check(t, false));
        }
    });
    println!("Allocations during 10,000 rounds: {allocs}");
    assert_eq!(allocs, 0, "stack push/pop and QSBR reporting must not allocate");
}

#[test]
#[serial_test::serial]
fn test_ring_with_memory_stats() {
    println!("\n--- Running standard ring with memory-stats ---");
    use memory_stats::memory_stats;

    let before = memory_stats();
    println!("Memory before: {:?}", before);

    let ring: Ring<u64> = RingBuilder::new("ms_ring", 1 << 16).build(&HeapAllocator).unwrap();
    for i in 0..100_000u64 {
        ring.enqueue(i);
        ring.dequeue();
    }

    let after = memory_stats();
    println!("Memory after: {:?}", after);

    if let (Some(b), Some(a)) = (before, after) {
        let delta = a.physical_mem as i64 - b.physical_mem as i64;
        println!("Memory delta: {} bytes ({:.2} KB)", delta, delta as f64 / 1024.0);
        println!("  Expected: roughly the {} byte memzone touched by the ring", Ring::<u64>::memsize(1 << 16, false).unwrap());
    }
}
