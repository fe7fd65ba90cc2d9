// Standard ring tests: sizing, FIFO order, bulk/burst semantics and dumps.
// Run with: cargo test --test ring -- --nocapture

use dmxp_core::error::Error;
use dmxp_core::Core::HeapAllocator;
use dmxp_core::Ring::{BulkQueue, QueueBehavior, Ring, RingBuilder, SyncMode, RING_SZ_MASK};

fn spsc_ring<T: Copy + Send>(name: &str, count: u32) -> Ring<T> {
    RingBuilder::new(name, count)
        .single_producer()
        .single_consumer()
        .build(&HeapAllocator)
        .unwrap()
}

#[test]
fn test_basic_enqueue_dequeue() {
    // Exact-size ring of 8: enqueue three, take two back.
    let ring: Ring<u64> = RingBuilder::new("basic", 8)
        .exact_size()
        .single_producer()
        .single_consumer()
        .build(&HeapAllocator)
        .unwrap();
    println!("{:?}", ring);

    assert_eq!(ring.capacity(), 8);
    assert_eq!(ring.size(), 16);
    assert_eq!(ring.enqueue_bulk(&[1, 2, 3], QueueBehavior::Fixed), 3);

    let mut out = [0u64; 2];
    assert_eq!(ring.dequeue_bulk(&mut out, QueueBehavior::Fixed), 2);
    assert_eq!(out, [1, 2]);
    assert_eq!(ring.count(), 1);
    assert_eq!(ring.free_count(), 7);
    assert_eq!(ring.dequeue(), Some(3));
    assert!(ring.is_empty());
}

#[test]
fn test_power_of_two_sizing() {
    let ring: Ring<u32> = spsc_ring("pow2", 8);
    assert_eq!(ring.size(), 8);
    assert_eq!(ring.capacity(), 7);

    let items: Vec<u32> = (0..8).collect();
    assert_eq!(ring.enqueue_burst(&items), 7);
    assert!(ring.is_full());
    assert!(!ring.enqueue(99));
}

#[test]
fn test_invalid_sizes() {
    for count in [0u32, 3, 100, RING_SZ_MASK] {
        let res = RingBuilder::new("bad", count).build::<u32>(&HeapAllocator);
        match res {
            Err(Error::InvalidSize { requested, .. }) => assert_eq!(requested, count as u64),
            other => panic!("count {count}: expected InvalidSize, got {:?}", other.map(|_| ())),
        }
    }

    // Exact-size lifts the power-of-two restriction.
    let ring: Ring<u32> = RingBuilder::new("odd", 100)
        .exact_size()
        .build(&HeapAllocator)
        .unwrap();
    assert_eq!(ring.capacity(), 100);
    assert_eq!(ring.size(), 128);

    let err = RingBuilder::new("huge", RING_SZ_MASK)
        .exact_size()
        .build::<u32>(&HeapAllocator)
        .unwrap_err();
    assert_eq!(err.errno(), -libc::EINVAL);
}

#[test]
fn test_name_too_long() {
    let name = "r".repeat(40);
    let err = RingBuilder::new(&name, 16).build::<u32>(&HeapAllocator).unwrap_err();
    assert!(matches!(err, Error::NameTooLong { .. }));
    assert_eq!(err.errno(), -libc::ENAMETOOLONG);
}

#[test]
fn test_fixed_is_all_or_nothing() {
    let ring: Ring<u32> = spsc_ring("fixed", 16);

    let ten: Vec<u32> = (0..10).collect();
    assert_eq!(ring.enqueue_bulk(&ten, QueueBehavior::Fixed), 10);

    // 5 free, ask for 6.
    let (n, free) = ring.enqueue_bulk_with_free(&ten[..6], QueueBehavior::Fixed);
    assert_eq!(n, 0);
    assert_eq!(free, 5);
    assert_eq!(ring.count(), 10);

    let (n, free) = ring.enqueue_bulk_with_free(&ten[..5], QueueBehavior::Fixed);
    assert_eq!(n, 5);
    assert_eq!(free, 0);

    let mut out = [0u32; 16];
    let (n, avail) = ring.dequeue_bulk_with_avail(&mut out, QueueBehavior::Fixed);
    assert_eq!((n, avail), (0, 15));
    assert_eq!(ring.count(), 15);
}

#[test]
fn test_variable_is_partial() {
    let ring: Ring<u32> = spsc_ring("variable", 16);
    let items: Vec<u32> = (0..20).collect();

    let (n, free) = ring.enqueue_bulk_with_free(&items, QueueBehavior::Variable);
    assert_eq!((n, free), (15, 0));

    let mut out = [0u32; 4];
    let (n, avail) = ring.dequeue_bulk_with_avail(&mut out, QueueBehavior::Variable);
    assert_eq!((n, avail), (4, 11));
    assert_eq!(out, [0, 1, 2, 3]);

    let mut rest = [0u32; 32];
    assert_eq!(ring.dequeue_burst(&mut rest), 11);
    assert_eq!(&rest[..11], &items[4..15]);
    assert_eq!(ring.dequeue_burst(&mut rest), 0);
}

#[test]
fn test_empty_requests() {
    let ring: Ring<u32> = spsc_ring("empty", 8);
    assert_eq!(ring.enqueue_bulk(&[], QueueBehavior::Fixed), 0);
    assert!(!ring.enqueue_all(&[]));
    let mut out: [u32; 0] = [];
    assert_eq!(ring.dequeue_bulk(&mut out, QueueBehavior::Variable), 0);
    assert_eq!(ring.dequeue(), None);
}

#[test]
fn test_fifo_random_batches() {
    let ring: Ring<u64> = spsc_ring("fifo", 64);
    let mut rng = fastrand::Rng::with_seed(0x5eed);

    let total = 100_000u64;
    let mut next_in = 0u64;
    let mut next_out = 0u64;
    let mut buf = vec![0u64; 64];

    while next_out < total {
        let want = rng.u64(1..=48).min(total - next_in) as usize;
        let batch: Vec<u64> = (next_in..next_in + want as u64).collect();
        next_in += ring.enqueue_burst(&batch) as u64;

        let take = rng.usize(1..=48);
        let n = ring.dequeue_burst(&mut buf[..take]);
        for &v in &buf[..n] {
            assert_eq!(v, next_out, "FIFO order violated");
            next_out += 1;
        }

        // Nothing in flight: conservation holds.
        assert_eq!(ring.count() + ring.free_count(), ring.capacity());
    }
    println!("moved {total} items in random batches");
}

#[test]
fn test_cursor_wraparound() {
    let mut ring: Ring<u32> = spsc_ring("wrap", 4);
    let zone_name = ring.zone().name().to_owned();
    assert_eq!(zone_name, "RG_wrap");

    for round in 0..10_000u32 {
        assert!(ring.enqueue_all(&[round, round + 1, round + 2]));
        let mut out = [0u32; 3];
        assert_eq!(ring.dequeue_bulk(&mut out, QueueBehavior::Fixed), 3);
        assert_eq!(out, [round, round + 1, round + 2]);
    }

    ring.enqueue(7);
    ring.reset();
    assert!(ring.is_empty());
    assert_eq!(ring.free_count(), 3);
}

#[test]
fn test_struct_elements() {
    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Packet {
        id: u64,
        len: u16,
        port: u8,
    }

    let ring: Ring<Packet> = RingBuilder::new("packets", 32).build(&HeapAllocator).unwrap();
    let pkts: Vec<Packet> = (0..20)
        .map(|i| Packet { id: i, len: 64 + i as u16, port: (i % 4) as u8 })
        .collect();
    assert_eq!(ring.enqueue_bulk(&pkts, QueueBehavior::Fixed), 20);

    let mut out = vec![Packet { id: 0, len: 0, port: 0 }; 20];
    assert_eq!(ring.dequeue_bulk(&mut out, QueueBehavior::Fixed), 20);
    assert_eq!(out, pkts);
}

#[test]
fn test_modes_and_dump() {
    let ring: Ring<u32> = RingBuilder::new("dumped", 16)
        .single_producer()
        .build(&HeapAllocator)
        .unwrap();
    assert_eq!(ring.producer_mode(), SyncMode::Single);
    assert_eq!(ring.consumer_mode(), SyncMode::Multi);
    assert_eq!(ring.name(), "dumped");

    ring.enqueue_burst(&[1, 2, 3, 4, 5]);
    let mut one = [0u32; 1];
    ring.dequeue_burst(&mut one);

    let mut out = Vec::new();
    ring.dump(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    println!("{text}");

    assert!(text.starts_with("ring <dumped>@0x"));
    assert!(text.contains("  size=16\n"));
    assert!(text.contains("  capacity=15\n"));
    assert!(text.contains("  ct=1\n"));
    assert!(text.contains("  ph=5\n"));
    assert!(text.contains("  used=4\n"));
    assert!(text.contains("  avail=11\n"));
}

#[test]
fn test_memsize() {
    let small = Ring::<u64>::memsize(64, false).unwrap();
    let large = Ring::<u64>::memsize(1024, false).unwrap();
    assert_eq!(small % 128, 0);
    assert_eq!(large - small, (1024 - 64) * 8);
    assert!(Ring::<u64>::memsize(63, false).is_err());
}
