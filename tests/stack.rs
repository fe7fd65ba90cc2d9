// Bounded stack tests.
// Run with: cargo test --test stack -- --nocapture

use dmxp_core::error::Error;
use dmxp_core::Core::{HeapAllocator, Registry};
use dmxp_core::Stack::{Stack, StackBuilder, STACK_MAX_COUNT, STACK_NAMESIZE};
use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn test_lifo_order() {
    let stack: Stack<u64> = StackBuilder::new("lifo", 8).build(&HeapAllocator).unwrap();
    println!("{:?}", stack);
    assert_eq!(stack.capacity(), 8);
    assert_eq!(stack.name(), "lifo");
    assert!(stack.is_empty());

    assert_eq!(stack.push(&[1, 2, 3]), 3);
    assert_eq!(stack.push(&[4]), 1);
    assert_eq!(stack.count(), 4);
    assert_eq!(stack.free_count(), 4);

    let mut out = [0u64; 3];
    assert_eq!(stack.pop(&mut out), 3);
    assert_eq!(out, [4, 3, 2]);

    let mut last = [0u64; 1];
    assert_eq!(stack.pop(&mut last), 1);
    assert_eq!(last, [1]);
    assert!(stack.is_empty());
}

#[test]
fn test_all_or_nothing() {
    let stack: Stack<u32> = StackBuilder::new("bounded", 4).build(&HeapAllocator).unwrap();
    assert_eq!(stack.push(&[1, 2, 3]), 3);
    assert_eq!(stack.push(&[4, 5]), 0);
    assert_eq!(stack.count(), 3);

    let mut out = [0u32; 4];
    assert_eq!(stack.pop(&mut out), 0);
    assert_eq!(stack.count(), 3);
    assert_eq!(out, [0; 4]);

    assert_eq!(stack.push(&[]), 0);
    assert_eq!(stack.pop(&mut []), 0);
}

#[test]
fn test_invalid_creation() {
    assert!(matches!(
        StackBuilder::new("zero", 0).build::<u32>(&HeapAllocator),
        Err(Error::InvalidSize { .. })
    ));
    assert!(StackBuilder::new("huge", STACK_MAX_COUNT + 1)
        .build::<u32>(&HeapAllocator)
        .is_err());

    let long = "s".repeat(STACK_NAMESIZE);
    let err = StackBuilder::new(&long, 8).build::<u32>(&HeapAllocator).unwrap_err();
    assert_eq!(err.errno(), -libc::ENAMETOOLONG);

    // Longest accepted name still fits the zone name.
    let longest = "s".repeat(STACK_NAMESIZE - 1);
    let stack: Stack<u32> = StackBuilder::new(&longest, 8).build(&HeapAllocator).unwrap();
    assert_eq!(stack.name(), longest);
}

#[test]
fn test_concurrent_push_pop() {
    const THREADS: u32 = 4;
    const ROUNDS: u32 = 5_000;

    let registry = Registry::default();
    let stack: Arc<Stack<u32>> = StackBuilder::new("shared", THREADS * 4)
        .create(&registry)
        .unwrap();
    let barrier = Arc::new(Barrier::new(THREADS as usize));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let stack = Arc::clone(&stack);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for r in 0..ROUNDS {
                    let batch = [t * 1_000_000 + r * 2, t * 1_000_000 + r * 2 + 1];
                    while stack.push(&batch) == 0 {
                        std::hint::spin_loop();
                    }
                    let mut out = [0u32; 2];
                    while stack.pop(&mut out) == 0 {
                        std::hint::spin_loop();
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(stack.count(), 0);

    // Contents survive intact under contention.
    let items: Vec<u32> = (0..stack.capacity()).collect();
    assert_eq!(stack.push(&items), items.len());
    let mut out = vec![0u32; items.len()];
    assert_eq!(stack.pop(&mut out), items.len());
    let unique: HashSet<u32> = out.iter().copied().collect();
    assert_eq!(unique.len(), items.len());

    let mut text = Vec::new();
    stack.dump(&mut text).unwrap();
    let text = String::from_utf8(text).unwrap();
    println!("{text}");
    assert!(text.starts_with("stack <shared>@0x"));
    assert!(text.contains("  capacity=16\n"));
    assert!(text.contains("  used=0\n"));
    assert!(text.contains("  locked=false\n"));

    drop(stack);
    registry.free_stack("shared").unwrap();
    assert!(registry.stack_names().is_empty());
}
