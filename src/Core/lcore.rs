//! Logical-core identity.
//!
//! Every OS thread that touches this crate gets a stable `u32` the first time
//! it asks for one. Ids are handed out in increasing order and never reused
//! for the lifetime of the process.

use std::cell::Cell;
use std::sync::atomic::{AtomicU32, Ordering};

/// Value never handed out as an lcore id.
pub const LCORE_ID_ANY: u32 = u32::MAX;

static NEXT_LCORE_ID: AtomicU32 = AtomicU32::new(0);

thread_local! {
    static LCORE_ID: Cell<u32> = const { Cell::new(LCORE_ID_ANY) };
}

/// The calling thread's logical-core id.
#[inline]
pub fn lcore_id() -> u32 {
    LCORE_ID.with(|id| {
        let current = id.get();
        if current != LCORE_ID_ANY {
            return current;
        }
        let assigned = NEXT_LCORE_ID.fetch_add(1, Ordering::Relaxed);
        id.set(assigned);
        assigned
    })
}

/// Number of ids handed out so far.
pub fn lcore_count() -> u32 {
    NEXT_LCORE_ID.load(Ordering::Relaxed)
}
