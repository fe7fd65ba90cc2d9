//! FIFO ticket lock.
//!
//! A thread takes a ticket by post-incrementing `next` and spins until
//! `current` reaches it. Tickets are served strictly in issue order.

use std::hint::spin_loop;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use parking_lot::lock_api::{self, GuardSend};

use crate::Core::lcore::{lcore_id, LCORE_ID_ANY};

#[repr(C)]
#[derive(Debug)]
pub struct RawTicketLock {
    current: AtomicU32,
    next: AtomicU32,
}

/// Snapshot of a ticket lock's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tickets {
    /// Ticket currently being served.
    pub current: u32,
    /// Next ticket to be handed out.
    pub next: u32,
}

impl Tickets {
    /// Threads holding or waiting for the lock.
    pub fn queued(&self) -> u32 {
        self.next.wrapping_sub(self.current)
    }
}

impl Default for RawTicketLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RawTicketLock {
    pub const fn new() -> Self {
        Self {
            current: AtomicU32::new(0),
            next: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn lock(&self) {
        let me = self.next.fetch_add(1, Relaxed);
        while self.current.load(Acquire) != me {
            spin_loop();
        }
    }

    /// # Safety
    ///
    /// The caller must hold the lock.
    #[inline]
    pub unsafe fn unlock(&self) {
        // Only the holder writes `current`.
        let served = self.current.load(Relaxed);
        self.current.store(served.wrapping_add(1), Release);
    }

    /// Take the lock only if nobody holds or waits for it.
    #[inline]
    pub fn try_lock(&self) -> bool {
        let next = self.next.load(Relaxed);
        let current = self.current.load(Acquire);
        next == current
            && self
                .next
                .compare_exchange(next, next.wrapping_add(1), Acquire, Relaxed)
                .is_ok()
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.current.load(Acquire) != self.next.load(Acquire)
    }

    pub fn tickets(&self) -> Tickets {
        Tickets {
            current: self.current.load(Relaxed),
            next: self.next.load(Relaxed),
        }
    }
}

unsafe impl lock_api::RawMutex for RawTicketLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = RawTicketLock::new();

    type GuardMarker = GuardSend;

    #[inline]
    fn lock(&self) {
        RawTicketLock::lock(self)
    }

    #[inline]
    fn try_lock(&self) -> bool {
        RawTicketLock::try_lock(self)
    }

    #[inline]
    unsafe fn unlock(&self) {
        RawTicketLock::unlock(self)
    }

    #[inline]
    fn is_locked(&self) -> bool {
        RawTicketLock::is_locked(self)
    }
}

/// Data guarded by a [`RawTicketLock`], with RAII guards.
pub type TicketLock<T> = lock_api::Mutex<RawTicketLock, T>;
pub type TicketLockGuard<'a, T> = lock_api::MutexGuard<'a, RawTicketLock, T>;

/// Ticket lock the owning thread may take again without deadlocking.
///
/// Ownership is tracked by [`lcore_id`]; the underlying lock is released when
/// the owner has unlocked as many times as it locked.
#[derive(Debug)]
pub struct RecursiveTicketLock {
    lock: RawTicketLock,
    owner: AtomicU32,
    count: AtomicU32,
}

impl Default for RecursiveTicketLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RecursiveTicketLock {
    pub const fn new() -> Self {
        Self {
            lock: RawTicketLock::new(),
            owner: AtomicU32::new(LCORE_ID_ANY),
            count: AtomicU32::new(0),
        }
    }

    pub fn lock(&self) {
        let id = lcore_id();
        if self.owner.load(Relaxed) != id {
            self.lock.lock();
            self.owner.store(id, Relaxed);
        }
        self.count.fetch_add(1, Relaxed);
    }

    /// # Safety
    ///
    /// The calling thread must hold the lock.
    pub unsafe fn unlock(&self) {
        debug_assert_eq!(self.owner.load(Relaxed), lcore_id());
        if self.count.fetch_sub(1, Relaxed) == 1 {
            self.owner.store(LCORE_ID_ANY, Relaxed);
            self.lock.unlock();
        }
    }

    pub fn try_lock(&self) -> bool {
        let id = lcore_id();
        if self.owner.load(Relaxed) != id {
            if !self.lock.try_lock() {
                return false;
            }
            self.owner.store(id, Relaxed);
        }
        self.count.fetch_add(1, Relaxed);
        true
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    /// Lcore id of the current holder.
    pub fn owner(&self) -> Option<u32> {
        match self.owner.load(Relaxed) {
            LCORE_ID_ANY => None,
            id => Some(id),
        }
    }

    /// How many times the holder has locked without unlocking.
    pub fn depth(&self) -> u32 {
        self.count.load(Relaxed)
    }
}
