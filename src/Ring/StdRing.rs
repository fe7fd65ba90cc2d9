// Fixed-capacity circular buffer of copyable objects with separate producer and
// consumer head/tail cursors.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr::NonNull;

use super::layout::StdRingHeader;
use crate::Core::alloc::MemZone;

/// How a bulk operation treats a request it cannot fully satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBehavior {
    /// Move exactly `n` objects or none.
    Fixed,
    /// Move as many objects as possible, `0..=n`.
    Variable,
}

/// Whether one side of a ring tolerates concurrent callers.
///
/// `Single` skips the head CAS and the wait for predecessors on the tail; it
/// is only correct if at most one thread uses that side at a time.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    #[default]
    Multi = 0,
    Single = 1,
}

impl SyncMode {
    #[inline]
    pub fn is_single(self) -> bool {
        self == SyncMode::Single
    }
}

impl TryFrom<u32> for SyncMode {
    type Error = u32;

    fn try_from(raw: u32) -> std::result::Result<Self, u32> {
        match raw {
            0 => Ok(SyncMode::Multi),
            1 => Ok(SyncMode::Single),
            other => Err(other),
        }
    }
}

/// Slot representation of a ring.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RingKind {
    /// Raw slots, 32-bit cursors, producers/consumers serialize on the tail.
    #[default]
    Standard = 0,
    /// `(value, lap)` slots replaced by CAS, pointer-width cursors; a thread
    /// stalled mid-operation cannot wedge the ring.
    LockFree = 1,
}

impl TryFrom<u32> for RingKind {
    type Error = u32;

    fn try_from(raw: u32) -> std::result::Result<Self, u32> {
        match raw {
            0 => Ok(RingKind::Standard),
            1 => Ok(RingKind::LockFree),
            other => Err(other),
        }
    }
}

/// Operations shared by [`Ring`] and [`LfRing`](super::lockfree::LfRing).
///
/// All of them are total: shortfalls are reported through the returned count.
pub trait BulkQueue<T: Copy> {
    /// Enqueue from `objs`; returns the number enqueued and the free space
    /// left afterwards.
    fn enqueue_bulk_with_free(&self, objs: &[T], behavior: QueueBehavior) -> (usize, u32);

    /// Dequeue into the front of `out`; returns the number dequeued and the
    /// entries left afterwards.
    fn dequeue_bulk_with_avail(&self, out: &mut [T], behavior: QueueBehavior) -> (usize, u32);

    /// Entries currently committed by producers and not yet released by
    /// consumers.
    fn count(&self) -> u32;

    fn capacity(&self) -> u32;

    #[inline]
    fn enqueue_bulk(&self, objs: &[T], behavior: QueueBehavior) -> usize {
        self.enqueue_bulk_with_free(objs, behavior).0
    }

    #[inline]
    fn dequeue_bulk(&self, out: &mut [T], behavior: QueueBehavior) -> usize {
        self.dequeue_bulk_with_avail(out, behavior).0
    }

    /// All-or-nothing enqueue.
    #[inline]
    fn enqueue_all(&self, objs: &[T]) -> bool {
        !objs.is_empty() && self.enqueue_bulk(objs, QueueBehavior::Fixed) == objs.len()
    }

    /// Enqueue as many of `objs` as fit.
    #[inline]
    fn enqueue_burst(&self, objs: &[T]) -> usize {
        self.enqueue_bulk(objs, QueueBehavior::Variable)
    }

    /// Dequeue up to `out.len()` objects.
    #[inline]
    fn dequeue_burst(&self, out: &mut [T]) -> usize {
        self.dequeue_bulk(out, QueueBehavior::Variable)
    }

    #[inline]
    fn enqueue(&self, obj: T) -> bool {
        self.enqueue_bulk(std::slice::from_ref(&obj), QueueBehavior::Fixed) == 1
    }

    /// Dequeue a single object.
    fn dequeue(&self) -> Option<T>;

    #[inline]
    fn free_count(&self) -> u32 {
        self.capacity() - self.count()
    }

    #[inline]
    fn is_full(&self) -> bool {
        self.free_count() == 0
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

/// Snapshot of a ring's cursors and fill level, for dumps and diagnostics.
///
/// The fields are read one by one with relaxed loads, so a snapshot taken
/// while operations are in flight need not be self-consistent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingStatus {
    pub name: String,
    pub addr: usize,
    pub kind: RingKind,
    pub producer: SyncMode,
    pub consumer: SyncMode,
    pub exact_size: bool,
    pub size: u32,
    pub capacity: u32,
    pub prod_head: u64,
    pub prod_tail: u64,
    pub cons_head: u64,
    pub cons_tail: u64,
    pub used: u32,
    pub avail: u32,
}

pub(crate) type Slot<T> = UnsafeCell<MaybeUninit<T>>;

/// Standard (blocking-tail) ring.
///
/// Backing store is one memzone: a [`StdRingHeader`] followed by `size` slots.
/// Slot ownership during an operation belongs to the thread that reserved the
/// index range through the head; it is handed to the other side by moving the
/// tail.
pub struct Ring<T: Copy> {
    pub(crate) zone: MemZone,
    pub(crate) header: NonNull<StdRingHeader>,
    pub(crate) slots: NonNull<Slot<T>>,

    /// Cached from the header; immutable after creation.
    pub(crate) size: u32,
    pub(crate) mask: u32,
    pub(crate) capacity: u32,
    pub(crate) producer: SyncMode,
    pub(crate) consumer: SyncMode,

    pub(crate) _marker: PhantomData<T>,
}

unsafe impl<T: Copy + Send> Send for Ring<T> {}
unsafe impl<T: Copy + Send> Sync for Ring<T> {}
