//! Non-blocking ring.
//!
//! Every slot is a single `AtomicU64` holding a 32-bit value and a 32-bit lap
//! counter ([`pack_entry`]). A slot at ring index `i` is writable only while
//! its lap equals `i >> log2(size)`; writing it stores the lap of `i + size`.
//! A stale producer therefore cannot overwrite a slot that was consumed and
//! refilled behind its back: the lap no longer matches and the CAS fails.
//!
//! Producers never wait for each other on the tail. Whoever finishes first
//! publishes the highest contiguous index it has observed filled, so a thread
//! that stalls (or dies) mid-enqueue does not wedge the ring.

use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::atomic::{fence, AtomicU64};

use crossbeam_utils::CachePadded;

use super::layout::{
    decode_name, encode_name, entry_lap, entry_value, header_size, lap_of, pack_entry,
    ring_memsize, HeadTail, LfRingHeader, RingGeometry, ENQ_RETRY_LIMIT, RING_LAYOUT_VERSION,
    RING_MAGIC,
};
use super::StdRing::{BulkQueue, QueueBehavior, RingKind, RingStatus, SyncMode};
use crate::error::{Error, Result};
use crate::Core::alloc::{write_header, MemZone};

/// Element types a lock-free slot can carry: anything that round-trips
/// through 32 bits, typically an index into an object pool.
pub trait LfElement: Copy + Send + 'static {
    fn to_bits(self) -> u32;
    fn from_bits(bits: u32) -> Self;
}

macro_rules! lf_element {
    ($($t:ty),*) => {$(
        impl LfElement for $t {
            #[inline]
            fn to_bits(self) -> u32 {
                self as u32
            }
            #[inline]
            fn from_bits(bits: u32) -> Self {
                bits as $t
            }
        }
    )*};
}

lf_element!(u8, u16, u32, i8, i16, i32);

/// Lock-free multi-producer/multi-consumer ring of [`LfElement`]s.
pub struct LfRing<T: LfElement> {
    zone: MemZone,
    header: NonNull<LfRingHeader>,
    slots: NonNull<AtomicU64>,
    size: u32,
    mask: u32,
    capacity: u32,
    log2_size: u32,
    producer: SyncMode,
    consumer: SyncMode,
    _marker: PhantomData<T>,
}

unsafe impl<T: LfElement> Send for LfRing<T> {}
unsafe impl<T: LfElement> Sync for LfRing<T> {}

struct PtrHeadMove {
    n: u32,
    old_head: u64,
    entries: u32,
}

impl<T: LfElement> LfRing<T> {
    /// Bytes of backing memory a lock-free ring of `count` entries needs.
    pub fn memsize(count: u32, exact_size: bool) -> Result<usize> {
        let geo = RingGeometry::new(count, exact_size, RingKind::LockFree)?;
        Ok(ring_memsize::<AtomicU64>(geo.size, size_of::<AtomicU64>()))
    }

    pub(crate) fn init_in(
        zone: MemZone,
        name: &str,
        geo: RingGeometry,
        exact_size: bool,
        producer: SyncMode,
        consumer: SyncMode,
    ) -> Result<Self> {
        let needed = ring_memsize::<AtomicU64>(geo.size, size_of::<AtomicU64>());
        if zone.len() < needed {
            return Err(Error::InvalidArgument("memzone too small for ring"));
        }

        // SAFETY: the zone is large enough and cache-line aligned; nothing
        // else references it until the magic is published.
        unsafe {
            write_header(
                zone.as_ptr(),
                LfRingHeader {
                    magic: AtomicU64::new(0),
                    version: RING_LAYOUT_VERSION,
                    kind: RingKind::LockFree as u32,
                    name: encode_name(name),
                    exact_size: exact_size as u32,
                    size: geo.size,
                    mask: geo.mask,
                    capacity: geo.capacity,
                    log2_size: geo.log2_size,
                    elt_size: size_of::<u32>() as u32,
                    prod: CachePadded::new(HeadTail::<AtomicU64>::new(producer)),
                    cons: CachePadded::new(HeadTail::<AtomicU64>::new(consumer)),
                },
                RING_MAGIC,
            );
        }

        let ring = Self::from_zone(zone)?;
        ring.init_slots();
        Ok(ring)
    }

    pub(crate) fn attach_in(zone: MemZone) -> Result<Self> {
        if zone.len() < header_size::<AtomicU64>() {
            return Err(Error::ElementMismatch {
                name: zone.name().to_owned(),
                expected: "a ring header",
            });
        }
        // SAFETY: the zone holds at least a header, and every header field
        // accepts any bit pattern.
        let header = unsafe { &*(zone.as_ptr() as *const LfRingHeader) };
        if header.validate(RingKind::LockFree).is_none()
            || zone.len() < ring_memsize::<AtomicU64>(header.size, size_of::<AtomicU64>())
        {
            return Err(Error::ElementMismatch {
                name: zone.name().to_owned(),
                expected: "a lock-free ring",
            });
        }
        Self::from_zone(zone)
    }

    fn from_zone(zone: MemZone) -> Result<Self> {
        let base = zone.as_ptr();
        let header = NonNull::new(base as *mut LfRingHeader)
            .ok_or(Error::InvalidArgument("memzone has no base address"))?;
        let slots = NonNull::new(unsafe { base.add(header_size::<AtomicU64>()) } as *mut AtomicU64)
            .ok_or(Error::InvalidArgument("memzone has no base address"))?;
        let h = unsafe { header.as_ref() };
        let (producer, consumer) = h
            .validate(RingKind::LockFree)
            .ok_or(Error::InvalidArgument("memzone does not hold a lock-free ring"))?;
        Ok(Self {
            zone,
            header,
            slots,
            size: h.size,
            mask: h.mask,
            capacity: h.capacity,
            log2_size: h.log2_size,
            producer,
            consumer,
            _marker: PhantomData,
        })
    }

    /// Every slot starts empty at lap 0.
    fn init_slots(&self) {
        for slot in self.slot_array() {
            slot.store(pack_entry(0, 0), Relaxed);
        }
    }

    #[inline]
    fn header(&self) -> &LfRingHeader {
        unsafe { self.header.as_ref() }
    }

    #[inline]
    fn slot_array(&self) -> &[AtomicU64] {
        unsafe { std::slice::from_raw_parts(self.slots.as_ptr(), self.size as usize) }
    }

    #[inline]
    fn slot(&self, idx: u64) -> &AtomicU64 {
        &self.slot_array()[(idx & self.mask as u64) as usize]
    }

    /// Producer head move over pointer-width cursors. Free space is measured
    /// against the consumer tail (the lock-free consumer has no head).
    #[inline]
    fn move_prod_head(&self, is_sp: bool, max: u32, behavior: QueueBehavior) -> PtrHeadMove {
        let h = self.header();
        let capacity = self.capacity as u64;
        let mut old_head = h.prod.head.load(Relaxed);

        loop {
            let mut n = max;

            fence(Acquire);

            // Pairs with the consumer-tail release in do_dequeue.
            let cons_tail = h.cons.tail.load(Acquire);

            let free_entries = capacity.wrapping_add(cons_tail).wrapping_sub(old_head) as u32;

            if n > free_entries {
                n = match behavior {
                    QueueBehavior::Fixed => 0,
                    QueueBehavior::Variable => free_entries,
                };
            }
            if n == 0 {
                return PtrHeadMove {
                    n: 0,
                    old_head,
                    entries: free_entries,
                };
            }

            let new_head = old_head.wrapping_add(n as u64);
            if is_sp {
                h.prod.head.store(new_head, Relaxed);
            } else if let Err(current) =
                h.prod
                    .head
                    .compare_exchange_weak(old_head, new_head, Relaxed, Relaxed)
            {
                old_head = current;
                continue;
            }

            return PtrHeadMove {
                n,
                old_head,
                entries: free_entries,
            };
        }
    }

    fn enqueue_sp(&self, objs: &[T], behavior: QueueBehavior) -> (usize, u32) {
        let mv = self.move_prod_head(true, request_len(objs.len()), behavior);
        if mv.n == 0 {
            return (0, mv.entries);
        }

        let size = self.size as u64;
        for (i, obj) in objs[..mv.n as usize].iter().enumerate() {
            let idx = mv.old_head.wrapping_add(i as u64);
            let next_lap = lap_of(idx.wrapping_add(size), self.log2_size);
            self.slot(idx).store(pack_entry(obj.to_bits(), next_lap), Relaxed);
        }

        let h = self.header();
        let tail = h.prod.tail.load(Relaxed);
        h.prod.tail.store(tail.wrapping_add(mv.n as u64), Release);
        (mv.n as usize, mv.entries - mv.n)
    }

    /// Next index to try after a slot turned out to be taken: the shared tail
    /// if it is ahead of ours, otherwise the following slot.
    #[inline]
    fn reload_tail(&self, idx: u64) -> u64 {
        let fresh = self.header().prod.tail.load(Relaxed);
        if (idx.wrapping_sub(fresh) as i64) < 0 {
            fresh
        } else {
            idx.wrapping_add(1)
        }
    }

    /// Move the shared producer tail forward to `val` unless another producer
    /// already moved it further.
    #[inline]
    fn publish_tail(&self, val: u64) -> u64 {
        let tail = &self.header().prod.tail;
        let mut old = tail.load(Relaxed);
        loop {
            if (val.wrapping_sub(old) as i64) < 0 {
                return old;
            }
            match tail.compare_exchange_weak(old, val, Release, Relaxed) {
                Ok(_) => return val,
                Err(current) => old = current,
            }
        }
    }

    /// Store `bits` in the first writable slot at or after ring index `tail`
    /// and return the index it landed at.
    ///
    /// The CAS compares the whole `(value, lap)` word read just before, so a
    /// producer that stalls between the read and the CAS while the slot is
    /// consumed and refilled fails instead of overwriting the new entry.
    fn claim_slot(&self, mut tail: u64, bits: u32) -> u64 {
        let size = self.size as u64;
        let log2 = self.log2_size;
        let mut retries = 0u32;
        loop {
            let slot = self.slot(tail);
            // Acquire: if this slot was filled by another producer, its
            // value must be visible before we publish a tail covering it.
            let old = slot.load(Acquire);

            if entry_lap(old) != lap_of(tail, log2) {
                // Filled this lap already: step over it. Anything else
                // means we fell two or more laps behind.
                let filled_lap = lap_of(tail.wrapping_add(size), log2);
                retries += 1;
                if entry_lap(old) != filled_lap || retries == ENQ_RETRY_LIMIT {
                    tail = self.reload_tail(tail);
                    retries = 0;
                } else {
                    tail = tail.wrapping_add(1);
                }
                continue;
            }

            let new = pack_entry(bits, lap_of(tail.wrapping_add(size), log2));
            // Only advance on success: a weak CAS may fail spuriously.
            if slot
                .compare_exchange_weak(old, new, Release, Relaxed)
                .is_ok()
            {
                return tail;
            }
        }
    }

    fn enqueue_mp(&self, objs: &[T], behavior: QueueBehavior) -> (usize, u32) {
        // Reserve space first; slots are claimed one at a time below.
        let mv = self.move_prod_head(false, request_len(objs.len()), behavior);
        let mut tail = self.header().prod.tail.load(Relaxed);

        if mv.n == 0 {
            self.publish_tail(tail);
            return (0, mv.entries);
        }

        for obj in &objs[..mv.n as usize] {
            tail = self.claim_slot(tail, obj.to_bits()).wrapping_add(1);
        }

        self.publish_tail(tail);
        (mv.n as usize, mv.entries - mv.n)
    }

    fn dequeue_sc<F>(&self, max: u32, behavior: QueueBehavior, mut sink: F) -> (usize, u32)
    where
        F: FnMut(usize, T),
    {
        let h = self.header();
        let cons_tail = h.cons.tail.load(Relaxed);
        let prod_tail = h.prod.tail.load(Acquire);

        let avail = prod_tail.wrapping_sub(cons_tail) as u32;
        let mut n = max;
        if avail < n {
            n = match behavior {
                QueueBehavior::Fixed => 0,
                QueueBehavior::Variable => avail,
            };
        }
        if n == 0 {
            return (0, avail);
        }

        for i in 0..n {
            let entry = self.slot(cons_tail.wrapping_add(i as u64)).load(Relaxed);
            sink(i as usize, T::from_bits(entry_value(entry)));
        }

        // Release: our slot reads happen before producers may refill them.
        h.cons.tail.store(cons_tail.wrapping_add(n as u64), Release);
        (n as usize, avail - n)
    }

    /// Copy the entries out speculatively, then claim them with a CAS on the
    /// consumer tail. If another consumer got there first the copy is
    /// discarded and redone from the new tail.
    fn dequeue_mc<F>(&self, max: u32, behavior: QueueBehavior, mut sink: F) -> (usize, u32)
    where
        F: FnMut(usize, T),
    {
        let h = self.header();
        let mut cons_tail = h.cons.tail.load(Relaxed);

        loop {
            // Reload every iteration to avoid reporting a spuriously empty ring.
            let prod_tail = h.prod.tail.load(Acquire);

            let avail = prod_tail.wrapping_sub(cons_tail) as u32;
            let mut n = max;
            if avail < n {
                n = match behavior {
                    QueueBehavior::Fixed => 0,
                    QueueBehavior::Variable => avail,
                };
            }
            if n == 0 {
                return (0, avail);
            }

            for i in 0..n {
                let entry = self.slot(cons_tail.wrapping_add(i as u64)).load(Relaxed);
                sink(i as usize, T::from_bits(entry_value(entry)));
            }

            match h.cons.tail.compare_exchange(
                cons_tail,
                cons_tail.wrapping_add(n as u64),
                Release,
                Relaxed,
            ) {
                Ok(_) => return (n as usize, avail - n),
                Err(current) => cons_tail = current,
            }
        }
    }

    fn do_dequeue<F>(&self, max: u32, behavior: QueueBehavior, sink: F) -> (usize, u32)
    where
        F: FnMut(usize, T),
    {
        if self.consumer.is_single() {
            self.dequeue_sc(max, behavior, sink)
        } else {
            self.dequeue_mc(max, behavior, sink)
        }
    }

    /// Drop every entry, rewind the cursors and reset all laps.
    pub fn reset(&mut self) {
        let h = self.header();
        h.prod.head.store(0, Relaxed);
        h.prod.tail.store(0, Relaxed);
        h.cons.head.store(0, Relaxed);
        h.cons.tail.store(0, Relaxed);
        self.init_slots();
    }

    pub fn name(&self) -> &str {
        decode_name(&self.header().name)
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn producer_mode(&self) -> SyncMode {
        self.producer
    }

    pub fn consumer_mode(&self) -> SyncMode {
        self.consumer
    }

    pub fn is_exact_size(&self) -> bool {
        self.header().exact_size != 0
    }

    pub(crate) fn into_zone(self) -> MemZone {
        self.zone
    }

    pub fn zone(&self) -> &MemZone {
        &self.zone
    }

    /// Lap counter currently stored in the slot backing ring index `idx`.
    pub fn slot_lap(&self, idx: u64) -> u32 {
        entry_lap(self.slot(idx).load(Acquire))
    }

    pub fn status(&self) -> RingStatus {
        let h = self.header();
        let used = self.count();
        RingStatus {
            name: self.name().to_owned(),
            addr: self.header.as_ptr() as usize,
            kind: RingKind::LockFree,
            producer: self.producer,
            consumer: self.consumer,
            exact_size: self.is_exact_size(),
            size: self.size,
            capacity: self.capacity,
            prod_head: h.prod.head.load(Relaxed),
            prod_tail: h.prod.tail.load(Relaxed),
            cons_head: h.cons.head.load(Relaxed),
            cons_tail: h.cons.tail.load(Relaxed),
            used,
            avail: self.capacity - used,
        }
    }

    pub fn dump<W: io::Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
        crate::Debug::StructDebug::dump_ring(w, &self.status())
    }
}

#[inline]
fn request_len(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

impl<T: LfElement> BulkQueue<T> for LfRing<T> {
    fn enqueue_bulk_with_free(&self, objs: &[T], behavior: QueueBehavior) -> (usize, u32) {
        if self.producer.is_single() {
            self.enqueue_sp(objs, behavior)
        } else {
            self.enqueue_mp(objs, behavior)
        }
    }

    fn dequeue_bulk_with_avail(&self, out: &mut [T], behavior: QueueBehavior) -> (usize, u32) {
        let max = request_len(out.len());
        self.do_dequeue(max, behavior, |i, obj| out[i] = obj)
    }

    fn dequeue(&self) -> Option<T> {
        let mut got = None;
        let (n, _) = self.do_dequeue(1, QueueBehavior::Fixed, |_, obj| got = Some(obj));
        if n == 1 {
            got
        } else {
            None
        }
    }

    fn count(&self) -> u32 {
        let h = self.header();
        let prod_tail = h.prod.tail.load(Relaxed);
        let cons_tail = h.cons.tail.load(Relaxed);
        let count = (prod_tail.wrapping_sub(cons_tail) & self.mask as u64) as u32;
        count.min(self.capacity)
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }
}

impl<T: LfElement> fmt::Debug for LfRing<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        crate::Debug::StructDebug::debug_ring(&self.status(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Core::alloc::HeapAllocator;
    use crate::Ring::RingBuilder;

    fn ring() -> LfRing<u32> {
        RingBuilder::new("lf_laps", 1024)
            .build_lock_free(&HeapAllocator)
            .unwrap()
    }

    /// Pass `n` entries through the ring one at a time.
    fn churn(ring: &LfRing<u32>, n: u32) {
        for i in 0..n {
            assert!(ring.enqueue(i));
            assert_eq!(ring.dequeue(), Some(i));
        }
    }

    #[test]
    fn test_stalled_cas_fails_after_slot_is_refilled() {
        let ring = ring();
        churn(&ring, 5);

        // A producer headed for index 5 reads the slot and is descheduled.
        let stale = ring.slot(5).load(Acquire);
        assert_eq!(entry_lap(stale), 0);

        // Index 5 is filled and drained, then the same slot is refilled at
        // index 1029 and left unconsumed.
        churn(&ring, 1024);
        assert!(ring.enqueue(777));
        let refilled = ring.slot(5).load(Acquire);
        assert_eq!(entry_value(refilled), 777);
        assert_eq!(entry_lap(refilled), 2);

        // Resuming, its CAS compares against the old lap and must fail.
        let res = ring
            .slot(5)
            .compare_exchange(stale, pack_entry(13, 1), Release, Relaxed);
        assert_eq!(res, Err(refilled));
        assert_eq!(ring.dequeue(), Some(777));
        assert!(ring.is_empty());
    }

    #[test]
    fn test_producer_two_laps_behind_reloads_tail() {
        let ring = ring();
        churn(&ring, 2048);
        let pending: Vec<u32> = (100..110).collect();
        assert!(ring.enqueue_all(&pending));

        // Space is reserved normally, but the producer's local tail still
        // points at index 0, two laps back.
        let mv = ring.move_prod_head(false, 1, QueueBehavior::Fixed);
        assert_eq!((mv.n, mv.old_head), (1, 2058));
        let at = ring.claim_slot(0, 555);
        assert_eq!(at, 2058, "a stale tail must jump to the shared producer tail");
        assert_eq!(ring.publish_tail(at + 1), 2059);

        // Nothing still waiting to be consumed was overwritten.
        let mut out = [0u32; 11];
        assert_eq!(ring.dequeue_bulk(&mut out, QueueBehavior::Fixed), 11);
        assert_eq!(&out[..10], &pending[..]);
        assert_eq!(out[10], 555);
    }

    #[test]
    fn test_producer_one_lap_behind_steps_over_filled_slots() {
        let ring = ring();
        churn(&ring, 1024);
        assert!(ring.enqueue_all(&[1, 2, 3]));

        // Indices 1024..1027 are filled this lap; a producer starting at 1024
        // walks past them to the first free slot.
        let mv = ring.move_prod_head(false, 1, QueueBehavior::Fixed);
        assert_eq!(mv.old_head, 1027);
        assert_eq!(ring.claim_slot(1024, 4), 1027);
        ring.publish_tail(1028);

        let mut out = [0u32; 4];
        assert_eq!(ring.dequeue_burst(&mut out), 4);
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn test_publish_tail_never_moves_back() {
        let ring = ring();
        assert!(ring.enqueue_all(&[1, 2, 3, 4]));
        assert_eq!(ring.publish_tail(2), 4);
        assert_eq!(ring.header().prod.tail.load(Relaxed), 4);
        assert_eq!(ring.count(), 4);
    }
}
