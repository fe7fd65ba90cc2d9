use std::hint::spin_loop;
use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::mem::{align_of, size_of, MaybeUninit};
use std::ptr::NonNull;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::atomic::{fence, AtomicU32, AtomicU64};

use crossbeam_utils::CachePadded;

use super::layout::{
    decode_name, encode_name, header_size, ring_memsize, HeadTail, RingGeometry, StdRingHeader,
    RING_LAYOUT_VERSION, RING_MAGIC,
};
use super::StdRing::{BulkQueue, QueueBehavior, Ring, RingKind, RingStatus, Slot, SyncMode};
use crate::error::{Error, Result};
use crate::Core::alloc::{write_header, MemZone, CACHE_LINE_SIZE};

/// Outcome of a head move: how many entries were reserved, where the
/// reservation starts and ends, and the free/used count seen before moving.
struct HeadMove {
    n: u32,
    old_head: u32,
    new_head: u32,
    entries: u32,
}

#[inline]
fn request_len(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

impl<T: Copy + Send> Ring<T> {
    /// Bytes of backing memory a ring of `count` entries needs.
    pub fn memsize(count: u32, exact_size: bool) -> Result<usize> {
        Self::check_element()?;
        let geo = RingGeometry::new(count, exact_size, RingKind::Standard)?;
        Ok(ring_memsize::<AtomicU32>(geo.size, size_of::<Slot<T>>()))
    }

    fn check_element() -> Result<()> {
        if align_of::<T>() > CACHE_LINE_SIZE {
            return Err(Error::InvalidArgument(
                "ring element alignment exceeds the cache line size",
            ));
        }
        Ok(())
    }

    /// Lay a fresh ring out in `zone`.
    ///
    /// The zone must be at least [`Ring::memsize`] bytes for `geo`.
    pub(crate) fn init_in(
        zone: MemZone,
        name: &str,
        geo: RingGeometry,
        exact_size: bool,
        producer: SyncMode,
        consumer: SyncMode,
    ) -> Result<Self> {
        Self::check_element()?;
        let needed = ring_memsize::<AtomicU32>(geo.size, size_of::<Slot<T>>());
        if zone.len() < needed {
            return Err(Error::InvalidArgument("memzone too small for ring"));
        }

        // SAFETY: the zone is large enough and cache-line aligned; nothing
        // else references it until the magic is published.
        unsafe {
            write_header(
                zone.as_ptr(),
                StdRingHeader {
                    magic: AtomicU64::new(0),
                    version: RING_LAYOUT_VERSION,
                    kind: RingKind::Standard as u32,
                    name: encode_name(name),
                    exact_size: exact_size as u32,
                    size: geo.size,
                    mask: geo.mask,
                    capacity: geo.capacity,
                    log2_size: geo.log2_size,
                    elt_size: size_of::<T>() as u32,
                    prod: CachePadded::new(HeadTail::<AtomicU32>::new(producer)),
                    cons: CachePadded::new(HeadTail::<AtomicU32>::new(consumer)),
                },
                RING_MAGIC,
            );
        }

        Self::from_zone(zone)
    }

    /// Build a view over a zone that already holds an initialized ring.
    pub(crate) fn attach_in(zone: MemZone) -> Result<Self> {
        Self::check_element()?;
        if zone.len() < header_size::<AtomicU32>() {
            return Err(Error::ElementMismatch {
                name: zone.name().to_owned(),
                expected: "a ring header",
            });
        }
        // SAFETY: the zone holds at least a header, and every header field
        // accepts any bit pattern.
        let header = unsafe { &*(zone.as_ptr() as *const StdRingHeader) };
        if header.validate(RingKind::Standard).is_none() {
            return Err(Error::ElementMismatch {
                name: zone.name().to_owned(),
                expected: "a standard ring",
            });
        }
        if header.elt_size as usize != size_of::<T>()
            || zone.len() < ring_memsize::<AtomicU32>(header.size, size_of::<Slot<T>>())
        {
            return Err(Error::ElementMismatch {
                name: zone.name().to_owned(),
                expected: std::any::type_name::<T>(),
            });
        }
        Self::from_zone(zone)
    }

    fn from_zone(zone: MemZone) -> Result<Self> {
        let base = zone.as_ptr();
        let header = NonNull::new(base as *mut StdRingHeader)
            .ok_or(Error::InvalidArgument("memzone has no base address"))?;
        let slots = NonNull::new(unsafe { base.add(header_size::<AtomicU32>()) } as *mut Slot<T>)
            .ok_or(Error::InvalidArgument("memzone has no base address"))?;
        let h = unsafe { header.as_ref() };
        let (producer, consumer) = h
            .validate(RingKind::Standard)
            .ok_or(Error::InvalidArgument("memzone does not hold a standard ring"))?;
        Ok(Self {
            zone,
            header,
            slots,
            size: h.size,
            mask: h.mask,
            capacity: h.capacity,
            producer,
            consumer,
            _marker: PhantomData,
        })
    }

    #[inline]
    pub(crate) fn header(&self) -> &StdRingHeader {
        // SAFETY: header points at the start of the zone we own for our whole lifetime.
        unsafe { self.header.as_ref() }
    }

    #[inline]
    fn slot_array(&self) -> &[Slot<T>] {
        // SAFETY: the zone holds `size` slots after the header; see `init_in`.
        unsafe { std::slice::from_raw_parts(self.slots.as_ptr(), self.size as usize) }
    }

    #[inline]
    fn slot(&self, idx: u32) -> &Slot<T> {
        &self.slot_array()[(idx & self.mask) as usize]
    }

    /// Reserve up to `n` slots on the producer head.
    ///
    /// The head load can be relaxed because the CAS re-validates it; the
    /// acquire fence keeps it ordered before the consumer-tail load.
    #[inline]
    fn move_prod_head(&self, is_sp: bool, max: u32, behavior: QueueBehavior) -> HeadMove {
        let h = self.header();
        let capacity = self.capacity;
        let mut old_head = h.prod.head.load(Relaxed);

        loop {
            let mut n = max;

            fence(Acquire);

            // Pairs with the consumer's tail store-release in update_tail.
            let cons_tail = h.cons.tail.load(Acquire);

            // Unsigned modulo 2^32, always within [0, capacity].
            let free_entries = capacity.wrapping_add(cons_tail).wrapping_sub(old_head);

            if n > free_entries {
                n = match behavior {
                    QueueBehavior::Fixed => 0,
                    QueueBehavior::Variable => free_entries,
                };
            }
            if n == 0 {
                return HeadMove {
                    n: 0,
                    old_head,
                    new_head: old_head,
                    entries: free_entries,
                };
            }

            let new_head = old_head.wrapping_add(n);
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

            return HeadMove {
                n,
                old_head,
                new_head,
                entries: free_entries,
            };
        }
    }

    /// Reserve up to `n` committed entries on the consumer head.
    #[inline]
    fn move_cons_head(&self, is_sc: bool, max: u32, behavior: QueueBehavior) -> HeadMove {
        let h = self.header();
        let mut old_head = h.cons.head.load(Relaxed);

        loop {
            let mut n = max;

            fence(Acquire);

            // Pairs with the producer's tail store-release in update_tail.
            let prod_tail = h.prod.tail.load(Acquire);

            let entries = prod_tail.wrapping_sub(old_head);

            if n > entries {
                n = match behavior {
                    QueueBehavior::Fixed => 0,
                    QueueBehavior::Variable => entries,
                };
            }
            if n == 0 {
                return HeadMove {
                    n: 0,
                    old_head,
                    new_head: old_head,
                    entries,
                };
            }

            let new_head = old_head.wrapping_add(n);
            if is_sc {
                h.cons.head.store(new_head, Relaxed);
            } else if let Err(current) =
                h.cons
                    .head
                    .compare_exchange_weak(old_head, new_head, Relaxed, Relaxed)
            {
                old_head = current;
                continue;
            }

            return HeadMove {
                n,
                old_head,
                new_head,
                entries,
            };
        }
    }

    /// Publish `[old_val, new_val)` to the other side.
    ///
    /// With several threads on this side, tails move in reservation order:
    /// wait until every earlier reservation has been published first.
    #[inline]
    fn update_tail(ht: &HeadTail<AtomicU32>, old_val: u32, new_val: u32, single: bool) {
        if !single {
            while ht.tail.load(Relaxed) != old_val {
                spin_loop();
            }
        }
        ht.tail.store(new_val, Release);
    }

    fn do_enqueue(&self, objs: &[T], behavior: QueueBehavior) -> (usize, u32) {
        let h = self.header();
        let single = self.producer.is_single();
        let mv = self.move_prod_head(single, request_len(objs.len()), behavior);
        if mv.n == 0 {
            return (0, mv.entries);
        }

        for (i, obj) in objs[..mv.n as usize].iter().enumerate() {
            let slot = self.slot(mv.old_head.wrapping_add(i as u32));
            // SAFETY: [old_head, new_head) was reserved by this thread alone.
            unsafe { (*slot.get()).write(*obj) };
        }

        Self::update_tail(&h.prod, mv.old_head, mv.new_head, single);
        (mv.n as usize, mv.entries - mv.n)
    }

    fn do_dequeue<F>(&self, max: u32, behavior: QueueBehavior, mut sink: F) -> (usize, u32)
    where
        F: FnMut(usize, T),
    {
        let h = self.header();
        let single = self.consumer.is_single();
        let mv = self.move_cons_head(single, max, behavior);
        if mv.n == 0 {
            return (0, mv.entries);
        }

        for i in 0..mv.n {
            let slot = self.slot(mv.old_head.wrapping_add(i));
            // SAFETY: reserved by this thread and published by a producer tail
            // store that our acquire load of prod.tail synchronized with.
            let obj = unsafe { (*slot.get()).assume_init_read() };
            sink(i as usize, obj);
        }

        Self::update_tail(&h.cons, mv.old_head, mv.new_head, single);
        (mv.n as usize, mv.entries - mv.n)
    }

    /// Drop every entry and rewind all cursors to zero.
    ///
    /// Requires exclusive access, so no operation can be in flight.
    pub fn reset(&mut self) {
        let h = self.header();
        h.prod.head.store(0, Relaxed);
        h.prod.tail.store(0, Relaxed);
        h.cons.head.store(0, Relaxed);
        h.cons.tail.store(0, Relaxed);
    }

    pub fn name(&self) -> &str {
        decode_name(&self.header().name)
    }

    /// Number of slots (always a power of two).
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

    /// The memzone holding this ring.
    pub(crate) fn into_zone(self) -> MemZone {
        self.zone
    }

    pub fn zone(&self) -> &MemZone {
        &self.zone
    }

    pub fn status(&self) -> RingStatus {
        let h = self.header();
        let used = self.count();
        RingStatus {
            name: self.name().to_owned(),
            addr: self.header.as_ptr() as usize,
            kind: RingKind::Standard,
            producer: self.producer,
            consumer: self.consumer,
            exact_size: self.is_exact_size(),
            size: self.size,
            capacity: self.capacity,
            prod_head: h.prod.head.load(Relaxed) as u64,
            prod_tail: h.prod.tail.load(Relaxed) as u64,
            cons_head: h.cons.head.load(Relaxed) as u64,
            cons_tail: h.cons.tail.load(Relaxed) as u64,
            used,
            avail: self.capacity - used,
        }
    }

    /// Write the ring's counters to `w`.
    pub fn dump<W: io::Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
        crate::Debug::StructDebug::dump_ring(w, &self.status())
    }
}

impl<T: Copy + Send> BulkQueue<T> for Ring<T> {
    fn enqueue_bulk_with_free(&self, objs: &[T], behavior: QueueBehavior) -> (usize, u32) {
        self.do_enqueue(objs, behavior)
    }

    fn dequeue_bulk_with_avail(&self, out: &mut [T], behavior: QueueBehavior) -> (usize, u32) {
        let max = request_len(out.len());
        self.do_dequeue(max, behavior, |i, obj| out[i] = obj)
    }

    fn dequeue(&self) -> Option<T> {
        let mut slot = MaybeUninit::<T>::uninit();
        let (n, _) = self.do_dequeue(1, QueueBehavior::Fixed, |_, obj| {
            slot.write(obj);
        });
        // SAFETY: n == 1 means the sink ran exactly once.
        (n == 1).then(|| unsafe { slot.assume_init() })
    }

    fn count(&self) -> u32 {
        let h = self.header();
        let prod_tail = h.prod.tail.load(Relaxed);
        let cons_tail = h.cons.tail.load(Relaxed);
        let count = prod_tail.wrapping_sub(cons_tail) & self.mask;
        count.min(self.capacity)
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }
}

impl<T: Copy + Send> fmt::Debug for Ring<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        crate::Debug::StructDebug::debug_ring(&self.status(), f)
    }
}
