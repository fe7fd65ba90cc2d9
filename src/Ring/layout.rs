use crossbeam_utils::CachePadded;
use std::mem::size_of;
use std::sync::atomic::Ordering::Acquire;
use std::sync::atomic::{AtomicU32, AtomicU64};

use super::StdRing::{RingKind, SyncMode};
use crate::error::{Error, Result};
use crate::Core::alloc::{align_up, CACHE_LINE_SIZE, MEMZONE_NAMESIZE};

/// Prefix of the memzone backing a ring.
pub const RING_MZ_PREFIX: &str = "RG_";

/// Maximum ring name length plus one, so that the prefixed zone name still
/// fits `MEMZONE_NAMESIZE`.
pub const RING_NAMESIZE: usize = MEMZONE_NAMESIZE - RING_MZ_PREFIX.len();

/// Largest ring size accepted.
pub const RING_SZ_MASK: u32 = 0x7fff_ffff;

/// The lap counter of a lock-free slot is 32 bits wide. A slot written every
/// M cycles repeats its counter every M * size * 2^32 cycles; at 1024 entries
/// that is days at line rate, which keeps counter wraparound (and with it ABA)
/// out of reach in practice.
pub const MIN_LF_RING_SIZE: u32 = 1024;

/// Number of times a lock-free producer may find its slot taken before it
/// reloads the shared producer tail.
pub const ENQ_RETRY_LIMIT: u32 = 32;

pub(crate) const RING_MAGIC: u64 = 0x444D_5850_5F52_494E; // "DMXP_RIN"
pub(crate) const RING_LAYOUT_VERSION: u32 = 1;

/// One side (producer or consumer) of a ring.
///
/// `head` is the next index reserved by a thread on this side, `tail` the next
/// index whose slot contents are visible to the other side.
#[repr(C)]
pub struct HeadTail<C> {
    pub head: C,
    pub tail: C,
    /// Raw [`SyncMode`]. Decoded once when a handle is built, since the bytes
    /// may come from another process.
    pub single: u32,
}

impl HeadTail<AtomicU32> {
    pub(crate) fn new(single: SyncMode) -> Self {
        Self {
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            single: single as u32,
        }
    }
}

impl HeadTail<AtomicU64> {
    pub(crate) fn new(single: SyncMode) -> Self {
        Self {
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            single: single as u32,
        }
    }
}

/// Control block at the start of a ring's memzone. The slot array follows at
/// `header_size::<C>()`.
///
/// Producer and consumer cursors sit on separate cache lines so the two sides
/// never false-share. Every field is a plain integer or an atomic, so any bit
/// pattern a foreign mapping holds is a valid header; `magic` is published
/// last (see [`write_header`](crate::Core::alloc::write_header)).
#[repr(C, align(128))]
pub struct RingHeader<C> {
    pub magic: AtomicU64,
    pub version: u32,
    /// Raw [`RingKind`].
    pub kind: u32,
    pub name: [u8; RING_NAMESIZE],
    pub exact_size: u32,
    pub size: u32,
    pub mask: u32,
    pub capacity: u32,
    pub log2_size: u32,
    pub elt_size: u32,
    pub prod: CachePadded<HeadTail<C>>,
    pub cons: CachePadded<HeadTail<C>>,
}

/// Header of a standard ring: 32-bit cursors.
pub type StdRingHeader = RingHeader<AtomicU32>;

/// Header of a lock-free ring: 64-bit cursors.
pub type LfRingHeader = RingHeader<AtomicU64>;

/// Size, mask and usable capacity derived from a requested count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingGeometry {
    pub size: u32,
    pub mask: u32,
    pub capacity: u32,
    pub log2_size: u32,
}

impl RingGeometry {
    /// Without `exact_size`, `count` must be a power of two and one slot stays
    /// unused (`capacity = count - 1`). With it, the ring is rounded up to the
    /// next power of two above `count` and exactly `count` entries fit.
    pub fn new(count: u32, exact_size: bool, kind: RingKind) -> Result<Self> {
        let size = if exact_size {
            match count.checked_add(1).and_then(u32::checked_next_power_of_two) {
                Some(size) => size,
                None => {
                    return Err(Error::InvalidSize {
                        requested: count as u64,
                        max: RING_SZ_MASK as u64,
                    })
                }
            }
        } else {
            count
        };

        if count == 0 || !size.is_power_of_two() || size > RING_SZ_MASK {
            return Err(Error::InvalidSize {
                requested: count as u64,
                max: RING_SZ_MASK as u64,
            });
        }
        if kind == RingKind::LockFree && size < MIN_LF_RING_SIZE {
            return Err(Error::InvalidSize {
                requested: count as u64,
                max: RING_SZ_MASK as u64,
            });
        }

        Ok(Self {
            size,
            mask: size - 1,
            capacity: if exact_size { count } else { size - 1 },
            log2_size: size.trailing_zeros(),
        })
    }
}

/// Byte offset of the slot array inside the ring's memzone.
#[inline]
pub const fn header_size<C>() -> usize {
    align_up(size_of::<RingHeader<C>>(), CACHE_LINE_SIZE)
}

/// Total bytes a ring of `size` slots of `slot_size` bytes occupies.
pub fn ring_memsize<C>(size: u32, slot_size: usize) -> usize {
    align_up(header_size::<C>() + size as usize * slot_size, CACHE_LINE_SIZE)
}

impl<C> RingHeader<C> {
    /// Check a mapped header against the expected kind and decode the
    /// producer and consumer modes. `None` if the zone does not hold a fully
    /// initialized ring of that kind.
    pub(crate) fn validate(&self, kind: RingKind) -> Option<(SyncMode, SyncMode)> {
        // Acquire pairs with the release store that publishes the header.
        if self.magic.load(Acquire) != RING_MAGIC
            || self.version != RING_LAYOUT_VERSION
            || RingKind::try_from(self.kind).ok()? != kind
        {
            return None;
        }
        let prod = SyncMode::try_from(self.prod.single).ok()?;
        let cons = SyncMode::try_from(self.cons.single).ok()?;
        Some((prod, cons))
    }
}

pub(crate) fn encode_name(name: &str) -> [u8; RING_NAMESIZE] {
    let mut out = [0u8; RING_NAMESIZE];
    let n = name.len().min(RING_NAMESIZE - 1);
    out[..n].copy_from_slice(&name.as_bytes()[..n]);
    out
}

pub(crate) fn decode_name(raw: &[u8]) -> &str {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    std::str::from_utf8(&raw[..end]).unwrap_or("<invalid>")
}

// Lock-free slot encoding: one 64-bit word, value in the low half and the lap
// counter in the high half, so both are replaced by a single CAS.

const LAP_SHIFT: u32 = 32;
const VALUE_MASK: u64 = 0xFFFF_FFFF;

/// Pack a slot value and its lap counter into one atomically updatable word.
#[inline]
pub const fn pack_entry(value: u32, lap: u32) -> u64 {
    ((lap as u64) << LAP_SHIFT) | value as u64
}

/// Value half of a packed slot.
#[inline]
pub const fn entry_value(entry: u64) -> u32 {
    (entry & VALUE_MASK) as u32
}

/// Lap half of a packed slot.
#[inline]
pub const fn entry_lap(entry: u64) -> u32 {
    (entry >> LAP_SHIFT) as u32
}

/// Lap a slot must carry to be writable at ring index `idx`.
#[inline]
pub const fn lap_of(idx: u64, log2_size: u32) -> u32 {
    (idx >> log2_size) as u32
}
