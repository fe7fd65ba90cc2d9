use crate::error::{Error, Result};
use crate::Core::SharedMemory::{
    attach_shared_memory, create_heap_memory, create_shared_memory, SharedMemoryBackend,
};
use std::io;
use std::mem::{self, size_of};
use std::ptr;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Release;
use tracing::{debug, error};
mod debug;
mod getters;

/// Maximum length of a zone name, including the terminator slot kept for
/// compatibility with fixed-size name tables.
pub const MEMZONE_NAMESIZE: usize = 32;

/// Let the allocator pick any NUMA node.
pub const SOCKET_ID_ANY: i32 = -1;

/// Alignment used for every zone and for the header/slot split inside one.
pub const CACHE_LINE_SIZE: usize = 128;

/// Prefix applied to `/dev/shm` files so zones do not collide with other users.
const SHM_PREFIX: &str = "dmxp_";

#[inline]
pub(crate) const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Initialize an object header at the start of a zone, then publish `magic`.
///
/// Everything after the magic word is copied first and the magic is stored
/// last with release ordering, so a process that maps the zone concurrently
/// sees either no magic or a complete header.
///
/// # Safety
///
/// `base` must be valid for writes of `size_of::<H>()` bytes and aligned for
/// `H`, and `H` must be `repr(C)` with an `AtomicU64` magic as its first field.
pub(crate) unsafe fn write_header<H>(base: *mut u8, header: H, magic: u64) {
    let skip = size_of::<AtomicU64>();
    let src = &header as *const H as *const u8;
    ptr::copy_nonoverlapping(src.add(skip), base.add(skip), size_of::<H>() - skip);
    mem::forget(header);
    (*(base as *const AtomicU64)).store(magic, Release);
}

/// A named, contiguous, exclusively owned block of backing memory.
///
/// Dropping the zone releases the memory exactly once.
pub struct MemZone {
    name: String,
    socket_id: i32,
    align: usize,
    len: usize,
    attached: bool,
    shm: Box<dyn SharedMemoryBackend>,
}

impl MemZone {
    fn new(
        name: &str,
        socket_id: i32,
        align: usize,
        len: usize,
        attached: bool,
        shm: Box<dyn SharedMemoryBackend>,
    ) -> Self {
        Self {
            name: name.to_owned(),
            socket_id,
            align,
            len,
            attached,
            shm,
        }
    }

    /// Base address of the zone.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.shm.as_ptr()
    }
}

// The zone is only a region of bytes; synchronization lives in the objects placed in it.
unsafe impl Send for MemZone {}
unsafe impl Sync for MemZone {}

/// The bulk allocator the ring and the stack draw their backing store from.
///
/// Used once at creation and once at destruction, never on the hot path.
pub trait BulkAllocator: Send + Sync + std::fmt::Debug {
    /// Reserve `size` zeroed bytes aligned to `align`, tagged with `name`.
    fn reserve(&self, name: &str, size: usize, socket_id: i32, align: usize) -> Result<MemZone>;

    /// Map a zone that was reserved elsewhere (another process or handle).
    fn attach(&self, name: &str) -> Result<MemZone> {
        Err(Error::NotFound(name.to_owned()))
    }

    /// Withdraw a zone's name so later [`attach`](BulkAllocator::attach) and
    /// [`reserve`](BulkAllocator::reserve) calls no longer see it. Handles that
    /// already map the zone keep working until they are dropped.
    fn unlink(&self, zone: &MemZone) {
        zone.shm.unlink();
    }

    /// Release a zone: unlink its name, then drop it.
    fn free(&self, zone: MemZone) {
        debug!(zone = %zone.name, len = zone.len, "freeing memzone");
        self.unlink(&zone);
        drop(zone);
    }
}

fn validate_zone_request(name: &str, size: usize, align: usize) -> Result<()> {
    if name.len() >= MEMZONE_NAMESIZE {
        error!(zone = name, "zone name too long");
        return Err(Error::NameTooLong {
            name: name.to_owned(),
            max: MEMZONE_NAMESIZE - 1,
        });
    }
    if size == 0 {
        return Err(Error::InvalidArgument("zone size must be non-zero"));
    }
    if !align.is_power_of_two() {
        return Err(Error::InvalidArgument("zone alignment must be a power of two"));
    }
    Ok(())
}

/// Process-local allocator backed by the global heap.
///
/// `socket_id` is recorded on the zone but placement is left to the system
/// allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl BulkAllocator for HeapAllocator {
    fn reserve(&self, name: &str, size: usize, socket_id: i32, align: usize) -> Result<MemZone> {
        validate_zone_request(name, size, align)?;
        let align = align.max(CACHE_LINE_SIZE);
        let len = align_up(size, align);
        let shm = create_heap_memory(len, align).map_err(|e| {
            error!(zone = name, len, "cannot reserve memory: {e}");
            Error::Io(e)
        })?;
        debug!(zone = name, len, socket_id, "reserved heap memzone");
        Ok(MemZone::new(name, socket_id, align, len, false, shm))
    }
}

/// Allocator backed by named `/dev/shm` files.
///
/// A zone reserved here can be mapped again with [`BulkAllocator::attach`],
/// from the same process or a secondary one.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShmAllocator;

impl ShmAllocator {
    fn file_name(name: &str) -> String {
        format!("{SHM_PREFIX}{name}")
    }
}

impl BulkAllocator for ShmAllocator {
    fn reserve(&self, name: &str, size: usize, socket_id: i32, align: usize) -> Result<MemZone> {
        validate_zone_request(name, size, align)?;
        let align = align.max(CACHE_LINE_SIZE);
        let len = align_up(size, align);
        let shm = create_shared_memory(len, &Self::file_name(name)).map_err(|e| {
            if e.kind() == io::ErrorKind::AlreadyExists {
                Error::AlreadyExists(name.to_owned())
            } else {
                error!(zone = name, len, "cannot reserve shared memory: {e}");
                Error::Io(e)
            }
        })?;
        debug!(zone = name, len, socket_id, "reserved shared memzone");
        Ok(MemZone::new(name, socket_id, align, len, false, shm))
    }

    fn attach(&self, name: &str) -> Result<MemZone> {
        let shm = attach_shared_memory(&Self::file_name(name), 1).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::NotFound(name.to_owned())
            } else {
                Error::Io(e)
            }
        })?;
        let len = shm.size();
        debug!(zone = name, len, "attached shared memzone");
        Ok(MemZone::new(name, SOCKET_ID_ANY, CACHE_LINE_SIZE, len, true, shm))
    }

    fn unlink(&self, zone: &MemZone) {
        debug!(zone = %zone.name, "unlinking shared memzone");
        zone.shm.unlink();
    }
}
