//! Bounded LIFO guarded by a single ticket lock.
//!
//! Push and pop are all-or-nothing. Every access serializes on the lock, so
//! this is meant for cases where LIFO order matters more than throughput.

use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ptr::{self, NonNull};
use std::sync::atomic::Ordering::{Acquire, Relaxed};
use std::sync::atomic::{AtomicU32, AtomicU64};

use tracing::error;

use crate::error::{Error, Result};
use crate::Core::alloc::{
    align_up, write_header, BulkAllocator, MemZone, CACHE_LINE_SIZE, MEMZONE_NAMESIZE,
    SOCKET_ID_ANY,
};
use crate::Core::registry::Registry;
use crate::Lock::RawTicketLock;

/// Prefix of the memzone backing a stack.
pub const STACK_MZ_PREFIX: &str = "STK_";

/// Maximum stack name length plus one.
pub const STACK_NAMESIZE: usize = MEMZONE_NAMESIZE - STACK_MZ_PREFIX.len();

/// Largest stack capacity accepted.
pub const STACK_MAX_COUNT: u32 = 0x7fff_ffff;

const STACK_MAGIC: u64 = 0x444D_5850_5F53_544B; // "DMXP_STK"
const STACK_LAYOUT_VERSION: u32 = 1;

/// Control block at the start of a stack's memzone; the object table follows
/// at `header_size()`.
#[repr(C, align(128))]
pub struct StackHeader {
    /// Stored last when the stack is created.
    pub magic: AtomicU64,
    pub version: u32,
    pub elt_size: u32,
    pub name: [u8; STACK_NAMESIZE],
    pub capacity: u32,
    pub lock: RawTicketLock,
    /// Written only under `lock`.
    pub len: AtomicU32,
}

#[inline]
pub const fn header_size() -> usize {
    align_up(size_of::<StackHeader>(), CACHE_LINE_SIZE)
}

/// Snapshot of a stack for dumps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackStatus {
    pub name: String,
    pub addr: usize,
    pub capacity: u32,
    pub used: u32,
    pub avail: u32,
    pub locked: bool,
}

pub struct Stack<T: Copy> {
    zone: MemZone,
    header: NonNull<StackHeader>,
    objs: NonNull<T>,
    capacity: u32,
    _marker: PhantomData<T>,
}

unsafe impl<T: Copy + Send> Send for Stack<T> {}
unsafe impl<T: Copy + Send> Sync for Stack<T> {}

impl<T: Copy> Stack<T> {
    /// Bytes of backing memory a stack of `count` objects needs.
    pub fn memsize(count: u32) -> Result<usize> {
        if count == 0 || count > STACK_MAX_COUNT {
            return Err(Error::InvalidSize {
                requested: count as u64,
                max: STACK_MAX_COUNT as u64,
            });
        }
        if align_of::<T>() > CACHE_LINE_SIZE {
            return Err(Error::InvalidArgument(
                "stack element alignment exceeds the cache line size",
            ));
        }
        (count as usize)
            .checked_mul(size_of::<T>())
            .map(|table| align_up(header_size() + table, CACHE_LINE_SIZE))
            .ok_or(Error::InvalidSize {
                requested: count as u64,
                max: STACK_MAX_COUNT as u64,
            })
    }

    pub(crate) fn init_in(zone: MemZone, name: &str, count: u32) -> Result<Self> {
        if zone.len() < Self::memsize(count)? {
            return Err(Error::InvalidArgument("memzone too small for stack"));
        }

        let mut raw_name = [0u8; STACK_NAMESIZE];
        let n = name.len().min(STACK_NAMESIZE - 1);
        raw_name[..n].copy_from_slice(&name.as_bytes()[..n]);

        // SAFETY: the zone is large enough and cache-line aligned; nothing
        // else references it until the magic is published.
        unsafe {
            write_header(
                zone.as_ptr(),
                StackHeader {
                    magic: AtomicU64::new(0),
                    version: STACK_LAYOUT_VERSION,
                    elt_size: size_of::<T>() as u32,
                    name: raw_name,
                    capacity: count,
                    lock: RawTicketLock::new(),
                    len: AtomicU32::new(0),
                },
                STACK_MAGIC,
            );
        }
        Self::from_zone(zone)
    }

    pub(crate) fn attach_in(zone: MemZone) -> Result<Self> {
        let mismatch = || Error::ElementMismatch {
            name: zone.name().to_owned(),
            expected: std::any::type_name::<T>(),
        };
        if zone.len() < header_size() {
            return Err(mismatch());
        }
        let header = unsafe { &*(zone.as_ptr() as *const StackHeader) };
        if header.magic.load(Acquire) != STACK_MAGIC
            || header.version != STACK_LAYOUT_VERSION
            || header.elt_size != size_of::<T>() as u32
            || Self::memsize(header.capacity).map_or(true, |len| zone.len() < len)
        {
            return Err(mismatch());
        }
        Self::from_zone(zone)
    }

    fn from_zone(zone: MemZone) -> Result<Self> {
        let base = zone.as_ptr();
        let header = NonNull::new(base as *mut StackHeader)
            .ok_or(Error::InvalidArgument("memzone has no base address"))?;
        let objs = NonNull::new(unsafe { base.add(header_size()) } as *mut T)
            .ok_or(Error::InvalidArgument("memzone has no base address"))?;
        let capacity = unsafe { header.as_ref().capacity };
        Ok(Self {
            zone,
            header,
            objs,
            capacity,
            _marker: PhantomData,
        })
    }

    #[inline]
    fn header(&self) -> &StackHeader {
        unsafe { self.header.as_ref() }
    }

    #[inline]
    fn locked<R>(&self, f: impl FnOnce(&AtomicU32) -> R) -> R {
        let h = self.header();
        h.lock.lock();
        let out = f(&h.len);
        unsafe { h.lock.unlock() };
        out
    }

    /// Push all of `objs` or nothing. Returns the number pushed.
    pub fn push(&self, objs: &[T]) -> usize {
        let n = objs.len();
        if n == 0 {
            return 0;
        }
        self.locked(|len| {
            let cur = len.load(Relaxed) as usize;
            if cur + n > self.capacity as usize {
                return 0;
            }
            // SAFETY: [cur, cur + n) is inside the table and owned under the lock.
            unsafe {
                ptr::copy_nonoverlapping(objs.as_ptr(), self.objs.as_ptr().add(cur), n);
            }
            len.store((cur + n) as u32, Relaxed);
            n
        })
    }

    /// Pop exactly `out.len()` objects, most recently pushed first, or
    /// nothing. Returns the number popped.
    pub fn pop(&self, out: &mut [T]) -> usize {
        let n = out.len();
        if n == 0 {
            return 0;
        }
        self.locked(|len| {
            let cur = len.load(Relaxed) as usize;
            if n > cur {
                return 0;
            }
            for (i, slot) in out.iter_mut().enumerate() {
                *slot = unsafe { ptr::read(self.objs.as_ptr().add(cur - i - 1)) };
            }
            len.store((cur - n) as u32, Relaxed);
            n
        })
    }

    /// Objects currently on the stack. Racy by nature unless callers stop
    /// pushing and popping.
    pub fn count(&self) -> u32 {
        self.header().len.load(Relaxed)
    }

    pub fn free_count(&self) -> u32 {
        self.capacity - self.count()
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn name(&self) -> &str {
        let raw = &self.header().name;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        std::str::from_utf8(&raw[..end]).unwrap_or("<invalid>")
    }

    pub fn zone(&self) -> &MemZone {
        &self.zone
    }

    pub(crate) fn into_zone(self) -> MemZone {
        self.zone
    }

    pub fn status(&self) -> StackStatus {
        let used = self.count();
        StackStatus {
            name: self.name().to_owned(),
            addr: self.header.as_ptr() as usize,
            capacity: self.capacity,
            used,
            avail: self.capacity - used,
            locked: self.header().lock.is_locked(),
        }
    }

    pub fn dump<W: io::Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
        crate::Debug::StructDebug::dump_stack(w, &self.status())
    }
}

/// Creation parameters for a [`Stack`].
#[derive(Debug, Clone)]
pub struct StackBuilder {
    pub(crate) name: String,
    pub(crate) count: u32,
    pub(crate) socket_id: i32,
}

impl Default for StackBuilder {
    fn default() -> Self {
        Self {
            name: String::new(),
            count: 1024,
            socket_id: SOCKET_ID_ANY,
        }
    }
}

impl StackBuilder {
    pub fn new(name: &str, count: u32) -> Self {
        Self {
            name: name.to_owned(),
            count,
            ..Self::default()
        }
    }

    pub fn with_socket_id(mut self, socket_id: i32) -> Self {
        self.socket_id = socket_id;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn zone_name(&self) -> String {
        format!("{STACK_MZ_PREFIX}{}", self.name)
    }

    pub(crate) fn validate<T: Copy>(&self) -> Result<usize> {
        if self.name.len() >= STACK_NAMESIZE {
            error!(stack = %self.name, "stack name too long");
            return Err(Error::NameTooLong {
                name: self.name.clone(),
                max: STACK_NAMESIZE - 1,
            });
        }
        Stack::<T>::memsize(self.count).map_err(|e| {
            error!(stack = %self.name, count = self.count, "{e}");
            e
        })
    }

    /// Create the stack and register it under its name.
    pub fn create<T: Copy + Send + Sync + 'static>(
        &self,
        registry: &Registry,
    ) -> Result<std::sync::Arc<Stack<T>>> {
        registry.create_stack(self)
    }

    /// Create the stack straight from `allocator`, outside any registry.
    pub fn build<T: Copy>(&self, allocator: &dyn BulkAllocator) -> Result<Stack<T>> {
        let len = self.validate::<T>()?;
        let zone = allocator.reserve(&self.zone_name(), len, self.socket_id, CACHE_LINE_SIZE)?;
        Stack::init_in(zone, &self.name, self.count)
    }
}

impl<T: Copy> fmt::Debug for Stack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        crate::Debug::StructDebug::debug_stack(&self.status(), f)
    }
}
