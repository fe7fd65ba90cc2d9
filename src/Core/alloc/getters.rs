use super::*;
use crate::Core::SharedMemory::RawHandle;

/// Read-only accessors for [`MemZone`], used by the objects placed in a zone
/// and by the dump functions.
impl MemZone {
    /// Zone name as passed to `reserve`/`attach`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Length in bytes (rounded up to the zone alignment).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// NUMA node the zone was requested on, or [`SOCKET_ID_ANY`].
    pub fn socket_id(&self) -> i32 {
        self.socket_id
    }

    pub fn align(&self) -> usize {
        self.align
    }

    /// True when this handle mapped a zone created by someone else.
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn raw_handle(&self) -> RawHandle {
        self.shm.raw_handle()
    }
}
