pub mod SharedMemory;
pub mod alloc;
pub mod lcore;
pub mod registry;

pub use alloc::{BulkAllocator, HeapAllocator, MemZone, ShmAllocator, SOCKET_ID_ANY};
pub use lcore::lcore_id;
pub use registry::Registry;
pub use SharedMemory::{
    attach_shared_memory, create_heap_memory, create_shared_memory, RawHandle, SharedMemoryBackend,
};
