pub mod builder;
pub mod layout;
pub mod lockfree;
pub mod StdRing;
pub mod StdRing_impl;

pub use builder::RingBuilder;
pub use layout::{
    entry_lap, entry_value, pack_entry, RingGeometry, ENQ_RETRY_LIMIT, MIN_LF_RING_SIZE,
    RING_NAMESIZE, RING_SZ_MASK,
};
pub use lockfree::{LfElement, LfRing};
pub use StdRing::{BulkQueue, QueueBehavior, Ring, RingKind, RingStatus, SyncMode};
