use std::sync::Arc;

use tracing::error;

use super::layout::{RingGeometry, RING_MZ_PREFIX, RING_NAMESIZE};
use super::lockfree::{LfElement, LfRing};
use super::StdRing::{Ring, RingKind, SyncMode};
use crate::error::{Error, Result};
use crate::Core::alloc::{BulkAllocator, CACHE_LINE_SIZE, SOCKET_ID_ANY};
use crate::Core::registry::Registry;

/// Creation parameters for a [`Ring`] or [`LfRing`].
#[derive(Debug, Clone)]
pub struct RingBuilder {
    pub(crate) name: String,
    pub(crate) count: u32,
    pub(crate) socket_id: i32,
    pub(crate) producer: SyncMode,
    pub(crate) consumer: SyncMode,
    pub(crate) exact_size: bool,
}

impl Default for RingBuilder {
    fn default() -> Self {
        Self {
            name: String::new(),
            count: 1024, // usable capacity 1023
            socket_id: SOCKET_ID_ANY,
            producer: SyncMode::Multi,
            consumer: SyncMode::Multi,
            exact_size: false,
        }
    }
}

impl RingBuilder {
    pub fn new(name: &str, count: u32) -> Self {
        Self {
            name: name.to_owned(),
            count,
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_owned();
        self
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    pub fn with_socket_id(mut self, socket_id: i32) -> Self {
        self.socket_id = socket_id;
        self
    }

    pub fn single_producer(mut self) -> Self {
        self.producer = SyncMode::Single;
        self
    }

    pub fn single_consumer(mut self) -> Self {
        self.consumer = SyncMode::Single;
        self
    }

    pub fn with_producer(mut self, mode: SyncMode) -> Self {
        self.producer = mode;
        self
    }

    pub fn with_consumer(mut self, mode: SyncMode) -> Self {
        self.consumer = mode;
        self
    }

    /// Make `count` the exact usable capacity instead of the power-of-two
    /// slot count.
    pub fn exact_size(mut self) -> Self {
        self.exact_size = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the memzone backing the ring.
    pub fn zone_name(&self) -> String {
        format!("{RING_MZ_PREFIX}{}", self.name)
    }

    /// Check the name and sizing without reserving anything.
    pub fn geometry(&self, kind: RingKind) -> Result<RingGeometry> {
        if self.name.len() >= RING_NAMESIZE {
            error!(ring = %self.name, "ring name too long");
            return Err(Error::NameTooLong {
                name: self.name.clone(),
                max: RING_NAMESIZE - 1,
            });
        }
        RingGeometry::new(self.count, self.exact_size, kind).map_err(|e| {
            error!(ring = %self.name, count = self.count, "{e}");
            e
        })
    }

    /// Create a standard ring and register it under its name.
    pub fn create<T: Copy + Send + Sync + 'static>(
        &self,
        registry: &Registry,
    ) -> Result<Arc<Ring<T>>> {
        registry.create_ring(self)
    }

    /// Create a lock-free ring and register it under its name.
    pub fn create_lock_free<T: LfElement + Sync>(
        &self,
        registry: &Registry,
    ) -> Result<Arc<LfRing<T>>> {
        registry.create_lf_ring(self)
    }

    /// Create a standard ring straight from `allocator`, outside any registry.
    pub fn build<T: Copy + Send>(&self, allocator: &dyn BulkAllocator) -> Result<Ring<T>> {
        let geo = self.geometry(RingKind::Standard)?;
        let len = Ring::<T>::memsize(self.count, self.exact_size)?;
        let zone = allocator.reserve(&self.zone_name(), len, self.socket_id, CACHE_LINE_SIZE)?;
        Ring::init_in(zone, &self.name, geo, self.exact_size, self.producer, self.consumer)
    }

    /// Lock-free counterpart of [`RingBuilder::build`].
    pub fn build_lock_free<T: LfElement>(
        &self,
        allocator: &dyn BulkAllocator,
    ) -> Result<LfRing<T>> {
        let geo = self.geometry(RingKind::LockFree)?;
        let len = LfRing::<T>::memsize(self.count, self.exact_size)?;
        let zone = allocator.reserve(&self.zone_name(), len, self.socket_id, CACHE_LINE_SIZE)?;
        LfRing::init_in(zone, &self.name, geo, self.exact_size, self.producer, self.consumer)
    }
}
