//! Process-wide table of named rings and stacks.
//!
//! A name that is not registered locally is looked up in the allocator
//! (`BulkAllocator::attach`), which lets a second process, or a second
//! registry over the same `/dev/shm` zones, pick up an object someone else
//! created.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::RwLock;
use tracing::{debug, error};

use super::alloc::{BulkAllocator, HeapAllocator, MemZone};
use crate::error::{Error, Result};
use crate::Ring::layout::RING_MZ_PREFIX;
use crate::Ring::{LfElement, LfRing, Ring, RingBuilder};
use crate::Stack::{Stack, StackBuilder, STACK_MZ_PREFIX};

/// What the registry needs from a stored object, independent of its element
/// type.
trait Named: Send + Sync {
    fn zone(&self) -> &MemZone;
    fn dump(&self, w: &mut dyn io::Write) -> io::Result<()>;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
    /// The backing zone, if this was the last handle.
    fn into_zone(self: Arc<Self>) -> Option<MemZone>;
}

impl<T: Copy + Send + Sync + 'static> Named for Ring<T> {
    fn zone(&self) -> &MemZone {
        Ring::zone(self)
    }

    fn dump(&self, w: &mut dyn io::Write) -> io::Result<()> {
        Ring::dump(self, w)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn into_zone(self: Arc<Self>) -> Option<MemZone> {
        Arc::try_unwrap(self).ok().map(Ring::into_zone)
    }
}

impl<T: LfElement + Sync> Named for LfRing<T> {
    fn zone(&self) -> &MemZone {
        LfRing::zone(self)
    }

    fn dump(&self, w: &mut dyn io::Write) -> io::Result<()> {
        LfRing::dump(self, w)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn into_zone(self: Arc<Self>) -> Option<MemZone> {
        Arc::try_unwrap(self).ok().map(LfRing::into_zone)
    }
}

impl<T: Copy + Send + Sync + 'static> Named for Stack<T> {
    fn zone(&self) -> &MemZone {
        Stack::zone(self)
    }

    fn dump(&self, w: &mut dyn io::Write) -> io::Result<()> {
        Stack::dump(self, w)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn into_zone(self: Arc<Self>) -> Option<MemZone> {
        Arc::try_unwrap(self).ok().map(Stack::into_zone)
    }
}

/// One name table. Rings and stacks live in separate tables, so a ring and a
/// stack may share a name.
struct Table {
    what: &'static str,
    prefix: &'static str,
    entries: RwLock<HashMap<String, Arc<dyn Named>>>,
}

impl Table {
    fn new(what: &'static str, prefix: &'static str) -> Self {
        Self {
            what,
            prefix,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn downcast<R: Any + Send + Sync>(name: &str, entry: Arc<dyn Named>) -> Result<Arc<R>> {
        entry
            .into_any()
            .downcast::<R>()
            .map_err(|_| Error::ElementMismatch {
                name: name.to_owned(),
                expected: type_name::<R>(),
            })
    }

    fn insert<R, F>(&self, name: &str, build: F) -> Result<Arc<R>>
    where
        R: Named + 'static,
        F: FnOnce() -> Result<R>,
    {
        // Held across the reservation so two creators of one name cannot race.
        let mut entries = self.entries.write();
        if entries.contains_key(name) {
            error!(object = name, "{} already exists", self.what);
            return Err(Error::AlreadyExists(name.to_owned()));
        }
        let obj = Arc::new(build()?);
        entries.insert(name.to_owned(), obj.clone());
        debug!(object = name, "created {}", self.what);
        Ok(obj)
    }

    fn lookup<R, F>(&self, allocator: &dyn BulkAllocator, name: &str, attach: F) -> Result<Arc<R>>
    where
        R: Named + Any,
        F: FnOnce(MemZone) -> Result<R>,
    {
        if let Some(entry) = self.entries.read().get(name).cloned() {
            return Self::downcast(name, entry);
        }

        let mut entries = self.entries.write();
        if let Some(entry) = entries.get(name).cloned() {
            return Self::downcast(name, entry);
        }
        let zone = allocator
            .attach(&format!("{}{name}", self.prefix))
            .map_err(|e| match e {
                Error::NotFound(_) => Error::NotFound(name.to_owned()),
                other => other,
            })?;
        let obj = Arc::new(attach(zone)?);
        entries.insert(name.to_owned(), obj.clone());
        debug!(object = name, "attached {}", self.what);
        Ok(obj)
    }

    /// Unregister `name` and withdraw its zone name from the allocator, so a
    /// later lookup cannot attach to it again and the name can be reused.
    fn free(&self, allocator: &dyn BulkAllocator, name: &str) -> Result<()> {
        let mut entries = self.entries.write();
        let entry = entries
            .remove(name)
            .ok_or_else(|| Error::NotFound(name.to_owned()))?;
        allocator.unlink(entry.zone());
        drop(entries);
        match entry.into_zone() {
            Some(zone) => allocator.free(zone),
            None => debug!(
                object = name,
                "{} unregistered, memory released with the last handle", self.what
            ),
        }
        Ok(())
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn dump(&self, w: &mut dyn io::Write) -> io::Result<()> {
        let entries = self.entries.read();
        let mut names: Vec<&String> = entries.keys().collect();
        names.sort();
        for name in names {
            entries[name].dump(w)?;
        }
        Ok(())
    }
}

/// Named rings and stacks, plus the allocator backing them.
pub struct Registry {
    allocator: Arc<dyn BulkAllocator>,
    rings: Table,
    stacks: Table,
}

lazy_static! {
    static ref GLOBAL: Registry = Registry::new(Arc::new(HeapAllocator));
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(Arc::new(HeapAllocator))
    }
}

impl Registry {
    pub fn new(allocator: Arc<dyn BulkAllocator>) -> Self {
        Self {
            allocator,
            rings: Table::new("ring", RING_MZ_PREFIX),
            stacks: Table::new("stack", STACK_MZ_PREFIX),
        }
    }

    /// Process-wide registry over the heap allocator.
    pub fn global() -> &'static Registry {
        &GLOBAL
    }

    pub fn allocator(&self) -> &dyn BulkAllocator {
        &*self.allocator
    }

    pub fn create_ring<T: Copy + Send + Sync + 'static>(
        &self,
        cfg: &RingBuilder,
    ) -> Result<Arc<Ring<T>>> {
        self.rings.insert(cfg.name(), || cfg.build::<T>(self.allocator()))
    }

    pub fn create_lf_ring<T: LfElement + Sync>(&self, cfg: &RingBuilder) -> Result<Arc<LfRing<T>>> {
        self.rings
            .insert(cfg.name(), || cfg.build_lock_free::<T>(self.allocator()))
    }

    pub fn create_stack<T: Copy + Send + Sync + 'static>(
        &self,
        cfg: &StackBuilder,
    ) -> Result<Arc<Stack<T>>> {
        self.stacks.insert(cfg.name(), || cfg.build::<T>(self.allocator()))
    }

    pub fn lookup_ring<T: Copy + Send + Sync + 'static>(&self, name: &str) -> Result<Arc<Ring<T>>> {
        self.rings.lookup(self.allocator(), name, Ring::<T>::attach_in)
    }

    pub fn lookup_lf_ring<T: LfElement + Sync>(&self, name: &str) -> Result<Arc<LfRing<T>>> {
        self.rings.lookup(self.allocator(), name, LfRing::<T>::attach_in)
    }

    pub fn lookup_stack<T: Copy + Send + Sync + 'static>(
        &self,
        name: &str,
    ) -> Result<Arc<Stack<T>>> {
        self.stacks.lookup(self.allocator(), name, Stack::<T>::attach_in)
    }

    /// Unregister a ring of either kind. The name is free for reuse at once;
    /// the memory goes back to the allocator once the last outstanding handle
    /// is dropped.
    pub fn free_ring(&self, name: &str) -> Result<()> {
        self.rings.free(self.allocator(), name)
    }

    pub fn free_stack(&self, name: &str) -> Result<()> {
        self.stacks.free(self.allocator(), name)
    }

    /// Registered ring names, sorted.
    pub fn ring_names(&self) -> Vec<String> {
        self.rings.names()
    }

    pub fn stack_names(&self) -> Vec<String> {
        self.stacks.names()
    }

    /// Dump every registered ring.
    pub fn list_dump(&self, w: &mut dyn io::Write) -> io::Result<()> {
        self.rings.dump(w)
    }

    /// Dump every registered stack.
    pub fn stack_list_dump(&self, w: &mut dyn io::Write) -> io::Result<()> {
        self.stacks.dump(w)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        crate::Debug::StructDebug::debug_registry(self, f)
    }
}
