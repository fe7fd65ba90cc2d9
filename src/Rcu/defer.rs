//! Deferred-free queue.
//!
//! Writers hand objects they have just unlinked to [`DeferQueue::enqueue`];
//! each is tagged with a fresh QSBR token and parked in a ring. Reclaiming
//! pops entries in order and passes an object to the free callback only once
//! every reader has gone past its token.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::qsbr::Qsbr;
use crate::error::{Error, Result};
use crate::Core::alloc::BulkAllocator;
use crate::Ring::{BulkQueue, Ring, RingBuilder, RING_SZ_MASK};

#[derive(Clone, Copy)]
struct Deferred<T> {
    token: u64,
    obj: T,
}

/// Reclaim-side state. Taking the mutex makes the caller the ring's only
/// consumer.
struct Reclaimer<T> {
    /// Head entry whose grace period had not elapsed on the last pass.
    pending: Option<Deferred<T>>,
    free: Box<dyn FnMut(T) + Send>,
}

/// Result of a reclaim pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reclaimed {
    /// Objects handed to the free callback.
    pub freed: u32,
    /// Objects still waiting for their grace period.
    pub pending: u32,
}

pub struct DeferQueue<T: Copy + Send + 'static> {
    qsbr: Arc<Qsbr>,
    ring: Ring<Deferred<T>>,
    reclaimer: Mutex<Reclaimer<T>>,
}

impl<T: Copy + Send + 'static> DeferQueue<T> {
    /// Queue holding up to `size` deferred objects (at least 2), backed by a
    /// ring named `name` from `allocator`. The reclaimer holds the oldest
    /// unexpired entry outside the ring, so the ring itself is one smaller.
    pub fn new<F>(
        name: &str,
        size: u32,
        qsbr: Arc<Qsbr>,
        allocator: &dyn BulkAllocator,
        free: F,
    ) -> Result<Self>
    where
        F: FnMut(T) + Send + 'static,
    {
        if size < 2 {
            return Err(Error::InvalidSize {
                requested: size as u64,
                max: RING_SZ_MASK as u64,
            });
        }
        let ring = RingBuilder::new(name, size - 1)
            .exact_size()
            .single_consumer()
            .build(allocator)?;
        debug!(queue = name, size, "created defer queue");
        Ok(Self {
            qsbr,
            ring,
            reclaimer: Mutex::new(Reclaimer {
                pending: None,
                free: Box::new(free),
            }),
        })
    }

    /// Park `obj` until the readers that might still see it are done.
    ///
    /// If the queue is full, reclaims whatever is already safe first. Returns
    /// `false` if there is still no room; the caller keeps ownership of `obj`.
    pub fn enqueue(&self, obj: T) -> bool {
        let entry = Deferred {
            token: self.qsbr.start(),
            obj,
        };
        if self.ring.enqueue(entry) {
            return true;
        }
        self.reclaim(u32::MAX);
        self.ring.enqueue(entry)
    }

    /// Free up to `max` objects whose grace period has elapsed. Never waits.
    pub fn reclaim(&self, max: u32) -> Reclaimed {
        let mut r = self.reclaimer.lock();
        let mut freed = 0;
        while freed < max {
            let Some(entry) = r.pending.take().or_else(|| self.ring.dequeue()) else {
                break;
            };
            if !self.qsbr.check(entry.token, false) {
                r.pending = Some(entry);
                break;
            }
            (r.free)(entry.obj);
            freed += 1;
        }
        Reclaimed {
            freed,
            pending: self.ring.count() + r.pending.is_some() as u32,
        }
    }

    /// Free everything, waiting for each grace period in turn.
    pub fn reclaim_all(&self) -> u32 {
        let mut r = self.reclaimer.lock();
        let mut freed = 0;
        while let Some(entry) = r.pending.take().or_else(|| self.ring.dequeue()) {
            self.qsbr.check(entry.token, true);
            (r.free)(entry.obj);
            freed += 1;
        }
        freed
    }

    /// Objects waiting to be freed.
    pub fn len(&self) -> u32 {
        self.ring.count() + self.reclaimer.lock().pending.is_some() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> u32 {
        self.ring.capacity() + 1
    }
}
