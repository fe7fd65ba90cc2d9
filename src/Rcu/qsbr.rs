//! Quiescent-state-based reclamation.
//!
//! Readers report the last token they have observed in a per-thread counter;
//! a writer bumps the global token with [`Qsbr::start`] after unlinking
//! something and may free it once [`Qsbr::check`] sees every registered,
//! online reader at or past that token. Readers pay one counter store per
//! quiescent point and nothing per access.
//!
//! Thread ids are caller-assigned in `[0, max_threads)`; a registration
//! bitmap lets the check skip ids that are not in use.

use std::fmt;
use std::io;
use std::mem::size_of;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release, SeqCst};
use std::sync::atomic::{fence, AtomicU32, AtomicU64};

use crossbeam_utils::{Backoff, CachePadded};
use tracing::{error, trace};

use crate::error::{Error, Result};
use crate::Core::alloc::{align_up, CACHE_LINE_SIZE};

/// Counter value of a thread that is offline.
pub const QSBR_CNT_THR_OFFLINE: u64 = 0;

/// Initial token; counters below it can only mean "offline".
pub const QSBR_CNT_INIT: u64 = 1;

const THRID_INDEX_SHIFT: u32 = 6;
const THRID_MASK: u32 = 0x3f;
const THRID_WORD_BITS: u32 = u64::BITS;

/// A QSBR variable shared by one writer side and up to `max_threads` readers.
pub struct Qsbr {
    token: CachePadded<AtomicU64>,
    num_threads: CachePadded<AtomicU32>,
    max_threads: u32,
    /// Bit `id & 63` of word `id >> 6` is set while `id` is registered.
    registered: Box<[AtomicU64]>,
    /// One counter per thread id, each on its own cache line; only the owning
    /// reader writes it.
    counters: Box<[CachePadded<AtomicU64>]>,
}

/// Snapshot of a [`Qsbr`] for dumps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QsbrStatus {
    pub addr: usize,
    pub memsize: usize,
    pub max_threads: u32,
    pub num_threads: u32,
    pub registered: Vec<u64>,
    pub token: u64,
    /// `(thread_id, counter)` of every registered thread.
    pub counters: Vec<(u32, u64)>,
}

#[inline]
fn bitmap_words(max_threads: u32) -> usize {
    max_threads.div_ceil(THRID_WORD_BITS) as usize
}

impl Qsbr {
    /// Memory a QSBR variable for `max_threads` readers occupies.
    pub fn memsize(max_threads: u32) -> Result<usize> {
        if max_threads == 0 {
            error!("QSBR max_threads must be non-zero");
            return Err(Error::InvalidArgument("max_threads must be non-zero"));
        }
        Ok(size_of::<Self>()
            + align_up(
                bitmap_words(max_threads) * size_of::<AtomicU64>(),
                CACHE_LINE_SIZE,
            )
            + max_threads as usize * size_of::<CachePadded<AtomicU64>>())
    }

    pub fn new(max_threads: u32) -> Result<Self> {
        Self::memsize(max_threads)?;
        Ok(Self {
            token: CachePadded::new(AtomicU64::new(QSBR_CNT_INIT)),
            num_threads: CachePadded::new(AtomicU32::new(0)),
            max_threads,
            registered: (0..bitmap_words(max_threads))
                .map(|_| AtomicU64::new(0))
                .collect(),
            counters: (0..max_threads)
                .map(|_| CachePadded::new(AtomicU64::new(QSBR_CNT_THR_OFFLINE)))
                .collect(),
        })
    }

    fn check_thread_id(&self, thread_id: u32) -> Result<()> {
        if thread_id >= self.max_threads {
            error!(thread_id, max_threads = self.max_threads, "invalid thread id");
            return Err(Error::InvalidThreadId {
                thread_id,
                max_threads: self.max_threads,
            });
        }
        Ok(())
    }

    #[inline]
    fn bit_of(&self, thread_id: u32) -> (&AtomicU64, u64) {
        (
            &self.registered[(thread_id >> THRID_INDEX_SHIFT) as usize],
            1u64 << (thread_id & THRID_MASK),
        )
    }

    /// Add `thread_id` to the set of readers the writer waits for. Registering
    /// an already registered id is a no-op.
    pub fn register(&self, thread_id: u32) -> Result<()> {
        self.check_thread_id(thread_id)?;
        let (word, bit) = self.bit_of(thread_id);

        let mut old = word.load(Relaxed);
        loop {
            if old & bit != 0 {
                return Ok(());
            }
            // Release: publish the new id to concurrent checks.
            match word.compare_exchange_weak(old, old | bit, Release, Relaxed) {
                Ok(_) => break,
                Err(current) => old = current,
            }
        }
        self.num_threads.fetch_add(1, Relaxed);
        Ok(())
    }

    /// Remove `thread_id` from the reader set. Unregistering an id that is
    /// not registered is a no-op.
    pub fn unregister(&self, thread_id: u32) -> Result<()> {
        self.check_thread_id(thread_id)?;
        let (word, bit) = self.bit_of(thread_id);

        let mut old = word.load(Relaxed);
        loop {
            if old & bit == 0 {
                return Ok(());
            }
            // Release: the reader's last critical-section loads happen before
            // a check stops looking at it.
            match word.compare_exchange_weak(old, old & !bit, Release, Relaxed) {
                Ok(_) => break,
                Err(current) => old = current,
            }
        }
        self.num_threads.fetch_sub(1, Relaxed);
        Ok(())
    }

    #[inline]
    fn counter_slot(&self, thread_id: u32) -> &AtomicU64 {
        debug_assert!(
            thread_id < self.max_threads,
            "thread id {thread_id} out of range (max_threads = {})",
            self.max_threads
        );
        &self.counters[thread_id as usize]
    }

    /// Announce that the calling reader may now hold references, as of the
    /// current token.
    ///
    /// # Panics
    ///
    /// If `thread_id >= max_threads`.
    #[inline]
    pub fn thread_online(&self, thread_id: u32) {
        // A stale token here only delays writers; the fence below keeps our
        // later shared loads from moving above the store.
        let t = self.token.load(Relaxed);
        self.counter_slot(thread_id).store(t, Relaxed);
        fence(SeqCst);
    }

    /// Announce that the calling reader holds no references. Call before
    /// blocking so writers do not wait on this thread.
    ///
    /// # Panics
    ///
    /// If `thread_id >= max_threads`.
    #[inline]
    pub fn thread_offline(&self, thread_id: u32) {
        self.counter_slot(thread_id).store(QSBR_CNT_THR_OFFLINE, Release);
    }

    /// Report a quiescent state: every reference taken before this point has
    /// been dropped.
    ///
    /// # Panics
    ///
    /// If `thread_id >= max_threads`.
    #[inline]
    pub fn quiescent(&self, thread_id: u32) {
        let t = self.token.load(Acquire);
        self.counter_slot(thread_id).store(t, Release);
        trace!(thread_id, token = t, "quiescent state update");
    }

    /// Begin a grace period; returns the token readers must reach.
    #[inline]
    pub fn start(&self) -> u64 {
        // Release: the writer's unlink is visible to any reader that later
        // observes the new token.
        self.token.fetch_add(1, Release) + 1
    }

    /// True once every registered reader is offline or has reported `t`.
    /// With `wait`, spins until that holds.
    #[inline]
    pub fn check(&self, t: u64, wait: bool) -> bool {
        if self.num_threads.load(Relaxed) == self.max_threads {
            self.check_all(t, wait)
        } else {
            self.check_selective(t, wait)
        }
    }

    /// Walk only the registered ids.
    fn check_selective(&self, t: u64, wait: bool) -> bool {
        for (i, word) in self.registered.iter().enumerate() {
            // Bitmap before counters: a freshly registered reader is seen
            // with its current counter.
            let mut bmap = word.load(Acquire);
            let base = (i as u32) << THRID_INDEX_SHIFT;
            let backoff = Backoff::new();

            while bmap != 0 {
                let j = bmap.trailing_zeros();
                let id = base + j;
                let c = self.counters[id as usize].load(Acquire);
                trace!(token = t, wait, bmap, thread_id = id, count = c, "qsbr check");

                if c != QSBR_CNT_THR_OFFLINE && c < t {
                    if !wait {
                        return false;
                    }
                    backoff.spin();
                    // The reader may have unregistered meanwhile.
                    bmap = word.load(Acquire);
                    continue;
                }
                bmap &= !(1u64 << j);
            }
        }
        true
    }

    /// Every slot is populated; walk them all without the bitmap.
    fn check_all(&self, t: u64, wait: bool) -> bool {
        for (id, counter) in self.counters.iter().enumerate() {
            let backoff = Backoff::new();
            loop {
                let c = counter.load(Acquire);
                trace!(token = t, wait, thread_id = id, count = c, "qsbr check");
                if c == QSBR_CNT_THR_OFFLINE || c >= t {
                    break;
                }
                if !wait {
                    return false;
                }
                backoff.spin();
            }
        }
        true
    }

    /// Start a grace period and wait for it. If the caller is itself a
    /// registered reader, pass its id so it reports its own quiescent state
    /// instead of waiting on itself.
    pub fn synchronize(&self, thread_id: Option<u32>) {
        let t = self.start();
        if let Some(id) = thread_id {
            self.quiescent(id);
        }
        self.check(t, true);
    }

    pub fn token(&self) -> u64 {
        self.token.load(Acquire)
    }

    pub fn num_threads(&self) -> u32 {
        self.num_threads.load(Relaxed)
    }

    pub fn max_threads(&self) -> u32 {
        self.max_threads
    }

    pub fn is_registered(&self, thread_id: u32) -> bool {
        if thread_id >= self.max_threads {
            return false;
        }
        let (word, bit) = self.bit_of(thread_id);
        word.load(Acquire) & bit != 0
    }

    /// Last token reported by `thread_id`, or [`QSBR_CNT_THR_OFFLINE`].
    pub fn counter(&self, thread_id: u32) -> Option<u64> {
        self.counters
            .get(thread_id as usize)
            .map(|c| c.load(Relaxed))
    }

    pub fn status(&self) -> QsbrStatus {
        let registered: Vec<u64> = self.registered.iter().map(|w| w.load(Acquire)).collect();
        let mut counters = Vec::new();
        for (i, &word) in registered.iter().enumerate() {
            let mut bmap = word;
            while bmap != 0 {
                let j = bmap.trailing_zeros();
                let id = ((i as u32) << THRID_INDEX_SHIFT) + j;
                counters.push((id, self.counters[id as usize].load(Relaxed)));
                bmap &= !(1u64 << j);
            }
        }
        QsbrStatus {
            addr: self as *const Self as usize,
            memsize: Self::memsize(self.max_threads).unwrap_or(0),
            max_threads: self.max_threads,
            num_threads: self.num_threads(),
            registered,
            token: self.token(),
            counters,
        }
    }

    pub fn dump<W: io::Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
        crate::Debug::StructDebug::dump_qsbr(w, &self.status())
    }
}

impl fmt::Debug for Qsbr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        crate::Debug::StructDebug::debug_qsbr(&self.status(), f)
    }
}
