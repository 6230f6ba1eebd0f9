//! Fixed pool of named rendezvous primitives.
//!
//! A synchronous caller acquires a [`SyncHandle`], hands it to whoever will
//! produce the result, then blocks in [`SyncPool::wait`]. The producer wakes
//! it with [`SyncPool::signal`] (handle stays owned) or [`SyncPool::release`]
//! (handle returns to the pool).
//!
//! Handles carry a generation number. A wait on a handle that was already
//! released or signalled returns immediately, so a producer that finishes
//! before the caller starts waiting cannot cause a lost wake-up.
//!
//! # Example
//!
//! ```
//! use lora_core::SyncPool;
//! use std::sync::Arc;
//!
//! let pool = Arc::new(SyncPool::new(4));
//! let handle = pool.acquire("doc-example");
//! let producer = {
//!     let pool = pool.clone();
//!     std::thread::spawn(move || pool.release(handle))
//! };
//! pool.wait(&handle);
//! producer.join().unwrap();
//! assert_eq!(pool.in_use(), 0);
//! ```

use crate::lock;
use log::{debug, warn};
use std::sync::{Condvar, Mutex, OnceLock};

/// Default number of rendezvous primitives.
pub const SYNC_POOL_SIZE: usize = 10;

/// Reference to one acquired pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncHandle {
    index: u8,
    generation: u32,
}

impl SyncHandle {
    /// Pack into a `u64` for storage inside byte-encoded messages.
    pub fn to_bits(self) -> u64 {
        ((self.generation as u64) << 8) | self.index as u64
    }

    /// Inverse of [`SyncHandle::to_bits`].
    pub fn from_bits(bits: u64) -> Self {
        Self {
            index: (bits & 0xff) as u8,
            generation: (bits >> 8) as u32,
        }
    }

    pub fn index(&self) -> usize {
        self.index as usize
    }
}

#[derive(Debug, Default)]
struct Slot {
    name: &'static str,
    in_use: bool,
    has_waiting: bool,
    signaled: bool,
    generation: u32,
}

impl Slot {
    fn owned_by(&self, handle: &SyncHandle) -> bool {
        self.in_use && self.generation == handle.generation
    }
}

/// Pool of reusable wait primitives.
pub struct SyncPool {
    slots: Mutex<Vec<Slot>>,
    // Built on first acquisition of a slot and reused afterwards.
    conds: Vec<OnceLock<Condvar>>,
}

impl SyncPool {
    /// Create a pool with `size` slots.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero or larger than 255.
    pub fn new(size: usize) -> Self {
        assert!(size > 0 && size <= u8::MAX as usize, "sync pool size out of range");
        Self {
            slots: Mutex::new((0..size).map(|_| Slot::default()).collect()),
            conds: (0..size).map(|_| OnceLock::new()).collect(),
        }
    }

    /// Take a free slot.
    ///
    /// # Panics
    ///
    /// Panics when every slot is in use. Callers are expected to bound the
    /// number of concurrent synchronous operations to the pool size.
    pub fn acquire(&self, name: &'static str) -> SyncHandle {
        let mut slots = lock(&self.slots);
        let index = slots
            .iter()
            .position(|s| !s.in_use)
            .unwrap_or_else(|| panic!("sync pool exhausted acquiring {name}"));

        let slot = &mut slots[index];
        slot.name = name;
        slot.in_use = true;
        slot.has_waiting = false;
        slot.signaled = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.conds[index].get_or_init(Condvar::new);

        debug!("sync[{}] {}: acquire", index, name);
        SyncHandle {
            index: index as u8,
            generation: slot.generation,
        }
    }

    /// Block until the handle is signalled or released.
    pub fn wait(&self, handle: &SyncHandle) {
        let cond = self.cond(handle);
        let mut slots = lock(&self.slots);
        let slot = &mut slots[handle.index()];
        if !slot.owned_by(handle) || slot.signaled {
            debug!("sync[{}] {}: wait (already done)", handle.index, slot.name);
            if slot.owned_by(handle) {
                slot.signaled = false;
            }
            return;
        }
        slot.has_waiting = true;
        debug!("sync[{}] {}: wait", handle.index, slot.name);

        let mut slots = cond
            .wait_while(slots, |slots| {
                let slot = &slots[handle.index()];
                slot.owned_by(handle) && !slot.signaled
            })
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let slot = &mut slots[handle.index()];
        if slot.generation == handle.generation {
            slot.has_waiting = false;
            slot.signaled = false;
        }
        debug!("sync[{}] {}: woke", handle.index, slot.name);
    }

    /// Wake the waiter without giving the handle back.
    pub fn signal(&self, handle: &SyncHandle) {
        let cond = self.cond(handle);
        let mut slots = lock(&self.slots);
        let slot = &mut slots[handle.index()];
        if !slot.owned_by(handle) {
            warn!("sync[{}]: signal on stale handle", handle.index);
            return;
        }
        slot.signaled = true;
        debug!("sync[{}] {}: signal", handle.index, slot.name);
        if slot.has_waiting {
            cond.notify_one();
        }
    }

    /// Return the handle to the pool, waking a recorded waiter.
    pub fn release(&self, handle: SyncHandle) {
        let cond = self.cond(&handle);
        let mut slots = lock(&self.slots);
        let slot = &mut slots[handle.index()];
        if !slot.owned_by(&handle) {
            warn!("sync[{}]: release on stale handle", handle.index);
            return;
        }
        slot.in_use = false;
        slot.signaled = false;
        debug!("sync[{}] {}: release", handle.index, slot.name);
        if slot.has_waiting {
            cond.notify_one();
        }
    }

    /// Number of slots currently handed out.
    pub fn in_use(&self) -> usize {
        lock(&self.slots).iter().filter(|s| s.in_use).count()
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.conds.len()
    }

    fn cond(&self, handle: &SyncHandle) -> &Condvar {
        let cell = self
            .conds
            .get(handle.index())
            .unwrap_or_else(|| panic!("invalid sync handle index {}", handle.index));
        cell.get_or_init(Condvar::new)
    }
}

impl Default for SyncPool {
    fn default() -> Self {
        Self::new(SYNC_POOL_SIZE)
    }
}
