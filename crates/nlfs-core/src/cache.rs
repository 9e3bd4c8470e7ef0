//! Write-back chunk cache.
//!
//! A tiny fully-associative cache of `(object, logical chunk)` buffers.
//! Only partial-chunk traffic (and all traffic when aligned bypass is
//! off) flows through it. Eviction is LRU among unlocked slots; the
//! device flushes a dirty victim before reuse. The `locked` flag pins a
//! slot for the exact span of a copy to or from caller memory.

use nlfs_types::ObjectId;
use tracing::trace;

/// LRU stamp ceiling; crossing it renormalizes every slot to zero.
const USE_COUNTER_LIMIT: u64 = 100_000_000;

#[derive(Debug)]
pub struct CacheSlot {
    pub object: Option<ObjectId>,
    pub logical: u32,
    pub last_use: u64,
    pub dirty: bool,
    pub locked: bool,
    /// Valid bytes in `data` (stored length for the flush path).
    pub n_bytes: usize,
    pub data: Vec<u8>,
}

impl CacheSlot {
    fn empty(chunk_bytes: usize) -> Self {
        Self {
            object: None,
            logical: 0,
            last_use: 0,
            dirty: false,
            locked: false,
            n_bytes: 0,
            data: vec![0u8; chunk_bytes],
        }
    }

    pub fn reset(&mut self) {
        self.object = None;
        self.logical = 0;
        self.last_use = 0;
        self.dirty = false;
        self.locked = false;
        self.n_bytes = 0;
        self.data.fill(0);
    }
}

#[derive(Debug)]
pub struct ChunkCache {
    slots: Vec<CacheSlot>,
    use_counter: u64,
}

impl ChunkCache {
    #[must_use]
    pub fn new(n_slots: usize, chunk_bytes: usize) -> Self {
        Self {
            slots: (0..n_slots).map(|_| CacheSlot::empty(chunk_bytes)).collect(),
            use_counter: 0,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[must_use]
    pub fn slot(&self, idx: usize) -> &CacheSlot {
        &self.slots[idx]
    }

    pub fn slot_mut(&mut self, idx: usize) -> &mut CacheSlot {
        &mut self.slots[idx]
    }

    /// Look up the slot bound to `(object, logical)`.
    #[must_use]
    pub fn find(&self, object: ObjectId, logical: u32) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.object == Some(object) && s.logical == logical)
    }

    /// Stamp a slot as just used.
    pub fn touch(&mut self, idx: usize) {
        self.use_counter += 1;
        if self.use_counter > USE_COUNTER_LIMIT {
            trace!(target: "nlfs::cache", "LRU counters renormalized");
            self.use_counter = 1;
            for slot in &mut self.slots {
                slot.last_use = 0;
            }
        }
        self.slots[idx].last_use = self.use_counter;
    }

    /// Pick a slot to reuse: any unbound slot, else the LRU unlocked one.
    /// The caller must flush the victim if it is dirty.
    #[must_use]
    pub fn victim(&self) -> Option<usize> {
        if let Some(free) = self.slots.iter().position(|s| s.object.is_none()) {
            return Some(free);
        }
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.locked)
            .min_by_key(|(_, s)| s.last_use)
            .map(|(idx, _)| idx)
    }

    /// Drop the binding for one `(object, logical)` pair if cached.
    pub fn invalidate_chunk(&mut self, object: ObjectId, logical: u32) {
        if let Some(idx) = self.find(object, logical) {
            self.slots[idx].reset();
        }
    }

    /// Drop every slot bound to `object`.
    pub fn invalidate_object(&mut self, object: ObjectId) {
        for slot in &mut self.slots {
            if slot.object == Some(object) {
                slot.reset();
            }
        }
    }

    /// Slots bound to `object` (any dirtiness).
    #[must_use]
    pub fn slots_for(&self, object: ObjectId) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.object == Some(object))
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Index of some dirty slot, if any.
    #[must_use]
    pub fn any_dirty(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.dirty)
    }

    /// Objects with at least one dirty slot.
    #[must_use]
    pub fn dirty_objects(&self) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = self
            .slots
            .iter()
            .filter(|s| s.dirty)
            .filter_map(|s| s.object)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}
