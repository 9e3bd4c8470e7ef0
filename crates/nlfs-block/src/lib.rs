#![forbid(unsafe_code)]
//! Erase-block table and free-space map.
//!
//! One RAM record per erase block plus a bitmap with one bit per chunk.
//! The bitmap bit for `(block, offset)` is 1 iff that chunk is the current
//! live copy of some `(object, chunk)` pair. Accounting invariants over
//! these records are what the garbage collector and allocator steer by.

use nlfs_types::{BlockId, Geometry, SeqNumber};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Lifecycle state of one erase block.
///
/// The working cycle is `Empty → Allocating → Full → Collecting → Dirty →
/// Empty`; `Checkpoint` labels blocks holding the fast-mount snapshot, and
/// `Dead` blocks are never reused. Scan-time states mark progress while
/// rebuilding the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BlockState {
    #[default]
    Unknown,
    NeedsScan,
    Scanning,
    Empty,
    Allocating,
    Full,
    Dirty,
    Checkpoint,
    Collecting,
    Dead,
}

/// Per-block RAM record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockInfo {
    pub state: BlockState,
    /// Assigned when the block first becomes `Allocating`; orders all
    /// writes across the device.
    pub seq_number: SeqNumber,
    /// Chunks programmed and not yet deleted (includes soft-deleted).
    pub pages_in_use: u32,
    /// Soft-deleted pages: counted in `pages_in_use` but reclaimable.
    pub soft_del_pages: u32,
    /// Set when a write or erase failure condemns the block.
    pub needs_retiring: bool,
    /// First program into this block since mount verifies the erase; a
    /// pass sets this and skips further checks.
    pub skip_erased_check: bool,
    /// ECC trouble seen; GC should take this block first.
    pub gc_prioritise: bool,
    pub chunk_error_strikes: u8,
    /// Block holds a shrink header; GC must not discard it early.
    pub has_shrink_hdr: bool,
}

impl BlockInfo {
    /// Pages holding live (non-soft-deleted) data.
    #[must_use]
    pub fn live_pages(&self) -> u32 {
        self.pages_in_use.saturating_sub(self.soft_del_pages)
    }
}

/// Block table plus chunk bitmap, both sized from the geometry.
#[derive(Debug, Clone)]
pub struct BlockTable {
    geometry: Geometry,
    info: Vec<BlockInfo>,
    bitmap: Vec<u8>,
}

impl BlockTable {
    #[must_use]
    pub fn new(geometry: Geometry) -> Self {
        let n = geometry.n_blocks() as usize;
        Self {
            geometry,
            info: vec![BlockInfo::default(); n],
            bitmap: vec![0; geometry.bitmap_stride() * n],
        }
    }

    #[must_use]
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// # Panics
    /// Out-of-range block numbers are a programming error.
    #[must_use]
    pub fn block_info(&self, block: BlockId) -> &BlockInfo {
        assert!(
            (block.0 as usize) < self.info.len(),
            "block {} out of range",
            block.0
        );
        &self.info[block.0 as usize]
    }

    /// # Panics
    /// Out-of-range block numbers are a programming error.
    pub fn block_info_mut(&mut self, block: BlockId) -> &mut BlockInfo {
        assert!(
            (block.0 as usize) < self.info.len(),
            "block {} out of range",
            block.0
        );
        &mut self.info[block.0 as usize]
    }

    pub fn set_state(&mut self, block: BlockId, state: BlockState) {
        let info = self.block_info_mut(block);
        trace!(
            target: "nlfs::block",
            block = block.0,
            from = ?info.state,
            to = ?state,
            "state change"
        );
        info.state = state;
    }

    pub fn iter(&self) -> impl Iterator<Item = (BlockId, &BlockInfo)> {
        self.info
            .iter()
            .enumerate()
            .map(|(i, info)| (BlockId(u32::try_from(i).unwrap_or(u32::MAX)), info))
    }

    fn bit_at(&self, block: BlockId, chunk: u32) -> (usize, u8) {
        assert!(
            (block.0 as usize) < self.info.len()
                && chunk < self.geometry.chunks_per_block(),
            "chunk bit ({}, {chunk}) out of range",
            block.0
        );
        let stride = self.geometry.bitmap_stride();
        let byte = block.0 as usize * stride + (chunk / 8) as usize;
        (byte, 1 << (chunk % 8))
    }

    pub fn set_chunk_bit(&mut self, block: BlockId, chunk: u32) {
        let (byte, mask) = self.bit_at(block, chunk);
        self.bitmap[byte] |= mask;
    }

    pub fn clear_chunk_bit(&mut self, block: BlockId, chunk: u32) {
        let (byte, mask) = self.bit_at(block, chunk);
        self.bitmap[byte] &= !mask;
    }

    #[must_use]
    pub fn check_chunk_bit(&self, block: BlockId, chunk: u32) -> bool {
        let (byte, mask) = self.bit_at(block, chunk);
        self.bitmap[byte] & mask != 0
    }

    /// Population count over one block's bitmap row.
    #[must_use]
    pub fn count_chunk_bits(&self, block: BlockId) -> u32 {
        self.row(block).iter().map(|b| b.count_ones()).sum()
    }

    /// Cheap "any bit set" test; fast path for skipping empty blocks in GC.
    #[must_use]
    pub fn still_some_chunks(&self, block: BlockId) -> bool {
        self.row(block).iter().any(|b| *b != 0)
    }

    pub fn clear_chunk_bits(&mut self, block: BlockId) {
        let stride = self.geometry.bitmap_stride();
        let start = block.0 as usize * stride;
        self.bitmap[start..start + stride].fill(0);
    }

    fn row(&self, block: BlockId) -> &[u8] {
        assert!(
            (block.0 as usize) < self.info.len(),
            "block {} out of range",
            block.0
        );
        let stride = self.geometry.bitmap_stride();
        let start = block.0 as usize * stride;
        &self.bitmap[start..start + stride]
    }

    /// Snapshot of the table for the checkpoint stream.
    #[must_use]
    pub fn to_snapshot(&self) -> BlockTableSnapshot {
        BlockTableSnapshot {
            info: self.info.clone(),
            bitmap: self.bitmap.clone(),
        }
    }

    /// Restore from a checkpoint snapshot; shapes must match the geometry.
    pub fn restore(&mut self, snapshot: BlockTableSnapshot) -> bool {
        if snapshot.info.len() != self.info.len() || snapshot.bitmap.len() != self.bitmap.len() {
            return false;
        }
        self.info = snapshot.info;
        self.bitmap = snapshot.bitmap;
        true
    }
}

/// Serializable image of the block table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockTableSnapshot {
    pub info: Vec<BlockInfo>,
    pub bitmap: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> BlockTable {
        BlockTable::new(Geometry::new(16, 32, 512).unwrap())
    }

    #[test]
    fn bitmap_set_clear_check() {
        let mut t = table();
        assert!(!t.check_chunk_bit(BlockId(3), 7));
        t.set_chunk_bit(BlockId(3), 7);
        assert!(t.check_chunk_bit(BlockId(3), 7));
        // neighbors unaffected
        assert!(!t.check_chunk_bit(BlockId(3), 6));
        assert!(!t.check_chunk_bit(BlockId(3), 8));
        assert!(!t.check_chunk_bit(BlockId(2), 7));
        assert!(!t.check_chunk_bit(BlockId(4), 7));
        t.clear_chunk_bit(BlockId(3), 7);
        assert!(!t.check_chunk_bit(BlockId(3), 7));
    }

    #[test]
    fn bitmap_counts_and_still_some() {
        let mut t = table();
        assert_eq!(t.count_chunk_bits(BlockId(5)), 0);
        assert!(!t.still_some_chunks(BlockId(5)));
        for chunk in [0, 1, 9, 31] {
            t.set_chunk_bit(BlockId(5), chunk);
        }
        assert_eq!(t.count_chunk_bits(BlockId(5)), 4);
        assert!(t.still_some_chunks(BlockId(5)));
        t.clear_chunk_bits(BlockId(5));
        assert_eq!(t.count_chunk_bits(BlockId(5)), 0);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn bitmap_out_of_range_is_fatal() {
        let mut t = table();
        t.set_chunk_bit(BlockId(3), 32);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn block_info_out_of_range_is_fatal() {
        let t = table();
        let _ = t.block_info(BlockId(16));
    }

    #[test]
    fn live_pages_excludes_soft_deleted() {
        let mut info = BlockInfo {
            pages_in_use: 10,
            soft_del_pages: 4,
            ..BlockInfo::default()
        };
        assert_eq!(info.live_pages(), 6);
        info.soft_del_pages = 12;
        assert_eq!(info.live_pages(), 0);
    }

    #[test]
    fn state_changes_are_recorded() {
        let mut t = table();
        t.set_state(BlockId(0), BlockState::Empty);
        t.set_state(BlockId(0), BlockState::Allocating);
        assert_eq!(t.block_info(BlockId(0)).state, BlockState::Allocating);
    }

    #[test]
    fn snapshot_round_trip() {
        let mut t = table();
        t.set_chunk_bit(BlockId(1), 2);
        t.set_state(BlockId(1), BlockState::Full);
        t.block_info_mut(BlockId(1)).pages_in_use = 3;

        let snap = t.to_snapshot();
        let mut fresh = table();
        assert!(fresh.restore(snap));
        assert!(fresh.check_chunk_bit(BlockId(1), 2));
        assert_eq!(fresh.block_info(BlockId(1)).state, BlockState::Full);
        assert_eq!(fresh.block_info(BlockId(1)).pages_in_use, 3);
    }

    #[test]
    fn snapshot_shape_mismatch_is_rejected() {
        let t = table();
        let snap = t.to_snapshot();
        let mut other = BlockTable::new(Geometry::new(8, 32, 512).unwrap());
        assert!(!other.restore(snap));
    }
}
