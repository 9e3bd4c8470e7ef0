//! Out-of-place chunk allocator.
//!
//! At most one block is ever in the `Allocating` state; chunks are handed
//! out sequentially within it. A new block is chosen by a circular scan
//! from the last hand, takes the next sequence number, and the reserve
//! policy keeps enough erased blocks back for GC, deletion completion,
//! and the checkpoint.

use crate::device::Device;
use nlfs_block::BlockState;
use nlfs_error::{NlfsError, Result};
use nlfs_types::{BlockId, PhysChunk, SeqNumber};
use tracing::{debug, error, trace};

impl Device {
    /// Can `n_chunks` be allocated without eating the reserve?
    pub(crate) fn check_alloc_available(&mut self, n_chunks: u32) -> bool {
        let checkpt_blocks = self.calc_checkpt_blocks_required();
        let reserved = (self.param.n_reserved_blocks + checkpt_blocks)
            * self.param.geometry.chunks_per_block();
        self.n_free_chunks > reserved + n_chunks
    }

    /// Promote the first `Empty` block found by the circular finder to
    /// `Allocating`, stamping the next sequence number.
    fn find_alloc_block(&mut self) -> Option<BlockId> {
        if self.n_erased_blocks < 1 {
            error!(target: "nlfs::alloc", "no more erased blocks");
            return None;
        }
        let n_blocks = self.param.geometry.n_blocks();
        for _ in 0..n_blocks {
            self.alloc_block_finder = (self.alloc_block_finder + 1) % n_blocks;
            let block = BlockId(self.alloc_block_finder);
            if self.blocks.block_info(block).state == BlockState::Empty {
                self.seq_number += 1;
                let info = self.blocks.block_info_mut(block);
                info.state = BlockState::Allocating;
                info.seq_number = SeqNumber(self.seq_number);
                self.n_erased_blocks -= 1;
                debug!(
                    target: "nlfs::alloc",
                    block = block.0,
                    seq = self.seq_number,
                    erased_left = self.n_erased_blocks,
                    "allocating from new block"
                );
                return Some(block);
            }
        }
        error!(
            target: "nlfs::alloc",
            expected_erased = self.n_erased_blocks,
            "no empty block found despite erased count"
        );
        None
    }

    /// Hand out the next chunk. `use_reserve` is granted to GC-internal
    /// relocation and the final writes of a deletion, so those never fail
    /// for lack of space.
    pub(crate) fn alloc_chunk(&mut self, use_reserve: bool) -> Result<PhysChunk> {
        if self.alloc_block.is_none() {
            self.alloc_block = self.find_alloc_block();
            self.alloc_page = 0;
        }
        if !use_reserve && !self.check_alloc_available(1) {
            return Err(NlfsError::NoSpace);
        }
        let Some(block) = self.alloc_block else {
            return Err(NlfsError::NoSpace);
        };

        let chunk = self.param.geometry.chunk(block, self.alloc_page);
        let info = self.blocks.block_info_mut(block);
        info.pages_in_use += 1;
        let page = self.alloc_page;
        self.blocks.set_chunk_bit(block, page);
        self.alloc_page += 1;
        self.n_free_chunks -= 1;

        if self.alloc_page >= self.param.geometry.chunks_per_block() {
            self.blocks.set_state(block, BlockState::Full);
            self.alloc_block = None;
        }
        trace!(target: "nlfs::alloc", chunk = chunk.0, block = block.0, "chunk allocated");
        Ok(chunk)
    }

    /// Abandon the rest of the current allocating block, promoting it to
    /// `Full`. Called after a failed write or erase check so that no
    /// partial block straddles a confirmed-bad programming event.
    pub(crate) fn skip_rest_of_block(&mut self) {
        if let Some(block) = self.alloc_block.take() {
            if self.blocks.block_info(block).state == BlockState::Allocating {
                self.blocks.set_state(block, BlockState::Full);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceParam;
    use nlfs_nand::{RamNand, TagMode};
    use nlfs_types::{Geometry, StoredEndian};

    fn device() -> Device {
        let geometry = Geometry::new(16, 32, 512).unwrap();
        let nand = RamNand::new(geometry, StoredEndian::Little, TagMode::Oob);
        let mut dev = Device::new(Box::new(nand), DeviceParam::new(geometry)).unwrap();
        dev.format().unwrap();
        dev.mount().unwrap();
        dev
    }

    #[test]
    fn sequential_chunks_from_one_block() {
        let mut dev = device();
        let first = dev.alloc_chunk(false).unwrap();
        let second = dev.alloc_chunk(false).unwrap();
        assert_eq!(second.0, first.0 + 1);
        let (block, _) = dev.param.geometry.split(first);
        assert_eq!(dev.alloc_block, Some(block));
        assert_eq!(dev.blocks.block_info(block).state, BlockState::Allocating);
        assert_eq!(dev.blocks.block_info(block).pages_in_use, 2);
        assert!(dev.blocks.check_chunk_bit(block, 0));
    }

    #[test]
    fn filling_a_block_promotes_it_to_full() {
        let mut dev = device();
        let first = dev.alloc_chunk(false).unwrap();
        let (block, _) = dev.param.geometry.split(first);
        for _ in 1..32 {
            dev.alloc_chunk(false).unwrap();
        }
        assert_eq!(dev.blocks.block_info(block).state, BlockState::Full);
        assert_eq!(dev.alloc_block, None);

        // the next allocation opens a new block with a higher sequence
        let next = dev.alloc_chunk(false).unwrap();
        let (next_block, _) = dev.param.geometry.split(next);
        assert_ne!(next_block, block);
        assert!(
            dev.blocks.block_info(next_block).seq_number
                > dev.blocks.block_info(block).seq_number
        );
    }

    #[test]
    fn reserve_policy_refuses_then_yields_to_gc() {
        let mut dev = device();
        // drain normal allocations until the reserve blocks them
        let mut granted = 0u32;
        while dev.alloc_chunk(false).is_ok() {
            granted += 1;
            assert!(granted <= 16 * 32, "allocator never refused");
        }
        assert!(granted > 0);
        // the reserve is still available to privileged callers
        assert!(dev.alloc_chunk(true).is_ok());
    }

    #[test]
    fn skip_rest_of_block_closes_the_hand() {
        let mut dev = device();
        let first = dev.alloc_chunk(false).unwrap();
        let (block, _) = dev.param.geometry.split(first);
        dev.skip_rest_of_block();
        assert_eq!(dev.blocks.block_info(block).state, BlockState::Full);
        assert_eq!(dev.alloc_block, None);

        let next = dev.alloc_chunk(false).unwrap();
        let (next_block, _) = dev.param.geometry.split(next);
        assert_ne!(next_block, block);
    }
}
