//! Chunk-level I/O: tagged reads with the ECC policy, the write-verify
//! loop, chunk deletion, and write-failure robustness.
//!
//! Retries are invisible to callers: a failed program deletes the chunk,
//! abandons the rest of its block, and tries again on a fresh chunk until
//! the attempt budget (or space) runs out.

use crate::device::Device;
use nlfs_block::BlockState;
use nlfs_error::{NlfsError, Result};
use nlfs_nand::{EccStatus, ExtTags};
use nlfs_types::{BlockId, PhysChunk};
use tracing::{debug, error, trace, warn};

impl Device {
    /// Tagged read with the ECC policy applied: corrected reads continue,
    /// suspect reads prioritize the block for GC, uncorrectable reads
    /// strike the block toward retirement.
    pub(crate) fn rd_chunk_tags(
        &mut self,
        chunk: PhysChunk,
        data: Option<&mut [u8]>,
    ) -> Result<ExtTags> {
        let (block, offset) = self.param.geometry.split(chunk);
        let mut tags = ExtTags::default();
        let status = self
            .driver
            .read_chunk(block, offset, data, Some(&mut tags))?;
        self.stats.n_page_reads += 1;
        match status {
            EccStatus::NoError => {}
            EccStatus::Corrected => self.stats.n_ecc_fixed += 1,
            EccStatus::Suspect => {
                self.stats.n_ecc_fixed += 1;
                let info = self.blocks.block_info_mut(block);
                if !info.gc_prioritise {
                    info.gc_prioritise = true;
                    self.gc.has_pending_prioritised = true;
                    debug!(target: "nlfs::io", block = block.0, "suspect ECC, block prioritised");
                }
            }
            EccStatus::Uncorrectable => {
                self.stats.n_ecc_unfixed += 1;
                self.handle_chunk_error(block);
            }
        }
        Ok(tags)
    }

    pub(crate) fn wr_chunk_tags(
        &mut self,
        chunk: PhysChunk,
        data: &[u8],
        tags: &ExtTags,
    ) -> Result<()> {
        let (block, offset) = self.param.geometry.split(chunk);
        self.stats.n_page_writes += 1;
        self.driver.write_chunk(block, offset, data, tags)
    }

    /// True iff the chunk reads back fully erased.
    pub(crate) fn check_chunk_erased(&mut self, chunk: PhysChunk) -> Result<bool> {
        let (block, offset) = self.param.geometry.split(chunk);
        let mut buffer = self.acquire_buffer();
        let mut tags = ExtTags::default();
        let outcome = self
            .driver
            .read_chunk(block, offset, Some(buffer.as_mut_slice()), Some(&mut tags));
        let erased = match outcome {
            Ok(_) => !tags.chunk_used && buffer.as_slice().iter().all(|b| *b == 0xFF),
            Err(_) => false,
        };
        self.release_buffer(buffer);
        Ok(erased)
    }

    /// Read back a just-programmed chunk and compare payload and identity.
    pub(crate) fn verify_chunk_written(
        &mut self,
        chunk: PhysChunk,
        data: &[u8],
        tags: &ExtTags,
    ) -> bool {
        let (block, offset) = self.param.geometry.split(chunk);
        let mut buffer = self.acquire_buffer();
        let mut read_tags = ExtTags::default();
        let outcome = self.driver.read_chunk(
            block,
            offset,
            Some(buffer.as_mut_slice()),
            Some(&mut read_tags),
        );
        let ok = outcome.is_ok()
            && &buffer.as_slice()[..data.len()] == data
            && read_tags.chunk_used
            && read_tags.obj_id == tags.obj_id
            && read_tags.chunk_id == tags.chunk_id
            && read_tags.n_bytes == tags.n_bytes;
        self.release_buffer(buffer);
        ok
    }

    /// Allocate, program, and verify one chunk; the heart of every write.
    ///
    /// The erased check runs on the first program into a block since
    /// mount (or always, when configured); a pass disables it for the
    /// rest of the block. Failures delete the chunk, abandon the block,
    /// and retry on a new chunk up to `wr_attempts` times (0 = unlimited,
    /// bounded in practice by allocation failure).
    pub(crate) fn write_new_chunk(
        &mut self,
        data: &[u8],
        tags: &mut ExtTags,
        use_reserve: bool,
    ) -> Result<PhysChunk> {
        self.invalidate_checkpoint()?;

        let mut attempts: u32 = 0;
        let chunk = loop {
            let chunk = self.alloc_chunk(use_reserve)?;
            let (block, _) = self.param.geometry.split(chunk);
            attempts += 1;

            if self.param.always_check_erased {
                self.blocks.block_info_mut(block).skip_erased_check = false;
            }
            let skip_check = self.blocks.block_info(block).skip_erased_check;
            let mut erased_ok = true;
            if !skip_check {
                erased_ok = self.check_chunk_erased(chunk)?;
                if !erased_ok {
                    warn!(target: "nlfs::io", chunk = chunk.0, "chunk was not erased");
                    self.chunk_del(chunk, true)?;
                    self.skip_rest_of_block();
                    continue;
                }
            }

            tags.seq_number = self.blocks.block_info(block).seq_number.0;
            let mut write_ok = self.wr_chunk_tags(chunk, data, tags).is_ok();
            if write_ok && !skip_check {
                write_ok = self.verify_chunk_written(chunk, data, tags);
            }

            if !write_ok {
                self.handle_chunk_wr_error(chunk, erased_ok)?;
                if self.param.wr_attempts != 0 && attempts > self.param.wr_attempts {
                    error!(
                        target: "nlfs::io",
                        attempts,
                        "chunk write abandoned after retries"
                    );
                    return Err(NlfsError::Nand {
                        block: self.param.geometry.split(chunk).0 .0,
                        detail: "write failed after retries",
                    });
                }
                continue;
            }

            self.blocks.block_info_mut(block).skip_erased_check = true;
            break chunk;
        };

        if attempts > 1 {
            warn!(target: "nlfs::io", attempts, "write required retries");
            self.stats.n_retried_writes += u64::from(attempts - 1);
        }
        Ok(chunk)
    }

    /// Delete a chunk: accounting always, plus the legacy on-flash
    /// deletion marker when `mark_flash` is set on a forward-scan volume.
    pub(crate) fn chunk_del(&mut self, chunk: PhysChunk, mark_flash: bool) -> Result<()> {
        if chunk.is_none() {
            return Ok(());
        }
        let (block, offset) = self.param.geometry.split(chunk);

        if mark_flash && self.param.format_v1 {
            let marker = ExtTags {
                chunk_used: true,
                is_deleted: true,
                ..ExtTags::default()
            };
            // best effort: an unmarkable chunk is still deleted in RAM
            let _ = self.wr_chunk_tags(chunk, &[], &marker);
        }

        self.update_oldest_dirty_seq(block);
        if self.blocks.check_chunk_bit(block, offset) {
            self.blocks.clear_chunk_bit(block, offset);
            let info = self.blocks.block_info_mut(block);
            info.pages_in_use = info.pages_in_use.saturating_sub(1);
            self.n_free_chunks += 1;
            trace!(target: "nlfs::io", chunk = chunk.0, "chunk deleted");

            let info = self.blocks.block_info(block);
            if info.pages_in_use == 0
                && !info.has_shrink_hdr
                && !matches!(
                    info.state,
                    BlockState::Allocating | BlockState::Scanning | BlockState::Empty
                )
            {
                self.block_became_dirty(block)?;
            }
        }
        Ok(())
    }

    /// Soft delete: the block's accounting releases the chunk but the
    /// bitmap bit and tags stay until GC relocates the block.
    pub(crate) fn soft_del_chunk(&mut self, chunk: PhysChunk) {
        if chunk.is_none() {
            return;
        }
        let (block, _) = self.param.geometry.split(chunk);
        self.blocks.block_info_mut(block).soft_del_pages += 1;
        self.n_free_chunks += 1;
        self.update_oldest_dirty_seq(block);
        trace!(target: "nlfs::io", chunk = chunk.0, "chunk soft-deleted");
    }

    /// ECC or program trouble on `block`: prioritize it for GC and strike
    /// it toward retirement.
    pub(crate) fn handle_chunk_error(&mut self, block: BlockId) {
        let info = self.blocks.block_info_mut(block);
        if !info.gc_prioritise {
            info.gc_prioritise = true;
            self.gc.has_pending_prioritised = true;
            info.chunk_error_strikes += 1;
            if info.chunk_error_strikes > 3 {
                info.needs_retiring = true;
                error!(target: "nlfs::io", block = block.0, "block struck out");
            }
        }
    }

    /// A program failed: condemn the block if the chunk was verified
    /// erased beforehand (a true write failure), delete the chunk, and
    /// abandon the rest of the block.
    pub(crate) fn handle_chunk_wr_error(
        &mut self,
        chunk: PhysChunk,
        erased_ok: bool,
    ) -> Result<()> {
        let (block, _) = self.param.geometry.split(chunk);
        self.handle_chunk_error(block);
        if erased_ok {
            self.blocks.block_info_mut(block).needs_retiring = true;
            warn!(target: "nlfs::io", block = block.0, "block needs retiring");
        }
        self.chunk_del(chunk, true)?;
        self.skip_rest_of_block();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceParam;
    use nlfs_nand::{NandDriver, RamNand, SharedNand, TagMode};
    use nlfs_types::{Geometry, StoredEndian};

    fn device_with(nand: SharedNand) -> Device {
        let geometry = nand.geometry();
        let mut dev = Device::new(Box::new(nand), DeviceParam::new(geometry)).unwrap();
        dev.format().unwrap();
        dev.mount().unwrap();
        dev
    }

    fn shared() -> SharedNand {
        let geometry = Geometry::new(16, 32, 512).unwrap();
        SharedNand::new(RamNand::new(geometry, StoredEndian::Little, TagMode::Oob))
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut dev = device_with(shared());
        let data = vec![0x42u8; 512];
        let mut tags = ExtTags::for_data(10, 0, 512, 0);
        let chunk = dev.write_new_chunk(&data, &mut tags, false).unwrap();

        let mut back = vec![0u8; 512];
        let got = dev.rd_chunk_tags(chunk, Some(&mut back)).unwrap();
        assert_eq!(back, data);
        assert!(got.matches(10, 1));
        assert_eq!(got.seq_number, 1);
    }

    #[test]
    fn injected_write_failure_retries_on_new_block() {
        let nand = shared();
        let mut dev = device_with(nand.clone());
        nand.with(|n| n.faults.fail_writes = 1);

        let data = vec![0x13u8; 512];
        let mut tags = ExtTags::for_data(11, 0, 512, 0);
        let chunk = dev.write_new_chunk(&data, &mut tags, false).unwrap();
        assert_eq!(dev.stats.n_retried_writes, 1);

        // the failed block was abandoned: the landed chunk is elsewhere
        let (ok_block, _) = dev.param.geometry.split(chunk);
        assert!(dev.blocks.block_info(ok_block).skip_erased_check);
        let mut back = vec![0u8; 512];
        let got = dev.rd_chunk_tags(chunk, Some(&mut back)).unwrap();
        assert!(got.matches(11, 1));
        assert_eq!(back, data);
    }

    #[test]
    fn silent_corruption_is_caught_by_verify() {
        let nand = shared();
        let mut dev = device_with(nand.clone());
        nand.with(|n| n.faults.corrupt_writes = 1);

        let data = vec![0x77u8; 512];
        let mut tags = ExtTags::for_data(12, 0, 512, 0);
        let chunk = dev.write_new_chunk(&data, &mut tags, false).unwrap();
        let mut back = vec![0u8; 512];
        dev.rd_chunk_tags(chunk, Some(&mut back)).unwrap();
        assert_eq!(back, data, "corrupted attempt must not be the live copy");
        assert!(dev.stats.n_retried_writes >= 1);
    }

    #[test]
    fn bounded_attempts_give_up() {
        let nand = shared();
        let geometry = nand.geometry();
        let mut param = DeviceParam::new(geometry);
        param.wr_attempts = 2;
        let mut dev = Device::new(Box::new(nand.clone()), param).unwrap();
        dev.format().unwrap();
        dev.mount().unwrap();
        nand.with(|n| n.faults.fail_writes = 50);

        let data = vec![0u8; 512];
        let mut tags = ExtTags::for_data(13, 0, 512, 0);
        assert!(dev.write_new_chunk(&data, &mut tags, false).is_err());
    }

    #[test]
    fn chunk_del_erases_an_emptied_full_block() {
        let mut dev = device_with(shared());
        let data = vec![1u8; 512];
        let mut chunks = Vec::new();
        for i in 0..32u32 {
            let mut tags = ExtTags::for_data(20, i, 512, 0);
            chunks.push(dev.write_new_chunk(&data, &mut tags, false).unwrap());
        }
        let (block, _) = dev.param.geometry.split(chunks[0]);
        assert_eq!(dev.blocks.block_info(block).state, BlockState::Full);

        let erased_before = dev.n_erased_blocks;
        for chunk in chunks {
            dev.chunk_del(chunk, true).unwrap();
        }
        // all pages died, so the block went dirty and was erased
        assert_eq!(dev.blocks.block_info(block).state, BlockState::Empty);
        assert_eq!(dev.n_erased_blocks, erased_before + 1);
    }

    #[test]
    fn uncorrectable_reads_strike_the_block() {
        let nand = shared();
        let mut dev = device_with(nand.clone());
        let data = vec![9u8; 512];
        let mut tags = ExtTags::for_data(30, 0, 512, 0);
        let chunk = dev.write_new_chunk(&data, &mut tags, false).unwrap();
        let (block, offset) = dev.param.geometry.split(chunk);
        nand.with(|n| {
            n.faults.uncorrectable.insert((block.0, offset));
        });

        dev.rd_chunk_tags(chunk, None).unwrap();
        let info = dev.blocks.block_info(block);
        assert!(info.gc_prioritise);
        assert_eq!(info.chunk_error_strikes, 1);
        assert!(dev.gc.has_pending_prioritised);
        assert_eq!(dev.stats.n_ecc_unfixed, 1);
    }
}
