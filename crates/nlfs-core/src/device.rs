//! Device state: everything reachable from one mounted volume.

use crate::buffer::{TempBuffer, TempBufferPool};
use crate::cache::ChunkCache;
use crate::config::{DeviceParam, DeviceStats};
use crate::object::{Object, ObjectTable, ObjectType};
use crate::tnode::{self, TnodeLayout};
use nlfs_block::{BlockState, BlockTable};
use nlfs_error::{NlfsError, Result};
use nlfs_nand::NandDriver;
use nlfs_types::{BlockId, ObjectId, MAX_PARENT_DEPTH};
use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Garbage-collector working state.
#[derive(Debug, Default)]
pub(crate) struct GcState {
    /// Block currently being collected across invocations.
    pub block: Option<BlockId>,
    pub chunk: u32,
    pub block_finder: u32,
    pub dirtiest: Option<BlockId>,
    pub pages_in_use: u32,
    /// Consecutive selection passes that found nothing.
    pub not_done: u32,
    /// Pacing countdown for leisurely collection.
    pub skip: u32,
    /// Reentrancy latch while a collection runs.
    pub disable: bool,
    pub has_pending_prioritised: bool,
    /// Soft-deleted objects whose last data chunk died during this
    /// collection; fully freed when the block completes.
    pub cleanup_list: Vec<ObjectId>,
    pub oldest_dirty_block: Option<BlockId>,
    pub oldest_dirty_seq: u64,
}

/// One volume's in-RAM state plus its driver.
pub struct Device {
    pub(crate) param: DeviceParam,
    pub(crate) layout: TnodeLayout,
    pub(crate) driver: Box<dyn NandDriver>,
    pub(crate) blocks: BlockTable,
    pub(crate) objects: ObjectTable,
    pub(crate) cache: ChunkCache,
    pub(crate) buffers: TempBufferPool,

    pub(crate) alloc_block: Option<BlockId>,
    pub(crate) alloc_page: u32,
    pub(crate) alloc_block_finder: u32,
    pub(crate) seq_number: u64,
    pub(crate) n_erased_blocks: u32,
    pub(crate) n_free_chunks: u32,

    pub(crate) gc: GcState,

    pub(crate) mounted: bool,
    pub(crate) read_only: bool,
    /// A checkpoint stream currently lives on flash.
    pub(crate) checkpoint_valid: bool,
    pub(crate) checkpt_blocks_estimate: Option<u32>,
    /// Directories with deferred mtime header rewrites.
    pub(crate) dirty_dirs: BTreeSet<ObjectId>,
    pub(crate) stats: DeviceStats,
}

impl Device {
    pub fn new(driver: Box<dyn NandDriver>, param: DeviceParam) -> Result<Self> {
        param.validate()?;
        if driver.geometry() != param.geometry {
            return Err(NlfsError::Range);
        }
        let layout = TnodeLayout::for_geometry(param.geometry, param.wide_tnodes_disabled);
        let chunk_bytes = param.data_bytes();
        Ok(Self {
            layout,
            blocks: BlockTable::new(param.geometry),
            objects: ObjectTable::new(),
            cache: ChunkCache::new(param.n_caches, chunk_bytes),
            buffers: TempBufferPool::new(chunk_bytes),
            driver,
            alloc_block: None,
            alloc_page: 0,
            alloc_block_finder: 0,
            seq_number: 0,
            n_erased_blocks: 0,
            n_free_chunks: 0,
            gc: GcState::default(),
            mounted: false,
            read_only: false,
            checkpoint_valid: false,
            checkpt_blocks_estimate: None,
            dirty_dirs: BTreeSet::new(),
            stats: DeviceStats::default(),
            param,
        })
    }

    #[must_use]
    pub fn param(&self) -> &DeviceParam {
        &self.param
    }

    #[must_use]
    pub fn stats(&self) -> DeviceStats {
        let mut stats = self.stats;
        stats.temp_buffer_overflows = self.buffers.overflows;
        stats
    }

    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    /// Switch the mounted volume between read-only and read-write.
    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    #[must_use]
    pub fn free_chunks(&self) -> u32 {
        self.n_free_chunks
    }

    #[must_use]
    pub fn erased_blocks(&self) -> u32 {
        self.n_erased_blocks
    }

    #[must_use]
    pub fn n_objects(&self) -> usize {
        self.objects.len()
    }

    /// Per-block view for inspection tools:
    /// `(state, seq, pages_in_use, soft_del_pages)`.
    #[must_use]
    pub fn block_report(&self) -> Vec<(BlockState, u64, u32, u32)> {
        self.blocks
            .iter()
            .map(|(_, info)| {
                (
                    info.state,
                    info.seq_number.0,
                    info.pages_in_use,
                    info.soft_del_pages,
                )
            })
            .collect()
    }

    pub(crate) fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    pub(crate) fn chunk_bytes(&self) -> usize {
        self.param.data_bytes()
    }

    pub(crate) fn acquire_buffer(&mut self) -> TempBuffer {
        self.buffers.acquire()
    }

    pub(crate) fn release_buffer(&mut self, buffer: TempBuffer) {
        self.buffers.release(buffer);
    }

    pub(crate) fn require_mounted(&self) -> Result<()> {
        if self.mounted {
            Ok(())
        } else {
            Err(NlfsError::Busy)
        }
    }

    pub(crate) fn require_writable(&self) -> Result<()> {
        self.require_mounted()?;
        if self.read_only {
            Err(NlfsError::ReadOnly)
        } else {
            Ok(())
        }
    }

    /// Erased chunks actually available right now (erased blocks plus the
    /// unwritten tail of the allocating block).
    #[must_use]
    pub(crate) fn erased_chunks(&self) -> u32 {
        let mut n = self.n_erased_blocks * self.param.geometry.chunks_per_block();
        if self.alloc_block.is_some() {
            n += self.param.geometry.chunks_per_block() - self.alloc_page;
        }
        n
    }

    // ── Format / mount / unmount ────────────────────────────────────────

    /// Erase every good block and reset the volume to empty. The device
    /// must not be mounted.
    pub fn format(&mut self) -> Result<()> {
        if self.mounted {
            return Err(NlfsError::Busy);
        }
        info!(target: "nlfs::device", "formatting volume");
        let n_blocks = self.param.geometry.n_blocks();
        for b in 0..n_blocks {
            let block = BlockId(b);
            if !self.param.format_v1 && self.driver.check_bad(block)? {
                continue;
            }
            // a block that will not erase is simply skipped; mount will
            // retire it
            let _ = self.driver.erase_block(block);
        }
        self.reset_ram_state();
        Ok(())
    }

    /// Rebuild in-RAM state from flash and open the volume for use.
    pub fn mount(&mut self) -> Result<()> {
        if self.mounted {
            return Err(NlfsError::Busy);
        }
        self.reset_ram_state();
        self.create_fake_directories();

        let restored = self.param.use_checkpoint && self.restore_from_checkpoint()?;
        if !restored {
            if self.param.format_v1 {
                self.scan_forward()?;
            } else {
                self.scan_backward()?;
            }
        }

        // the root must resolve or the volume is unusable
        if self.objects.get(ObjectId::ROOT).is_none() {
            return Err(NlfsError::Fatal("root directory missing after scan"));
        }

        self.mounted = true;
        info!(
            target: "nlfs::device",
            restored_from_checkpoint = restored,
            objects = self.objects.len(),
            free_chunks = self.n_free_chunks,
            erased_blocks = self.n_erased_blocks,
            "mounted"
        );
        Ok(())
    }

    /// Flush everything and close the volume.
    pub fn unmount(&mut self) -> Result<()> {
        if !self.mounted {
            return Err(NlfsError::Busy);
        }
        self.sync(false)?;
        self.mounted = false;
        debug!(target: "nlfs::device", "unmounted");
        Ok(())
    }

    pub(crate) fn reset_ram_state(&mut self) {
        self.blocks = BlockTable::new(self.param.geometry);
        self.objects = ObjectTable::new();
        self.cache = ChunkCache::new(self.param.n_caches, self.param.data_bytes());
        self.alloc_block = None;
        self.alloc_page = 0;
        self.alloc_block_finder = 0;
        self.seq_number = 0;
        self.n_erased_blocks = 0;
        self.n_free_chunks = 0;
        self.gc = GcState::default();
        self.checkpoint_valid = false;
        self.checkpt_blocks_estimate = None;
        self.dirty_dirs.clear();
    }

    /// The four pseudo-directories; never written to flash.
    pub(crate) fn create_fake_directories(&mut self) {
        for (id, name, in_root) in [
            (ObjectId::UNLINKED, "unlinked", false),
            (ObjectId::DELETED, "deleted", false),
            (ObjectId::ROOT, "", false),
            (ObjectId::LOST_AND_FOUND, "lost+found", true),
        ] {
            let mut dir = Object::new(id, ObjectType::Directory);
            dir.fake = true;
            dir.mode = 0o40_700;
            dir.set_name(name);
            self.objects.insert(dir);
            if in_root {
                self.objects
                    .get_mut(ObjectId::ROOT)
                    .expect("root created first")
                    .as_dir_mut()
                    .expect("root is a directory")
                    .children
                    .push(id);
                if let Some(obj) = self.objects.get_mut(id) {
                    obj.parent = Some(ObjectId::ROOT);
                }
            }
        }
    }

    // ── Self-audit ──────────────────────────────────────────────────────

    /// Check the universal invariants; returns a description of the first
    /// violation. Reads flash to cross-check index-tree entries, so it is
    /// test/debug machinery, not a hot path.
    pub fn check_invariants(&mut self) -> std::result::Result<(), String> {
        let geometry = self.param.geometry;
        let cpb = geometry.chunks_per_block();

        // 1. chunk conservation
        let mut live = 0u64;
        let mut checkpoint_chunks = 0u64;
        let mut dead_chunks = 0u64;
        let mut allocating = Vec::new();
        let mut max_full_seq = 0u64;
        for (block, info) in self.blocks.iter() {
            live += u64::from(info.live_pages());
            match info.state {
                BlockState::Checkpoint => {
                    checkpoint_chunks += u64::from(cpb) - u64::from(info.live_pages())
                }
                BlockState::Dead => dead_chunks += u64::from(cpb),
                BlockState::Allocating => allocating.push(block),
                BlockState::Full => max_full_seq = max_full_seq.max(info.seq_number.0),
                _ => {}
            }
        }
        let total = u64::from(geometry.total_chunks());
        let sum = live + u64::from(self.n_free_chunks) + checkpoint_chunks + dead_chunks;
        if sum != total {
            return Err(format!(
                "chunk conservation broken: live {live} + free {} + checkpoint \
                 {checkpoint_chunks} + dead {dead_chunks} != total {total}",
                self.n_free_chunks
            ));
        }

        // 2. at most one allocating block, matching the allocator's hand
        if allocating.len() > 1 {
            return Err(format!("{} blocks in Allocating state", allocating.len()));
        }
        if allocating.first().copied() != self.alloc_block {
            return Err("allocator hand disagrees with block states".into());
        }

        // 3. full blocks are older than the allocating block
        if let Some(alloc) = self.alloc_block {
            let alloc_seq = self.blocks.block_info(alloc).seq_number.0;
            if max_full_seq > alloc_seq {
                return Err(format!(
                    "full block seq {max_full_seq} exceeds allocating seq {alloc_seq}"
                ));
            }
        }

        // 4 + 5. index trees: leaf counts and tag cross-checks
        let files: Vec<ObjectId> = self
            .objects
            .iter()
            .filter(|o| o.as_file().is_some() && !o.deleted)
            .map(|o| o.id)
            .collect();
        for id in files {
            let mut entries = Vec::new();
            {
                let obj = self.objects.get(id).expect("listed object exists");
                let file = obj.as_file().expect("file variant");
                tnode::collect_entries(
                    &self.layout,
                    file.top.as_deref(),
                    file.top_level,
                    0,
                    &mut entries,
                );
                let n = i32::try_from(entries.len()).unwrap_or(i32::MAX);
                if n != file.n_data_chunks {
                    return Err(format!(
                        "object {id}: {n} tree leaves vs n_data_chunks {}",
                        file.n_data_chunks
                    ));
                }
            }
            for (logical, _base) in entries {
                match self.find_data_chunk(id, logical) {
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        return Err(format!(
                            "object {id} logical {logical}: tree entry resolves to nothing"
                        ))
                    }
                    Err(err) => {
                        return Err(format!(
                            "object {id} logical {logical}: resolve failed: {err}"
                        ))
                    }
                }
            }
        }

        // 6. hard-link chains are one hop and end in file or directory
        let links: Vec<(ObjectId, ObjectId)> = self
            .objects
            .iter()
            .filter_map(|o| match o.variant {
                crate::object::Variant::Hardlink { equiv } => Some((o.id, equiv)),
                _ => None,
            })
            .collect();
        for (id, equiv) in links {
            match self.objects.get(equiv).map(Object::object_type) {
                Some(ObjectType::File | ObjectType::Directory) => {}
                other => {
                    return Err(format!(
                        "hardlink {id}: equivalent {equiv} resolves to {other:?}"
                    ))
                }
            }
        }

        // 7. parent chains terminate at a pseudo-directory quickly
        for id in self.objects.ids() {
            let mut at = id;
            let mut steps = 0;
            loop {
                let Some(obj) = self.objects.get(at) else {
                    return Err(format!("object {id}: parent chain hits missing {at}"));
                };
                if at.is_pseudo() {
                    break;
                }
                let Some(parent) = obj.parent else {
                    return Err(format!("object {id}: no parent at {at}"));
                };
                steps += 1;
                if steps >= MAX_PARENT_DEPTH {
                    return Err(format!("object {id}: parent chain exceeds depth limit"));
                }
                at = parent;
            }
        }

        Ok(())
    }
}
