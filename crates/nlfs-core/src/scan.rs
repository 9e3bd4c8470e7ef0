//! Mount-time scan: rebuild the block table, object table, and index
//! trees by replaying the log.
//!
//! Current-format volumes scan backward (newest block first, first
//! observation of a `(object, chunk)` pair wins); legacy volumes scan
//! forward and arbitrate duplicates with the 2-bit serial number. Either
//! way the scan only reads tags for most chunks; header bodies are read
//! lazily, except for the types whose payload the scan itself needs.

use crate::checkpoint::CHECKPOINT_OBJECT_ID;
use crate::device::Device;
use crate::header::ObjHeader;
use crate::object::{Object, ObjectType, Variant};
use crate::tnode;
use nlfs_block::BlockState;
use nlfs_error::Result;
use nlfs_nand::ExtTags;
use nlfs_types::{BlockId, ObjectId, PhysChunk, SeqNumber, MAX_PARENT_DEPTH};
use std::collections::HashSet;
use tracing::{debug, info, trace, warn};

struct ScanCand {
    block: BlockId,
    seq: u64,
}

#[derive(Default)]
struct ScanCtx {
    shadowed: HashSet<u32>,
}

impl Device {
    // ── Shared helpers ──────────────────────────────────────────────────

    fn unmark_chunk(&mut self, block: BlockId, offset: u32) {
        if self.blocks.check_chunk_bit(block, offset) {
            self.blocks.clear_chunk_bit(block, offset);
            let info = self.blocks.block_info_mut(block);
            info.pages_in_use = info.pages_in_use.saturating_sub(1);
        }
    }

    fn read_scan_tags(&mut self, block: BlockId, offset: u32) -> Result<ExtTags> {
        let mut tags = ExtTags::default();
        self.driver.read_chunk(block, offset, None, Some(&mut tags))?;
        self.stats.n_page_reads += 1;
        Ok(tags)
    }

    /// Pass 1: classify every block by its first chunk. Returns the
    /// blocks carrying data (with sequence numbers) and the blocks that
    /// need erasing (torn first chunk, stale checkpoint remains).
    fn classify_blocks(&mut self) -> Result<(Vec<ScanCand>, Vec<BlockId>)> {
        let geometry = self.param.geometry;
        let mut cands = Vec::new();
        let mut to_erase = Vec::new();

        for b in 0..geometry.n_blocks() {
            let block = BlockId(b);
            if !self.param.format_v1 && self.driver.check_bad(block)? {
                self.blocks.set_state(block, BlockState::Dead);
                debug!(target: "nlfs::scan", block = b, "bad block skipped");
                continue;
            }

            let tags = self.read_scan_tags(block, 0)?;
            if tags.chunk_used {
                if tags.obj_id == CHECKPOINT_OBJECT_ID {
                    // checkpoint remains with no valid stream: reclaim
                    to_erase.push(block);
                } else {
                    self.blocks.set_state(block, BlockState::NeedsScan);
                    self.blocks.block_info_mut(block).seq_number = SeqNumber(tags.seq_number);
                    cands.push(ScanCand {
                        block,
                        seq: tags.seq_number,
                    });
                }
                continue;
            }

            // first chunk unreadable: erased block, or a torn program
            let mut buffer = self.acquire_buffer();
            let mut programmed = false;
            for offset in 0..geometry.chunks_per_block() {
                let mut tags = ExtTags::default();
                let read = self.driver.read_chunk(
                    block,
                    offset,
                    Some(buffer.as_mut_slice()),
                    Some(&mut tags),
                );
                self.stats.n_page_reads += 1;
                let erased = read.is_ok()
                    && !tags.chunk_used
                    && buffer.as_slice().iter().all(|b| *b == 0xFF);
                if !erased {
                    programmed = true;
                    break;
                }
            }
            self.release_buffer(buffer);
            if programmed {
                to_erase.push(block);
            } else {
                self.blocks.set_state(block, BlockState::Empty);
            }
        }
        Ok((cands, to_erase))
    }

    /// Derive the free-space counters once every surviving chunk is
    /// marked.
    fn finish_scan_accounting(&mut self) {
        let geometry = self.param.geometry;
        let cpb = u64::from(geometry.chunks_per_block());
        let mut pages = 0u64;
        let mut dead = 0u64;
        let mut empty = 0u32;
        for (_, info) in self.blocks.iter() {
            pages += u64::from(info.pages_in_use);
            match info.state {
                BlockState::Dead => dead += cpb,
                BlockState::Empty => empty += 1,
                _ => {}
            }
        }
        self.n_erased_blocks = empty;
        let total = u64::from(geometry.total_chunks());
        self.n_free_chunks = u32::try_from(total.saturating_sub(pages + dead)).unwrap_or(0);
    }

    // ── Per-chunk dispatch ──────────────────────────────────────────────

    fn scan_header_chunk(
        &mut self,
        ctx: &mut ScanCtx,
        block: BlockId,
        offset: u32,
        tags: &ExtTags,
        forward: bool,
    ) -> Result<()> {
        let geometry = self.param.geometry;
        let phys = geometry.chunk(block, offset);
        let id = ObjectId(tags.obj_id);

        if tags.extra_shadows != 0 {
            ctx.shadowed.insert(tags.extra_shadows);
            trace!(target: "nlfs::scan", id = tags.obj_id, shadows = tags.extra_shadows, "shadow recorded");
            if forward {
                // forward order sees the shadowed object's chunks first;
                // withdraw whatever it already claimed
                self.scan_drop_object(ObjectId(tags.extra_shadows))?;
            }
        }
        if id.0 < ObjectId::FIRST_ALLOCATABLE
            || id.0 & 0x8000_0000 != 0
            || ctx.shadowed.contains(&id.0)
        {
            self.unmark_chunk(block, offset);
            return Ok(());
        }

        // duplicate headers: backward keeps the first (newest) seen,
        // forward arbitrates by serial
        let prior = self.objects.get(id).map(|o| (o.hdr_chunk, o.serial));
        if let Some((old_hdr, old_serial)) = prior {
            if !old_hdr.is_none() {
                if forward {
                    let new_wins = (old_serial + 1) & 3 == tags.serial_number;
                    if new_wins {
                        let (old_block, old_offset) = geometry.split(old_hdr);
                        self.unmark_chunk(old_block, old_offset);
                    } else {
                        self.unmark_chunk(block, offset);
                        return Ok(());
                    }
                } else {
                    self.unmark_chunk(block, offset);
                    return Ok(());
                }
            }
        }

        let hinted = if tags.extra_available {
            ObjectType::from_tag(tags.extra_obj_type)
        } else {
            None
        };
        let needs_body = !tags.extra_available
            || matches!(
                hinted,
                None | Some(ObjectType::Symlink | ObjectType::Hardlink | ObjectType::Special)
            )
            || (hinted == Some(ObjectType::File) && tags.extra_file_size == u64::MAX);
        let header = if needs_body {
            let mut buffer = self.acquire_buffer();
            let mut body_tags = ExtTags::default();
            let read = self.driver.read_chunk(
                block,
                offset,
                Some(buffer.as_mut_slice()),
                Some(&mut body_tags),
            );
            self.stats.n_page_reads += 1;
            let header = match read {
                Ok(_) => ObjHeader::unpack(self.param.endian, buffer.as_slice()).ok(),
                Err(_) => None,
            };
            self.release_buffer(buffer);
            match header {
                Some(header) => Some(header),
                None => {
                    warn!(target: "nlfs::scan", chunk = phys.0, "unreadable header body dropped");
                    self.unmark_chunk(block, offset);
                    return Ok(());
                }
            }
        } else {
            None
        };

        let obj_type = match hinted.or_else(|| {
            header
                .as_ref()
                .and_then(|h| ObjectType::from_tag(h.obj_type))
        }) {
            Some(t) => t,
            None => {
                self.unmark_chunk(block, offset);
                return Ok(());
            }
        };

        if let Some(existing) = self.objects.get(id) {
            if existing.object_type() != obj_type {
                // contradictory evidence across a crash: keep the newer
                // (already materialized) identity, drop this header
                warn!(target: "nlfs::scan", id = id.0, "type flip dropped");
                self.unmark_chunk(block, offset);
                return Ok(());
            }
        } else {
            self.objects.insert(Object::new(id, obj_type));
        }

        let parent_raw = header
            .as_ref()
            .map_or(tags.extra_parent_id, |h| h.parent_id);
        let shrink = tags.extra_is_shrink || header.as_ref().is_some_and(|h| h.is_shrink);
        if let Some(h) = &header {
            if h.shadows_obj != 0 {
                ctx.shadowed.insert(h.shadows_obj);
            }
        }

        {
            let obj = self.objects.get_mut(id).expect("inserted above");
            obj.hdr_chunk = phys;
            obj.serial = tags.serial_number;
            match &header {
                Some(h) => {
                    obj.set_name(&h.name);
                    obj.mode = h.mode;
                    obj.uid = h.uid;
                    obj.gid = h.gid;
                    obj.atime = u64::from(h.atime);
                    obj.mtime = u64::from(h.mtime);
                    obj.ctime = u64::from(h.ctime);
                    obj.xattrs = h.xattrs.clone();
                    match &mut obj.variant {
                        Variant::Symlink { alias } => *alias = h.alias.clone(),
                        Variant::Hardlink { equiv } => *equiv = ObjectId(h.equiv_id),
                        Variant::Special { rdev } => *rdev = h.rdev,
                        _ => {}
                    }
                    obj.lazy_loaded = false;
                }
                None => obj.lazy_loaded = true,
            }
            if let Some(file) = obj.as_file_mut() {
                let hint = header
                    .as_ref()
                    .map_or(tags.extra_file_size, |h| h.file_size);
                let hint = if hint == u64::MAX { 0 } else { hint };
                if forward {
                    // newest evidence so far: the header dictates the size
                    // (a truncation may have shrunk it); newer data chunks
                    // re-extend it later in the walk
                    file.file_size = hint;
                    file.stored_size = hint;
                } else {
                    // data chunks newer than this header may already have
                    // extended the provisional size
                    file.file_size = file.file_size.max(hint);
                    file.stored_size = file.stored_size.max(hint);
                }
                file.shrink_size = hint;
            }
        }
        if shrink {
            self.blocks.block_info_mut(block).has_shrink_hdr = true;
        }

        // parent linkage, creating placeholder directories as needed
        match parent_raw {
            0 => {}
            p if p == ObjectId::UNLINKED.0 || p == ObjectId::DELETED.0 => {
                self.add_obj_to_dir(ObjectId(p), id);
            }
            p => {
                let parent = ObjectId(p);
                if !self.objects.contains(parent) {
                    let mut placeholder = Object::new(parent, ObjectType::Directory);
                    placeholder.lazy_loaded = true;
                    self.objects.insert(placeholder);
                }
                if self.objects.get(parent).is_some_and(Object::is_dir) {
                    self.add_obj_to_dir(parent, id);
                }
            }
        }
        Ok(())
    }

    fn scan_data_chunk(
        &mut self,
        ctx: &ScanCtx,
        block: BlockId,
        offset: u32,
        tags: &ExtTags,
        forward: bool,
    ) -> Result<()> {
        let geometry = self.param.geometry;
        let phys = geometry.chunk(block, offset);
        let id = ObjectId(tags.obj_id);

        if id.0 == 0 || id.0 & 0x8000_0000 != 0 || ctx.shadowed.contains(&id.0) {
            self.unmark_chunk(block, offset);
            return Ok(());
        }

        if !self.objects.contains(id) {
            let mut placeholder = Object::new(id, ObjectType::File);
            placeholder.lazy_loaded = true;
            self.objects.insert(placeholder);
        }
        if self.objects.get(id).and_then(Object::as_file).is_none() {
            // data aimed at a non-file: stale garbage
            self.unmark_chunk(block, offset);
            return Ok(());
        }

        let logical = tags.chunk_id - 1;
        let layout = self.layout;
        let existing = {
            let file = self
                .objects
                .get(id)
                .and_then(Object::as_file)
                .expect("checked above");
            tnode::get(&layout, file.top.as_deref(), file.top_level, logical)
        };

        if existing != 0 {
            if forward {
                // serial arbitration; the loser's mark is withdrawn
                let resolved = self.find_chunk_in_group(existing, id.0, tags.chunk_id)?;
                let old_serial = match resolved {
                    Some(old) => self.read_scan_tags_at(old)?.serial_number,
                    None => tags.serial_number.wrapping_sub(1) & 3,
                };
                let new_wins = (old_serial + 1) & 3 == tags.serial_number;
                if new_wins {
                    if let Some(old) = resolved {
                        let (ob, oo) = geometry.split(old);
                        self.unmark_chunk(ob, oo);
                    }
                } else {
                    self.unmark_chunk(block, offset);
                    return Ok(());
                }
            } else {
                // backward: first seen is newest, later copies lose
                self.unmark_chunk(block, offset);
                return Ok(());
            }
        }

        // grow the provisional size only while no header has been seen:
        // those chunks are newer than any header in a backward scan
        let header_seen = !self
            .objects
            .get(id)
            .expect("checked above")
            .hdr_chunk
            .is_none();
        {
            let file = self
                .objects
                .get_mut(id)
                .and_then(Object::as_file_mut)
                .expect("checked above");
            let mut top = file.top.take();
            let mut top_level = file.top_level;
            tnode::set(&layout, &mut top, &mut top_level, logical, phys.0)?;
            let file = self
                .objects
                .get_mut(id)
                .and_then(Object::as_file_mut)
                .expect("checked above");
            file.top = top;
            file.top_level = top_level;
            if existing == 0 {
                file.n_data_chunks += 1;
            }
            if !header_seen || forward {
                let end = u64::from(logical) * self.param.data_bytes() as u64
                    + u64::from(tags.n_bytes);
                if end > file.file_size {
                    file.file_size = end;
                    file.stored_size = file.stored_size.max(end);
                }
            }
        }
        Ok(())
    }

    fn read_scan_tags_at(&mut self, chunk: PhysChunk) -> Result<ExtTags> {
        let (block, offset) = self.param.geometry.split(chunk);
        self.read_scan_tags(block, offset)
    }

    /// Withdraw every mark an object claimed during this scan and forget
    /// it (forward-scan shadow handling).
    fn scan_drop_object(&mut self, id: ObjectId) -> Result<()> {
        if !self.objects.contains(id) {
            return Ok(());
        }
        let layout = self.layout;
        let mut entries = Vec::new();
        if let Some(file) = self.objects.get(id).and_then(Object::as_file) {
            tnode::collect_entries(
                &layout,
                file.top.as_deref(),
                file.top_level,
                0,
                &mut entries,
            );
        }
        for (logical, base) in entries {
            if let Some(chunk) = self.find_chunk_in_group(base, id.0, logical + 1)? {
                let (block, offset) = self.param.geometry.split(chunk);
                self.unmark_chunk(block, offset);
            }
        }
        let hdr = self.objects.get(id).map_or(PhysChunk::NONE, |o| o.hdr_chunk);
        if !hdr.is_none() {
            let (block, offset) = self.param.geometry.split(hdr);
            self.unmark_chunk(block, offset);
        }
        self.remove_obj_from_dir(id);
        self.objects.remove(id);
        Ok(())
    }

    // ── Scan drivers ────────────────────────────────────────────────────

    /// Backward scan for current-format volumes.
    pub(crate) fn scan_backward(&mut self) -> Result<()> {
        let (mut cands, to_erase) = self.classify_blocks()?;
        cands.sort_by(|a, b| b.seq.cmp(&a.seq));
        self.seq_number = cands.first().map_or(0, |c| c.seq);
        info!(
            target: "nlfs::scan",
            blocks_with_data = cands.len(),
            to_erase = to_erase.len(),
            "backward scan"
        );

        let cpb = self.param.geometry.chunks_per_block();
        let mut ctx = ScanCtx::default();
        for (i, cand) in cands.iter().enumerate() {
            let block = cand.block;
            self.blocks.set_state(block, BlockState::Scanning);
            let mut highest_used: Option<u32> = None;

            for offset in (0..cpb).rev() {
                let tags = self.read_scan_tags(block, offset)?;
                if !tags.chunk_used {
                    continue;
                }
                if highest_used.is_none() {
                    highest_used = Some(offset);
                }
                if tags.obj_id == CHECKPOINT_OBJECT_ID || tags.is_deleted {
                    continue;
                }
                self.blocks.set_chunk_bit(block, offset);
                self.blocks.block_info_mut(block).pages_in_use += 1;
                if tags.chunk_id == 0 {
                    self.scan_header_chunk(&mut ctx, block, offset, &tags, false)?;
                } else {
                    self.scan_data_chunk(&ctx, block, offset, &tags, false)?;
                }
            }

            // the newest block keeps allocating from its unwritten tail
            let next = highest_used.map_or(0, |h| h + 1);
            if i == 0 && next < cpb {
                self.blocks.set_state(block, BlockState::Allocating);
                self.alloc_block = Some(block);
                self.alloc_page = next;
            } else {
                self.blocks.set_state(block, BlockState::Full);
            }
        }

        self.finish_scan_accounting();
        for block in to_erase {
            self.block_became_dirty(block)?;
        }
        self.scan_fixups()
    }

    /// Forward scan for legacy volumes: oldest first, serial arbitration,
    /// deletion markers honored on sight.
    pub(crate) fn scan_forward(&mut self) -> Result<()> {
        let (mut cands, to_erase) = self.classify_blocks()?;
        cands.sort_by(|a, b| a.seq.cmp(&b.seq));
        self.seq_number = cands.last().map_or(0, |c| c.seq);
        info!(
            target: "nlfs::scan",
            blocks_with_data = cands.len(),
            to_erase = to_erase.len(),
            "forward scan"
        );

        let cpb = self.param.geometry.chunks_per_block();
        let mut ctx = ScanCtx::default();
        let newest = cands.last().map(|c| c.block);
        for cand in &cands {
            let block = cand.block;
            self.blocks.set_state(block, BlockState::Scanning);
            let mut highest_used: Option<u32> = None;

            for offset in 0..cpb {
                let tags = self.read_scan_tags(block, offset)?;
                if !tags.chunk_used {
                    continue;
                }
                highest_used = Some(offset);
                if tags.is_deleted {
                    // a deleted-marker chunk is dead on sight
                    continue;
                }
                self.blocks.set_chunk_bit(block, offset);
                self.blocks.block_info_mut(block).pages_in_use += 1;
                if tags.chunk_id == 0 {
                    self.scan_header_chunk(&mut ctx, block, offset, &tags, true)?;
                } else {
                    self.scan_data_chunk(&ctx, block, offset, &tags, true)?;
                }
            }

            let next = highest_used.map_or(0, |h| h + 1);
            if Some(block) == newest && next < cpb {
                self.blocks.set_state(block, BlockState::Allocating);
                self.alloc_block = Some(block);
                self.alloc_page = next;
            } else {
                self.blocks.set_state(block, BlockState::Full);
            }
        }

        self.finish_scan_accounting();
        for block in to_erase {
            self.block_became_dirty(block)?;
        }
        self.scan_fixups()
    }

    // ── Post-scan fixups ────────────────────────────────────────────────

    fn scan_fixups(&mut self) -> Result<()> {
        // hard links into their targets' lists; dangling links die
        let links: Vec<(ObjectId, ObjectId)> = self
            .objects
            .iter()
            .filter_map(|o| match o.variant {
                Variant::Hardlink { equiv } => Some((o.id, equiv)),
                _ => None,
            })
            .collect();
        for (link, equiv) in links {
            let target_ok = matches!(
                self.objects.get(equiv).map(Object::object_type),
                Some(ObjectType::File | ObjectType::Directory)
            );
            if target_ok {
                let target = self.objects.get_mut(equiv).expect("checked above");
                if !target.hardlinks.contains(&link) {
                    target.hardlinks.push(link);
                }
            } else {
                warn!(target: "nlfs::scan", link = link.0, equiv = equiv.0, "dangling hard link dropped");
                self.free_deleted_object(link)?;
            }
        }

        // objects parked in the deletion pseudo-dirs resume dying; no
        // holders survive a remount, so UNLINKED collapses into the same
        // path
        let parked: Vec<ObjectId> = [ObjectId::UNLINKED, ObjectId::DELETED]
            .iter()
            .filter_map(|d| self.objects.get(*d).and_then(Object::as_dir))
            .flat_map(|d| d.children.clone())
            .collect();
        for id in parked {
            let has_data = self
                .objects
                .get(id)
                .and_then(Object::as_file)
                .is_some_and(|f| f.n_data_chunks > 0);
            if has_data && !self.param.format_v1 {
                if let Some(obj) = self.objects.get_mut(id) {
                    obj.deleted = true;
                    obj.soft_del = true;
                }
                self.soft_delete_file_chunks(id);
                self.stats.n_deleted_files += 1;
            } else {
                // legacy volumes delete hard; so does anything dataless
                self.trim_file_chunks(id, 0)?;
                self.free_deleted_object(id)?;
            }
        }

        // orphans and unreachable subtrees re-home to lost+found
        let ids = self.objects.ids();
        for id in ids {
            if id.is_pseudo() || !self.objects.contains(id) {
                continue;
            }
            let parent = self.objects.get(id).and_then(|o| o.parent);
            let parent_ok = parent.is_some_and(|p| self.objects.get(p).is_some_and(Object::is_dir));
            if !parent_ok {
                debug!(target: "nlfs::scan", id = id.0, "orphan re-homed to lost+found");
                self.add_obj_to_dir(ObjectId::LOST_AND_FOUND, id);
                continue;
            }
            // detect parent cycles that never reach a pseudo-root
            let mut at = id;
            let mut steps = 0u32;
            let reaches_root = loop {
                if at.is_pseudo() {
                    break true;
                }
                match self.objects.get(at).and_then(|o| o.parent) {
                    Some(p) => at = p,
                    None => break false,
                }
                steps += 1;
                if steps >= MAX_PARENT_DEPTH {
                    break false;
                }
            };
            if !reaches_root {
                debug!(target: "nlfs::scan", id = id.0, "unreachable object re-homed");
                self.add_obj_to_dir(ObjectId::LOST_AND_FOUND, id);
            }
        }

        // placeholders with neither header nor data never really existed
        let ghosts: Vec<ObjectId> = self
            .objects
            .iter()
            .filter(|o| {
                !o.fake
                    && o.hdr_chunk.is_none()
                    && o.as_file().is_some_and(|f| f.n_data_chunks == 0)
                    && !o.deleted
            })
            .map(|o| o.id)
            .collect();
        for id in ghosts {
            self.remove_obj_from_dir(id);
            self.objects.remove(id);
        }
        Ok(())
    }
}
