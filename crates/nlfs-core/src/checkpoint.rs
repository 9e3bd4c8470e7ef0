//! Fast-mount checkpoint stream.
//!
//! `sync(checkpoint)` snapshots the block table, counters, and object
//! records (index trees flattened to `(logical, physical)` pairs) into a
//! framed stream written across whole erased blocks. Mount restores from
//! it when the frame validates; any later mutation invalidates the
//! stream by surrendering its blocks to erasure, so a stale checkpoint
//! can never shadow newer log writes.

use crate::device::Device;
use crate::object::{Object, ObjectType, Variant};
use crate::tnode;
use crate::xattr::XattrEntry;
use nlfs_block::{BlockState, BlockTableSnapshot};
use nlfs_error::Result;
use nlfs_nand::ExtTags;
use nlfs_types::{crc32, BlockId, Geometry, ObjectId, PhysChunk, SeqNumber};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Reserved top-bit object id tagging checkpoint stream chunks.
pub const CHECKPOINT_OBJECT_ID: u32 = 0x8000_0001;

const CHECKPOINT_MAGIC: u32 = 0x4E4C_4653;
const CHECKPOINT_VERSION: u32 = 1;
const FRAME_BYTES: usize = 16;

#[derive(Debug, Serialize, Deserialize)]
enum CheckpointVariant {
    File {
        file_size: u64,
        stored_size: u64,
        shrink_size: u64,
        n_data_chunks: i32,
        entries: Vec<(u32, u32)>,
    },
    Dir {
        children: Vec<u32>,
    },
    Symlink {
        alias: String,
    },
    Hardlink {
        equiv: u32,
    },
    Special {
        rdev: u32,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointObject {
    id: u32,
    parent: Option<u32>,
    hdr_chunk: u32,
    short_name: Option<String>,
    sum: u16,
    mode: u32,
    uid: u32,
    gid: u32,
    atime: u64,
    mtime: u64,
    ctime: u64,
    serial: u8,
    deleted: bool,
    soft_del: bool,
    unlinked: bool,
    fake: bool,
    lazy_loaded: bool,
    xattrs: Vec<XattrEntry>,
    hardlinks: Vec<u32>,
    variant: CheckpointVariant,
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointData {
    geometry: Geometry,
    seq_number: u64,
    alloc_block: Option<u32>,
    alloc_page: u32,
    n_erased_blocks: u32,
    n_free_chunks: u32,
    blocks: BlockTableSnapshot,
    objects: Vec<CheckpointObject>,
}

impl Device {
    // ── Reserve estimate ────────────────────────────────────────────────

    /// Blocks the reserve policy must hold back for a checkpoint. A
    /// deliberate over-estimate of the serialized size, cached until the
    /// object population or tree shapes change.
    pub(crate) fn calc_checkpt_blocks_required(&mut self) -> u32 {
        if !self.param.use_checkpoint {
            return 0;
        }
        if let Some(estimate) = self.checkpt_blocks_estimate {
            return estimate;
        }
        let geometry = self.param.geometry;
        let n_objects = self.objects.len();
        let n_tnodes = self.objects.total_tnodes();
        // the JSON body is bulky; over-estimating only costs reserve
        let bytes = 1024
            + geometry.n_blocks() as usize * (geometry.bitmap_stride() * 4 + 192)
            + n_objects * 512
            + n_tnodes * (self.layout.leaf_bytes * 8 + 128);
        let per_block = self.param.data_bytes() * geometry.chunks_per_block() as usize;
        let estimate = u32::try_from(bytes.div_ceil(per_block)).unwrap_or(u32::MAX) + 1;
        self.checkpt_blocks_estimate = Some(estimate);
        estimate
    }

    // ── Invalidation ────────────────────────────────────────────────────

    /// Any write that is not part of the checkpoint makes it stale:
    /// surrender its blocks for erasure.
    pub(crate) fn invalidate_checkpoint(&mut self) -> Result<()> {
        if !self.checkpoint_valid {
            return Ok(());
        }
        self.checkpoint_valid = false;
        let cpb = self.param.geometry.chunks_per_block();
        let stream: Vec<BlockId> = self
            .blocks
            .iter()
            .filter(|(_, info)| info.state == BlockState::Checkpoint)
            .map(|(block, _)| block)
            .collect();
        debug!(target: "nlfs::checkpoint", blocks = stream.len(), "checkpoint invalidated");
        for block in stream {
            self.n_free_chunks += cpb;
            self.block_became_dirty(block)?;
        }
        Ok(())
    }

    // ── Write ───────────────────────────────────────────────────────────

    fn snapshot(&self) -> CheckpointData {
        let layout = self.layout;
        let objects = self
            .objects
            .iter()
            .map(|obj| {
                let variant = match &obj.variant {
                    Variant::File(f) => {
                        let mut entries = Vec::new();
                        tnode::collect_entries(
                            &layout,
                            f.top.as_deref(),
                            f.top_level,
                            0,
                            &mut entries,
                        );
                        CheckpointVariant::File {
                            file_size: f.file_size,
                            stored_size: f.stored_size,
                            shrink_size: f.shrink_size,
                            n_data_chunks: f.n_data_chunks,
                            entries,
                        }
                    }
                    Variant::Dir(d) => CheckpointVariant::Dir {
                        children: d.children.iter().map(|c| c.0).collect(),
                    },
                    Variant::Symlink { alias } => CheckpointVariant::Symlink {
                        alias: alias.clone(),
                    },
                    Variant::Hardlink { equiv } => CheckpointVariant::Hardlink { equiv: equiv.0 },
                    Variant::Special { rdev } => CheckpointVariant::Special { rdev: *rdev },
                };
                CheckpointObject {
                    id: obj.id.0,
                    parent: obj.parent.map(|p| p.0),
                    hdr_chunk: obj.hdr_chunk.0,
                    short_name: obj.short_name.clone(),
                    sum: obj.sum,
                    mode: obj.mode,
                    uid: obj.uid,
                    gid: obj.gid,
                    atime: obj.atime,
                    mtime: obj.mtime,
                    ctime: obj.ctime,
                    serial: obj.serial,
                    deleted: obj.deleted,
                    soft_del: obj.soft_del,
                    unlinked: obj.unlinked,
                    fake: obj.fake,
                    lazy_loaded: obj.lazy_loaded,
                    xattrs: obj.xattrs.clone(),
                    hardlinks: obj.hardlinks.iter().map(|l| l.0).collect(),
                    variant,
                }
            })
            .collect();
        CheckpointData {
            geometry: self.param.geometry,
            seq_number: self.seq_number,
            alloc_block: self.alloc_block.map(|b| b.0),
            alloc_page: self.alloc_page,
            n_erased_blocks: self.n_erased_blocks,
            n_free_chunks: self.n_free_chunks,
            blocks: self.blocks.to_snapshot(),
            objects,
        }
    }

    /// Serialize and write the checkpoint stream. Best-effort: when the
    /// stream does not fit the available erased blocks the volume simply
    /// stays checkpoint-less and the next mount scans.
    pub(crate) fn write_checkpoint(&mut self) -> Result<()> {
        if !self.param.use_checkpoint {
            return Ok(());
        }
        self.invalidate_checkpoint()?;

        let body = match serde_json::to_vec(&self.snapshot()) {
            Ok(body) => body,
            Err(err) => {
                warn!(target: "nlfs::checkpoint", %err, "serialize failed, skipping checkpoint");
                return Ok(());
            }
        };
        let mut stream = Vec::with_capacity(FRAME_BYTES + body.len());
        stream.extend_from_slice(&CHECKPOINT_MAGIC.to_le_bytes());
        stream.extend_from_slice(&CHECKPOINT_VERSION.to_le_bytes());
        stream.extend_from_slice(&(u32::try_from(body.len()).unwrap_or(0)).to_le_bytes());
        stream.extend_from_slice(&crc32(&body).to_le_bytes());
        stream.extend_from_slice(&body);

        let chunk_bytes = self.param.data_bytes();
        let cpb = self.param.geometry.chunks_per_block();
        let n_chunks = stream.len().div_ceil(chunk_bytes);
        let n_blocks_needed = u32::try_from(n_chunks.div_ceil(cpb as usize)).unwrap_or(u32::MAX);

        let empties: Vec<BlockId> = self
            .blocks
            .iter()
            .filter(|(block, info)| {
                info.state == BlockState::Empty && Some(*block) != self.alloc_block
            })
            .map(|(block, _)| block)
            .take(n_blocks_needed as usize)
            .collect();
        if empties.len() < n_blocks_needed as usize {
            warn!(
                target: "nlfs::checkpoint",
                needed = n_blocks_needed,
                have = empties.len(),
                "not enough erased blocks, skipping checkpoint"
            );
            return Ok(());
        }

        // write the whole stream first; blocks are only marked once every
        // chunk landed, so an abort leaves nothing half-claimed
        let mut chunk_index = 0u32;
        let mut block_seqs = Vec::with_capacity(empties.len());
        for block in &empties {
            self.seq_number += 1;
            let seq = self.seq_number;
            block_seqs.push(seq);
            for offset in 0..cpb {
                let at = chunk_index as usize * chunk_bytes;
                if at >= stream.len() {
                    break;
                }
                let end = (at + chunk_bytes).min(stream.len());
                let mut data = stream[at..end].to_vec();
                data.resize(chunk_bytes, 0xFF);
                let tags = ExtTags {
                    chunk_used: true,
                    obj_id: CHECKPOINT_OBJECT_ID,
                    chunk_id: chunk_index + 1,
                    n_bytes: u32::try_from(end - at).unwrap_or(0),
                    seq_number: seq,
                    ..ExtTags::default()
                };
                if let Err(err) = self.driver.write_chunk(*block, offset, &data, &tags) {
                    warn!(target: "nlfs::checkpoint", %err, "checkpoint write failed, abandoning");
                    // erase the partial stream so the next mount ignores it
                    for written in &empties {
                        let _ = self.driver.erase_block(*written);
                    }
                    return Ok(());
                }
                self.stats.n_page_writes += 1;
                chunk_index += 1;
            }
        }
        for (block, seq) in empties.iter().zip(block_seqs) {
            let info = self.blocks.block_info_mut(*block);
            info.state = BlockState::Checkpoint;
            info.seq_number = SeqNumber(seq);
            self.n_erased_blocks -= 1;
            self.n_free_chunks -= cpb;
        }
        self.checkpoint_valid = true;
        info!(
            target: "nlfs::checkpoint",
            bytes = stream.len(),
            blocks = empties.len(),
            "checkpoint written"
        );
        Ok(())
    }

    // ── Restore ─────────────────────────────────────────────────────────

    /// Try to restore RAM state from a checkpoint stream. Returns false
    /// (leaving the device untouched) when no valid stream exists.
    pub(crate) fn restore_from_checkpoint(&mut self) -> Result<bool> {
        let geometry = self.param.geometry;
        let cpb = geometry.chunks_per_block();
        let chunk_bytes = self.param.data_bytes();

        // locate stream blocks by their first chunk's tags
        let mut stream_blocks = Vec::new();
        for b in 0..geometry.n_blocks() {
            let block = BlockId(b);
            if !self.param.format_v1 && self.driver.check_bad(block)? {
                continue;
            }
            let mut tags = ExtTags::default();
            self.driver.read_chunk(block, 0, None, Some(&mut tags))?;
            if tags.chunk_used && tags.obj_id == CHECKPOINT_OBJECT_ID {
                stream_blocks.push((tags.seq_number, block));
            }
        }
        if stream_blocks.is_empty() {
            return Ok(false);
        }
        stream_blocks.sort_unstable();

        // reassemble in chunk_id order
        let mut pieces: Vec<(u32, Vec<u8>)> = Vec::new();
        for (_, block) in &stream_blocks {
            for offset in 0..cpb {
                let mut data = vec![0u8; chunk_bytes];
                let mut tags = ExtTags::default();
                if self
                    .driver
                    .read_chunk(*block, offset, Some(&mut data), Some(&mut tags))
                    .is_err()
                {
                    return Ok(false);
                }
                if !tags.chunk_used {
                    break;
                }
                if tags.obj_id != CHECKPOINT_OBJECT_ID || tags.chunk_id == 0 {
                    return Ok(false);
                }
                data.truncate(tags.n_bytes as usize);
                pieces.push((tags.chunk_id, data));
            }
        }
        pieces.sort_by_key(|(id, _)| *id);
        if pieces
            .iter()
            .enumerate()
            .any(|(i, (id, _))| *id != u32::try_from(i + 1).unwrap_or(0))
        {
            warn!(target: "nlfs::checkpoint", "stream has holes, falling back to scan");
            return Ok(false);
        }
        let stream: Vec<u8> = pieces.into_iter().flat_map(|(_, data)| data).collect();
        if stream.len() < FRAME_BYTES {
            return Ok(false);
        }

        let word = |at: usize| u32::from_le_bytes([stream[at], stream[at + 1], stream[at + 2], stream[at + 3]]);
        if word(0) != CHECKPOINT_MAGIC || word(4) != CHECKPOINT_VERSION {
            return Ok(false);
        }
        let body_len = word(8) as usize;
        let stored_crc = word(12);
        let Some(body) = stream.get(FRAME_BYTES..FRAME_BYTES + body_len) else {
            return Ok(false);
        };
        if crc32(body) != stored_crc {
            warn!(target: "nlfs::checkpoint", "checkpoint CRC mismatch, falling back to scan");
            return Ok(false);
        }
        let Ok(data) = serde_json::from_slice::<CheckpointData>(body) else {
            return Ok(false);
        };
        if data.geometry != geometry {
            return Ok(false);
        }

        // validated: commit to RAM
        if !self.blocks.restore(data.blocks) {
            return Ok(false);
        }
        self.seq_number = data.seq_number;
        self.alloc_block = data.alloc_block.map(BlockId);
        self.alloc_page = data.alloc_page;
        self.n_erased_blocks = data.n_erased_blocks;
        self.n_free_chunks = data.n_free_chunks;
        let layout = self.layout;
        for record in data.objects {
            let object_type = match &record.variant {
                CheckpointVariant::File { .. } => ObjectType::File,
                CheckpointVariant::Dir { .. } => ObjectType::Directory,
                CheckpointVariant::Symlink { .. } => ObjectType::Symlink,
                CheckpointVariant::Hardlink { .. } => ObjectType::Hardlink,
                CheckpointVariant::Special { .. } => ObjectType::Special,
            };
            let mut obj = Object::new(ObjectId(record.id), object_type);
            obj.parent = record.parent.map(ObjectId);
            obj.hdr_chunk = PhysChunk(record.hdr_chunk);
            obj.short_name = record.short_name;
            obj.sum = record.sum;
            obj.mode = record.mode;
            obj.uid = record.uid;
            obj.gid = record.gid;
            obj.atime = record.atime;
            obj.mtime = record.mtime;
            obj.ctime = record.ctime;
            obj.serial = record.serial;
            obj.deleted = record.deleted;
            obj.soft_del = record.soft_del;
            obj.unlinked = record.unlinked;
            obj.fake = record.fake;
            obj.lazy_loaded = record.lazy_loaded;
            obj.xattrs = record.xattrs;
            obj.hardlinks = record.hardlinks.into_iter().map(ObjectId).collect();
            match record.variant {
                CheckpointVariant::File {
                    file_size,
                    stored_size,
                    shrink_size,
                    n_data_chunks,
                    entries,
                } => {
                    let file = obj.as_file_mut().expect("file variant");
                    file.file_size = file_size;
                    file.stored_size = stored_size;
                    file.shrink_size = shrink_size;
                    file.n_data_chunks = n_data_chunks;
                    let mut top = None;
                    let mut top_level = 0;
                    for (logical, phys) in entries {
                        tnode::set(&layout, &mut top, &mut top_level, logical, phys)?;
                    }
                    file.top = top;
                    file.top_level = top_level;
                }
                CheckpointVariant::Dir { children } => {
                    let dir = obj.as_dir_mut().expect("dir variant");
                    dir.children = children.into_iter().map(ObjectId).collect();
                }
                CheckpointVariant::Symlink { alias } => {
                    if let Variant::Symlink { alias: slot } = &mut obj.variant {
                        *slot = alias;
                    }
                }
                CheckpointVariant::Hardlink { equiv } => {
                    if let Variant::Hardlink { equiv: slot } = &mut obj.variant {
                        *slot = ObjectId(equiv);
                    }
                }
                CheckpointVariant::Special { rdev } => {
                    if let Variant::Special { rdev: slot } = &mut obj.variant {
                        *slot = rdev;
                    }
                }
            }
            self.objects.insert(obj);
        }

        // the stream blocks themselves were erased when the snapshot was
        // taken; account for them now
        for (seq, block) in &stream_blocks {
            let info = self.blocks.block_info_mut(*block);
            info.state = BlockState::Checkpoint;
            info.seq_number = SeqNumber(*seq);
            info.pages_in_use = 0;
            info.soft_del_pages = 0;
            self.n_erased_blocks = self.n_erased_blocks.saturating_sub(1);
            self.n_free_chunks = self
                .n_free_chunks
                .saturating_sub(cpb);
        }
        self.checkpoint_valid = true;
        info!(
            target: "nlfs::checkpoint",
            objects = self.objects.len(),
            "restored from checkpoint"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceParam;
    use crate::cx::Cx;
    use nlfs_nand::{NandDriver, RamNand, SharedNand, TagMode};
    use nlfs_types::StoredEndian;

    fn device() -> (SharedNand, Device) {
        let geometry = Geometry::new(32, 32, 512).unwrap();
        let nand = SharedNand::new(RamNand::new(geometry, StoredEndian::Little, TagMode::Oob));
        let mut dev = Device::new(Box::new(nand.clone()), DeviceParam::new(geometry)).unwrap();
        dev.format().unwrap();
        dev.mount().unwrap();
        (nand, dev)
    }

    #[test]
    fn estimate_grows_with_population() {
        let (_nand, mut dev) = device();
        let base = dev.calc_checkpt_blocks_required();
        let root = dev.root();
        for i in 0..120 {
            dev.create_file(root, &format!("n{i}"), 0o644, 0, 0).unwrap();
        }
        // creation invalidated the cache via header writes' tree churn;
        // force a fresh computation either way
        dev.checkpt_blocks_estimate = None;
        assert!(dev.calc_checkpt_blocks_required() > base);
    }

    #[test]
    fn estimate_is_zero_without_checkpoints() {
        let geometry = Geometry::new(16, 32, 512).unwrap();
        let nand = SharedNand::new(RamNand::new(geometry, StoredEndian::Little, TagMode::Oob));
        let mut param = DeviceParam::new(geometry);
        param.use_checkpoint = false;
        let mut dev = Device::new(Box::new(nand), param).unwrap();
        dev.format().unwrap();
        dev.mount().unwrap();
        assert_eq!(dev.calc_checkpt_blocks_required(), 0);
    }

    #[test]
    fn write_marks_blocks_and_invalidate_releases_them() {
        let (_nand, mut dev) = device();
        let root = dev.root();
        let id = dev.create_file(root, "data", 0o644, 0, 0).unwrap();
        dev.write_file(&Cx::none(), id, 0, &[1; 512], false).unwrap();
        dev.sync(true).unwrap();
        assert!(dev.checkpoint_valid);

        let checkpoint_blocks = dev
            .blocks
            .iter()
            .filter(|(_, info)| info.state == BlockState::Checkpoint)
            .count();
        assert!(checkpoint_blocks >= 1);
        dev.check_invariants().expect("accounting with checkpoint");

        // the first post-checkpoint write hands the blocks back
        dev.write_file(&Cx::none(), id, 512, &[2; 512], false).unwrap();
        assert!(!dev.checkpoint_valid);
        let still_checkpoint = dev
            .blocks
            .iter()
            .filter(|(_, info)| info.state == BlockState::Checkpoint)
            .count();
        assert_eq!(still_checkpoint, 0);
        dev.check_invariants().expect("accounting after invalidation");
    }

    #[test]
    fn corrupt_stream_falls_back_to_scan() {
        let (nand, mut dev) = device();
        let root = dev.root();
        let id = dev.create_file(root, "data", 0o644, 0, 0).unwrap();
        dev.write_file(&Cx::none(), id, 0, &[7; 512], false).unwrap();
        dev.sync(true).unwrap();
        let stream_block = dev
            .blocks
            .iter()
            .find(|(_, info)| info.state == BlockState::Checkpoint)
            .map(|(block, _)| block)
            .expect("checkpoint written");
        drop(dev);

        // flip a byte inside the stream body
        nand.with(|n| {
            let geometry = n.geometry();
            let mut data = vec![0u8; 512];
            let mut tags = ExtTags::default();
            n.read_chunk(stream_block, 0, Some(&mut data), Some(&mut tags))
                .unwrap();
            n.erase_block(stream_block).unwrap();
            data[40] ^= 0xFF;
            n.write_chunk(stream_block, 0, &data, &tags).unwrap();
            let _ = geometry;
        });

        let geometry = Geometry::new(32, 32, 512).unwrap();
        let mut dev = Device::new(Box::new(nand), DeviceParam::new(geometry)).unwrap();
        dev.mount().unwrap();
        // the scan path still recovers the file
        let found = dev.lookup(dev.root(), "data").unwrap();
        let mut buf = vec![0u8; 512];
        let n = dev.read_file(&Cx::none(), found, 0, &mut buf).unwrap();
        assert_eq!(n, 512);
        assert!(buf.iter().all(|b| *b == 7));
        dev.check_invariants().expect("post-fallback accounting");
    }
}
