//! RAM-backed NAND simulator.
//!
//! Behaves like a well-mannered raw NAND part: program-once chunks, whole
//! block erasure, a sticky bad-block mark, and a fault plan for tests
//! (hard write failures, silent corruption, ECC outcomes, erase failures).
//! Cloning the simulator snapshots the flash image, which is how the
//! harness models power loss.

use crate::tags::{pack_tags, unpack_tags, TagMode, PACKED_TAGS_SIZE};
use crate::{EccStatus, ExtTags, NandDriver};
use nlfs_error::{NlfsError, Result};
use nlfs_types::{BlockId, Geometry, StoredEndian};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, trace};

const IMAGE_MAGIC: &[u8; 8] = b"NLFSIMG1";

/// Test-only fault injection knobs.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    /// Fail this many upcoming writes outright (chunk left half-programmed).
    pub fail_writes: u32,
    /// Corrupt this many upcoming writes silently (write "succeeds", data
    /// lands with a flipped bit, so only a verify pass notices).
    pub corrupt_writes: u32,
    /// Blocks whose erase always fails.
    pub fail_erase_blocks: HashSet<u32>,
    /// Chunks that read back with an uncorrectable ECC status.
    pub uncorrectable: HashSet<(u32, u32)>,
    /// Chunks that read back corrected-but-suspect.
    pub suspect: HashSet<(u32, u32)>,
}

/// Cumulative operation counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct NandStats {
    pub writes: u64,
    pub reads: u64,
    pub erases: u64,
    pub failed_writes: u64,
    pub failed_erases: u64,
}

#[derive(Debug, Clone, Default)]
struct SimChunk {
    programmed: bool,
    data: Vec<u8>,
    spare: Vec<u8>,
}

/// In-memory NAND device.
#[derive(Debug, Clone)]
pub struct RamNand {
    geometry: Geometry,
    endian: StoredEndian,
    mode: TagMode,
    chunks: Vec<SimChunk>,
    bad: Vec<bool>,
    erase_counts: Vec<u32>,
    pub faults: FaultPlan,
    pub stats: NandStats,
}

impl RamNand {
    #[must_use]
    pub fn new(geometry: Geometry, endian: StoredEndian, mode: TagMode) -> Self {
        let total = geometry.total_chunks() as usize;
        Self {
            geometry,
            endian,
            mode,
            chunks: vec![SimChunk::default(); total],
            bad: vec![false; geometry.n_blocks() as usize],
            erase_counts: vec![0; geometry.n_blocks() as usize],
            faults: FaultPlan::default(),
            stats: NandStats::default(),
        }
    }

    /// Usable payload bytes per chunk under the current tag mode.
    #[must_use]
    pub fn payload_bytes(&self) -> usize {
        let raw = self.geometry.data_bytes_per_chunk() as usize;
        match self.mode {
            TagMode::Oob => raw,
            TagMode::Inband => raw - PACKED_TAGS_SIZE,
        }
    }

    #[must_use]
    pub fn endian(&self) -> StoredEndian {
        self.endian
    }

    #[must_use]
    pub fn tag_mode(&self) -> TagMode {
        self.mode
    }

    #[must_use]
    pub fn erase_count(&self, block: BlockId) -> u32 {
        self.erase_counts[block.0 as usize]
    }

    fn index(&self, block: BlockId, chunk: u32) -> Result<usize> {
        if block.0 >= self.geometry.n_blocks() || chunk >= self.geometry.chunks_per_block() {
            return Err(NlfsError::Nand {
                block: block.0,
                detail: "address out of range",
            });
        }
        Ok((block.0 * self.geometry.chunks_per_block() + chunk) as usize)
    }

    /// Overwrite a chunk with a torn program: data half-written, tag record
    /// unreadable. Models power loss mid-program.
    pub fn tear_chunk(&mut self, block: BlockId, chunk: u32) {
        if let Ok(idx) = self.index(block, chunk) {
            let slot = &mut self.chunks[idx];
            slot.programmed = true;
            slot.data = vec![0xA5; self.geometry.data_bytes_per_chunk() as usize];
            slot.spare = vec![0x00; PACKED_TAGS_SIZE];
        }
    }
}

impl NandDriver for RamNand {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn write_chunk(
        &mut self,
        block: BlockId,
        chunk: u32,
        data: &[u8],
        tags: &ExtTags,
    ) -> Result<()> {
        let idx = self.index(block, chunk)?;
        self.stats.writes += 1;

        if self.bad[block.0 as usize] {
            return Err(NlfsError::Nand {
                block: block.0,
                detail: "write to bad block",
            });
        }
        if data.len() > self.payload_bytes() {
            return Err(NlfsError::Nand {
                block: block.0,
                detail: "payload larger than chunk",
            });
        }
        if self.chunks[idx].programmed {
            // Real NAND can program further 0 bits into a written page;
            // the one legitimate use is the legacy deletion marker (same
            // identity, deleted flag newly set, no data).
            if tags.is_deleted && data.is_empty() && self.mode == TagMode::Oob {
                let packed = pack_tags(self.endian, tags);
                self.chunks[idx].spare = packed.to_vec();
                trace!(target: "nlfs::nand", block = block.0, chunk, "deletion marker programmed");
                return Ok(());
            }
            return Err(NlfsError::Nand {
                block: block.0,
                detail: "program on already-programmed chunk",
            });
        }

        if self.faults.fail_writes > 0 {
            self.faults.fail_writes -= 1;
            self.stats.failed_writes += 1;
            self.tear_chunk(block, chunk);
            debug!(target: "nlfs::nand", block = block.0, chunk, "injected write failure");
            return Err(NlfsError::Nand {
                block: block.0,
                detail: "program failed",
            });
        }

        let packed = pack_tags(self.endian, tags);
        let mut stored = data.to_vec();
        let payload_bytes = self.payload_bytes();
        let slot = &mut self.chunks[idx];
        slot.programmed = true;
        match self.mode {
            TagMode::Oob => {
                slot.spare = packed.to_vec();
            }
            TagMode::Inband => {
                stored.resize(payload_bytes, 0xFF);
                stored.extend_from_slice(&packed);
                slot.spare.clear();
            }
        }
        slot.data = stored;

        if self.faults.corrupt_writes > 0 {
            self.faults.corrupt_writes -= 1;
            if let Some(byte) = self.chunks[idx].data.first_mut() {
                *byte ^= 0x01;
            }
            debug!(target: "nlfs::nand", block = block.0, chunk, "injected silent corruption");
        }

        trace!(target: "nlfs::nand", block = block.0, chunk, bytes = data.len(), "programmed");
        Ok(())
    }

    fn read_chunk(
        &mut self,
        block: BlockId,
        chunk: u32,
        data: Option<&mut [u8]>,
        tags: Option<&mut ExtTags>,
    ) -> Result<EccStatus> {
        let idx = self.index(block, chunk)?;
        self.stats.reads += 1;
        let slot = &self.chunks[idx];

        let status = if self.faults.uncorrectable.contains(&(block.0, chunk)) {
            EccStatus::Uncorrectable
        } else if self.faults.suspect.contains(&(block.0, chunk)) {
            EccStatus::Suspect
        } else {
            EccStatus::NoError
        };

        if let Some(out) = data {
            if slot.programmed {
                let n = out.len().min(slot.data.len());
                out[..n].copy_from_slice(&slot.data[..n]);
                if n < out.len() {
                    out[n..].fill(0xFF);
                }
            } else {
                out.fill(0xFF);
            }
        }

        if let Some(out) = tags {
            let record = if !slot.programmed {
                None
            } else {
                match self.mode {
                    TagMode::Oob => unpack_tags(self.endian, &slot.spare),
                    TagMode::Inband => {
                        let tail_at = self.payload_bytes();
                        slot.data
                            .get(tail_at..tail_at + PACKED_TAGS_SIZE)
                            .and_then(|tail| unpack_tags(self.endian, tail))
                    }
                }
            };
            *out = record.unwrap_or_default();
            out.ecc = status;
        }

        Ok(status)
    }

    fn erase_block(&mut self, block: BlockId) -> Result<()> {
        let base = self.index(block, 0)?;
        self.stats.erases += 1;

        if self.faults.fail_erase_blocks.contains(&block.0) {
            self.stats.failed_erases += 1;
            debug!(target: "nlfs::nand", block = block.0, "injected erase failure");
            return Err(NlfsError::Nand {
                block: block.0,
                detail: "erase failed",
            });
        }

        for chunk in &mut self.chunks[base..base + self.geometry.chunks_per_block() as usize] {
            *chunk = SimChunk::default();
        }
        self.erase_counts[block.0 as usize] += 1;
        trace!(target: "nlfs::nand", block = block.0, "erased");
        Ok(())
    }

    fn mark_bad(&mut self, block: BlockId) -> Result<()> {
        let _ = self.index(block, 0)?;
        self.bad[block.0 as usize] = true;
        debug!(target: "nlfs::nand", block = block.0, "marked bad");
        Ok(())
    }

    fn check_bad(&mut self, block: BlockId) -> Result<bool> {
        let _ = self.index(block, 0)?;
        Ok(self.bad[block.0 as usize])
    }
}

// ── Flat image persistence ──────────────────────────────────────────────────

impl RamNand {
    /// Serialize the flash image to a flat byte vector.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(IMAGE_MAGIC);
        out.extend_from_slice(&self.geometry.n_blocks().to_le_bytes());
        out.extend_from_slice(&self.geometry.chunks_per_block().to_le_bytes());
        out.extend_from_slice(&self.geometry.data_bytes_per_chunk().to_le_bytes());
        out.push(match self.endian {
            StoredEndian::Little => 0,
            StoredEndian::Big => 1,
        });
        out.push(match self.mode {
            TagMode::Oob => 0,
            TagMode::Inband => 1,
        });
        for bad in &self.bad {
            out.push(u8::from(*bad));
        }
        for count in &self.erase_counts {
            out.extend_from_slice(&count.to_le_bytes());
        }
        let page = self.geometry.data_bytes_per_chunk() as usize;
        for chunk in &self.chunks {
            out.push(u8::from(chunk.programmed));
            if chunk.programmed {
                let mut data = chunk.data.clone();
                data.resize(page, 0xFF);
                out.extend_from_slice(&data);
                let mut spare = chunk.spare.clone();
                spare.resize(PACKED_TAGS_SIZE, 0xFF);
                out.extend_from_slice(&spare);
            }
        }
        out
    }

    /// Restore a flash image serialized by [`Self::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        fn take<'a>(bytes: &'a [u8], at: &mut usize, n: usize) -> Result<&'a [u8]> {
            let slice = bytes
                .get(*at..*at + n)
                .ok_or_else(|| NlfsError::NotFound("truncated NAND image".into()))?;
            *at += n;
            Ok(slice)
        }
        let mut at = 0usize;

        if take(bytes, &mut at, 8)? != IMAGE_MAGIC {
            return Err(NlfsError::NotFound("not an nlfs NAND image".into()));
        }
        let u32_at = |slice: &[u8]| u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]);
        let n_blocks = u32_at(take(bytes, &mut at, 4)?);
        let chunks_per_block = u32_at(take(bytes, &mut at, 4)?);
        let data_bytes = u32_at(take(bytes, &mut at, 4)?);
        let geometry = Geometry::new(n_blocks, chunks_per_block, data_bytes)
            .map_err(|_| NlfsError::NotFound("image geometry invalid".into()))?;
        let endian = match take(bytes, &mut at, 1)?[0] {
            0 => StoredEndian::Little,
            _ => StoredEndian::Big,
        };
        let mode = match take(bytes, &mut at, 1)?[0] {
            0 => TagMode::Oob,
            _ => TagMode::Inband,
        };

        let mut nand = Self::new(geometry, endian, mode);
        for b in 0..n_blocks as usize {
            nand.bad[b] = take(bytes, &mut at, 1)?[0] != 0;
        }
        for b in 0..n_blocks as usize {
            nand.erase_counts[b] = u32_at(take(bytes, &mut at, 4)?);
        }
        let page = data_bytes as usize;
        for i in 0..geometry.total_chunks() as usize {
            let programmed = take(bytes, &mut at, 1)?[0] != 0;
            if programmed {
                let data = take(bytes, &mut at, page)?.to_vec();
                let spare = take(bytes, &mut at, PACKED_TAGS_SIZE)?.to_vec();
                nand.chunks[i] = SimChunk {
                    programmed,
                    data,
                    spare,
                };
            }
        }
        Ok(nand)
    }
}

/// Cloneable handle sharing one [`RamNand`], so a mount can be dropped and
/// the flash remounted (power-loss tests) or inspected from outside.
#[derive(Debug, Clone)]
pub struct SharedNand(Arc<Mutex<RamNand>>);

impl SharedNand {
    #[must_use]
    pub fn new(nand: RamNand) -> Self {
        Self(Arc::new(Mutex::new(nand)))
    }

    /// Run `f` against the underlying simulator.
    pub fn with<R>(&self, f: impl FnOnce(&mut RamNand) -> R) -> R {
        f(&mut self.0.lock())
    }
}

impl NandDriver for SharedNand {
    fn geometry(&self) -> Geometry {
        self.0.lock().geometry()
    }

    fn write_chunk(
        &mut self,
        block: BlockId,
        chunk: u32,
        data: &[u8],
        tags: &ExtTags,
    ) -> Result<()> {
        self.0.lock().write_chunk(block, chunk, data, tags)
    }

    fn read_chunk(
        &mut self,
        block: BlockId,
        chunk: u32,
        data: Option<&mut [u8]>,
        tags: Option<&mut ExtTags>,
    ) -> Result<EccStatus> {
        self.0.lock().read_chunk(block, chunk, data, tags)
    }

    fn erase_block(&mut self, block: BlockId) -> Result<()> {
        self.0.lock().erase_block(block)
    }

    fn mark_bad(&mut self, block: BlockId) -> Result<()> {
        self.0.lock().mark_bad(block)
    }

    fn check_bad(&mut self, block: BlockId) -> Result<bool> {
        self.0.lock().check_bad(block)
    }
}
