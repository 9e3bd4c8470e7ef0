#![forbid(unsafe_code)]
//! NAND driver contract, extended tags, tag marshalling, and a RAM-backed
//! simulator.
//!
//! The core consumes flash through the [`NandDriver`] trait and the
//! in-memory [`ExtTags`] record; the packed on-flash tag form and the
//! driver's storage strategy (out-of-band spare area vs inband payload
//! tail) are this crate's business.

mod ram;
mod tags;

pub use ram::{FaultPlan, RamNand, SharedNand};
pub use tags::{pack_tags, unpack_tags, TagMode, PACKED_TAGS_SIZE};

use nlfs_error::Result;
use nlfs_types::{BlockId, Geometry};

/// ECC outcome of a chunk read.
///
/// The core maps these to no-action / continue / prioritize-GC / retire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EccStatus {
    #[default]
    NoError,
    Corrected,
    /// Corrected, but the correction pattern suggests the block is tiring.
    Suspect,
    Uncorrectable,
}

/// Object type carried in header-chunk scan hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TagObjectType {
    #[default]
    Unknown,
    File,
    Symlink,
    Directory,
    Hardlink,
    Special,
}

impl TagObjectType {
    #[must_use]
    pub fn to_raw(self) -> u32 {
        match self {
            Self::Unknown => 0,
            Self::File => 1,
            Self::Symlink => 2,
            Self::Directory => 3,
            Self::Hardlink => 4,
            Self::Special => 5,
        }
    }

    #[must_use]
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::File,
            2 => Self::Symlink,
            3 => Self::Directory,
            4 => Self::Hardlink,
            5 => Self::Special,
            _ => Self::Unknown,
        }
    }
}

/// In-memory form of a chunk's tags.
///
/// `chunk_id` 0 marks an object header; data chunks carry their logical
/// chunk index offset by one. The `extra_*` fields are scan hints packed
/// into header-chunk tags so a backward scan can classify objects without
/// reading header bodies.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtTags {
    /// False for unprogrammed or unreadable chunks.
    pub chunk_used: bool,
    pub obj_id: u32,
    pub chunk_id: u32,
    pub n_bytes: u32,
    /// Write-generation counter, wraps modulo 4.
    pub serial_number: u8,
    /// Deleted marker (forward-scan volumes only).
    pub is_deleted: bool,
    /// Sequence number of the block this chunk was written into.
    pub seq_number: u64,

    pub extra_available: bool,
    pub extra_parent_id: u32,
    pub extra_is_shrink: bool,
    pub extra_shadows: u32,
    pub extra_obj_type: TagObjectType,
    pub extra_file_size: u64,

    /// Filled on reads; ignored on writes.
    pub ecc: EccStatus,
}

impl ExtTags {
    /// Tags for a data chunk holding logical chunk `logical` of `obj_id`.
    #[must_use]
    pub fn for_data(obj_id: u32, logical: u32, n_bytes: u32, seq: u64) -> Self {
        Self {
            chunk_used: true,
            obj_id,
            chunk_id: logical + 1,
            n_bytes,
            seq_number: seq,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_header(&self) -> bool {
        self.chunk_used && self.chunk_id == 0
    }

    /// True iff these tags identify `(obj_id, chunk_id)` and are live.
    #[must_use]
    pub fn matches(&self, obj_id: u32, chunk_id: u32) -> bool {
        self.chunk_used && self.obj_id == obj_id && self.chunk_id == chunk_id && !self.is_deleted
    }
}

/// Driver contract the core consumes.
///
/// All addressing is `(block, chunk_in_block)`. Implementations must not
/// retry internally; the core owns the retry and retire policy.
pub trait NandDriver: Send {
    fn geometry(&self) -> Geometry;

    /// Program one chunk. The chunk must be in the erased state.
    fn write_chunk(&mut self, block: BlockId, chunk: u32, data: &[u8], tags: &ExtTags)
        -> Result<()>;

    /// Read one chunk. Either output may be omitted. Unprogrammed chunks
    /// yield `chunk_used == false` tags and all-0xFF data.
    fn read_chunk(
        &mut self,
        block: BlockId,
        chunk: u32,
        data: Option<&mut [u8]>,
        tags: Option<&mut ExtTags>,
    ) -> Result<EccStatus>;

    /// Erase a whole block.
    fn erase_block(&mut self, block: BlockId) -> Result<()>;

    /// Record a factory-style bad-block mark.
    fn mark_bad(&mut self, block: BlockId) -> Result<()>;

    /// Query the bad-block mark. `true` means bad.
    fn check_bad(&mut self, block: BlockId) -> Result<bool>;
}
