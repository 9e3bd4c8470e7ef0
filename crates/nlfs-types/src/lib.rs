#![forbid(unsafe_code)]
//! Shared identifier types and device geometry for nlfs.
//!
//! Everything here is a unit-carrying wrapper or a validated parameter
//! bundle; no flash state lives in this crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Number of object-table hash buckets. Power of two.
pub const N_OBJECT_BUCKETS: u32 = 256;

/// Names at or below this length are stored inline in the object record.
pub const SHORT_NAME_LEN: usize = 15;

/// Maximum object name length (bytes, excluding terminator).
pub const MAX_NAME_LEN: usize = 255;

/// Maximum symlink alias length (bytes).
pub const MAX_ALIAS_LEN: usize = 159;

/// Symlink resolution depth limit before the façade reports a loop.
pub const MAX_LINK_DEPTH: u32 = 5;

/// Parent-chain walk limit used to detect unreachable objects at scan time.
pub const MAX_PARENT_DEPTH: u32 = 100;

/// Object identifier, unique within one volume.
///
/// Ids 1–4 are reserved for the pseudo-directories; id 0 is never valid on
/// flash (tags with `object_id == 0` mark unprogrammed chunks).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u32);

impl ObjectId {
    /// Holds objects that were unlinked while still externally open.
    pub const UNLINKED: Self = Self(1);
    /// Holds soft-deleted objects until their data chunks are reclaimed.
    pub const DELETED: Self = Self(2);
    /// The root directory.
    pub const ROOT: Self = Self(3);
    /// Receives orphans whose parent could not be reconstructed.
    pub const LOST_AND_FOUND: Self = Self(4);

    /// First id eligible for normal allocation.
    pub const FIRST_ALLOCATABLE: u32 = 5;

    #[must_use]
    pub fn is_pseudo(self) -> bool {
        (1..Self::FIRST_ALLOCATABLE).contains(&self.0)
    }

    /// Hash-bucket index for the object table.
    #[must_use]
    pub fn bucket(self) -> usize {
        (self.0 % N_OBJECT_BUCKETS) as usize
    }
}

/// Erase-block index within the device, zero-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u32);

/// Flat physical chunk index across the whole device.
///
/// Index-tree leaves use 0 for "no chunk", so the flat numbering is offset
/// by one block's worth of chunks: block 0 chunk 0 is `PhysChunk(
/// chunks_per_block)`, and values below that never occur (see
/// [`Geometry::chunk`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PhysChunk(pub u32);

impl PhysChunk {
    /// Sentinel for "no chunk"; equals the packed-leaf null value.
    pub const NONE: Self = Self(0);

    #[must_use]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// Per-block write-ordering sequence number.
///
/// Assigned when a block first enters `Allocating`; totally orders all
/// writes across the device.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct SeqNumber(pub u64);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("chunks_per_block must be a power of two >= 2, got {0}")]
    BadChunksPerBlock(u32),
    #[error("data_bytes_per_chunk must be in 256..=16384, got {0}")]
    BadChunkBytes(u32),
    #[error("device needs at least {min} blocks, got {got}")]
    TooFewBlocks { min: u32, got: u32 },
    #[error("total chunk count overflows u32")]
    TooManyChunks,
}

/// Validated device shape: blocks × chunks × payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    n_blocks: u32,
    chunks_per_block: u32,
    data_bytes_per_chunk: u32,
}

impl Geometry {
    /// Minimum block count: room for the allocator, the reserve, and GC to
    /// make forward progress.
    pub const MIN_BLOCKS: u32 = 4;

    pub fn new(
        n_blocks: u32,
        chunks_per_block: u32,
        data_bytes_per_chunk: u32,
    ) -> Result<Self, GeometryError> {
        if chunks_per_block < 2 || !chunks_per_block.is_power_of_two() {
            return Err(GeometryError::BadChunksPerBlock(chunks_per_block));
        }
        if !(256..=16384).contains(&data_bytes_per_chunk) {
            return Err(GeometryError::BadChunkBytes(data_bytes_per_chunk));
        }
        if n_blocks < Self::MIN_BLOCKS {
            return Err(GeometryError::TooFewBlocks {
                min: Self::MIN_BLOCKS,
                got: n_blocks,
            });
        }
        if n_blocks
            .checked_add(1)
            .and_then(|n| n.checked_mul(chunks_per_block))
            .is_none()
        {
            return Err(GeometryError::TooManyChunks);
        }
        Ok(Self {
            n_blocks,
            chunks_per_block,
            data_bytes_per_chunk,
        })
    }

    #[must_use]
    pub fn n_blocks(self) -> u32 {
        self.n_blocks
    }

    #[must_use]
    pub fn chunks_per_block(self) -> u32 {
        self.chunks_per_block
    }

    #[must_use]
    pub fn data_bytes_per_chunk(self) -> u32 {
        self.data_bytes_per_chunk
    }

    #[must_use]
    pub fn total_chunks(self) -> u32 {
        self.n_blocks * self.chunks_per_block
    }

    /// Flat chunk index for `(block, offset)`.
    ///
    /// The numbering is offset by one block so that 0 stays free as the
    /// index-tree null.
    ///
    /// # Panics
    /// Out-of-range arguments are a programming error.
    #[must_use]
    pub fn chunk(self, block: BlockId, offset: u32) -> PhysChunk {
        assert!(block.0 < self.n_blocks, "block {} out of range", block.0);
        assert!(
            offset < self.chunks_per_block,
            "chunk offset {offset} out of range"
        );
        PhysChunk((block.0 + 1) * self.chunks_per_block + offset)
    }

    /// Split a flat chunk index into `(block, offset_in_block)`.
    ///
    /// # Panics
    /// Out-of-range arguments are a programming error.
    #[must_use]
    pub fn split(self, chunk: PhysChunk) -> (BlockId, u32) {
        assert!(
            chunk.0 >= self.chunks_per_block && chunk.0 < self.addressable_chunks(),
            "chunk {} out of range",
            chunk.0
        );
        (
            BlockId(chunk.0 / self.chunks_per_block - 1),
            chunk.0 % self.chunks_per_block,
        )
    }

    /// One past the highest flat chunk index, including the null offset.
    ///
    /// This is the range the index tree must be able to address.
    #[must_use]
    pub fn addressable_chunks(self) -> u32 {
        (self.n_blocks + 1) * self.chunks_per_block
    }

    #[must_use]
    pub fn block_of(self, chunk: PhysChunk) -> BlockId {
        self.split(chunk).0
    }

    /// Bytes per block in the chunk bitmap.
    #[must_use]
    pub fn bitmap_stride(self) -> usize {
        (self.chunks_per_block as usize).div_ceil(8)
    }

    /// Number of whole chunks needed to hold `n_bytes` of file data.
    #[must_use]
    pub fn chunks_for_bytes(self, n_bytes: u64) -> u64 {
        n_bytes.div_ceil(u64::from(self.data_bytes_per_chunk))
    }
}

// ── Stored-size protocol ────────────────────────────────────────────────────
//
// File sizes are stored in the object header as two 32-bit halves. A high
// half of !0 is the sentinel for "written by a 32-bit volume"; the load
// path then uses only the low half. Sizes whose high half would collide
// with the sentinel are clamped down one full 2^32 step.

/// Largest size representable by the two-halves encoding.
pub const FSIZE_MAX: u64 = 0xFFFF_FFFE_FFFF_FFFF;

/// Split a 64-bit size into `(low, high)` header halves.
#[must_use]
pub fn fsize_split(size: u64) -> (u32, u32) {
    let clamped = size.min(FSIZE_MAX);
    #[allow(clippy::cast_possible_truncation)]
    let low = clamped as u32;
    let high = (clamped >> 32) as u32;
    (low, high)
}

/// Combine header halves back into a size.
#[must_use]
pub fn fsize_combine(low: u32, high: u32) -> u64 {
    if high == u32::MAX {
        u64::from(low)
    } else {
        (u64::from(high) << 32) | u64::from(low)
    }
}

// ── Name checksum ───────────────────────────────────────────────────────────

/// 16-bit positional checksum used to prefilter directory name scans.
///
/// The `0x1f` mask folds ASCII case, so the checksum is usable for both
/// case-sensitive and case-insensitive volumes.
#[must_use]
pub fn name_checksum(name: &str) -> u16 {
    let mut sum = 0u16;
    for (i, byte) in name.bytes().enumerate() {
        if i + 1 >= MAX_NAME_LEN / 2 {
            break;
        }
        #[allow(clippy::cast_possible_truncation)]
        let weight = (i + 1) as u16;
        sum = sum.wrapping_add(u16::from(byte & 0x1f).wrapping_mul(weight));
    }
    sum
}

/// Case-folded name equality for case-insensitive volumes.
#[must_use]
pub fn names_equal(a: &str, b: &str, case_insensitive: bool) -> bool {
    if case_insensitive {
        a.eq_ignore_ascii_case(b)
    } else {
        a == b
    }
}

// ── CRC-32 (IEEE) ───────────────────────────────────────────────────────────

/// CRC-32 (IEEE 802.3 polynomial, reflected) over `bytes`.
///
/// Used for tag integrity words and checkpoint framing.
#[must_use]
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = !0u32;
    for &byte in bytes {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

// ── Stored endianness ───────────────────────────────────────────────────────

/// Byte order applied uniformly to headers and packed tags at mount time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StoredEndian {
    #[default]
    Little,
    Big,
}

impl StoredEndian {
    #[must_use]
    pub fn read_u16(self, bytes: [u8; 2]) -> u16 {
        match self {
            Self::Little => u16::from_le_bytes(bytes),
            Self::Big => u16::from_be_bytes(bytes),
        }
    }

    #[must_use]
    pub fn read_u32(self, bytes: [u8; 4]) -> u32 {
        match self {
            Self::Little => u32::from_le_bytes(bytes),
            Self::Big => u32::from_be_bytes(bytes),
        }
    }

    #[must_use]
    pub fn write_u16(self, value: u16) -> [u8; 2] {
        match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        }
    }

    #[must_use]
    pub fn write_u32(self, value: u32) -> [u8; 4] {
        match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PhysChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_validation() {
        assert!(Geometry::new(16, 32, 512).is_ok());
        assert!(Geometry::new(16, 2, 2048).is_ok());

        // chunks_per_block must be a power of two >= 2
        assert!(Geometry::new(16, 0, 512).is_err());
        assert!(Geometry::new(16, 1, 512).is_err());
        assert!(Geometry::new(16, 33, 512).is_err());
        // data bytes bounds
        assert!(Geometry::new(16, 32, 128).is_err());
        assert!(Geometry::new(16, 32, 32768).is_err());
        // minimum block count
        assert!(Geometry::new(3, 32, 512).is_err());
    }

    #[test]
    fn geometry_conversions() {
        let g = Geometry::new(16, 32, 512).unwrap();
        assert_eq!(g.total_chunks(), 512);
        assert_eq!(g.addressable_chunks(), 544);
        // numbering starts one block in, so 0 stays free as the tree null
        assert_eq!(g.chunk(BlockId(0), 0), PhysChunk(32));
        assert_eq!(g.chunk(BlockId(1), 0), PhysChunk(64));
        assert_eq!(g.chunk(BlockId(2), 5), PhysChunk(101));
        assert_eq!(g.split(PhysChunk(101)), (BlockId(2), 5));
        assert_eq!(g.split(PhysChunk(32)), (BlockId(0), 0));
        assert_eq!(g.bitmap_stride(), 4);
        assert_eq!(g.chunks_for_bytes(0), 0);
        assert_eq!(g.chunks_for_bytes(1), 1);
        assert_eq!(g.chunks_for_bytes(512), 1);
        assert_eq!(g.chunks_for_bytes(513), 2);
        assert_eq!(g.chunks_for_bytes(1500), 3);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn geometry_split_out_of_range_panics() {
        let g = Geometry::new(16, 32, 512).unwrap();
        let _ = g.split(PhysChunk(0));
    }

    #[test]
    fn object_id_reservations() {
        assert!(ObjectId::UNLINKED.is_pseudo());
        assert!(ObjectId::DELETED.is_pseudo());
        assert!(ObjectId::ROOT.is_pseudo());
        assert!(ObjectId::LOST_AND_FOUND.is_pseudo());
        assert!(!ObjectId(5).is_pseudo());
        assert!(!ObjectId(0).is_pseudo());
        assert_eq!(ObjectId(257).bucket(), 1);
        assert_eq!(ObjectId(256).bucket(), 0);
    }

    #[test]
    fn fsize_round_trip() {
        assert_eq!(fsize_combine(100, 0), 100);
        let (lo, hi) = fsize_split(0x1_0000_0000);
        assert_eq!((lo, hi), (0, 1));
        assert_eq!(fsize_combine(lo, hi), 0x1_0000_0000);
    }

    #[test]
    fn fsize_sentinel_means_32bit() {
        assert_eq!(fsize_combine(1500, u32::MAX), 1500);
    }

    #[test]
    fn fsize_clamps_near_sentinel() {
        // A high half of !0 is unrepresentable; must clamp, not alias.
        let (lo, hi) = fsize_split(u64::MAX);
        assert_eq!(hi, u32::MAX - 1);
        assert_eq!(lo, u32::MAX);
        assert_eq!(fsize_combine(lo, hi), FSIZE_MAX);
    }

    #[test]
    fn name_checksum_is_case_insensitive() {
        assert_eq!(name_checksum("hello"), name_checksum("HELLO"));
        assert_ne!(name_checksum("hello"), name_checksum("world"));
        assert_eq!(name_checksum(""), 0);
    }

    #[test]
    fn names_equal_modes() {
        assert!(names_equal("a", "a", false));
        assert!(!names_equal("a", "A", false));
        assert!(names_equal("a", "A", true));
        assert!(!names_equal("ab", "A", true));
    }

    #[test]
    fn crc32_known_vectors() {
        assert_eq!(crc32(b""), 0);
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn endian_round_trip() {
        for endian in [StoredEndian::Little, StoredEndian::Big] {
            assert_eq!(endian.read_u32(endian.write_u32(0xDEAD_BEEF)), 0xDEAD_BEEF);
            assert_eq!(endian.read_u16(endian.write_u16(0xBEEF)), 0xBEEF);
        }
        assert_eq!(StoredEndian::Little.write_u32(1), [1, 0, 0, 0]);
        assert_eq!(StoredEndian::Big.write_u32(1), [0, 0, 0, 1]);
    }
}
