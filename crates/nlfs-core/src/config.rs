//! Mount-time parameters and device-wide counters.

use nlfs_error::{NlfsError, Result};
use nlfs_nand::{TagMode, PACKED_TAGS_SIZE};
use nlfs_types::{Geometry, StoredEndian};
use serde::{Deserialize, Serialize};

use crate::header::HEADER_FIXED_BYTES;

/// Mount-time configuration for one volume.
#[derive(Debug, Clone)]
pub struct DeviceParam {
    pub geometry: Geometry,
    /// Erased blocks withheld from normal allocation so that GC and
    /// deletion always have room to move.
    pub n_reserved_blocks: u32,
    /// Write-back cache slots.
    pub n_caches: usize,
    /// Write attempts before a chunk write is reported failed.
    /// 0 means unlimited; each failed attempt abandons the rest of its
    /// block, so even unlimited retries terminate at no-space.
    pub wr_attempts: u32,
    /// Legacy volume format: forward scan, deletion markers, serial
    /// arbitration. Off means the current format: backward scan and soft
    /// deletes.
    pub format_v1: bool,
    /// Store packed tags in the payload tail instead of the spare area.
    pub inband_tags: bool,
    /// Whole-chunk aligned writes may bypass the cache.
    pub cache_bypass_aligned: bool,
    pub case_insensitive: bool,
    pub endian: StoredEndian,
    /// Verify the erased state before every program, not just the first
    /// per block.
    pub always_check_erased: bool,
    /// Reserve room for, and honor, fast-mount checkpoints.
    pub use_checkpoint: bool,
    /// Narrow index-tree slots to 16 bits even on devices that need more,
    /// forcing chunk-group resolution.
    pub wide_tnodes_disabled: bool,
}

impl DeviceParam {
    #[must_use]
    pub fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            n_reserved_blocks: 5,
            n_caches: 10,
            wr_attempts: 3,
            format_v1: false,
            inband_tags: false,
            cache_bypass_aligned: true,
            case_insensitive: false,
            endian: StoredEndian::Little,
            always_check_erased: false,
            use_checkpoint: true,
            wide_tnodes_disabled: false,
        }
    }

    /// Usable data payload per chunk under the configured tag mode.
    #[must_use]
    pub fn data_bytes(&self) -> usize {
        let raw = self.geometry.data_bytes_per_chunk() as usize;
        if self.inband_tags {
            raw - PACKED_TAGS_SIZE
        } else {
            raw
        }
    }

    #[must_use]
    pub fn tag_mode(&self) -> TagMode {
        if self.inband_tags {
            TagMode::Inband
        } else {
            TagMode::Oob
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.data_bytes() < HEADER_FIXED_BYTES + 4 {
            return Err(NlfsError::Range);
        }
        if self.n_reserved_blocks < 2
            || self.n_reserved_blocks >= self.geometry.n_blocks()
        {
            return Err(NlfsError::Range);
        }
        if self.n_caches == 0 || self.n_caches > 256 {
            return Err(NlfsError::Range);
        }
        if self.format_v1 && self.inband_tags {
            // inband tags are a current-format feature
            return Err(NlfsError::Range);
        }
        Ok(())
    }
}

/// Device-wide counters, cheap to copy out for inspection.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DeviceStats {
    pub n_page_writes: u64,
    pub n_page_reads: u64,
    pub n_erasures: u64,
    pub n_erase_failures: u64,
    pub n_retired_blocks: u64,
    pub n_retried_writes: u64,
    pub all_gcs: u64,
    pub passive_gc_count: u64,
    pub oldest_dirty_gc_count: u64,
    pub n_gc_blocks: u64,
    pub bg_gcs: u64,
    pub n_gc_copies: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub n_deleted_files: u64,
    pub n_unlinked_files: u64,
    pub n_bg_deletions: u64,
    pub n_ecc_fixed: u64,
    pub n_ecc_unfixed: u64,
    pub temp_buffer_overflows: u64,
}
