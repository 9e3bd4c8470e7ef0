//! Packed on-flash tag representation.
//!
//! Six words per chunk: sequence, object word, chunk word, size word, an
//! auxiliary word, and a CRC-32 over the rest. Header chunks (chunk id 0)
//! reuse the chunk word's low bits for the parent id and its top bits for
//! hint flags, and the object word's top nibble for the object type, so a
//! scan can classify objects without reading header bodies.

use crate::{EccStatus, ExtTags, TagObjectType};
use nlfs_types::{crc32, StoredEndian};

/// Size of the packed tag record in bytes.
pub const PACKED_TAGS_SIZE: usize = 24;

/// Where packed tags live on flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TagMode {
    /// Tags in the page's spare area, through the driver.
    #[default]
    Oob,
    /// Tags in the last bytes of the data payload.
    Inband,
}

const HEADER_EXTRA_FLAG: u32 = 0x8000_0000;
const SHRINK_FLAG: u32 = 0x4000_0000;
const SHADOWS_FLAG: u32 = 0x2000_0000;
const EXTRA_PAYLOAD_MASK: u32 = 0x0FFF_FFFF;
const EXTRA_TYPE_SHIFT: u32 = 28;

const AUX_SERIAL_MASK: u32 = 0x3;
const AUX_DELETED: u32 = 0x4;

/// Size-word sentinel: the real size did not fit, read the header body.
const SIZE_UNKNOWN: u32 = u32::MAX;

#[must_use]
pub fn pack_tags(endian: StoredEndian, tags: &ExtTags) -> [u8; PACKED_TAGS_SIZE] {
    let mut obj_word = tags.obj_id;
    let mut chunk_word = tags.chunk_id;
    let mut size_word = tags.n_bytes;

    if tags.chunk_id == 0 && tags.extra_available {
        obj_word = (tags.extra_obj_type.to_raw() << EXTRA_TYPE_SHIFT)
            | (tags.obj_id & EXTRA_PAYLOAD_MASK);
        chunk_word = HEADER_EXTRA_FLAG | (tags.extra_parent_id & EXTRA_PAYLOAD_MASK);
        if tags.extra_is_shrink {
            chunk_word |= SHRINK_FLAG;
        }
        if tags.extra_shadows != 0 {
            chunk_word |= SHADOWS_FLAG;
            size_word = tags.extra_shadows;
        } else if tags.extra_obj_type == TagObjectType::File {
            size_word = u32::try_from(tags.extra_file_size).unwrap_or(SIZE_UNKNOWN);
        } else {
            size_word = 0;
        }
    }

    let mut aux = u32::from(tags.serial_number) & AUX_SERIAL_MASK;
    if tags.is_deleted {
        aux |= AUX_DELETED;
    }

    let mut out = [0u8; PACKED_TAGS_SIZE];
    #[allow(clippy::cast_possible_truncation)]
    let seq_lo = tags.seq_number as u32;
    out[0..4].copy_from_slice(&endian.write_u32(seq_lo));
    out[4..8].copy_from_slice(&endian.write_u32(obj_word));
    out[8..12].copy_from_slice(&endian.write_u32(chunk_word));
    out[12..16].copy_from_slice(&endian.write_u32(size_word));
    out[16..20].copy_from_slice(&endian.write_u32(aux));
    let check = crc32(&out[0..20]);
    out[20..24].copy_from_slice(&endian.write_u32(check));
    out
}

/// Decode packed tags. Returns `None` for erased or corrupt records.
#[must_use]
pub fn unpack_tags(endian: StoredEndian, bytes: &[u8]) -> Option<ExtTags> {
    if bytes.len() < PACKED_TAGS_SIZE {
        return None;
    }
    if bytes[..PACKED_TAGS_SIZE].iter().all(|b| *b == 0xFF) {
        return None;
    }

    let word = |at: usize| endian.read_u32([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
    let stored_crc = word(20);
    if crc32(&bytes[0..20]) != stored_crc {
        return None;
    }

    let seq_lo = word(0);
    let obj_word = word(4);
    let chunk_word = word(8);
    let size_word = word(12);
    let aux = word(16);

    #[allow(clippy::cast_possible_truncation)]
    let mut tags = ExtTags {
        chunk_used: true,
        seq_number: u64::from(seq_lo),
        serial_number: (aux & AUX_SERIAL_MASK) as u8,
        is_deleted: aux & AUX_DELETED != 0,
        ecc: EccStatus::NoError,
        ..ExtTags::default()
    };

    if chunk_word & HEADER_EXTRA_FLAG != 0 {
        tags.obj_id = obj_word & EXTRA_PAYLOAD_MASK;
        tags.chunk_id = 0;
        tags.extra_available = true;
        tags.extra_obj_type = TagObjectType::from_raw(obj_word >> EXTRA_TYPE_SHIFT);
        tags.extra_parent_id = chunk_word & EXTRA_PAYLOAD_MASK;
        tags.extra_is_shrink = chunk_word & SHRINK_FLAG != 0;
        if chunk_word & SHADOWS_FLAG != 0 {
            tags.extra_shadows = size_word;
        } else if tags.extra_obj_type == TagObjectType::File {
            tags.extra_file_size = if size_word == SIZE_UNKNOWN {
                u64::MAX
            } else {
                u64::from(size_word)
            };
        }
    } else {
        tags.obj_id = obj_word;
        tags.chunk_id = chunk_word;
        tags.n_bytes = size_word;
    }

    Some(tags)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(tags: &ExtTags) -> ExtTags {
        let packed = pack_tags(StoredEndian::Little, tags);
        unpack_tags(StoredEndian::Little, &packed).expect("valid record")
    }

    #[test]
    fn data_chunk_round_trip() {
        let tags = ExtTags::for_data(42, 7, 512, 9);
        let got = round_trip(&tags);
        assert_eq!(got.obj_id, 42);
        assert_eq!(got.chunk_id, 8);
        assert_eq!(got.n_bytes, 512);
        assert_eq!(got.seq_number, 9);
        assert!(!got.extra_available);
    }

    #[test]
    fn header_extras_round_trip() {
        let tags = ExtTags {
            chunk_used: true,
            obj_id: 300,
            chunk_id: 0,
            seq_number: 17,
            extra_available: true,
            extra_parent_id: 3,
            extra_obj_type: TagObjectType::File,
            extra_file_size: 1500,
            extra_is_shrink: true,
            ..ExtTags::default()
        };
        let got = round_trip(&tags);
        assert_eq!(got.obj_id, 300);
        assert_eq!(got.chunk_id, 0);
        assert!(got.extra_available);
        assert_eq!(got.extra_parent_id, 3);
        assert_eq!(got.extra_obj_type, TagObjectType::File);
        assert_eq!(got.extra_file_size, 1500);
        assert!(got.extra_is_shrink);
    }

    #[test]
    fn header_shadow_round_trip() {
        let tags = ExtTags {
            chunk_used: true,
            obj_id: 300,
            chunk_id: 0,
            extra_available: true,
            extra_parent_id: 2,
            extra_obj_type: TagObjectType::File,
            extra_shadows: 299,
            ..ExtTags::default()
        };
        let got = round_trip(&tags);
        assert_eq!(got.extra_shadows, 299);
        // the shadow id displaces the size hint
        assert_eq!(got.extra_file_size, 0);
    }

    #[test]
    fn oversize_hint_degrades_to_unknown() {
        let tags = ExtTags {
            chunk_used: true,
            obj_id: 5,
            chunk_id: 0,
            extra_available: true,
            extra_obj_type: TagObjectType::File,
            extra_file_size: u64::from(u32::MAX) + 1,
            ..ExtTags::default()
        };
        assert_eq!(round_trip(&tags).extra_file_size, u64::MAX);
    }

    #[test]
    fn erased_and_corrupt_records_decode_to_none() {
        assert!(unpack_tags(StoredEndian::Little, &[0xFF; PACKED_TAGS_SIZE]).is_none());
        let mut packed = pack_tags(StoredEndian::Little, &ExtTags::for_data(1, 0, 10, 1));
        packed[5] ^= 0x40;
        assert!(unpack_tags(StoredEndian::Little, &packed).is_none());
        assert!(unpack_tags(StoredEndian::Little, &packed[..10]).is_none());
    }

    #[test]
    fn serial_and_deleted_survive() {
        let tags = ExtTags {
            serial_number: 3,
            is_deleted: true,
            ..ExtTags::for_data(9, 0, 1, 2)
        };
        let got = round_trip(&tags);
        assert_eq!(got.serial_number, 3);
        assert!(got.is_deleted);
    }

    #[test]
    fn big_endian_layout_differs_but_round_trips() {
        let tags = ExtTags::for_data(11, 3, 100, 5);
        let le = pack_tags(StoredEndian::Little, &tags);
        let be = pack_tags(StoredEndian::Big, &tags);
        assert_ne!(le, be);
        assert_eq!(unpack_tags(StoredEndian::Big, &be).unwrap().obj_id, 11);
        assert!(unpack_tags(StoredEndian::Little, &be).is_none());
    }
}
