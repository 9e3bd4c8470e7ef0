//! Object-header chunk layout.
//!
//! Bit-exact layout of the payload of a chunk whose tag `chunk_id` is 0.
//! The fixed record is followed by the extended-attribute blob filling the
//! remainder of the chunk. All multi-byte fields honor the volume's
//! configured byte order.

use crate::xattr::{decode_xattrs, encode_xattrs, XattrEntry};
use nlfs_error::{NlfsError, Result};
use nlfs_nand::TagObjectType;
use nlfs_types::{fsize_combine, fsize_split, name_checksum, StoredEndian, MAX_ALIAS_LEN};

const OFF_TYPE: usize = 0;
const OFF_PARENT: usize = 4;
const OFF_NAME_SUM: usize = 8;
const OFF_NAME: usize = 10;
const NAME_BYTES: usize = 256;
const OFF_MODE: usize = 268;
const OFF_UID: usize = 272;
const OFF_GID: usize = 276;
const OFF_ATIME: usize = 280;
const OFF_MTIME: usize = 284;
const OFF_CTIME: usize = 288;
const OFF_SIZE_LOW: usize = 292;
const OFF_EQUIV: usize = 296;
const OFF_ALIAS: usize = 300;
const ALIAS_BYTES: usize = MAX_ALIAS_LEN + 1;
const OFF_RDEV: usize = 460;
const OFF_SIZE_HIGH: usize = 464;
const OFF_SHADOWS: usize = 468;
const OFF_INBAND_SHADOW: usize = 472;
const OFF_IS_SHRINK: usize = 476;

/// Bytes before the xattr blob begins.
pub const HEADER_FIXED_BYTES: usize = 480;

/// Decoded object header.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObjHeader {
    pub obj_type: TagObjectType,
    pub parent_id: u32,
    pub name: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub file_size: u64,
    pub equiv_id: u32,
    pub alias: String,
    pub rdev: u32,
    pub shadows_obj: u32,
    pub inband_shadowed_obj: u32,
    pub is_shrink: bool,
    pub xattrs: Vec<XattrEntry>,
}

fn put_str(region: &mut [u8], s: &str) {
    let n = s.len().min(region.len().saturating_sub(1));
    region[..n].copy_from_slice(&s.as_bytes()[..n]);
    region[n..].fill(0);
}

fn get_str(region: &[u8]) -> String {
    let end = region.iter().position(|b| *b == 0).unwrap_or(region.len());
    String::from_utf8_lossy(&region[..end]).into_owned()
}

impl ObjHeader {
    /// Serialize into a chunk payload buffer. The buffer must be at least
    /// `HEADER_FIXED_BYTES + 1` long; its tail receives the xattr blob.
    pub fn pack(&self, endian: StoredEndian, buf: &mut [u8]) -> Result<()> {
        if buf.len() < HEADER_FIXED_BYTES + 1 {
            return Err(NlfsError::Range);
        }
        if self.name.len() >= NAME_BYTES {
            return Err(NlfsError::NameTooLong);
        }
        if self.alias.len() > MAX_ALIAS_LEN {
            return Err(NlfsError::NameTooLong);
        }

        buf.fill(0xFF);
        let mut word = |at: usize, value: u32| {
            buf[at..at + 4].copy_from_slice(&endian.write_u32(value));
        };
        word(OFF_TYPE, self.obj_type.to_raw());
        word(OFF_PARENT, self.parent_id);
        word(OFF_MODE, self.mode);
        word(OFF_UID, self.uid);
        word(OFF_GID, self.gid);
        word(OFF_ATIME, self.atime);
        word(OFF_MTIME, self.mtime);
        word(OFF_CTIME, self.ctime);
        let (size_low, size_high) = fsize_split(self.file_size);
        word(OFF_SIZE_LOW, size_low);
        word(OFF_SIZE_HIGH, size_high);
        word(OFF_EQUIV, self.equiv_id);
        word(OFF_RDEV, self.rdev);
        word(OFF_SHADOWS, self.shadows_obj);
        word(OFF_INBAND_SHADOW, self.inband_shadowed_obj);
        word(OFF_IS_SHRINK, u32::from(self.is_shrink));

        buf[OFF_NAME_SUM..OFF_NAME_SUM + 2]
            .copy_from_slice(&endian.write_u16(name_checksum(&self.name)));
        put_str(&mut buf[OFF_NAME..OFF_NAME + NAME_BYTES], &self.name);
        buf[OFF_NAME + NAME_BYTES..OFF_MODE].fill(0);
        put_str(&mut buf[OFF_ALIAS..OFF_ALIAS + ALIAS_BYTES], &self.alias);

        let blob_capacity = buf.len() - HEADER_FIXED_BYTES;
        let blob = encode_xattrs(endian, &self.xattrs, blob_capacity)?;
        buf[HEADER_FIXED_BYTES..].copy_from_slice(&blob);
        Ok(())
    }

    /// Parse a header payload.
    pub fn unpack(endian: StoredEndian, buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_FIXED_BYTES + 1 {
            return Err(NlfsError::Range);
        }
        let word = |at: usize| endian.read_u32([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);

        Ok(Self {
            obj_type: TagObjectType::from_raw(word(OFF_TYPE)),
            parent_id: word(OFF_PARENT),
            name: get_str(&buf[OFF_NAME..OFF_NAME + NAME_BYTES]),
            mode: word(OFF_MODE),
            uid: word(OFF_UID),
            gid: word(OFF_GID),
            atime: word(OFF_ATIME),
            mtime: word(OFF_MTIME),
            ctime: word(OFF_CTIME),
            file_size: fsize_combine(word(OFF_SIZE_LOW), word(OFF_SIZE_HIGH)),
            equiv_id: word(OFF_EQUIV),
            alias: get_str(&buf[OFF_ALIAS..OFF_ALIAS + ALIAS_BYTES]),
            rdev: word(OFF_RDEV),
            shadows_obj: word(OFF_SHADOWS),
            inband_shadowed_obj: word(OFF_INBAND_SHADOW),
            is_shrink: word(OFF_IS_SHRINK) != 0,
            xattrs: decode_xattrs(endian, &buf[HEADER_FIXED_BYTES..]),
        })
    }
}
