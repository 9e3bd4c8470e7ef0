//! Extended-attribute blob codec.
//!
//! Attributes ride in the tail of the object header chunk, so the whole
//! set must fit in one encode region whose capacity depends on the chunk
//! size. Entries are packed back to back: name length, value length,
//! name bytes, value bytes; a zero name length terminates the stream.

use nlfs_error::{NlfsError, Result};
use nlfs_types::StoredEndian;
use serde::{Deserialize, Serialize};

pub const XATTR_NAME_MAX: usize = u8::MAX as usize;
pub const XATTR_VALUE_MAX: usize = u16::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XattrEntry {
    pub name: String,
    pub value: Vec<u8>,
}

/// Encode `entries` into a region of exactly `capacity` bytes.
pub fn encode_xattrs(
    endian: StoredEndian,
    entries: &[XattrEntry],
    capacity: usize,
) -> Result<Vec<u8>> {
    let mut out = vec![0u8; capacity];
    let mut at = 0usize;
    for entry in entries {
        if entry.name.is_empty() || entry.name.len() > XATTR_NAME_MAX {
            return Err(NlfsError::NameTooLong);
        }
        if entry.value.len() > XATTR_VALUE_MAX {
            return Err(NlfsError::Range);
        }
        let need = 3 + entry.name.len() + entry.value.len();
        // the terminator byte must still fit
        if at + need + 1 > capacity {
            return Err(NlfsError::NoSpace);
        }
        #[allow(clippy::cast_possible_truncation)]
        {
            out[at] = entry.name.len() as u8;
            out[at + 1..at + 3]
                .copy_from_slice(&endian.write_u16(entry.value.len() as u16));
        }
        at += 3;
        out[at..at + entry.name.len()].copy_from_slice(entry.name.as_bytes());
        at += entry.name.len();
        out[at..at + entry.value.len()].copy_from_slice(&entry.value);
        at += entry.value.len();
    }
    Ok(out)
}

/// Decode a blob produced by [`encode_xattrs`]. Tolerates truncation by
/// stopping at the first malformed entry.
#[must_use]
pub fn decode_xattrs(endian: StoredEndian, bytes: &[u8]) -> Vec<XattrEntry> {
    let mut entries = Vec::new();
    let mut at = 0usize;
    while at + 3 <= bytes.len() {
        let name_len = bytes[at] as usize;
        if name_len == 0 {
            break;
        }
        let value_len = endian.read_u16([bytes[at + 1], bytes[at + 2]]) as usize;
        at += 3;
        let Some(name_bytes) = bytes.get(at..at + name_len) else {
            break;
        };
        let Ok(name) = std::str::from_utf8(name_bytes) else {
            break;
        };
        at += name_len;
        let Some(value) = bytes.get(at..at + value_len) else {
            break;
        };
        entries.push(XattrEntry {
            name: name.to_owned(),
            value: value.to_vec(),
        });
        at += value_len;
    }
    entries
}

/// Upsert into an attribute list.
pub fn set_entry(entries: &mut Vec<XattrEntry>, name: &str, value: &[u8]) {
    match entries.iter_mut().find(|e| e.name == name) {
        Some(entry) => entry.value = value.to_vec(),
        None => entries.push(XattrEntry {
            name: name.to_owned(),
            value: value.to_vec(),
        }),
    }
}

/// Remove by name; absent names report `NoData`.
pub fn remove_entry(entries: &mut Vec<XattrEntry>, name: &str) -> Result<()> {
    let before = entries.len();
    entries.retain(|e| e.name != name);
    if entries.len() == before {
        return Err(NlfsError::NoData);
    }
    Ok(())
}
