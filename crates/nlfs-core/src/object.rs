//! Object table: files, directories, symlinks, hard links, specials.
//!
//! All objects live in one flat region keyed by id; every inter-object
//! reference (parent, children, hard links) is an id into that region, so
//! traversals are index walks and deletion can never dangle. The classic
//! hash buckets survive as per-bucket population counters driving id
//! assignment.

use crate::tnode::Tnode;
use crate::xattr::XattrEntry;
use nlfs_nand::TagObjectType;
use nlfs_types::{name_checksum, ObjectId, PhysChunk, N_OBJECT_BUCKETS, SHORT_NAME_LEN};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectType {
    File,
    Directory,
    Symlink,
    Hardlink,
    Special,
}

impl ObjectType {
    #[must_use]
    pub fn to_tag(self) -> TagObjectType {
        match self {
            Self::File => TagObjectType::File,
            Self::Directory => TagObjectType::Directory,
            Self::Symlink => TagObjectType::Symlink,
            Self::Hardlink => TagObjectType::Hardlink,
            Self::Special => TagObjectType::Special,
        }
    }

    #[must_use]
    pub fn from_tag(tag: TagObjectType) -> Option<Self> {
        match tag {
            TagObjectType::File => Some(Self::File),
            TagObjectType::Directory => Some(Self::Directory),
            TagObjectType::Symlink => Some(Self::Symlink),
            TagObjectType::Hardlink => Some(Self::Hardlink),
            TagObjectType::Special => Some(Self::Special),
            TagObjectType::Unknown => None,
        }
    }
}

/// Per-file payload: the index tree plus size bookkeeping.
#[derive(Debug, Default)]
pub struct FileVar {
    pub top: Option<Box<Tnode>>,
    pub top_level: u32,
    /// Size visible to callers.
    pub file_size: u64,
    /// High-water mark of data actually written (headers store this).
    pub stored_size: u64,
    /// Smallest size the file has been truncated to while a header was
    /// live; drives shrink-header emission.
    pub shrink_size: u64,
    pub n_data_chunks: i32,
}

#[derive(Debug, Default)]
pub struct DirVar {
    pub children: Vec<ObjectId>,
}

/// Per-type payload; the discriminant is the object's type.
#[derive(Debug)]
pub enum Variant {
    File(FileVar),
    Dir(DirVar),
    Symlink { alias: String },
    Hardlink { equiv: ObjectId },
    Special { rdev: u32 },
}

impl Variant {
    #[must_use]
    pub fn new_for(object_type: ObjectType) -> Self {
        match object_type {
            ObjectType::File => Self::File(FileVar::default()),
            ObjectType::Directory => Self::Dir(DirVar::default()),
            ObjectType::Symlink => Self::Symlink {
                alias: String::new(),
            },
            ObjectType::Hardlink => Self::Hardlink {
                equiv: ObjectId(0),
            },
            ObjectType::Special => Self::Special { rdev: 0 },
        }
    }

    #[must_use]
    pub fn object_type(&self) -> ObjectType {
        match self {
            Self::File(_) => ObjectType::File,
            Self::Dir(_) => ObjectType::Directory,
            Self::Symlink { .. } => ObjectType::Symlink,
            Self::Hardlink { .. } => ObjectType::Hardlink,
            Self::Special { .. } => ObjectType::Special,
        }
    }
}

/// One object record.
#[derive(Debug)]
pub struct Object {
    pub id: ObjectId,
    pub parent: Option<ObjectId>,
    pub variant: Variant,
    /// Physical chunk of the live object header; NONE before first flush.
    pub hdr_chunk: PhysChunk,
    /// Inline name when short enough; None means recover it from the
    /// header chunk on demand.
    pub short_name: Option<String>,
    pub sum: u16,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    /// Header write-generation (wraps modulo 4).
    pub serial: u8,
    pub dirty: bool,
    pub deleted: bool,
    pub soft_del: bool,
    pub unlinked: bool,
    /// Pseudo-directory (never written to flash).
    pub fake: bool,
    /// Scan created this object from tag hints only; details come from
    /// one header read the first time they are needed.
    pub lazy_loaded: bool,
    /// External holders (open file handles in the façade).
    pub open_count: u32,
    pub xattrs: Vec<XattrEntry>,
    /// Hard links pointing at this object.
    pub hardlinks: Vec<ObjectId>,
}

impl Object {
    #[must_use]
    pub fn new(id: ObjectId, object_type: ObjectType) -> Self {
        Self {
            id,
            parent: None,
            variant: Variant::new_for(object_type),
            hdr_chunk: PhysChunk::NONE,
            short_name: None,
            sum: 0,
            mode: 0,
            uid: 0,
            gid: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            serial: 0,
            dirty: false,
            deleted: false,
            soft_del: false,
            unlinked: false,
            fake: false,
            lazy_loaded: false,
            open_count: 0,
            xattrs: Vec::new(),
            hardlinks: Vec::new(),
        }
    }

    #[must_use]
    pub fn object_type(&self) -> ObjectType {
        self.variant.object_type()
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        matches!(self.variant, Variant::Dir(_))
    }

    #[must_use]
    pub fn as_file(&self) -> Option<&FileVar> {
        match &self.variant {
            Variant::File(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_file_mut(&mut self) -> Option<&mut FileVar> {
        match &mut self.variant {
            Variant::File(f) => Some(f),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_dir(&self) -> Option<&DirVar> {
        match &self.variant {
            Variant::Dir(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_dir_mut(&mut self) -> Option<&mut DirVar> {
        match &mut self.variant {
            Variant::Dir(d) => Some(d),
            _ => None,
        }
    }

    /// Record a (new) name: checksum always, inline storage when short.
    pub fn set_name(&mut self, name: &str) {
        self.sum = name_checksum(name);
        self.short_name = if name.len() <= SHORT_NAME_LEN {
            Some(name.to_owned())
        } else {
            None
        };
        self.lazy_loaded = false;
    }
}

/// The flat object region plus bucket population counters.
#[derive(Debug)]
pub struct ObjectTable {
    map: HashMap<u32, Object>,
    bucket_count: Vec<u32>,
    rng: SmallRng,
}

impl Default for ObjectTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
            bucket_count: vec![0; N_OBJECT_BUCKETS as usize],
            rng: SmallRng::seed_from_u64(0x6e6c_6673),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: ObjectId) -> Option<&Object> {
        self.map.get(&id.0)
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut Object> {
        self.map.get_mut(&id.0)
    }

    #[must_use]
    pub fn contains(&self, id: ObjectId) -> bool {
        self.map.contains_key(&id.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Object> {
        self.map.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Object> {
        self.map.values_mut()
    }

    pub fn ids(&self) -> Vec<ObjectId> {
        self.map.keys().copied().map(ObjectId).collect()
    }

    /// Insert, replacing any record with the same id.
    pub fn insert(&mut self, object: Object) {
        let id = object.id;
        if self.map.insert(id.0, object).is_none() {
            self.bucket_count[id.bucket()] += 1;
        }
        trace!(target: "nlfs::obj", id = id.0, "object inserted");
    }

    pub fn remove(&mut self, id: ObjectId) -> Option<Object> {
        let removed = self.map.remove(&id.0);
        if removed.is_some() {
            self.bucket_count[id.bucket()] -= 1;
            trace!(target: "nlfs::obj", id = id.0, "object removed");
        }
        removed
    }

    /// Least-populated bucket among a 10-sample random probe.
    fn find_nice_bucket(&mut self) -> u32 {
        let mut best = self.rng.gen_range(0..N_OBJECT_BUCKETS);
        let mut best_count = self.bucket_count[best as usize];
        for _ in 0..9 {
            let candidate = self.rng.gen_range(0..N_OBJECT_BUCKETS);
            if self.bucket_count[candidate as usize] < best_count {
                best = candidate;
                best_count = self.bucket_count[candidate as usize];
            }
        }
        best
    }

    /// Allocate a fresh object id.
    ///
    /// Walks `bucket, bucket + N, bucket + 2N, …` until an unused value is
    /// found; uniqueness only ever needs a bucket-local check. Ids below
    /// the reserved range and ids with the top bit set are skipped.
    pub fn new_obj_id(&mut self) -> ObjectId {
        let bucket = self.find_nice_bucket();
        let mut candidate = bucket;
        loop {
            let ok = candidate >= ObjectId::FIRST_ALLOCATABLE
                && candidate & 0x8000_0000 == 0
                && !self.map.contains_key(&candidate);
            if ok {
                return ObjectId(candidate);
            }
            candidate = candidate.wrapping_add(N_OBJECT_BUCKETS);
        }
    }

    /// Total index-tree nodes across all files (checkpoint sizing).
    #[must_use]
    pub fn total_tnodes(&self) -> usize {
        self.map
            .values()
            .filter_map(|o| o.as_file())
            .filter_map(|f| f.top.as_ref())
            .map(|t| t.count_nodes())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_remove_tracks_buckets() {
        let mut table = ObjectTable::new();
        table.insert(Object::new(ObjectId(261), ObjectType::File));
        table.insert(Object::new(ObjectId(517), ObjectType::File));
        assert_eq!(table.len(), 2);
        assert!(table.contains(ObjectId(261)));
        assert!(table.remove(ObjectId(261)).is_some());
        assert!(!table.contains(ObjectId(261)));
        assert!(table.remove(ObjectId(261)).is_none());
    }

    #[test]
    fn new_ids_are_unique_and_allocatable() {
        let mut table = ObjectTable::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..2000 {
            let id = table.new_obj_id();
            assert!(id.0 >= ObjectId::FIRST_ALLOCATABLE);
            assert_eq!(id.0 & 0x8000_0000, 0);
            assert!(seen.insert(id.0), "duplicate id {id}");
            table.insert(Object::new(id, ObjectType::File));
        }
    }

    #[test]
    fn id_assignment_prefers_sparse_buckets() {
        let mut table = ObjectTable::new();
        // preload every bucket except one with several objects
        for bucket in 0..N_OBJECT_BUCKETS {
            if bucket == 77 {
                continue;
            }
            for step in 1..=4u32 {
                table.insert(Object::new(
                    ObjectId(bucket + step * N_OBJECT_BUCKETS),
                    ObjectType::File,
                ));
            }
        }
        // the probe lands in the sparse bucket far more often than the
        // uniform 1/256 baseline
        let mut hits = 0;
        for _ in 0..256 {
            let id = table.new_obj_id();
            if id.bucket() == 77 {
                hits += 1;
            }
            table.insert(Object::new(id, ObjectType::File));
        }
        assert!(hits >= 3, "10-sample probe barely found the sparse bucket");
    }

    #[test]
    fn short_names_stored_inline() {
        let mut obj = Object::new(ObjectId(9), ObjectType::File);
        obj.set_name("readme");
        assert_eq!(obj.short_name.as_deref(), Some("readme"));
        assert_eq!(obj.sum, name_checksum("readme"));

        obj.set_name("a-name-clearly-longer-than-the-inline-cap");
        assert!(obj.short_name.is_none());
        assert_eq!(obj.sum, name_checksum("a-name-clearly-longer-than-the-inline-cap"));
    }

    #[test]
    fn variant_accessors() {
        let mut obj = Object::new(ObjectId(5), ObjectType::Directory);
        assert!(obj.is_dir());
        assert!(obj.as_dir().is_some());
        assert!(obj.as_file().is_none());
        obj.as_dir_mut().unwrap().children.push(ObjectId(6));
        assert_eq!(obj.as_dir().unwrap().children.len(), 1);
        assert_eq!(obj.object_type(), ObjectType::Directory);
    }

    #[test]
    fn tag_type_round_trip() {
        for t in [
            ObjectType::File,
            ObjectType::Directory,
            ObjectType::Symlink,
            ObjectType::Hardlink,
            ObjectType::Special,
        ] {
            assert_eq!(ObjectType::from_tag(t.to_tag()), Some(t));
        }
        assert_eq!(ObjectType::from_tag(TagObjectType::Unknown), None);
    }
}
