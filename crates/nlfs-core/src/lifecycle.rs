//! Object lifecycle: headers, name resolution, directory membership,
//! index-tree plumbing, and the several ways an object dies.

use crate::device::Device;
use crate::header::ObjHeader;
use crate::object::{Object, ObjectType, Variant};
use crate::tnode;
use nlfs_error::{NlfsError, Result};
use nlfs_nand::ExtTags;
use nlfs_types::{
    name_checksum, names_equal, ObjectId, PhysChunk, MAX_ALIAS_LEN, MAX_NAME_LEN,
};
use tracing::{debug, trace, warn};

/// Attributes supplied at create time.
#[derive(Debug, Clone, Default)]
pub(crate) struct NewObject {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub alias: Option<String>,
    pub equiv: Option<ObjectId>,
    pub rdev: u32,
}

impl Device {
    // ── Index-tree plumbing ─────────────────────────────────────────────

    /// Resolve a group base to the concrete chunk holding
    /// `(obj_id, chunk_id)`. With single-chunk groups the bitmap bit is
    /// proof enough; larger groups read tags to disambiguate.
    pub(crate) fn find_chunk_in_group(
        &mut self,
        base: u32,
        obj_id: u32,
        chunk_id: u32,
    ) -> Result<Option<PhysChunk>> {
        let span = self.param.geometry.addressable_chunks();
        let mut candidate = base;
        for _ in 0..self.layout.grp_size {
            if candidate == 0 || candidate >= span {
                break;
            }
            let (block, offset) = self.param.geometry.split(PhysChunk(candidate));
            if self.blocks.check_chunk_bit(block, offset) {
                if self.layout.grp_size == 1 {
                    return Ok(Some(PhysChunk(candidate)));
                }
                let tags = self.rd_chunk_tags(PhysChunk(candidate), None)?;
                if tags.matches(obj_id, chunk_id) {
                    return Ok(Some(PhysChunk(candidate)));
                }
            }
            candidate += 1;
        }
        Ok(None)
    }

    /// Physical chunk currently holding `logical` of file `id`, if any.
    pub(crate) fn find_data_chunk(
        &mut self,
        id: ObjectId,
        logical: u32,
    ) -> Result<Option<PhysChunk>> {
        let base = {
            let Some(file) = self.objects.get(id).and_then(Object::as_file) else {
                return Ok(None);
            };
            tnode::get(&self.layout, file.top.as_deref(), file.top_level, logical)
        };
        if base == 0 {
            return Ok(None);
        }
        self.find_chunk_in_group(base, id.0, logical + 1)
    }

    /// Record `phys` as the home of `logical`. The caller owns deletion
    /// of any previous chunk.
    pub(crate) fn put_chunk_in_file(
        &mut self,
        id: ObjectId,
        logical: u32,
        phys: PhysChunk,
    ) -> Result<()> {
        self.checkpt_blocks_estimate = None;
        let layout = self.layout;
        if self.objects.get(id).and_then(Object::as_file).is_none() {
            warn!(target: "nlfs::obj", id = id.0, "data chunk for a non-file");
            return self.chunk_del(phys, true);
        }
        let file = self
            .objects
            .get_mut(id)
            .and_then(Object::as_file_mut)
            .expect("checked above");
        let mut top = file.top.take();
        let mut top_level = file.top_level;
        let previous = tnode::set(&layout, &mut top, &mut top_level, logical, phys.0)?;
        let file = self
            .objects
            .get_mut(id)
            .and_then(Object::as_file_mut)
            .expect("file checked above");
        file.top = top;
        file.top_level = top_level;
        if previous == 0 {
            file.n_data_chunks += 1;
        }
        Ok(())
    }

    /// Hard-delete every data chunk at or beyond `first_dead` and prune.
    pub(crate) fn trim_file_chunks(&mut self, id: ObjectId, first_dead: u32) -> Result<()> {
        self.checkpt_blocks_estimate = None;
        let layout = self.layout;
        let mut entries = Vec::new();
        {
            let Some(file) = self.objects.get(id).and_then(Object::as_file) else {
                return Ok(());
            };
            tnode::collect_entries(
                &layout,
                file.top.as_deref(),
                file.top_level,
                first_dead,
                &mut entries,
            );
        }
        for (logical, _base) in entries {
            let chunk = self.find_data_chunk(id, logical)?;
            if let Some(file) = self.objects.get_mut(id).and_then(Object::as_file_mut) {
                let mut top = file.top.take();
                let top_level = file.top_level;
                tnode::clear(&layout, &mut top, top_level, logical);
                file.top = top;
                file.n_data_chunks -= 1;
            }
            if let Some(chunk) = chunk {
                self.chunk_del(chunk, true)?;
            }
        }
        if let Some(file) = self.objects.get_mut(id).and_then(Object::as_file_mut) {
            let mut top = file.top.take();
            let mut top_level = file.top_level;
            tnode::prune(&mut top, &mut top_level);
            file.top = top;
            file.top_level = top_level;
        }
        Ok(())
    }

    /// Soft-delete the whole tree: per-chunk accounting moves to the
    /// blocks, the tree itself is dropped. Tags stay on flash until GC
    /// relocates each block, which is also when the object is finally
    /// freed (via the cleanup list and `n_data_chunks`).
    pub(crate) fn soft_delete_file_chunks(&mut self, id: ObjectId) {
        self.checkpt_blocks_estimate = None;
        let layout = self.layout;
        let mut entries = Vec::new();
        let Some(file) = self.objects.get_mut(id).and_then(Object::as_file_mut) else {
            return;
        };
        tnode::collect_entries(
            &layout,
            file.top.as_deref(),
            file.top_level,
            0,
            &mut entries,
        );
        file.top = None;
        file.top_level = 0;
        let n_chunks = entries.len();
        for (_logical, base) in entries {
            self.soft_del_chunk(PhysChunk(base));
        }
        trace!(target: "nlfs::obj", id = id.0, chunks = n_chunks, "file soft-deleted");
    }

    // ── Names and lazy header loading ───────────────────────────────────

    /// Load name, attributes, alias/equiv, and xattrs from the header
    /// body. Scan defers this so a mount touches each header chunk at
    /// most once on demand.
    pub(crate) fn load_object_details(&mut self, id: ObjectId) -> Result<()> {
        let hdr_chunk = match self.objects.get(id) {
            Some(obj) if obj.lazy_loaded && !obj.hdr_chunk.is_none() => obj.hdr_chunk,
            _ => return Ok(()),
        };
        let mut buffer = self.acquire_buffer();
        let outcome = self.rd_chunk_tags(hdr_chunk, Some(buffer.as_mut_slice()));
        let header = match outcome {
            Ok(_) => ObjHeader::unpack(self.param.endian, buffer.as_slice()),
            Err(err) => Err(err),
        };
        self.release_buffer(buffer);
        let header = header?;

        let obj = self.objects.get_mut(id).expect("object present");
        obj.set_name(&header.name);
        obj.mode = header.mode;
        obj.uid = header.uid;
        obj.gid = header.gid;
        obj.atime = u64::from(header.atime);
        obj.mtime = u64::from(header.mtime);
        obj.ctime = u64::from(header.ctime);
        obj.xattrs = header.xattrs;
        if let Variant::Symlink { alias } = &mut obj.variant {
            *alias = header.alias;
        }
        obj.lazy_loaded = false;
        Ok(())
    }

    /// Current name of `id`. Long names are re-read from the header
    /// chunk; headerless placeholders get a synthesized name.
    pub(crate) fn object_name(&mut self, id: ObjectId) -> Result<String> {
        self.load_object_details(id)?;
        let obj = self
            .objects
            .get(id)
            .ok_or(NlfsError::BadHandle)?;
        if let Some(short) = &obj.short_name {
            return Ok(short.clone());
        }
        if obj.hdr_chunk.is_none() {
            return Ok(format!("obj{}", id.0));
        }
        let hdr_chunk = obj.hdr_chunk;
        let mut buffer = self.acquire_buffer();
        let outcome = self.rd_chunk_tags(hdr_chunk, Some(buffer.as_mut_slice()));
        let header = match outcome {
            Ok(_) => ObjHeader::unpack(self.param.endian, buffer.as_slice()),
            Err(err) => Err(err),
        };
        self.release_buffer(buffer);
        Ok(header?.name)
    }

    /// Name lookup inside a directory: checksum prefilter, then a real
    /// compare (case-folded when configured).
    pub(crate) fn lookup_in_dir(
        &mut self,
        dir: ObjectId,
        name: &str,
    ) -> Result<Option<ObjectId>> {
        let children = {
            let obj = self.objects.get(dir).ok_or(NlfsError::BadHandle)?;
            let Some(dir_var) = obj.as_dir() else {
                return Err(NlfsError::NotDirectory);
            };
            dir_var.children.clone()
        };
        let sum = name_checksum(name);
        for child in children {
            let (child_sum, lazy) = match self.objects.get(child) {
                Some(obj) => (obj.sum, obj.lazy_loaded || obj.short_name.is_none()),
                None => continue,
            };
            if !lazy && child_sum != sum {
                continue;
            }
            let child_name = self.object_name(child)?;
            if names_equal(&child_name, name, self.param.case_insensitive) {
                return Ok(Some(child));
            }
        }
        Ok(None)
    }

    // ── Directory membership ────────────────────────────────────────────

    pub(crate) fn add_obj_to_dir(&mut self, parent: ObjectId, child: ObjectId) {
        if let Some(old_parent) = self.objects.get(child).and_then(|o| o.parent) {
            if let Some(dir) = self.objects.get_mut(old_parent).and_then(Object::as_dir_mut) {
                dir.children.retain(|c| *c != child);
            }
        }
        if let Some(dir) = self.objects.get_mut(parent).and_then(Object::as_dir_mut) {
            if !dir.children.contains(&child) {
                dir.children.push(child);
            }
        }
        if let Some(obj) = self.objects.get_mut(child) {
            obj.parent = Some(parent);
        }
    }

    pub(crate) fn remove_obj_from_dir(&mut self, child: ObjectId) {
        if let Some(parent) = self.objects.get(child).and_then(|o| o.parent) {
            if let Some(dir) = self.objects.get_mut(parent).and_then(Object::as_dir_mut) {
                dir.children.retain(|c| *c != child);
            }
        }
        if let Some(obj) = self.objects.get_mut(child) {
            obj.parent = None;
        }
    }

    /// One-hop hard-link resolution.
    pub(crate) fn equivalent(&self, id: ObjectId) -> ObjectId {
        match self.objects.get(id).map(|o| &o.variant) {
            Some(Variant::Hardlink { equiv }) => *equiv,
            _ => id,
        }
    }

    // ── Header writes ───────────────────────────────────────────────────

    /// Serialize the object's current state into a fresh header chunk and
    /// retire the previous one. `shadows` stamps a replaced object id
    /// into the header for crash-safe rename-over.
    pub(crate) fn update_header(
        &mut self,
        id: ObjectId,
        new_name: Option<&str>,
        is_shrink: bool,
        shadows: Option<ObjectId>,
        use_reserve: bool,
    ) -> Result<()> {
        self.load_object_details(id)?;
        let name = match new_name {
            Some(name) => name.to_owned(),
            None => self.object_name(id)?,
        };

        let (header, mut tags, old_chunk) = {
            let obj = self.objects.get(id).ok_or(NlfsError::BadHandle)?;
            if obj.fake {
                return Ok(());
            }
            let object_type = obj.object_type();
            let file_size = obj.as_file().map_or(0, |f| f.file_size);
            let header = ObjHeader {
                obj_type: object_type.to_tag(),
                parent_id: obj.parent.map_or(0, |p| p.0),
                name: name.clone(),
                mode: obj.mode,
                uid: obj.uid,
                gid: obj.gid,
                atime: u32::try_from(obj.atime).unwrap_or(u32::MAX),
                mtime: u32::try_from(obj.mtime).unwrap_or(u32::MAX),
                ctime: u32::try_from(obj.ctime).unwrap_or(u32::MAX),
                file_size,
                equiv_id: match &obj.variant {
                    Variant::Hardlink { equiv } => equiv.0,
                    _ => 0,
                },
                alias: match &obj.variant {
                    Variant::Symlink { alias } => alias.clone(),
                    _ => String::new(),
                },
                rdev: match &obj.variant {
                    Variant::Special { rdev } => *rdev,
                    _ => 0,
                },
                shadows_obj: shadows.map_or(0, |s| s.0),
                inband_shadowed_obj: shadows.map_or(0, |s| s.0),
                is_shrink,
                xattrs: obj.xattrs.clone(),
            };
            let serial = (obj.serial + 1) & 3;
            let tags = ExtTags {
                chunk_used: true,
                obj_id: id.0,
                chunk_id: 0,
                serial_number: serial,
                extra_available: true,
                extra_parent_id: header.parent_id,
                extra_is_shrink: is_shrink,
                extra_shadows: header.shadows_obj,
                extra_obj_type: object_type.to_tag(),
                extra_file_size: file_size,
                ..ExtTags::default()
            };
            (header, tags, obj.hdr_chunk)
        };

        let mut buffer = self.acquire_buffer();
        let packed = header.pack(self.param.endian, buffer.as_mut_slice());
        let written = match packed {
            Ok(()) => self.write_new_chunk(buffer.as_slice(), &mut tags, use_reserve),
            Err(err) => Err(err),
        };
        self.release_buffer(buffer);
        let new_chunk = written?;

        if is_shrink {
            let (block, _) = self.param.geometry.split(new_chunk);
            self.blocks.block_info_mut(block).has_shrink_hdr = true;
        }

        let obj = self.objects.get_mut(id).expect("object present");
        obj.hdr_chunk = new_chunk;
        obj.serial = tags.serial_number;
        obj.set_name(&name);
        obj.dirty = false;
        self.dirty_dirs.remove(&id);

        if !old_chunk.is_none() {
            self.chunk_del(old_chunk, true)?;
        }
        trace!(target: "nlfs::obj", id = id.0, chunk = new_chunk.0, "header written");
        Ok(())
    }

    // ── Creation ────────────────────────────────────────────────────────

    pub(crate) fn create_object(
        &mut self,
        parent: ObjectId,
        name: &str,
        object_type: ObjectType,
        attrs: NewObject,
    ) -> Result<ObjectId> {
        self.require_writable()?;
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(NlfsError::NameTooLong);
        }
        if !self
            .objects
            .get(parent)
            .is_some_and(Object::is_dir)
        {
            return Err(NlfsError::NotDirectory);
        }
        if self.lookup_in_dir(parent, name)?.is_some() {
            return Err(NlfsError::Exists);
        }
        self.check_gc(false)?;
        if !self.check_alloc_available(1) {
            return Err(NlfsError::NoSpace);
        }

        let equiv = match object_type {
            ObjectType::Hardlink => {
                let target = attrs.equiv.ok_or(NlfsError::BadHandle)?;
                let resolved = self.equivalent(target);
                match self.objects.get(resolved).map(Object::object_type) {
                    Some(ObjectType::File | ObjectType::Directory) => Some(resolved),
                    _ => return Err(NlfsError::BadHandle),
                }
            }
            _ => None,
        };

        let id = self.objects.new_obj_id();
        let now = self.now();
        let mut obj = Object::new(id, object_type);
        obj.mode = attrs.mode;
        obj.uid = attrs.uid;
        obj.gid = attrs.gid;
        obj.atime = now;
        obj.mtime = now;
        obj.ctime = now;
        obj.set_name(name);
        match &mut obj.variant {
            Variant::Symlink { alias } => {
                let target = attrs.alias.unwrap_or_default();
                if target.len() > MAX_ALIAS_LEN {
                    return Err(NlfsError::NameTooLong);
                }
                *alias = target;
            }
            Variant::Hardlink { equiv: slot } => {
                *slot = equiv.expect("validated above");
            }
            Variant::Special { rdev } => *rdev = attrs.rdev,
            _ => {}
        }
        self.objects.insert(obj);
        self.checkpt_blocks_estimate = None;
        self.add_obj_to_dir(parent, id);
        if let Some(target) = equiv {
            if let Some(target_obj) = self.objects.get_mut(target) {
                target_obj.hardlinks.push(id);
            }
        }

        if let Err(err) = self.update_header(id, Some(name), false, None, false) {
            // roll back: the object never existed
            if let Some(target) = equiv {
                if let Some(target_obj) = self.objects.get_mut(target) {
                    target_obj.hardlinks.retain(|l| *l != id);
                }
            }
            self.remove_obj_from_dir(id);
            self.objects.remove(id);
            return Err(err);
        }
        self.mark_parent_dirty(parent);
        debug!(target: "nlfs::obj", id = id.0, ?object_type, name, "object created");
        Ok(id)
    }

    pub(crate) fn mark_parent_dirty(&mut self, dir: ObjectId) {
        let now = self.now();
        if let Some(obj) = self.objects.get_mut(dir) {
            if obj.is_dir() && !obj.fake {
                obj.mtime = now;
                obj.dirty = true;
                self.dirty_dirs.insert(dir);
            }
        }
    }

    // ── Deletion ────────────────────────────────────────────────────────

    /// Remove every trace of an object that has no remaining data:
    /// directory membership, header chunk, table record.
    pub(crate) fn free_deleted_object(&mut self, id: ObjectId) -> Result<()> {
        self.cache.invalidate_object(id);
        self.remove_obj_from_dir(id);
        let hdr_chunk = self.objects.get(id).map_or(PhysChunk::NONE, |o| o.hdr_chunk);
        if !hdr_chunk.is_none() {
            self.chunk_del(hdr_chunk, true)?;
        }
        if let Some(obj) = self.objects.remove(id) {
            if let Variant::Hardlink { equiv } = obj.variant {
                if let Some(target) = self.objects.get_mut(equiv) {
                    target.hardlinks.retain(|l| *l != id);
                }
            }
        }
        self.checkpt_blocks_estimate = None;
        Ok(())
    }

    /// Unlink-time deletion of a resolved object, including hard-link
    /// promotion and the soft-delete path for files with live data.
    pub(crate) fn delete_object(&mut self, id: ObjectId) -> Result<()> {
        let obj_type = self
            .objects
            .get(id)
            .ok_or(NlfsError::BadHandle)?
            .object_type();

        // a survivor with hard links is not deleted: the first link is
        // promoted to the object's identity instead
        let first_link = self
            .objects
            .get(id)
            .and_then(|o| o.hardlinks.first().copied());
        if let Some(link) = first_link {
            let link_name = self.object_name(link)?;
            let link_parent = self
                .objects
                .get(link)
                .and_then(|o| o.parent)
                .unwrap_or(ObjectId::ROOT);
            self.free_deleted_object(link)?;
            self.add_obj_to_dir(link_parent, id);
            self.update_header(id, Some(&link_name), false, None, true)?;
            self.mark_parent_dirty(link_parent);
            debug!(target: "nlfs::obj", id = id.0, link = link.0, "hard link promoted over delete");
            return Ok(());
        }

        match obj_type {
            ObjectType::Directory => {
                let empty = self
                    .objects
                    .get(id)
                    .and_then(Object::as_dir)
                    .is_some_and(|d| d.children.is_empty());
                if !empty {
                    return Err(NlfsError::NotEmpty);
                }
                self.free_deleted_object(id)
            }
            ObjectType::File => {
                self.cache.invalidate_object(id);
                let (has_data, open) = {
                    let obj = self.objects.get(id).ok_or(NlfsError::BadHandle)?;
                    let file = obj.as_file().ok_or(NlfsError::Fatal("file variant lost"))?;
                    (file.n_data_chunks > 0, obj.open_count > 0)
                };
                if open {
                    // external holders remain: park it in UNLINKED
                    self.add_obj_to_dir(ObjectId::UNLINKED, id);
                    if let Some(obj) = self.objects.get_mut(id) {
                        obj.unlinked = true;
                    }
                    self.stats.n_unlinked_files += 1;
                    self.update_header(id, None, false, None, true)
                } else if has_data && !self.param.format_v1 {
                    // soft delete: data chunks release lazily through GC
                    self.add_obj_to_dir(ObjectId::DELETED, id);
                    if let Some(obj) = self.objects.get_mut(id) {
                        obj.deleted = true;
                        obj.soft_del = true;
                    }
                    self.update_header(id, None, false, None, true)?;
                    self.soft_delete_file_chunks(id);
                    self.stats.n_deleted_files += 1;
                    Ok(())
                } else {
                    // legacy volumes delete hard, leaving markers behind
                    self.trim_file_chunks(id, 0)?;
                    self.free_deleted_object(id)
                }
            }
            ObjectType::Symlink | ObjectType::Hardlink | ObjectType::Special => {
                self.free_deleted_object(id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceParam;
    use crate::cx::Cx;
    use nlfs_nand::{RamNand, SharedNand, TagMode};
    use nlfs_types::{Geometry, StoredEndian};

    fn device() -> Device {
        let geometry = Geometry::new(16, 32, 512).unwrap();
        let nand = SharedNand::new(RamNand::new(geometry, StoredEndian::Little, TagMode::Oob));
        let mut dev = Device::new(Box::new(nand), DeviceParam::new(geometry)).unwrap();
        dev.format().unwrap();
        dev.mount().unwrap();
        dev
    }

    #[test]
    fn equivalent_resolves_one_hop() {
        let mut dev = device();
        let root = dev.root();
        let file = dev.create_file(root, "target", 0o644, 0, 0).unwrap();
        let link = dev.create_hardlink(root, "link", file).unwrap();

        assert_eq!(dev.equivalent(link), file);
        assert_eq!(dev.equivalent(file), file);
        // linking through a link resolves to the original, so chains
        // never exceed one hop
        let link2 = dev.create_hardlink(root, "link2", link).unwrap();
        assert_eq!(dev.equivalent(link2), file);
        let target = dev.objects.get(file).unwrap();
        assert_eq!(target.hardlinks, vec![link, link2]);
    }

    #[test]
    fn promotion_renames_the_original_into_the_links_place() {
        let mut dev = device();
        let root = dev.root();
        let sub = dev.create_dir(root, "sub", 0o755, 0, 0).unwrap();
        let file = dev.create_file(root, "orig", 0o644, 0, 0).unwrap();
        let link = dev.create_hardlink(sub, "alias", file).unwrap();

        dev.delete_object(file).unwrap();
        // the link record is gone; the file now answers to the link's
        // name under the link's parent
        assert!(!dev.objects.contains(link));
        assert!(dev.objects.contains(file));
        assert_eq!(dev.lookup_in_dir(sub, "alias").unwrap(), Some(file));
        assert_eq!(dev.lookup_in_dir(root, "orig").unwrap(), None);
        assert!(dev.objects.get(file).unwrap().hardlinks.is_empty());
    }

    #[test]
    fn update_header_retires_the_previous_chunk() {
        let mut dev = device();
        let root = dev.root();
        let id = dev.create_file(root, "hdr", 0o644, 0, 0).unwrap();
        let first = dev.objects.get(id).unwrap().hdr_chunk;
        assert!(!first.is_none());
        let (block, offset) = dev.param.geometry.split(first);

        dev.update_header(id, None, false, None, false).unwrap();
        let second = dev.objects.get(id).unwrap().hdr_chunk;
        assert_ne!(first, second);
        // the old header's bitmap bit is withdrawn
        assert!(!dev.blocks.check_chunk_bit(block, offset));
        // serial advanced modulo 4
        assert_eq!(dev.objects.get(id).unwrap().serial, 2);
    }

    #[test]
    fn lookup_prefilter_skips_mismatched_checksums() {
        let mut dev = device();
        let root = dev.root();
        for name in ["alpha", "beta", "gamma", "delta"] {
            dev.create_file(root, name, 0o644, 0, 0).unwrap();
        }
        let reads_before = dev.stats.n_page_reads;
        assert!(dev.lookup_in_dir(root, "gamma").unwrap().is_some());
        // short inline names resolve without touching flash
        assert_eq!(dev.stats.n_page_reads, reads_before);
        assert!(dev.lookup_in_dir(root, "epsilon").unwrap().is_none());
    }

    #[test]
    fn headerless_placeholders_get_synthesized_names() {
        let mut dev = device();
        let mut ghost = Object::new(ObjectId(777), ObjectType::File);
        ghost.lazy_loaded = true;
        dev.objects.insert(ghost);
        assert_eq!(dev.object_name(ObjectId(777)).unwrap(), "obj777");
    }

    #[test]
    fn soft_delete_moves_accounting_but_keeps_tags() {
        let mut dev = device();
        let root = dev.root();
        let id = dev.create_file(root, "victim", 0o644, 0, 0).unwrap();
        for i in 0..4u64 {
            dev.write_file(&Cx::none(), id, i * 512, &[3; 512], false).unwrap();
        }
        let chunk0 = dev.find_data_chunk(id, 0).unwrap().unwrap();
        let (block, offset) = dev.param.geometry.split(chunk0);
        let free_before = dev.n_free_chunks;

        dev.soft_delete_file_chunks(id);
        // accounting released the chunks
        assert_eq!(dev.n_free_chunks, free_before + 4);
        assert_eq!(dev.blocks.block_info(block).soft_del_pages, 4);
        // but the bitmap bit and the flash tags are untouched until GC
        assert!(dev.blocks.check_chunk_bit(block, offset));
        let file = dev.objects.get(id).unwrap().as_file().unwrap();
        assert!(file.top.is_none());
        assert_eq!(file.n_data_chunks, 4);
    }

    #[test]
    fn create_rolls_back_when_the_header_cannot_land() {
        let geometry = Geometry::new(16, 32, 512).unwrap();
        let nand = SharedNand::new(RamNand::new(geometry, StoredEndian::Little, TagMode::Oob));
        let mut param = DeviceParam::new(geometry);
        param.wr_attempts = 1;
        let mut dev = Device::new(Box::new(nand.clone()), param).unwrap();
        dev.format().unwrap();
        dev.mount().unwrap();
        let root = dev.root();

        nand.with(|n| n.faults.fail_writes = 50);
        assert!(dev.create_file(root, "doomed", 0o644, 0, 0).is_err());
        assert!(dev.lookup_in_dir(root, "doomed").unwrap().is_none());
        // no half-created object survives
        assert_eq!(dev.objects.len(), 4);
    }
}
