//! Caller-facing operations.
//!
//! This is a library surface, not a CLI: a path façade above it resolves
//! names to object ids and owns per-open-file state. Every operation
//! enters with the device region held (see the `nlfs` facade) and returns
//! exactly one error kind on failure.

use crate::config::DeviceStats;
use crate::cx::Cx;
use crate::device::Device;
use crate::lifecycle::NewObject;
use crate::object::{Object, ObjectType, Variant};
use crate::xattr::{self, XattrEntry};
use crate::header::HEADER_FIXED_BYTES;
use nlfs_error::{NlfsError, Result};
use nlfs_nand::ExtTags;
use nlfs_types::{ObjectId, FSIZE_MAX, MAX_NAME_LEN};
use tracing::debug;

/// Attribute record returned by [`Device::stat`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    pub id: ObjectId,
    pub object_type: ObjectType,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub size: u64,
    pub n_links: u32,
    pub rdev: u32,
}

/// One directory entry from [`Device::readdir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub id: ObjectId,
    pub name: String,
    pub object_type: ObjectType,
}

impl Device {
    // ── Create ──────────────────────────────────────────────────────────

    pub fn create_file(
        &mut self,
        parent: ObjectId,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<ObjectId> {
        self.create_object(
            parent,
            name,
            ObjectType::File,
            NewObject {
                mode,
                uid,
                gid,
                ..NewObject::default()
            },
        )
    }

    pub fn create_dir(
        &mut self,
        parent: ObjectId,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<ObjectId> {
        self.create_object(
            parent,
            name,
            ObjectType::Directory,
            NewObject {
                mode,
                uid,
                gid,
                ..NewObject::default()
            },
        )
    }

    pub fn create_symlink(
        &mut self,
        parent: ObjectId,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
        alias: &str,
    ) -> Result<ObjectId> {
        self.create_object(
            parent,
            name,
            ObjectType::Symlink,
            NewObject {
                mode,
                uid,
                gid,
                alias: Some(alias.to_owned()),
                ..NewObject::default()
            },
        )
    }

    pub fn create_hardlink(
        &mut self,
        parent: ObjectId,
        name: &str,
        target: ObjectId,
    ) -> Result<ObjectId> {
        self.create_object(
            parent,
            name,
            ObjectType::Hardlink,
            NewObject {
                equiv: Some(target),
                ..NewObject::default()
            },
        )
    }

    pub fn create_special(
        &mut self,
        parent: ObjectId,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
        rdev: u32,
    ) -> Result<ObjectId> {
        self.create_object(
            parent,
            name,
            ObjectType::Special,
            NewObject {
                mode,
                uid,
                gid,
                rdev,
                ..NewObject::default()
            },
        )
    }

    // ── Lookup / directory iteration ────────────────────────────────────

    /// Resolve `name` inside directory `dir`.
    pub fn lookup(&mut self, dir: ObjectId, name: &str) -> Result<ObjectId> {
        self.require_mounted()?;
        self.lookup_in_dir(dir, name)?
            .ok_or_else(|| NlfsError::NotFound(name.to_owned()))
    }

    /// Next child at `cursor`, or `None` at end of directory.
    pub fn readdir(&mut self, dir: ObjectId, cursor: usize) -> Result<Option<DirEntry>> {
        self.require_mounted()?;
        let child = {
            let obj = self.objects.get(dir).ok_or(NlfsError::BadHandle)?;
            let dir_var = obj.as_dir().ok_or(NlfsError::NotDirectory)?;
            dir_var.children.get(cursor).copied()
        };
        let Some(id) = child else { return Ok(None) };
        let name = self.object_name(id)?;
        let object_type = self
            .objects
            .get(id)
            .ok_or(NlfsError::BadHandle)?
            .object_type();
        Ok(Some(DirEntry {
            id,
            name,
            object_type,
        }))
    }

    /// Attribute record; hard links report their target.
    pub fn stat(&mut self, id: ObjectId) -> Result<Attr> {
        self.require_mounted()?;
        let resolved = self.equivalent(id);
        self.load_object_details(resolved)?;
        let obj = self.objects.get(resolved).ok_or(NlfsError::BadHandle)?;
        let (size, rdev) = match &obj.variant {
            Variant::File(f) => (f.file_size, 0),
            Variant::Symlink { alias } => (alias.len() as u64, 0),
            Variant::Special { rdev } => (0, *rdev),
            _ => (0, 0),
        };
        Ok(Attr {
            id: obj.id,
            object_type: obj.object_type(),
            mode: obj.mode,
            uid: obj.uid,
            gid: obj.gid,
            atime: obj.atime,
            mtime: obj.mtime,
            ctime: obj.ctime,
            size,
            n_links: 1 + u32::try_from(obj.hardlinks.len()).unwrap_or(u32::MAX),
            rdev,
        })
    }

    /// Symlink target.
    pub fn read_alias(&mut self, id: ObjectId) -> Result<String> {
        self.require_mounted()?;
        self.load_object_details(id)?;
        match &self.objects.get(id).ok_or(NlfsError::BadHandle)?.variant {
            Variant::Symlink { alias } => Ok(alias.clone()),
            _ => Err(NlfsError::BadHandle),
        }
    }

    // ── Unlink / rename ─────────────────────────────────────────────────

    pub fn unlink(&mut self, dir: ObjectId, name: &str) -> Result<()> {
        self.require_writable()?;
        self.check_gc(false)?;
        let id = self
            .lookup_in_dir(dir, name)?
            .ok_or_else(|| NlfsError::NotFound(name.to_owned()))?;
        if id.is_pseudo() {
            return Err(NlfsError::Busy);
        }
        self.delete_object(id)?;
        self.mark_parent_dirty(dir);
        Ok(())
    }

    pub fn rename(
        &mut self,
        old_dir: ObjectId,
        old_name: &str,
        new_dir: ObjectId,
        new_name: &str,
    ) -> Result<()> {
        self.require_writable()?;
        if new_name.is_empty() || new_name.len() > MAX_NAME_LEN {
            return Err(NlfsError::NameTooLong);
        }
        self.check_gc(false)?;
        let id = self
            .lookup_in_dir(old_dir, old_name)?
            .ok_or_else(|| NlfsError::NotFound(old_name.to_owned()))?;
        if id.is_pseudo() {
            return Err(NlfsError::Busy);
        }
        if !self.objects.get(new_dir).is_some_and(Object::is_dir) {
            return Err(NlfsError::NotDirectory);
        }

        // a directory cannot move into its own subtree
        if self.objects.get(id).is_some_and(Object::is_dir) {
            let mut at = new_dir;
            loop {
                if at == id {
                    return Err(NlfsError::Range);
                }
                match self.objects.get(at).and_then(|o| o.parent) {
                    Some(parent) => at = parent,
                    None => break,
                }
            }
        }

        let mut shadows = None;
        if let Some(target) = self.lookup_in_dir(new_dir, new_name)? {
            if target == id {
                return Ok(());
            }
            let target_is_dir = self.objects.get(target).is_some_and(Object::is_dir);
            let source_is_dir = self.objects.get(id).is_some_and(Object::is_dir);
            match (source_is_dir, target_is_dir) {
                (true, false) => return Err(NlfsError::NotDirectory),
                (false, true) => return Err(NlfsError::IsDirectory),
                _ => {}
            }
            self.delete_object(target)?;
            // the replacement header declares the old id dead, so a crash
            // between the delete and the rename resolves cleanly
            shadows = Some(target);
        }

        self.add_obj_to_dir(new_dir, id);
        self.update_header(id, Some(new_name), false, shadows, false)?;
        self.mark_parent_dirty(old_dir);
        self.mark_parent_dirty(new_dir);
        debug!(
            target: "nlfs::ops",
            id = id.0,
            old_name,
            new_name,
            "renamed"
        );
        Ok(())
    }

    // ── Open-handle accounting ──────────────────────────────────────────

    /// The façade registered an open handle.
    pub fn open_object(&mut self, id: ObjectId) -> Result<()> {
        self.require_mounted()?;
        let obj = self.objects.get_mut(id).ok_or(NlfsError::BadHandle)?;
        obj.open_count += 1;
        Ok(())
    }

    /// The façade dropped a handle; an unlinked object with no remaining
    /// holders is deleted for real now.
    pub fn close_object(&mut self, id: ObjectId) -> Result<()> {
        self.require_mounted()?;
        let (finish, has_data) = {
            let obj = self.objects.get_mut(id).ok_or(NlfsError::BadHandle)?;
            obj.open_count = obj.open_count.saturating_sub(1);
            let finish = obj.open_count == 0 && obj.unlinked;
            if finish {
                obj.unlinked = false;
            }
            (finish, obj.as_file().is_some_and(|f| f.n_data_chunks > 0))
        };
        if finish {
            if has_data && !self.param.format_v1 {
                self.add_obj_to_dir(ObjectId::DELETED, id);
                if let Some(obj) = self.objects.get_mut(id) {
                    obj.deleted = true;
                    obj.soft_del = true;
                }
                self.update_header(id, None, false, None, true)?;
                self.soft_delete_file_chunks(id);
                self.stats.n_deleted_files += 1;
            } else {
                self.trim_file_chunks(id, 0)?;
                self.free_deleted_object(id)?;
            }
        }
        Ok(())
    }

    // ── Read ────────────────────────────────────────────────────────────

    /// Read up to `buf.len()` bytes at `offset`. Short reads happen only
    /// at end of file; reads past it return 0.
    pub fn read_file(
        &mut self,
        cx: &Cx,
        id: ObjectId,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        self.require_mounted()?;
        let file_size = {
            let obj = self.objects.get(id).ok_or(NlfsError::BadHandle)?;
            if obj.is_dir() {
                return Err(NlfsError::IsDirectory);
            }
            obj.as_file().ok_or(NlfsError::BadHandle)?.file_size
        };
        if offset >= file_size || buf.is_empty() {
            return Ok(0);
        }
        let chunk_bytes = self.chunk_bytes() as u64;
        let total = usize::try_from((file_size - offset).min(buf.len() as u64))
            .map_err(|_| NlfsError::Range)?;

        let mut done = 0usize;
        let mut pos = offset;
        while done < total {
            cx.checkpoint()?;
            #[allow(clippy::cast_possible_truncation)]
            let logical = (pos / chunk_bytes) as u32;
            #[allow(clippy::cast_possible_truncation)]
            let start = (pos % chunk_bytes) as usize;
            let n = (chunk_bytes as usize - start).min(total - done);

            if let Some(idx) = self.cache.find(id, logical) {
                self.stats.cache_hits += 1;
                self.cache.touch(idx);
                let slot = self.cache.slot_mut(idx);
                slot.locked = true;
                buf[done..done + n].copy_from_slice(&slot.data[start..start + n]);
                slot.locked = false;
            } else if start == 0 && n == chunk_bytes as usize {
                // whole-chunk read goes straight to flash
                self.read_chunk_into(id, logical, &mut buf[done..done + n])?;
            } else {
                let idx = self.grab_cache_slot(id, logical)?;
                let slot = self.cache.slot_mut(idx);
                slot.locked = true;
                buf[done..done + n].copy_from_slice(&slot.data[start..start + n]);
                slot.locked = false;
            }
            done += n;
            pos += n as u64;
        }
        Ok(total)
    }

    /// Read one whole chunk's worth of file data (zeros for holes).
    fn read_chunk_into(&mut self, id: ObjectId, logical: u32, out: &mut [u8]) -> Result<()> {
        match self.find_data_chunk(id, logical)? {
            Some(chunk) => {
                let mut buffer = self.acquire_buffer();
                let outcome = self.rd_chunk_tags(chunk, Some(buffer.as_mut_slice()));
                if outcome.is_ok() {
                    let n = out.len().min(buffer.as_slice().len());
                    out[..n].copy_from_slice(&buffer.as_slice()[..n]);
                }
                self.release_buffer(buffer);
                outcome.map(|_| ())
            }
            None => {
                out.fill(0);
                Ok(())
            }
        }
    }

    // ── Write ───────────────────────────────────────────────────────────

    /// Write `buf` at `offset`. Whole aligned chunks may bypass the
    /// cache; partial chunks read-modify-write through it. Writing zero
    /// bytes is a no-op.
    pub fn write_file(
        &mut self,
        cx: &Cx,
        id: ObjectId,
        offset: u64,
        buf: &[u8],
        write_through: bool,
    ) -> Result<usize> {
        self.require_writable()?;
        {
            let obj = self.objects.get(id).ok_or(NlfsError::BadHandle)?;
            if obj.is_dir() {
                return Err(NlfsError::IsDirectory);
            }
            if obj.as_file().is_none() {
                return Err(NlfsError::BadHandle);
            }
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(NlfsError::Range)?;
        if end > FSIZE_MAX {
            return Err(NlfsError::Range);
        }

        let chunk_bytes = self.chunk_bytes() as u64;
        let mut done = 0usize;
        let mut pos = offset;
        while done < buf.len() {
            cx.checkpoint()?;
            self.check_gc(false)?;
            #[allow(clippy::cast_possible_truncation)]
            let logical = (pos / chunk_bytes) as u32;
            #[allow(clippy::cast_possible_truncation)]
            let start = (pos % chunk_bytes) as usize;
            let n = (chunk_bytes as usize - start).min(buf.len() - done);

            let whole = start == 0 && n == chunk_bytes as usize;
            let bypass = whole && self.param.cache_bypass_aligned && !self.param.inband_tags;
            if bypass {
                // invalidation is mandatory on a whole-chunk write
                self.cache.invalidate_chunk(id, logical);
                #[allow(clippy::cast_possible_truncation)]
                self.write_data_chunk(id, logical, &buf[done..done + n], n as u32)?;
            } else {
                let idx = self.grab_cache_slot(id, logical)?;
                let slot = self.cache.slot_mut(idx);
                slot.locked = true;
                slot.data[start..start + n].copy_from_slice(&buf[done..done + n]);
                slot.n_bytes = slot.n_bytes.max(start + n);
                slot.dirty = true;
                slot.locked = false;
                if write_through {
                    self.flush_cache_slot(idx)?;
                }
            }

            done += n;
            pos += n as u64;
            let obj = self.objects.get_mut(id).expect("checked above");
            let file = obj.as_file_mut().expect("checked above");
            if pos > file.file_size {
                file.file_size = pos;
            }
            if pos > file.stored_size {
                file.stored_size = pos;
            }
            obj.dirty = true;
        }

        let now = self.now();
        if let Some(obj) = self.objects.get_mut(id) {
            obj.mtime = now;
        }
        Ok(done)
    }

    /// Out-of-place write of one data chunk plus the index-tree update
    /// and the previous copy's deletion.
    pub(crate) fn write_data_chunk(
        &mut self,
        id: ObjectId,
        logical: u32,
        data: &[u8],
        n_bytes: u32,
    ) -> Result<()> {
        let previous = self.find_data_chunk(id, logical)?;
        let mut tags = ExtTags::for_data(id.0, logical, n_bytes, 0);
        if self.param.format_v1 {
            if let Some(prev) = previous {
                let old_tags = self.rd_chunk_tags(prev, None)?;
                tags.serial_number = (old_tags.serial_number + 1) & 3;
            }
        }
        let chunk = self.write_new_chunk(data, &mut tags, false)?;
        self.put_chunk_in_file(id, logical, chunk)?;
        if let Some(prev) = previous {
            self.chunk_del(prev, true)?;
        }
        Ok(())
    }

    // ── Cache internals ─────────────────────────────────────────────────

    /// Bind a slot to `(id, logical)`, filling it from flash when the
    /// chunk already exists. A dirty victim is flushed first.
    fn grab_cache_slot(&mut self, id: ObjectId, logical: u32) -> Result<usize> {
        if let Some(idx) = self.cache.find(id, logical) {
            self.stats.cache_hits += 1;
            self.cache.touch(idx);
            return Ok(idx);
        }
        self.stats.cache_misses += 1;
        let idx = self.cache.victim().ok_or(NlfsError::NoMemory)?;
        if self.cache.slot(idx).dirty {
            self.flush_cache_slot(idx)?;
        }
        self.cache.slot_mut(idx).reset();

        let chunk_bytes = self.chunk_bytes();
        let mut staged = vec![0u8; chunk_bytes];
        let mut stored = 0usize;
        if self.find_data_chunk(id, logical)?.is_some() {
            self.read_chunk_into(id, logical, &mut staged)?;
            stored = chunk_bytes;
        }

        let slot = self.cache.slot_mut(idx);
        slot.object = Some(id);
        slot.logical = logical;
        slot.data.copy_from_slice(&staged);
        slot.n_bytes = stored;
        self.cache.touch(idx);
        Ok(idx)
    }

    /// Write a dirty slot out as a full chunk, padded to its stored
    /// length.
    pub(crate) fn flush_cache_slot(&mut self, idx: usize) -> Result<()> {
        let (id, logical, n_bytes, data) = {
            let slot = self.cache.slot(idx);
            if !slot.dirty {
                return Ok(());
            }
            let Some(id) = slot.object else {
                return Ok(());
            };
            (id, slot.logical, slot.n_bytes, slot.data.clone())
        };
        let n = u32::try_from(n_bytes).map_err(|_| NlfsError::Range)?;
        self.write_data_chunk(id, logical, &data, n)?;
        self.cache.slot_mut(idx).dirty = false;
        Ok(())
    }

    fn flush_file_cache(&mut self, id: ObjectId) -> Result<()> {
        for idx in self.cache.slots_for(id) {
            self.flush_cache_slot(idx)?;
        }
        Ok(())
    }

    // ── Resize ──────────────────────────────────────────────────────────

    /// Truncate or extend. Extension creates a hole; truncation hard-
    /// deletes the dead chunks and emits a shrink header.
    pub fn resize(&mut self, id: ObjectId, new_size: u64) -> Result<()> {
        self.require_writable()?;
        let old_size = {
            let obj = self.objects.get(id).ok_or(NlfsError::BadHandle)?;
            if obj.is_dir() {
                return Err(NlfsError::IsDirectory);
            }
            obj.as_file().ok_or(NlfsError::BadHandle)?.file_size
        };
        if new_size > FSIZE_MAX {
            return Err(NlfsError::Range);
        }
        if new_size == old_size {
            return Ok(());
        }
        self.check_gc(false)?;

        if new_size < old_size {
            self.flush_file_cache(id)?;
            let chunk_bytes = self.chunk_bytes() as u64;
            #[allow(clippy::cast_possible_truncation)]
            let first_dead = new_size.div_ceil(chunk_bytes) as u32;
            for idx in self.cache.slots_for(id) {
                if self.cache.slot(idx).logical >= first_dead {
                    self.cache.slot_mut(idx).reset();
                }
            }
            self.trim_file_chunks(id, first_dead)?;
            let now = self.now();
            {
                let obj = self.objects.get_mut(id).expect("checked above");
                let file = obj.as_file_mut().expect("checked above");
                file.file_size = new_size;
                file.stored_size = file.stored_size.min(new_size);
                file.shrink_size = if file.shrink_size == 0 {
                    new_size
                } else {
                    file.shrink_size.min(new_size)
                };
                obj.mtime = now;
            }
            self.update_header(id, None, true, None, false)?;
        } else {
            let now = self.now();
            {
                let obj = self.objects.get_mut(id).expect("checked above");
                let file = obj.as_file_mut().expect("checked above");
                file.file_size = new_size;
                obj.mtime = now;
            }
            self.update_header(id, None, false, None, false)?;
        }
        Ok(())
    }

    // ── Flush / sync ────────────────────────────────────────────────────

    /// Flush one object: cache slots out, optionally stamp mtime, write
    /// the header if dirty (skipped for data-only sync), optionally drop
    /// the cache binding.
    pub fn flush_object(
        &mut self,
        id: ObjectId,
        update_time: bool,
        data_sync: bool,
        discard_cache: bool,
    ) -> Result<()> {
        self.require_mounted()?;
        if !self.objects.contains(id) {
            return Err(NlfsError::BadHandle);
        }
        self.flush_file_cache(id)?;
        if update_time {
            let now = self.now();
            if let Some(obj) = self.objects.get_mut(id) {
                obj.mtime = now;
                obj.dirty = true;
            }
        }
        let dirty = self.objects.get(id).is_some_and(|o| o.dirty);
        if dirty && !data_sync && !self.read_only {
            self.update_header(id, None, false, None, false)?;
        }
        if discard_cache {
            self.cache.invalidate_object(id);
        }
        Ok(())
    }

    /// Flush the whole device; optionally also write a checkpoint for
    /// fast remount.
    pub fn sync(&mut self, write_checkpoint: bool) -> Result<()> {
        self.require_mounted()?;
        if self.read_only {
            return Err(NlfsError::ReadOnly);
        }
        while let Some(idx) = self.cache.any_dirty() {
            self.flush_cache_slot(idx)?;
        }
        let dirty: Vec<ObjectId> = self
            .objects
            .iter()
            .filter(|o| o.dirty && !o.fake)
            .map(|o| o.id)
            .collect();
        for id in dirty {
            self.update_header(id, None, false, None, false)?;
        }
        self.dirty_dirs.clear();
        if write_checkpoint {
            self.write_checkpoint()?;
        }
        Ok(())
    }

    // ── Extended attributes ─────────────────────────────────────────────

    fn xattr_capacity(&self) -> usize {
        self.chunk_bytes() - HEADER_FIXED_BYTES
    }

    pub fn set_xattr(&mut self, id: ObjectId, name: &str, value: &[u8]) -> Result<()> {
        self.require_writable()?;
        self.load_object_details(id)?;
        let mut entries = self
            .objects
            .get(id)
            .ok_or(NlfsError::BadHandle)?
            .xattrs
            .clone();
        xattr::set_entry(&mut entries, name, value);
        // prove the new set still fits the header tail before committing
        xattr::encode_xattrs(self.param.endian, &entries, self.xattr_capacity())?;
        self.objects
            .get_mut(id)
            .expect("checked above")
            .xattrs = entries;
        self.update_header(id, None, false, None, false)
    }

    pub fn get_xattr(&mut self, id: ObjectId, name: &str) -> Result<Vec<u8>> {
        self.require_mounted()?;
        self.load_object_details(id)?;
        self.objects
            .get(id)
            .ok_or(NlfsError::BadHandle)?
            .xattrs
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.value.clone())
            .ok_or(NlfsError::NoData)
    }

    pub fn list_xattr(&mut self, id: ObjectId) -> Result<Vec<String>> {
        self.require_mounted()?;
        self.load_object_details(id)?;
        Ok(self
            .objects
            .get(id)
            .ok_or(NlfsError::BadHandle)?
            .xattrs
            .iter()
            .map(|e| e.name.clone())
            .collect())
    }

    pub fn remove_xattr(&mut self, id: ObjectId, name: &str) -> Result<()> {
        self.require_writable()?;
        self.load_object_details(id)?;
        let mut entries = self
            .objects
            .get(id)
            .ok_or(NlfsError::BadHandle)?
            .xattrs
            .clone();
        xattr::remove_entry(&mut entries, name)?;
        self.objects
            .get_mut(id)
            .expect("checked above")
            .xattrs = entries;
        self.update_header(id, None, false, None, false)
    }

    /// Copy of the current xattr set (for inspection tools).
    pub fn xattrs(&mut self, id: ObjectId) -> Result<Vec<XattrEntry>> {
        self.require_mounted()?;
        self.load_object_details(id)?;
        Ok(self
            .objects
            .get(id)
            .ok_or(NlfsError::BadHandle)?
            .xattrs
            .clone())
    }

    // ── Introspection ───────────────────────────────────────────────────

    /// Root directory handle.
    #[must_use]
    pub fn root(&self) -> ObjectId {
        ObjectId::ROOT
    }

    /// Counters snapshot including cache and GC activity.
    #[must_use]
    pub fn counters(&self) -> DeviceStats {
        self.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceParam;
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
    fn partial_writes_hit_the_cache_on_reread() {
        let mut dev = device();
        let root = dev.root();
        let id = dev.create_file(root, "c", 0o644, 0, 0).unwrap();
        dev.write_file(&Cx::none(), id, 0, &[1; 100], false).unwrap();
        let misses_after_write = dev.stats.cache_misses;
        assert!(misses_after_write >= 1);

        let mut buf = [0u8; 100];
        dev.read_file(&Cx::none(), id, 0, &mut buf).unwrap();
        assert!(dev.stats.cache_hits >= 1);
        assert_eq!(dev.stats.cache_misses, misses_after_write);
        assert_eq!(buf, [1; 100]);
    }

    #[test]
    fn aligned_writes_bypass_the_cache() {
        let mut dev = device();
        let root = dev.root();
        let id = dev.create_file(root, "b", 0o644, 0, 0).unwrap();
        dev.write_file(&Cx::none(), id, 0, &[2; 1024], false).unwrap();
        assert_eq!(dev.stats.cache_misses, 0);
        assert_eq!(dev.cache.any_dirty(), None);
        // on-flash immediately: two data chunks recorded
        assert_eq!(
            dev.objects.get(id).unwrap().as_file().unwrap().n_data_chunks,
            2
        );
    }

    #[test]
    fn bypass_disabled_routes_everything_through_the_cache() {
        let geometry = Geometry::new(16, 32, 512).unwrap();
        let nand = SharedNand::new(RamNand::new(geometry, StoredEndian::Little, TagMode::Oob));
        let mut param = DeviceParam::new(geometry);
        param.cache_bypass_aligned = false;
        let mut dev = Device::new(Box::new(nand), param).unwrap();
        dev.format().unwrap();
        dev.mount().unwrap();
        let root = dev.root();
        let id = dev.create_file(root, "b", 0o644, 0, 0).unwrap();

        dev.write_file(&Cx::none(), id, 0, &[3; 512], false).unwrap();
        assert!(dev.cache.any_dirty().is_some());
        dev.sync(false).unwrap();
        assert_eq!(dev.cache.any_dirty(), None);
        let mut buf = [0u8; 512];
        dev.read_file(&Cx::none(), id, 0, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 3));
    }

    #[test]
    fn write_through_flushes_immediately() {
        let mut dev = device();
        let root = dev.root();
        let id = dev.create_file(root, "wt", 0o644, 0, 0).unwrap();
        dev.write_file(&Cx::none(), id, 0, &[4; 100], true).unwrap();
        assert_eq!(dev.cache.any_dirty(), None);
        assert_eq!(
            dev.objects.get(id).unwrap().as_file().unwrap().n_data_chunks,
            1
        );
    }

    #[test]
    fn flush_with_discard_unbinds_the_cache() {
        let mut dev = device();
        let root = dev.root();
        let id = dev.create_file(root, "d", 0o644, 0, 0).unwrap();
        dev.write_file(&Cx::none(), id, 0, &[5; 100], false).unwrap();
        dev.flush_object(id, true, false, true).unwrap();
        assert!(dev.cache.slots_for(id).is_empty());
        let mut buf = [0u8; 100];
        dev.read_file(&Cx::none(), id, 0, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 5));
    }

    #[test]
    fn readdir_walks_children_in_order() {
        let mut dev = device();
        let root = dev.root();
        dev.create_file(root, "one", 0o644, 0, 0).unwrap();
        dev.create_dir(root, "two", 0o755, 0, 0).unwrap();
        let mut names = Vec::new();
        let mut cursor = 0;
        while let Some(entry) = dev.readdir(root, cursor).unwrap() {
            names.push((entry.name, entry.object_type));
            cursor += 1;
        }
        assert_eq!(
            names,
            vec![
                ("lost+found".to_owned(), ObjectType::Directory),
                ("one".to_owned(), ObjectType::File),
                ("two".to_owned(), ObjectType::Directory),
            ]
        );
        assert!(dev.readdir(root, cursor).unwrap().is_none());
    }

    #[test]
    fn cancellation_interrupts_bulk_io() {
        let mut dev = device();
        let root = dev.root();
        let id = dev.create_file(root, "big", 0o644, 0, 0).unwrap();
        let (cx, flag) = Cx::cancellable();
        flag.store(true, std::sync::atomic::Ordering::Relaxed);
        assert!(matches!(
            dev.write_file(&cx, id, 0, &[0; 2048], false),
            Err(NlfsError::Cancelled)
        ));
        // nothing landed: the cancel fired at the first yield point
        assert_eq!(
            dev.objects.get(id).unwrap().as_file().unwrap().n_data_chunks,
            0
        );
    }
}
