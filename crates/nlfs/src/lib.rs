#![forbid(unsafe_code)]
//! nlfs public API facade.
//!
//! Re-exports the core object store plus a [`Volume`] handle that
//! provides the device-wide mutually-exclusive region: every operation
//! enters the region on call and leaves it on return, which is the
//! concurrency contract the core assumes. A supervisory thread can share
//! the handle to run background GC between caller operations.

pub use nlfs_block::{BlockInfo, BlockState};
pub use nlfs_core::{
    Attr, ChunkCache, Cx, Device, DeviceParam, DeviceStats, DirEntry, Object, ObjectTable,
    ObjectType, Tnode, TnodeLayout, Variant, XattrEntry,
};
pub use nlfs_error::{NlfsError, Result};
pub use nlfs_nand::{
    pack_tags, unpack_tags, EccStatus, ExtTags, FaultPlan, NandDriver, RamNand, SharedNand,
    TagMode, PACKED_TAGS_SIZE,
};
pub use nlfs_types::{
    fsize_combine, fsize_split, BlockId, Geometry, ObjectId, PhysChunk, SeqNumber, StoredEndian,
};

use parking_lot::Mutex;
use std::sync::Arc;

/// A mounted (or mountable) volume behind the device-wide lock.
#[derive(Clone)]
pub struct Volume {
    device: Arc<Mutex<Device>>,
}

impl Volume {
    pub fn new(driver: Box<dyn NandDriver>, param: DeviceParam) -> Result<Self> {
        Ok(Self {
            device: Arc::new(Mutex::new(Device::new(driver, param)?)),
        })
    }

    /// Enter the device region and run `f`.
    pub fn with<R>(&self, f: impl FnOnce(&mut Device) -> R) -> R {
        f(&mut self.device.lock())
    }

    pub fn format(&self) -> Result<()> {
        self.with(Device::format)
    }

    pub fn mount(&self) -> Result<()> {
        self.with(Device::mount)
    }

    pub fn unmount(&self) -> Result<()> {
        self.with(Device::unmount)
    }

    pub fn sync(&self, checkpoint: bool) -> Result<()> {
        self.with(|dev| dev.sync(checkpoint))
    }

    /// One background-GC invocation; returns whether a block moved.
    pub fn background_gc(&self) -> Result<bool> {
        self.with(Device::background_gc)
    }

    pub fn root(&self) -> ObjectId {
        ObjectId::ROOT
    }

    pub fn stats(&self) -> DeviceStats {
        self.with(|dev| dev.stats())
    }
}
