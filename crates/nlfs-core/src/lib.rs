#![forbid(unsafe_code)]
//! Log-structured object store for raw NAND flash.
//!
//! The [`Device`] owns everything reachable from one mounted volume: the
//! block table and free-space map, the out-of-place allocator, the object
//! table with its per-file index trees, the small write-back cache, the
//! garbage collector, and the mount-time scan that rebuilds RAM state from
//! flash. Callers reach it through the operation surface in [`ops`].
//!
//! Concurrency model: single-threaded cooperative. One `Device` is one
//! mutually-exclusive region; long loops poll a [`Cx`] at chunk-sized
//! yield points.

mod alloc;
mod buffer;
mod cache;
mod checkpoint;
mod config;
mod cx;
mod device;
mod gc;
mod header;
mod io;
mod lifecycle;
mod object;
mod ops;
mod scan;
mod tnode;
mod xattr;

pub use cache::ChunkCache;
pub use checkpoint::CHECKPOINT_OBJECT_ID;
pub use config::{DeviceParam, DeviceStats};
pub use cx::Cx;
pub use device::Device;
pub use object::{Object, ObjectTable, ObjectType, Variant};
pub use ops::{Attr, DirEntry};
pub use tnode::{Tnode, TnodeLayout};
pub use xattr::XattrEntry;
