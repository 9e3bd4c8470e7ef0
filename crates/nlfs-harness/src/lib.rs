#![forbid(unsafe_code)]
//! Test harness for nlfs: shared-device construction, a minimal path
//! walker (the real path façade lives above the core), and the smoke
//! report used by the harness binary.

use anyhow::{bail, Context};
use nlfs::{
    Cx, Device, DeviceParam, Geometry, NlfsError, ObjectId, ObjectType, RamNand, Result,
    SharedNand,
};
use serde::Serialize;

/// Symlink-following depth limit, matching the loop error contract.
const MAX_FOLLOW: u32 = 5;

/// Standard small test device: 16 blocks × 32 chunks × 512 bytes.
#[must_use]
pub fn small_geometry() -> Geometry {
    Geometry::new(16, 32, 512).expect("valid test geometry")
}

/// Roomier device for population tests: 64 blocks × 32 chunks.
#[must_use]
pub fn medium_geometry() -> Geometry {
    Geometry::new(64, 32, 512).expect("valid test geometry")
}

/// Build a formatted, mounted device on shared RAM NAND. The returned
/// handle survives the device, which is how power loss is simulated:
/// drop the device, remount a new one on the same handle.
pub fn fresh_device(geometry: Geometry, param: Option<DeviceParam>) -> Result<(SharedNand, Device)> {
    let param = param.unwrap_or_else(|| DeviceParam::new(geometry));
    let mode = param.tag_mode();
    let nand = SharedNand::new(RamNand::new(geometry, param.endian, mode));
    let mut device = Device::new(Box::new(nand.clone()), param)?;
    device.format()?;
    device.mount()?;
    Ok((nand, device))
}

/// Mount another device over an existing NAND image (the "after power
/// loss" view: all RAM state discarded).
pub fn remount(nand: &SharedNand, param: DeviceParam) -> Result<Device> {
    let mut device = Device::new(Box::new(nand.clone()), param)?;
    device.mount()?;
    Ok(device)
}

/// Resolve a `/`-separated path from the root, following symlink aliases
/// up to the depth limit. This stands in for the out-of-scope POSIX
/// façade in scenario tests.
pub fn resolve_path(device: &mut Device, path: &str) -> Result<ObjectId> {
    resolve_from(device, ObjectId::ROOT, path, 0)
}

fn resolve_from(device: &mut Device, base: ObjectId, path: &str, depth: u32) -> Result<ObjectId> {
    let mut at = if path.starts_with('/') {
        ObjectId::ROOT
    } else {
        base
    };
    for part in path.split('/').filter(|p| !p.is_empty()) {
        let next = device.lookup(at, part)?;
        let attr_type = device.stat(next)?.object_type;
        if attr_type == ObjectType::Symlink {
            if depth >= MAX_FOLLOW {
                return Err(NlfsError::LinkLoop);
            }
            let alias = device.read_alias(next)?;
            at = resolve_from(device, at, &alias, depth + 1)?;
        } else {
            at = next;
        }
    }
    Ok(at)
}

/// Names of all children of a directory, in readdir order.
pub fn list_dir(device: &mut Device, dir: ObjectId) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut cursor = 0;
    while let Some(entry) = device.readdir(dir, cursor)? {
        names.push(entry.name);
        cursor += 1;
    }
    Ok(names)
}

/// Write a whole file at offset 0.
pub fn write_all(device: &mut Device, id: ObjectId, data: &[u8]) -> Result<()> {
    let n = device.write_file(&Cx::none(), id, 0, data, false)?;
    if n != data.len() {
        return Err(NlfsError::Range);
    }
    Ok(())
}

/// Read a file's full contents.
pub fn read_all(device: &mut Device, id: ObjectId) -> Result<Vec<u8>> {
    let size = device.stat(id)?.size;
    let mut buf = vec![0u8; usize::try_from(size).map_err(|_| NlfsError::Range)?];
    let n = device.read_file(&Cx::none(), id, 0, &mut buf)?;
    buf.truncate(n);
    Ok(buf)
}

/// Assert the universal invariants, panicking with the violation.
pub fn assert_invariants(device: &mut Device) {
    if let Err(violation) = device.check_invariants() {
        panic!("invariant violated: {violation}");
    }
}

// ── Smoke report for the harness binary ─────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct SmokeReport {
    pub files_created: usize,
    pub bytes_written: usize,
    pub bytes_verified: usize,
    pub gc_blocks: u64,
    pub remount_objects: usize,
    pub invariants_ok: bool,
}

/// End-to-end smoke pass: populate, churn, remount, verify.
pub fn run_smoke() -> anyhow::Result<SmokeReport> {
    let geometry = medium_geometry();
    let (nand, mut device) =
        fresh_device(geometry, None).context("building smoke device")?;
    let root = device.root();

    let mut bytes_written = 0;
    let mut payloads = Vec::new();
    for i in 0..20 {
        let name = format!("smoke{i:02}");
        let id = device
            .create_file(root, &name, 0o644, 0, 0)
            .with_context(|| format!("creating {name}"))?;
        let data = vec![u8::try_from(i).unwrap_or(0); 700 + i * 37];
        write_all(&mut device, id, &data).context("writing payload")?;
        bytes_written += data.len();
        payloads.push((name, data));
    }
    // churn: delete half, rewrite the rest
    for i in (0..20).step_by(2) {
        device.unlink(root, &format!("smoke{i:02}"))?;
    }
    device.sync(true).context("sync with checkpoint")?;

    let param = DeviceParam::new(geometry);
    drop(device);
    let mut device = remount(&nand, param).context("remounting")?;
    let mut bytes_verified = 0;
    let mut survivors = 0;
    for (name, data) in &payloads {
        match device.lookup(device.root(), name) {
            Ok(id) => {
                let back = read_all(&mut device, id)?;
                if back != *data {
                    bail!("payload mismatch for {name}");
                }
                bytes_verified += back.len();
                survivors += 1;
            }
            Err(NlfsError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }
    }
    if survivors != 10 {
        bail!("expected 10 survivors, found {survivors}");
    }

    let invariants_ok = device.check_invariants().is_ok();
    Ok(SmokeReport {
        files_created: 20,
        bytes_written,
        bytes_verified,
        gc_blocks: device.stats().n_gc_blocks,
        remount_objects: device.n_objects(),
        invariants_ok,
    })
}
