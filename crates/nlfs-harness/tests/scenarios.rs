#![forbid(unsafe_code)]
//! Concrete end-to-end scenarios with literal inputs and expected
//! outputs.

use nlfs::{Cx, DeviceParam, Geometry, NlfsError, ObjectType};
use nlfs_harness::{
    assert_invariants, fresh_device, read_all, remount, resolve_path, small_geometry, write_all,
};

/// Format a 16-block device, create one file, write 1500 bytes, read
/// them back: size 1500, three data chunks.
#[test]
fn s1_simple_write_read() {
    let (_nand, mut device) = fresh_device(small_geometry(), None).unwrap();
    let root = device.root();
    let a = device.create_file(root, "a", 0o644, 0, 0).unwrap();
    write_all(&mut device, a, &[0x41; 1500]).unwrap();

    let back = read_all(&mut device, a).unwrap();
    assert_eq!(back.len(), 1500);
    assert!(back.iter().all(|b| *b == 0x41));
    assert_eq!(device.stat(a).unwrap().size, 1500);
    device.sync(false).unwrap();
    // 1500 bytes over 512-byte chunks = 3 data chunks; the invariant
    // audit pins leaf count to the recorded chunk count
    assert_invariants(&mut device);
}

/// Overwrite 100 bytes in the middle; the rest is untouched.
#[test]
fn s2_partial_overwrite() {
    let (_nand, mut device) = fresh_device(small_geometry(), None).unwrap();
    let root = device.root();
    let a = device.create_file(root, "a", 0o644, 0, 0).unwrap();
    write_all(&mut device, a, &[0x41; 1500]).unwrap();

    let n = device
        .write_file(&Cx::none(), a, 200, &[0xFF; 100], false)
        .unwrap();
    assert_eq!(n, 100);

    let back = read_all(&mut device, a).unwrap();
    assert_eq!(back.len(), 1500);
    assert!(back[..200].iter().all(|b| *b == 0x41));
    assert!(back[200..300].iter().all(|b| *b == 0xFF));
    assert!(back[300..].iter().all(|b| *b == 0x41));
    assert_invariants(&mut device);
}

/// 300 one-byte files, unlink the even ones, checkpoint, power-loss,
/// remount: the 150 odd files remain.
#[test]
fn s3_mass_create_unlink_power_loss() {
    let geometry = Geometry::new(128, 32, 512).unwrap();
    let (nand, mut device) = fresh_device(geometry, None).unwrap();
    let root = device.root();

    for i in 0..300 {
        let name = format!("f{i:03}");
        let id = device.create_file(root, &name, 0o644, 0, 0).unwrap();
        write_all(&mut device, id, &[i as u8]).unwrap();
    }
    for i in (0..300).step_by(2) {
        device.unlink(root, &format!("f{i:03}")).unwrap();
    }
    device.sync(true).unwrap();
    assert_invariants(&mut device);

    // power loss: discard all RAM state, remount from flash
    drop(device);
    let mut device = remount(&nand, DeviceParam::new(geometry)).unwrap();
    let root = device.root();

    let mut survivors = Vec::new();
    let mut cursor = 0;
    while let Some(entry) = device.readdir(root, cursor).unwrap() {
        if entry.object_type == ObjectType::File {
            survivors.push(entry.name);
        }
        cursor += 1;
    }
    assert_eq!(survivors.len(), 150, "odd-numbered files must survive");
    for name in &survivors {
        let i: usize = name[1..].parse().unwrap();
        assert_eq!(i % 2, 1, "file {name} should have been unlinked");
        let id = device.lookup(root, name).unwrap();
        let data = read_all(&mut device, id).unwrap();
        assert_eq!(data, vec![i as u8]);
    }
    assert_invariants(&mut device);
}

/// Fill the device to the reserve, truncate, refill: the second fill
/// succeeds because GC reclaims the truncated space.
#[test]
fn s4_fill_truncate_refill_invokes_gc() {
    let (_nand, mut device) = fresh_device(small_geometry(), None).unwrap();
    let root = device.root();
    let big = device.create_file(root, "big", 0o644, 0, 0).unwrap();
    // a small pinned file interleaves with big, so truncating big leaves
    // every block with a little live data for GC to relocate
    let pin = device.create_file(root, "pin", 0o644, 0, 0).unwrap();

    let mut big_chunks = 0u64;
    let mut pin_chunks = 0u64;
    loop {
        let result = if (big_chunks + pin_chunks) % 29 == 28 {
            let r = device.write_file(&Cx::none(), pin, pin_chunks * 512, &[0x11; 512], false);
            if r.is_ok() {
                pin_chunks += 1;
            }
            r
        } else {
            let r = device.write_file(&Cx::none(), big, big_chunks * 512, &[0x5A; 512], false);
            if r.is_ok() {
                big_chunks += 1;
            }
            r
        };
        match result {
            Ok(_) => {}
            Err(NlfsError::NoSpace) => break,
            Err(err) => panic!("unexpected error: {err}"),
        }
        assert!(big_chunks + pin_chunks < 1024, "device never filled");
    }
    assert!(big_chunks > 0);

    device.resize(big, 0).unwrap();
    assert_eq!(device.stat(big).unwrap().size, 0);

    // the same volume of data fits again once GC reclaims the holes
    for i in 0..big_chunks {
        device
            .write_file(&Cx::none(), big, i * 512, &[0xA5; 512], false)
            .unwrap_or_else(|err| panic!("refill failed at chunk {i}: {err}"));
    }
    assert!(device.stats().n_gc_blocks >= 1, "GC never ran");

    // the pinned file was relocated, not lost
    let pinned = read_all(&mut device, pin).unwrap();
    assert!(pinned.iter().all(|b| *b == 0x11));
    device.sync(false).unwrap();
    assert_invariants(&mut device);
}

/// Hard link survives deletion of the original name.
#[test]
fn s5_hardlink_survives_unlink_of_original() {
    let (_nand, mut device) = fresh_device(small_geometry(), None).unwrap();
    let root = device.root();
    let x = device.create_file(root, "x", 0o644, 0, 0).unwrap();
    write_all(&mut device, x, &[0x77; 10]).unwrap();
    device.create_hardlink(root, "y", x).unwrap();

    device.unlink(root, "x").unwrap();
    assert!(matches!(
        device.lookup(root, "x"),
        Err(NlfsError::NotFound(_))
    ));

    let y = device.lookup(root, "y").unwrap();
    let attr = device.stat(y).unwrap();
    assert_eq!(attr.object_type, ObjectType::File);
    assert_eq!(attr.size, 10);
    assert_eq!(read_all(&mut device, y).unwrap(), vec![0x77; 10]);
    assert_invariants(&mut device);
}

/// A self-referential symlink fails resolution with the loop error.
#[test]
fn s6_symlink_loop() {
    let (_nand, mut device) = fresh_device(small_geometry(), None).unwrap();
    let root = device.root();
    device
        .create_symlink(root, "s", 0o777, 0, 0, "/s")
        .unwrap();
    assert!(matches!(
        resolve_path(&mut device, "/s"),
        Err(NlfsError::LinkLoop)
    ));

    // a short, terminating chain still resolves
    let real = device.create_file(root, "real", 0o644, 0, 0).unwrap();
    device
        .create_symlink(root, "to_real", 0o777, 0, 0, "/real")
        .unwrap();
    assert_eq!(resolve_path(&mut device, "/to_real").unwrap(), real);
}
