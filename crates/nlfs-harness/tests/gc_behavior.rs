#![forbid(unsafe_code)]
//! Garbage-collection behavior observed from outside: space comes back,
//! data survives relocation, troubled blocks leave service.

use nlfs::{Cx, NandDriver, NlfsError};
use nlfs_harness::{
    assert_invariants, fresh_device, medium_geometry, read_all, small_geometry, write_all,
};

#[test]
fn deleted_space_is_reclaimed_by_background_gc() {
    let (_nand, mut device) = fresh_device(medium_geometry(), None).unwrap();
    let root = device.root();

    // build up garbage: several generations of files, all deleted
    for round in 0..3 {
        for i in 0..6 {
            let name = format!("g{round}_{i}");
            let id = device.create_file(root, &name, 0o644, 0, 0).unwrap();
            write_all(&mut device, id, &vec![0xBB; 3000]).unwrap();
        }
        for i in 0..6 {
            device.unlink(root, &format!("g{round}_{i}")).unwrap();
        }
    }
    let erased_low = device.erased_blocks();

    let mut collected = 0;
    for _ in 0..256 {
        if device.background_gc().unwrap() {
            collected += 1;
        }
    }
    assert!(collected >= 1, "background GC never collected a block");
    assert!(
        device.erased_blocks() > erased_low,
        "GC reclaimed no erased blocks"
    );
    // the deletion backlog is fully drained
    assert!(device.stats().n_bg_deletions >= 1);
    assert_invariants(&mut device);
}

#[test]
fn live_data_survives_heavy_relocation() {
    let (_nand, mut device) = fresh_device(small_geometry(), None).unwrap();
    let root = device.root();
    let keeper = device.create_file(root, "keeper", 0o644, 0, 0).unwrap();
    let payload: Vec<u8> = (0..3000u32).map(|i| (i % 241) as u8).collect();
    write_all(&mut device, keeper, &payload).unwrap();

    // churn a scratch file through many rewrites, nudging the background
    // collector between rounds so mixed blocks get consolidated
    let scratch = device.create_file(root, "scratch", 0o644, 0, 0).unwrap();
    for round in 0..40u64 {
        for chunk in 0..6u64 {
            device
                .write_file(
                    &Cx::none(),
                    scratch,
                    chunk * 512,
                    &[round as u8; 512],
                    false,
                )
                .unwrap();
        }
        device.background_gc().unwrap();
    }
    assert!(device.stats().n_gc_copies >= 1, "nothing was relocated");
    assert_eq!(read_all(&mut device, keeper).unwrap(), payload);
    device.sync(false).unwrap();
    assert_invariants(&mut device);
}

#[test]
fn uncorrectable_reads_prioritise_the_block_for_relocation() {
    let geometry = small_geometry();
    let (nand, mut device) = fresh_device(geometry, None).unwrap();
    let root = device.root();
    let id = device.create_file(root, "fragile", 0o644, 0, 0).unwrap();
    // big enough that the first block fills completely: the prioritised
    // sweep only considers full blocks
    write_all(&mut device, id, &[0xEE; 40 * 512]).unwrap();

    // locate the home of logical chunk 0 through the driver and poison it
    let mut poisoned = None;
    nand.with(|n| {
        'search: for b in 0..geometry.n_blocks() {
            for c in 0..geometry.chunks_per_block() {
                let mut tags = nlfs::ExtTags::default();
                n.read_chunk(nlfs::BlockId(b), c, None, Some(&mut tags))
                    .unwrap();
                if tags.matches(id.0, 1) {
                    n.faults.uncorrectable.insert((b, c));
                    poisoned = Some((b, c));
                    break 'search;
                }
            }
        }
    });
    let poisoned = poisoned.expect("chunk 0 lives somewhere");

    // the read itself succeeds (data still decodes) but strikes the block
    let mut buf = [0u8; 512];
    device.read_file(&Cx::none(), id, 0, &mut buf).unwrap();
    assert!(buf.iter().all(|b| *b == 0xEE));
    assert_eq!(device.stats().n_ecc_unfixed, 1);

    // the prioritised block is collected ahead of ordinary candidates,
    // even though it is almost entirely live
    let copies_before = device.stats().n_gc_copies;
    for _ in 0..64 {
        device.background_gc().unwrap();
        if device.stats().n_gc_copies > copies_before {
            break;
        }
    }
    assert!(
        device.stats().n_gc_copies > copies_before,
        "prioritised block was never collected"
    );
    nand.with(|n| {
        n.faults.uncorrectable.remove(&poisoned);
    });
    // the data moved away from the poisoned chunk and reads clean
    assert_eq!(read_all(&mut device, id).unwrap(), vec![0xEE; 40 * 512]);
    assert_invariants(&mut device);
}

#[test]
fn gc_respects_the_reserve_even_under_pressure() {
    let (_nand, mut device) = fresh_device(small_geometry(), None).unwrap();
    let root = device.root();
    let hog = device.create_file(root, "hog", 0o644, 0, 0).unwrap();

    let mut chunks = 0u64;
    loop {
        match device.write_file(&Cx::none(), hog, chunks * 512, &[0x44; 512], false) {
            Ok(_) => chunks += 1,
            Err(NlfsError::NoSpace) => break,
            Err(err) => panic!("unexpected: {err}"),
        }
    }
    // even at no-space, the erased reserve never drains to zero
    assert!(device.erased_blocks() >= 1, "reserve was consumed");
    // deletion still succeeds at no-space (it runs on the reserve)
    device.unlink(root, "hog").unwrap();
    let again = device.create_file(root, "again", 0o644, 0, 0).unwrap();
    write_all(&mut device, again, &[0x55; 512]).unwrap();
    assert_invariants(&mut device);
}
