//! Minimal tour: format a simulated NAND part, store a file tree, pull
//! the power, and remount.
//!
//! Run with `cargo run -p nlfs --example basic`.

use nlfs::{
    Cx, Device, DeviceParam, Geometry, RamNand, Result, SharedNand, StoredEndian, TagMode,
};

fn main() -> Result<()> {
    // 64 erase blocks of 32 pages, 2048 data bytes each
    let geometry = Geometry::new(64, 32, 2048).expect("valid geometry");
    let nand = SharedNand::new(RamNand::new(geometry, StoredEndian::Little, TagMode::Oob));

    let mut device = Device::new(Box::new(nand.clone()), DeviceParam::new(geometry))?;
    device.format()?;
    device.mount()?;

    let root = device.root();
    let logs = device.create_dir(root, "logs", 0o755, 0, 0)?;
    let boot = device.create_file(logs, "boot.log", 0o644, 0, 0)?;
    device.write_file(&Cx::none(), boot, 0, b"power-on self test: ok\n", false)?;
    device.set_xattr(boot, "user.origin", b"example")?;
    device.sync(true)?;

    // power loss: throw away all RAM state, keep the flash image
    drop(device);

    let mut device = Device::new(Box::new(nand), DeviceParam::new(geometry))?;
    device.mount()?;
    let logs = device.lookup(device.root(), "logs")?;
    let boot = device.lookup(logs, "boot.log")?;
    let mut buf = vec![0u8; device.stat(boot)?.size as usize];
    device.read_file(&Cx::none(), boot, 0, &mut buf)?;

    println!("recovered: {}", String::from_utf8_lossy(&buf).trim_end());
    println!("origin xattr: {:?}", device.get_xattr(boot, "user.origin")?);
    println!("stats: {:?}", device.stats());
    Ok(())
}
