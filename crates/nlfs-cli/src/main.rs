#![forbid(unsafe_code)]
//! Image tooling for nlfs volumes: format a flat image file, inspect its
//! state, move data in and out. The image is a serialized RAM NAND, so
//! everything here exercises the same mount/scan paths a real part
//! would.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use nlfs::{
    Cx, Device, DeviceParam, Geometry, NandDriver, ObjectType, RamNand, SharedNand, StoredEndian,
    TagMode,
};
use nlfs_harness::resolve_path;
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "nlfs", about = "nlfs — log-structured NAND filesystem toolkit")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create and format a NAND image file.
    Format {
        /// Path for the new image.
        image: PathBuf,
        /// Erase blocks on the device.
        #[arg(long, default_value_t = 64)]
        blocks: u32,
        /// Chunks (pages) per erase block; power of two.
        #[arg(long, default_value_t = 32)]
        chunks_per_block: u32,
        /// Data bytes per chunk.
        #[arg(long, default_value_t = 2048)]
        chunk_bytes: u32,
        /// Store tags inband instead of in the spare area.
        #[arg(long)]
        inband_tags: bool,
    },
    /// Mount an image and print volume state.
    Inspect {
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// List a directory inside the image.
    Ls {
        image: PathBuf,
        /// Directory path, e.g. `/` or `/logs`.
        #[arg(default_value = "/")]
        path: String,
    },
    /// Create a directory inside the image.
    Mkdir {
        image: PathBuf,
        path: String,
    },
    /// Copy a local file into the image.
    Put {
        image: PathBuf,
        /// Local source file.
        src: PathBuf,
        /// Destination path inside the image.
        dst: String,
    },
    /// Print a file from the image to stdout.
    Cat {
        image: PathBuf,
        path: String,
    },
    /// Remove a file or empty directory from the image.
    Rm {
        image: PathBuf,
        path: String,
    },
    /// Print device counters.
    Stats {
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Serialize)]
struct InspectOutput {
    n_blocks: u32,
    chunks_per_block: u32,
    data_bytes_per_chunk: u32,
    inband_tags: bool,
    objects: usize,
    free_chunks: u32,
    erased_blocks: u32,
    block_states: Vec<String>,
    invariants_ok: bool,
}

fn load_image(path: &Path) -> Result<SharedNand> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("reading image {}", path.display()))?;
    let nand = RamNand::from_bytes(&bytes).context("decoding NAND image")?;
    Ok(SharedNand::new(nand))
}

fn save_image(path: &Path, nand: &SharedNand) -> Result<()> {
    let bytes = nand.with(|n| n.to_bytes());
    std::fs::write(path, bytes)
        .with_context(|| format!("writing image {}", path.display()))
}

fn mount_image(nand: &SharedNand) -> Result<Device> {
    let geometry = nand.geometry();
    let inband = nand.with(|n| n.tag_mode()) == TagMode::Inband;
    let mut param = DeviceParam::new(geometry);
    param.inband_tags = inband;
    let mut device =
        Device::new(Box::new(nand.clone()), param).context("binding device to image")?;
    device.mount().context("mounting volume")?;
    Ok(device)
}

/// Split `/a/b/c` into the parent path and the final component.
fn split_parent(path: &str) -> Result<(String, String)> {
    let trimmed = path.trim_end_matches('/');
    let Some((parent, name)) = trimmed.rsplit_once('/') else {
        bail!("path {path} has no parent component");
    };
    if name.is_empty() {
        bail!("path {path} has an empty final component");
    }
    let parent = if parent.is_empty() { "/" } else { parent };
    Ok((parent.to_owned(), name.to_owned()))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Format {
            image,
            blocks,
            chunks_per_block,
            chunk_bytes,
            inband_tags,
        } => {
            let geometry = Geometry::new(blocks, chunks_per_block, chunk_bytes)
                .context("invalid geometry")?;
            let mode = if inband_tags {
                TagMode::Inband
            } else {
                TagMode::Oob
            };
            let nand = SharedNand::new(RamNand::new(geometry, StoredEndian::Little, mode));
            let mut param = DeviceParam::new(geometry);
            param.inband_tags = inband_tags;
            let mut device = Device::new(Box::new(nand.clone()), param)?;
            device.format().context("formatting")?;
            device.mount().context("verifying the fresh volume")?;
            device.unmount()?;
            drop(device);
            save_image(&image, &nand)?;
            println!(
                "formatted {}: {blocks} blocks x {chunks_per_block} chunks x {chunk_bytes} B",
                image.display()
            );
        }

        Command::Inspect { image, json } => {
            let nand = load_image(&image)?;
            let mut device = mount_image(&nand)?;
            let geometry = nand.geometry();
            let output = InspectOutput {
                n_blocks: geometry.n_blocks(),
                chunks_per_block: geometry.chunks_per_block(),
                data_bytes_per_chunk: geometry.data_bytes_per_chunk(),
                inband_tags: nand.with(|n| n.tag_mode()) == TagMode::Inband,
                objects: device.n_objects(),
                free_chunks: device.free_chunks(),
                erased_blocks: device.erased_blocks(),
                block_states: device
                    .block_report()
                    .into_iter()
                    .map(|(state, seq, used, soft)| {
                        format!("{state:?} seq={seq} used={used} soft={soft}")
                    })
                    .collect(),
                invariants_ok: device.check_invariants().is_ok(),
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                println!(
                    "{} blocks x {} chunks x {} B{}",
                    output.n_blocks,
                    output.chunks_per_block,
                    output.data_bytes_per_chunk,
                    if output.inband_tags { " (inband tags)" } else { "" }
                );
                println!(
                    "objects {}  free chunks {}  erased blocks {}  invariants {}",
                    output.objects,
                    output.free_chunks,
                    output.erased_blocks,
                    if output.invariants_ok { "ok" } else { "VIOLATED" }
                );
            }
        }

        Command::Ls { image, path } => {
            let nand = load_image(&image)?;
            let mut device = mount_image(&nand)?;
            let dir = resolve_path(&mut device, &path)
                .with_context(|| format!("resolving {path}"))?;
            let mut cursor = 0;
            while let Some(entry) = device.readdir(dir, cursor)? {
                let attr = device.stat(entry.id)?;
                let kind = match entry.object_type {
                    ObjectType::File => "-",
                    ObjectType::Directory => "d",
                    ObjectType::Symlink => "l",
                    ObjectType::Hardlink => "h",
                    ObjectType::Special => "c",
                };
                println!("{kind} {:>8} {}", attr.size, entry.name);
                cursor += 1;
            }
        }

        Command::Mkdir { image, path } => {
            let nand = load_image(&image)?;
            let mut device = mount_image(&nand)?;
            let (parent, name) = split_parent(&path)?;
            let dir = resolve_path(&mut device, &parent)?;
            device.create_dir(dir, &name, 0o755, 0, 0)?;
            device.unmount()?;
            drop(device);
            save_image(&image, &nand)?;
        }

        Command::Put { image, src, dst } => {
            let nand = load_image(&image)?;
            let mut device = mount_image(&nand)?;
            let data = std::fs::read(&src)
                .with_context(|| format!("reading {}", src.display()))?;
            let (parent, name) = split_parent(&dst)?;
            let dir = resolve_path(&mut device, &parent)?;
            let id = match device.lookup(dir, &name) {
                Ok(existing) => {
                    device.resize(existing, 0)?;
                    existing
                }
                Err(_) => device.create_file(dir, &name, 0o644, 0, 0)?,
            };
            let n = device.write_file(&Cx::none(), id, 0, &data, false)?;
            device.unmount()?;
            drop(device);
            save_image(&image, &nand)?;
            println!("wrote {n} bytes to {dst}");
        }

        Command::Cat { image, path } => {
            let nand = load_image(&image)?;
            let mut device = mount_image(&nand)?;
            let id = resolve_path(&mut device, &path)?;
            let size = device.stat(id)?.size;
            let mut buf = vec![0u8; usize::try_from(size).context("file too large")?];
            device.read_file(&Cx::none(), id, 0, &mut buf)?;
            use std::io::Write;
            std::io::stdout().write_all(&buf)?;
        }

        Command::Rm { image, path } => {
            let nand = load_image(&image)?;
            let mut device = mount_image(&nand)?;
            let (parent, name) = split_parent(&path)?;
            let dir = resolve_path(&mut device, &parent)?;
            device.unlink(dir, &name)?;
            device.unmount()?;
            drop(device);
            save_image(&image, &nand)?;
        }

        Command::Stats { image, json } => {
            let nand = load_image(&image)?;
            let device = mount_image(&nand)?;
            let stats = device.stats();
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!(
                    "page writes {}  page reads {}  erasures {} (failed {})",
                    stats.n_page_writes, stats.n_page_reads, stats.n_erasures,
                    stats.n_erase_failures
                );
                println!(
                    "gc blocks {}  gc copies {}  oldest-dirty gcs {}  retired blocks {}",
                    stats.n_gc_blocks,
                    stats.n_gc_copies,
                    stats.oldest_dirty_gc_count,
                    stats.n_retired_blocks
                );
                println!(
                    "cache hits {}  misses {}  retried writes {}",
                    stats.cache_hits, stats.cache_misses, stats.n_retried_writes
                );
            }
        }
    }
    Ok(())
}
