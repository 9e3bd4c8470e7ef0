//! Benchmark: chunk-bitmap hot paths used by GC block selection.
//!
//! `count_chunk_bits` runs once per inspected candidate during leisurely
//! GC scans; `still_some_chunks` is the fast-path skip for empty blocks.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use nlfs_block::BlockTable;
use nlfs_types::{BlockId, Geometry};

/// A mid-life device: 1024 blocks of 64 chunks, about half the chunks live,
/// clustered the way a log-structured write pattern leaves them.
fn make_table() -> BlockTable {
    let geometry = Geometry::new(1024, 64, 2048).unwrap();
    let mut table = BlockTable::new(geometry);
    for block in 0..1024u32 {
        let fill = (block % 5) * 13 % 64;
        for chunk in 0..fill {
            table.set_chunk_bit(BlockId(block), chunk);
        }
    }
    table
}

fn bench_count_bits(c: &mut Criterion) {
    let table = make_table();
    c.bench_function("count_chunk_bits", |b| {
        b.iter(|| {
            let mut total = 0u32;
            for block in 0..1024u32 {
                total += table.count_chunk_bits(black_box(BlockId(block)));
            }
            black_box(total)
        });
    });
}

fn bench_still_some(c: &mut Criterion) {
    let table = make_table();
    c.bench_function("still_some_chunks", |b| {
        b.iter(|| {
            let mut live = 0u32;
            for block in 0..1024u32 {
                live += u32::from(table.still_some_chunks(black_box(BlockId(block))));
            }
            black_box(live)
        });
    });
}

fn bench_set_clear(c: &mut Criterion) {
    c.bench_function("set_clear_cycle", |b| {
        let mut table = make_table();
        b.iter(|| {
            for chunk in 0..64 {
                table.set_chunk_bit(BlockId(512), chunk);
            }
            table.clear_chunk_bits(BlockId(512));
        });
    });
}

criterion_group!(benches, bench_count_bits, bench_still_some, bench_set_clear);
criterion_main!(benches);
