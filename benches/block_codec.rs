use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use chanidx::index::{BlockId, IndexBlock, IndexEntry};
use chanidx::storage::Cas;

fn filled_block(capacity: u64, every: u64) -> IndexBlock {
    let mut block = IndexBlock::new("ABC", BlockId::new(0, 0), capacity);
    let entries: Vec<IndexEntry> = (0..capacity)
        .step_by(every as usize)
        .map(|seq| IndexEntry::new(0, seq, seq % 7 == 0))
        .collect();
    block.apply(&entries).unwrap();
    block
}

fn bench_block_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("index_block");

    for &capacity in &[1_000u64, 10_000, 100_000] {
        let block = filled_block(capacity, 3);
        let encoded = block.encode();

        group.throughput(Throughput::Elements(capacity));

        group.bench_with_input(BenchmarkId::new("encode", capacity), &block, |b, block| {
            b.iter(|| black_box(block.encode()));
        });

        group.bench_with_input(BenchmarkId::new("decode", capacity), &encoded, |b, data| {
            b.iter(|| {
                IndexBlock::decode("ABC", BlockId::new(0, 0), capacity, data, Cas::none()).unwrap()
            });
        });

        group.bench_with_input(BenchmarkId::new("entries", capacity), &block, |b, block| {
            b.iter(|| black_box(block.entries(0, capacity)));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_block_codec);
criterion_main!(benches);
