use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use lzmt_core::{
    CountingSink, DictMode, Lzma2Options, Lzma2Parallel, Lzma2Writer, Mode, ParallelConfig,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const INPUT_SIZE: usize = 8 * 1024 * 1024;

fn corpus(len: usize) -> Vec<u8> {
    const WORDS: [&[u8]; 8] = [
        b"block ", b"chunk ", b"window ", b"match ", b"literal ", b"stream ", b"reset ", b"\n",
    ];
    let mut rng = StdRng::seed_from_u64(0x1A2B);
    let mut data = Vec::with_capacity(len + 16);
    while data.len() < len {
        if rng.gen_range(0..16) == 0 {
            data.extend((0..32).map(|_| rng.r#gen::<u8>()));
        } else {
            data.extend_from_slice(WORDS[rng.gen_range(0..WORDS.len())]);
        }
    }
    data.truncate(len);
    data
}

fn bench_sequential(c: &mut Criterion) {
    let data = corpus(INPUT_SIZE);
    let mut group = c.benchmark_group("sequential");
    group.sample_size(10);
    group.throughput(Throughput::Bytes(data.len() as u64));

    for (name, preset, mode) in [
        ("store", 1, Some(Mode::Uncompressed)),
        ("fast", 1, None),
        ("normal", 6, None),
    ] {
        let mut options = Lzma2Options::preset(preset).expect("valid preset");
        if let Some(mode) = mode {
            options.set_mode(mode);
        }
        group.bench_function(name, |b| {
            b.iter(|| {
                let mut writer =
                    Lzma2Writer::new(CountingSink::default(), &options).expect("writer");
                writer.write_bytes(black_box(&data)).expect("write");
                writer.finish_into_inner().expect("finish").count()
            })
        });
    }

    group.finish();
}

fn bench_parallel(c: &mut Criterion) {
    let data = corpus(INPUT_SIZE);
    let mut options = Lzma2Options::preset(1).expect("valid preset");
    options.set_dict_size(256 << 10).expect("valid dictionary");

    let mut group = c.benchmark_group("parallel");
    group.sample_size(10);
    group.throughput(Throughput::Bytes(data.len() as u64));

    for dict_mode in [DictMode::None, DictMode::Set, DictMode::AsyncSet] {
        let config = ParallelConfig {
            block_size: 1 << 20,
            dict_mode,
            ..ParallelConfig::default()
        };
        let coordinator =
            Arc::new(Lzma2Parallel::new(options.clone(), config).expect("coordinator"));
        group.bench_with_input(
            BenchmarkId::new("dict_mode", format!("{dict_mode:?}")),
            &data,
            |b, data| {
                b.iter(|| {
                    let mut writer = coordinator
                        .writer(CountingSink::default())
                        .expect("parallel writer");
                    writer.write_bytes(black_box(data)).expect("write");
                    writer.finish_into_inner().expect("finish").count()
                })
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_sequential, bench_parallel);
criterion_main!(benches);
