mod support;

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use lzmt_core::parallel::{BLOCK_SIZE_MIN, auto_block_size};
use lzmt_core::{
    BlockTelemetry, BufferPool, DefaultBlockTelemetry, DictMode, Lzma2Error, Lzma2Options,
    Lzma2Parallel, Lzma2Sink, Lzma2Writer, ParallelConfig, ResetState, SharedSink, StreamState,
    TaskExecutor,
};
use support::{Chunk, RecordingTelemetry, TestResult, decode, parse_chunks, text_bytes};

const BLOCK: usize = 128 << 10;
const DICT: u32 = 64 << 10;

fn options() -> Result<Lzma2Options, Lzma2Error> {
    let mut options = Lzma2Options::preset(1)?;
    options.set_dict_size(DICT)?;
    Ok(options)
}

fn config(dict_mode: DictMode, affinity: usize) -> ParallelConfig {
    ParallelConfig {
        block_size: BLOCK,
        dict_mode,
        affinity,
        allow_small_blocks: true,
    }
}

fn coordinator_with(
    options: Lzma2Options,
    config: ParallelConfig,
    pool: BufferPool,
    telemetry: Arc<dyn BlockTelemetry>,
) -> Result<Arc<Lzma2Parallel>, Lzma2Error> {
    let executor = Arc::new(TaskExecutor::new(4)?);
    Ok(Arc::new(Lzma2Parallel::with_resources(
        options,
        config,
        executor,
        Arc::new(pool),
        telemetry,
    )?))
}

fn simple(dict_mode: DictMode, affinity: usize) -> Result<Arc<Lzma2Parallel>, Lzma2Error> {
    coordinator_with(
        options()?,
        config(dict_mode, affinity),
        BufferPool::new(16),
        Arc::new(DefaultBlockTelemetry),
    )
}

fn compress(coordinator: &Arc<Lzma2Parallel>, data: &[u8]) -> Result<Vec<u8>, Lzma2Error> {
    let sink = SharedSink::new();
    let mut writer = coordinator.writer(sink.clone())?;
    writer.write_bytes(data)?;
    writer.close()?;
    Ok(sink.contents())
}

/// Independent sequential streams per block, joined under one end marker.
fn independent_blocks(data: &[u8], options: &Lzma2Options) -> Result<Vec<u8>, Lzma2Error> {
    let mut expected = Vec::new();
    for block in data.chunks(BLOCK) {
        let mut writer = Lzma2Writer::new(Vec::new(), options)?;
        writer.write_bytes(block)?;
        let mut stream = writer.finish_into_inner()?;
        stream.pop();
        expected.extend_from_slice(&stream);
    }
    expected.push(0x00);
    Ok(expected)
}

#[test]
fn round_trips_through_liblzma() -> TestResult {
    let coordinator = simple(DictMode::Auto, 4)?;
    assert_eq!(coordinator.dict_mode(), DictMode::AsyncSet);

    let data = text_bytes(BLOCK * 7 + 12_345, 1);
    let sink = SharedSink::new();
    let mut writer = coordinator.writer(sink.clone())?;
    for piece in data.chunks(50_000) {
        writer.write_bytes(piece)?;
    }
    writer.finish()?;
    let stats = writer.stats();
    assert_eq!(writer.state(), StreamState::Closed);
    writer.close()?;

    let stream = sink.contents();
    assert_eq!(stats.blocks, 8);
    assert_eq!(stats.uncompressed_bytes, data.len() as u64);
    assert_eq!(stats.compressed_bytes, stream.len() as u64);
    assert_eq!(sink.finish_count(), 1);
    assert_eq!(sink.close_count(), 1);
    assert_eq!(decode(&stream, DICT)?, data);
    Ok(())
}

#[test]
fn blocks_are_written_in_submission_order() -> TestResult {
    let options = options()?;
    let telemetry = Arc::new(
        RecordingTelemetry::new()
            .with_delay(0, Duration::from_millis(300))
            .with_delay(1, Duration::from_millis(150)),
    );
    let coordinator = coordinator_with(
        options.clone(),
        config(DictMode::None, 4),
        BufferPool::new(16),
        telemetry.clone(),
    )?;

    let data = text_bytes(BLOCK * 6, 2);
    let stream = compress(&coordinator, &data)?;

    let events = telemetry.events();
    assert_eq!(events.flushed, (0..6).collect::<Vec<u64>>());
    assert_ne!(events.finished, events.flushed, "later blocks should finish first");
    assert_eq!(stream, independent_blocks(&data, &options)?);
    assert_eq!(decode(&stream, DICT)?, data);
    Ok(())
}

#[test]
fn single_slot_matches_many_slots() -> TestResult {
    let data = text_bytes(BLOCK * 5 + 99, 3);
    let serial = compress(&simple(DictMode::AsyncSet, 1)?, &data)?;
    let wide = compress(&simple(DictMode::AsyncSet, 6)?, &data)?;
    assert_eq!(serial, wide);
    Ok(())
}

#[test]
fn set_and_async_set_produce_identical_streams() -> TestResult {
    let data = text_bytes(BLOCK * 5 + 4_321, 4);
    let set = compress(&simple(DictMode::Set, 3)?, &data)?;
    let async_set = compress(&simple(DictMode::AsyncSet, 3)?, &data)?;
    let none = compress(&simple(DictMode::None, 3)?, &data)?;

    assert_eq!(set, async_set);
    assert!(set.len() < none.len(), "history should help: {} vs {}", set.len(), none.len());
    assert_eq!(decode(&set, DICT)?, data);
    Ok(())
}

#[test]
fn block_boundaries_reset_as_expected() -> TestResult {
    let data = text_bytes(BLOCK * 3, 5);
    for (mode, expected) in [
        (DictMode::None, ResetState::DictReset),
        (DictMode::AsyncSet, ResetState::PropReset),
    ] {
        let options = options()?;
        let stream = compress(&simple(mode, 2)?, &data)?;
        let chunks = parse_chunks(&stream)?;

        let mut covered = 0;
        let mut starts = Vec::new();
        for chunk in &chunks {
            if covered % BLOCK == 0 && *chunk != Chunk::End {
                starts.push(*chunk);
            }
            covered += chunk.uncompressed();
        }
        assert_eq!(starts.len(), 3, "{mode:?}");
        assert!(matches!(
            starts[0],
            Chunk::Lzma {
                reset: ResetState::DictReset,
                ..
            }
        ));
        for start in &starts[1..] {
            match *start {
                Chunk::Lzma { reset, props, .. } => {
                    assert_eq!(reset, expected, "{mode:?}");
                    assert_eq!(props, Some(options.props_byte()));
                }
                other => panic!("text block started with {other:?}"),
            }
        }
    }
    Ok(())
}

// Carried blocks restart at PropReset rather than StateReset, so each one
// repeats the props byte. That is the whole cost: one byte per block.
#[test]
fn carried_blocks_repeat_the_props_byte_once() -> TestResult {
    let data = text_bytes(BLOCK * 4, 21);
    let props_byte = options()?.props_byte();
    for mode in [DictMode::Set, DictMode::AsyncSet] {
        let stream = compress(&simple(mode, 2)?, &data)?;
        let chunks = parse_chunks(&stream)?;

        let with_props: Vec<_> = chunks
            .iter()
            .filter_map(|chunk| match *chunk {
                Chunk::Lzma { props, .. } => props,
                _ => None,
            })
            .collect();
        assert_eq!(with_props.len(), 4, "{mode:?}");
        assert!(with_props.iter().all(|&props| props == props_byte), "{mode:?}");
        assert_eq!(decode(&stream, DICT)?, data);
    }
    Ok(())
}

#[test]
fn affinity_bounds_live_blocks() -> TestResult {
    let mut telemetry = RecordingTelemetry::new();
    for id in 0..10 {
        telemetry = telemetry.with_delay(id, Duration::from_millis(30));
    }
    let telemetry = Arc::new(telemetry);
    let coordinator = coordinator_with(
        options()?,
        config(DictMode::AsyncSet, 2),
        BufferPool::new(16),
        telemetry.clone(),
    )?;

    let data = text_bytes(BLOCK * 10, 6);
    let stream = compress(&coordinator, &data)?;

    let events = telemetry.events();
    assert_eq!(events.started.len(), 10);
    assert!(events.max_alive <= 2, "max alive {}", events.max_alive);
    assert_eq!(events.flushed, (0..10).collect::<Vec<u64>>());

    let counters = coordinator.counters();
    assert_eq!(counters.blocks_submitted, 10);
    assert_eq!(counters.blocks_flushed, 10);
    assert_eq!(counters.live_writers, 0);
    assert_eq!(counters.free_slots, 2);
    assert_eq!(counters.idle_tasks, 0);
    assert_eq!(decode(&stream, DICT)?, data);
    Ok(())
}

#[test]
fn abort_drops_unwritten_blocks() -> TestResult {
    let telemetry = Arc::new(RecordingTelemetry::new().with_delay(0, Duration::from_millis(400)));
    let coordinator = coordinator_with(
        options()?,
        config(DictMode::None, 4),
        BufferPool::new(16),
        telemetry.clone(),
    )?;

    let sink = SharedSink::new();
    let mut writer = coordinator.writer(sink.clone())?;
    writer.write_bytes(&text_bytes(BLOCK * 3, 7))?;
    let handle = writer.abort_handle();
    handle.abort();
    assert_eq!(handle.state(), StreamState::Aborted);

    let err = writer.write_bytes(b"more").unwrap_err();
    assert!(err.is_cancelled());
    let err = writer.finish().unwrap_err();
    assert!(err.is_cancelled());
    let err = writer.close().unwrap_err();
    assert!(err.is_cancelled());
    writer.close()?;
    drop(writer);

    assert!(sink.is_empty());
    assert_eq!(sink.finish_count(), 0);
    assert_eq!(sink.close_count(), 1);
    let events = telemetry.events();
    assert!(events.flushed.is_empty());
    assert!(events.failed.contains(&0), "{events:?}");
    assert_eq!(coordinator.counters().free_slots, 4);
    Ok(())
}

#[test]
fn abort_stops_a_block_that_is_already_compressing() -> TestResult {
    const LARGE: usize = 4 << 20;
    let telemetry =
        Arc::new(RecordingTelemetry::new().with_delay(0, Duration::from_millis(200)));
    let coordinator = coordinator_with(
        options()?,
        ParallelConfig {
            block_size: LARGE,
            dict_mode: DictMode::None,
            affinity: 2,
            allow_small_blocks: false,
        },
        BufferPool::new(16),
        telemetry.clone(),
    )?;

    let sink = SharedSink::new();
    let mut writer = coordinator.writer(sink.clone())?;
    // Block 0 is held after it starts; block 1 starting cancels the stream.
    telemetry.abort_when_started(1, writer.abort_handle());
    if let Err(err) = writer.write_bytes(&text_bytes(LARGE * 2, 17)) {
        assert!(err.is_cancelled(), "{err:?}");
    }
    let err = writer.close().unwrap_err();
    assert!(err.is_cancelled(), "{err:?}");

    let mut events = telemetry.events();
    events.started.sort_unstable();
    assert_eq!(events.started, vec![0, 1]);
    assert!(events.finished.is_empty(), "{events:?}");
    assert!(events.flushed.is_empty());
    assert!(events.failed.contains(&0) && events.failed.contains(&1));
    assert!(sink.is_empty());
    assert_eq!(sink.close_count(), 1);
    assert_eq!(coordinator.counters().free_slots, 2);
    Ok(())
}

#[test]
fn abort_wakes_a_writer_waiting_for_a_slot() -> TestResult {
    let telemetry = Arc::new(RecordingTelemetry::new().with_delay(0, Duration::from_secs(1)));
    let coordinator = coordinator_with(
        options()?,
        config(DictMode::None, 1),
        BufferPool::new(16),
        telemetry,
    )?;

    let mut writer = coordinator.writer(SharedSink::new())?;
    let handle = writer.abort_handle();
    let aborter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        handle.abort();
    });

    // Block 0 holds the only slot, so submitting block 1 has to wait.
    let err = writer.write_bytes(&text_bytes(BLOCK * 3, 8)).unwrap_err();
    assert!(err.is_cancelled());
    aborter.join().map_err(|_| "abort thread panicked")?;
    assert_eq!(writer.state(), StreamState::Aborted);
    Ok(())
}

#[test]
fn pool_limit_surfaces_as_capacity_error() -> TestResult {
    let pool = BufferPool::with_limit(BLOCK + BLOCK / 2, 8);
    let coordinator = coordinator_with(
        options()?,
        config(DictMode::None, 2),
        pool,
        Arc::new(DefaultBlockTelemetry),
    )?;

    let sink = SharedSink::new();
    let mut writer = coordinator.writer(sink.clone())?;
    let err = writer.write_bytes(&text_bytes(BLOCK, 9)).unwrap_err();
    assert!(matches!(err, Lzma2Error::Capacity { .. }), "{err:?}");
    assert_eq!(writer.state(), StreamState::Aborted);
    assert!(matches!(writer.close(), Err(Lzma2Error::Capacity { .. })));
    assert!(sink.is_empty());

    let tiny = coordinator_with(
        options()?,
        config(DictMode::None, 2),
        BufferPool::with_limit(1024, 8),
        Arc::new(DefaultBlockTelemetry),
    )?;
    assert!(matches!(
        tiny.writer(SharedSink::new()),
        Err(Lzma2Error::Capacity { .. })
    ));
    assert_eq!(tiny.counters().live_writers, 0);
    Ok(())
}

/// Fails every write with a fixed error kind.
struct BrokenSink;

impl io::Write for BrokenSink {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "reader went away"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Lzma2Sink for BrokenSink {}

#[test]
fn sink_failure_aborts_the_stream() -> TestResult {
    let coordinator = simple(DictMode::None, 2)?;
    let mut writer = coordinator.writer(BrokenSink)?;
    writer.write_bytes(&text_bytes(BLOCK + 100, 10))?;

    let err = writer.finish().unwrap_err();
    assert!(!err.is_cancelled());
    assert!(err.to_string().contains("writing block 0"), "{err}");
    assert_eq!(writer.state(), StreamState::Aborted);
    assert!(writer.close().is_err());
    Ok(())
}

#[test]
fn finish_is_idempotent_and_rejects_later_writes() -> TestResult {
    let coordinator = simple(DictMode::AsyncSet, 2)?;
    let sink = SharedSink::new();
    let mut writer = coordinator.writer(sink.clone())?;
    writer.write_bytes(&text_bytes(1000, 11))?;
    writer.finish()?;
    writer.finish()?;

    assert!(matches!(writer.write_bytes(b"x"), Err(Lzma2Error::Cancelled)));
    writer.close()?;
    writer.close()?;

    let chunks = parse_chunks(&sink.contents())?;
    assert_eq!(chunks.iter().filter(|c| **c == Chunk::End).count(), 1);
    assert_eq!(sink.finish_count(), 1);
    assert_eq!(sink.close_count(), 1);
    Ok(())
}

#[test]
fn empty_stream_is_only_the_end_marker() -> TestResult {
    let coordinator = simple(DictMode::AsyncSet, 2)?;
    let writer = coordinator.writer(Vec::new())?;
    assert_eq!(writer.finish_into_inner()?, vec![0x00]);
    Ok(())
}

#[test]
fn flush_writes_the_partial_block() -> TestResult {
    let coordinator = simple(DictMode::AsyncSet, 2)?;
    let sink = SharedSink::new();
    let data = text_bytes(BLOCK * 2, 12);

    let mut writer = coordinator.writer(sink.clone())?;
    writer.write_bytes(&data[..BLOCK / 2])?;
    writer.flush()?;
    assert_eq!(writer.blocks_submitted(), 1);

    let flushed = parse_chunks(&sink.contents())?;
    assert!(!flushed.contains(&Chunk::End));
    assert_eq!(flushed.iter().map(Chunk::uncompressed).sum::<usize>(), BLOCK / 2);

    writer.write_bytes(&data[BLOCK / 2..])?;
    writer.close()?;
    assert_eq!(decode(&sink.contents(), DICT)?, data);
    Ok(())
}

#[test]
fn streams_share_one_coordinator() -> TestResult {
    let coordinator = simple(DictMode::AsyncSet, 3)?;
    let handles: Vec<_> = (0..3u64)
        .map(|seed| {
            let coordinator = Arc::clone(&coordinator);
            thread::spawn(move || -> Result<bool, Box<dyn std::error::Error + Send + Sync>> {
                let data = text_bytes(BLOCK * 4 + seed as usize, 20 + seed);
                let stream = compress(&coordinator, &data)?;
                let decoded = decode(&stream, DICT).map_err(|err| err.to_string())?;
                Ok(decoded == data)
            })
        })
        .collect();

    for handle in handles {
        let matched = handle.join().map_err(|_| "stream thread panicked")?;
        assert!(matched.map_err(|err| err.to_string())?);
    }

    let counters = coordinator.counters();
    assert_eq!(counters.live_writers, 0);
    assert_eq!(counters.idle_tasks, 0);
    assert_eq!(counters.free_slots, 3);
    Ok(())
}

#[test]
fn preset_dictionary_leads_the_first_block() -> TestResult {
    let dictionary = text_bytes(32 << 10, 13);
    let mut options = options()?;
    options.set_preset_dict(dictionary.clone());
    let coordinator = coordinator_with(
        options.clone(),
        config(DictMode::AsyncSet, 2),
        BufferPool::new(16),
        Arc::new(DefaultBlockTelemetry),
    )?;

    let data = [dictionary.as_slice(), &text_bytes(BLOCK * 2, 14)].concat();
    let stream = compress(&coordinator, &data)?;
    match parse_chunks(&stream)?[0] {
        Chunk::Lzma { reset, props, .. } => {
            assert_eq!(reset, ResetState::PropReset);
            assert_eq!(props, Some(options.props_byte()));
        }
        other => panic!("expected a compressed chunk: {other:?}"),
    }
    Ok(())
}

#[test]
fn memory_estimate_scales_with_affinity() -> TestResult {
    let estimate = |affinity| -> Result<usize, Lzma2Error> {
        Ok(simple(DictMode::AsyncSet, affinity)?.extra_memory_usage_bytes())
    };
    let one = estimate(1)?;
    let two = estimate(2)?;
    let four = estimate(4)?;

    let per_task = two - one;
    assert_eq!(four - two, 2 * per_task);
    assert!(per_task >= DICT as usize + 2 * BLOCK);
    assert!(one - per_task >= DICT as usize + BLOCK);
    Ok(())
}

#[test]
fn config_validation_and_defaults() -> TestResult {
    let mut config = ParallelConfig::default();
    assert!(config.affinity >= 1);
    assert_eq!(config.dict_mode, DictMode::Auto);
    assert!(config.validate().is_ok());

    config.block_size = BLOCK;
    assert!(matches!(
        config.validate(),
        Err(Lzma2Error::InvalidOptions(_))
    ));
    config.allow_small_blocks = true;
    assert!(config.validate().is_ok());

    config.affinity = 0;
    assert!(config.validate().is_err());
    config.affinity = 256;
    assert!(config.validate().is_err());

    let coordinator = Lzma2Parallel::new(Lzma2Options::preset(6)?, ParallelConfig::default())?;
    assert_eq!(coordinator.block_size(), auto_block_size(8 << 20));
    assert!(coordinator.block_size() >= BLOCK_SIZE_MIN);
    Ok(())
}
