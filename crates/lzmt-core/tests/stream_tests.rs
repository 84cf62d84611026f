mod support;

use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use lzmt_core::lzma::LZMA2_UNCOMPRESSED_LIMIT;
use lzmt_core::{Lzma2Error, Lzma2Options, Lzma2Sink, Lzma2Writer, Mode, ResetState, SharedSink};
use support::{Chunk, TestResult, decode, parse_chunks, random_bytes, text_bytes};

fn compress(data: &[u8], options: &Lzma2Options) -> Result<Vec<u8>, Lzma2Error> {
    let mut writer = Lzma2Writer::new(Vec::new(), options)?;
    writer.write_bytes(data)?;
    writer.finish_into_inner()
}

fn fast_options() -> Result<Lzma2Options, Lzma2Error> {
    Lzma2Options::preset(1)
}

#[test]
fn empty_stream_is_only_the_end_marker() -> TestResult {
    let options = fast_options()?;
    let stream = compress(&[], &options)?;
    assert_eq!(stream, vec![0x00]);
    assert!(decode(&stream, options.dict_size())?.is_empty());
    Ok(())
}

#[test]
fn round_trips_around_the_chunk_limit() -> TestResult {
    let options = fast_options()?;
    for len in [
        1,
        LZMA2_UNCOMPRESSED_LIMIT - 1,
        LZMA2_UNCOMPRESSED_LIMIT,
        LZMA2_UNCOMPRESSED_LIMIT + 1,
    ] {
        let data = text_bytes(len, len as u64);
        let stream = compress(&data, &options)?;
        let chunks = parse_chunks(&stream)?;
        assert_eq!(chunks.last(), Some(&Chunk::End), "len {len}");
        let total: usize = chunks.iter().map(Chunk::uncompressed).sum();
        assert_eq!(total, len);
        assert_eq!(decode(&stream, options.dict_size())?, data, "len {len}");
    }
    Ok(())
}

#[test]
fn normal_mode_round_trips_several_mebibytes() -> TestResult {
    let options = Lzma2Options::preset(6)?;
    let mut data = text_bytes(3 << 20, 11);
    data.extend_from_slice(&random_bytes(300_000, 12));
    data.extend_from_slice(&text_bytes(1 << 20, 13));

    let stream = compress(&data, &options)?;
    assert!(stream.len() < data.len() / 2);
    assert_eq!(decode(&stream, options.dict_size())?, data);
    Ok(())
}

#[test]
fn small_incompressible_input_is_one_raw_chunk() -> TestResult {
    let options = fast_options()?;
    let data = random_bytes(40_000, 1);
    let stream = compress(&data, &options)?;

    assert_eq!(
        parse_chunks(&stream)?,
        vec![
            Chunk::Raw {
                dict_reset: true,
                size: 40_000,
                offset: 0,
            },
            Chunk::End,
        ]
    );
    assert_eq!(&stream[3..stream.len() - 1], &data[..]);
    Ok(())
}

#[test]
fn uncompressed_mode_cuts_raw_chunks_at_64_kib() -> TestResult {
    let mut options = fast_options()?;
    options.set_mode(Mode::Uncompressed);
    let data = random_bytes(150_000, 2);
    let stream = compress(&data, &options)?;
    let chunks = parse_chunks(&stream)?;

    let raw: Vec<(bool, usize, usize)> = chunks
        .iter()
        .filter_map(|chunk| match *chunk {
            Chunk::Raw {
                dict_reset,
                size,
                offset,
            } => Some((dict_reset, size, offset)),
            _ => None,
        })
        .collect();
    assert_eq!(
        raw.iter().map(|&(reset, size, _)| (reset, size)).collect::<Vec<_>>(),
        vec![(true, 65_536), (false, 65_536), (false, 18_928)]
    );
    assert_eq!(chunks.len(), 4);

    // Every raw chunk decodes on its own once it is given a dictionary reset.
    let mut start = 0;
    for (_, size, offset) in raw {
        let mut alone = stream[offset..offset + 3 + size].to_vec();
        alone[0] = 0x01;
        alone.push(0x00);
        assert_eq!(decode(&alone, options.dict_size())?, &data[start..start + size]);
        start += size;
    }
    Ok(())
}

#[test]
fn compressed_chunks_after_raw_chunks_reset_state() -> TestResult {
    let options = fast_options()?;
    let mut data = text_bytes(300_000, 3);
    data.extend_from_slice(&random_bytes(200_000, 4));
    data.extend_from_slice(&text_bytes(300_000, 5));

    let stream = compress(&data, &options)?;
    let chunks = parse_chunks(&stream)?;

    match chunks[0] {
        Chunk::Lzma { reset, props, .. } => {
            assert_eq!(reset, ResetState::DictReset);
            assert_eq!(props, Some(options.props_byte()));
        }
        other => panic!("first chunk should be compressed: {other:?}"),
    }
    assert!(chunks.iter().any(Chunk::is_raw));

    for pair in chunks.windows(2) {
        if let [Chunk::Raw { .. }, Chunk::Lzma { reset, .. }] = pair {
            assert!(*reset >= ResetState::StateReset, "{pair:?}");
        }
    }
    for chunk in &chunks[1..] {
        if let Chunk::Raw { dict_reset, .. } = chunk {
            assert!(!dict_reset);
        }
    }
    assert_eq!(decode(&stream, options.dict_size())?, data);
    Ok(())
}

#[test]
fn properties_follow_a_leading_raw_chunk() -> TestResult {
    let options = fast_options()?;
    let mut data = random_bytes(100_000, 6);
    data.extend_from_slice(&text_bytes(200_000, 7));

    let stream = compress(&data, &options)?;
    let chunks = parse_chunks(&stream)?;

    assert!(matches!(
        chunks[0],
        Chunk::Raw {
            dict_reset: true,
            ..
        }
    ));
    let first_lzma = chunks
        .iter()
        .find(|chunk| matches!(chunk, Chunk::Lzma { .. }))
        .ok_or("no compressed chunk")?;
    match *first_lzma {
        Chunk::Lzma { reset, props, .. } => {
            assert_eq!(reset, ResetState::PropReset);
            assert_eq!(props, Some(options.props_byte()));
        }
        _ => unreachable!(),
    }
    assert_eq!(decode(&stream, options.dict_size())?, data);
    Ok(())
}

#[test]
fn finish_and_close_are_idempotent() -> TestResult {
    let options = fast_options()?;
    let sink = SharedSink::new();
    let data = text_bytes(50_000, 8);

    let mut writer = Lzma2Writer::new(sink.clone(), &options)?;
    writer.write_bytes(&data)?;
    writer.finish()?;
    writer.finish()?;
    writer.close()?;
    writer.close()?;
    drop(writer);

    let stream = sink.contents();
    let chunks = parse_chunks(&stream)?;
    assert_eq!(chunks.iter().filter(|c| **c == Chunk::End).count(), 1);
    assert_eq!(sink.finish_count(), 1);
    assert_eq!(sink.close_count(), 1);
    assert_eq!(decode(&stream, options.dict_size())?, data);
    Ok(())
}

#[test]
fn write_after_finish_is_rejected() -> TestResult {
    let options = fast_options()?;
    let mut writer = Lzma2Writer::new(Vec::new(), &options)?;
    writer.write_bytes(b"payload")?;
    writer.finish()?;

    let err = writer.write_bytes(b"more").unwrap_err();
    assert!(matches!(err, Lzma2Error::IllegalState(_)), "{err:?}");
    assert!(writer.is_finished());
    Ok(())
}

#[test]
fn flush_emits_complete_chunks_mid_stream() -> TestResult {
    let options = fast_options()?;
    let sink = SharedSink::new();
    let first = text_bytes(10_000, 9);
    let second = text_bytes(20_000, 10);

    let mut writer = Lzma2Writer::new(sink.clone(), &options)?;
    writer.write_bytes(&first)?;
    writer.flush()?;

    let flushed = parse_chunks(&sink.contents())?;
    assert!(!flushed.is_empty());
    assert!(!flushed.contains(&Chunk::End));
    assert_eq!(flushed.iter().map(Chunk::uncompressed).sum::<usize>(), first.len());

    writer.write_bytes(&second)?;
    writer.close()?;

    let mut expected = first;
    expected.extend_from_slice(&second);
    assert_eq!(decode(&sink.contents(), options.dict_size())?, expected);
    Ok(())
}

#[test]
fn stats_match_the_written_stream() -> TestResult {
    let options = fast_options()?;
    let sink = SharedSink::new();
    let mut data = text_bytes(200_000, 14);
    data.extend_from_slice(&random_bytes(100_000, 15));

    let mut writer = Lzma2Writer::new(sink.clone(), &options)?;
    writer.write_bytes(&data)?;
    writer.finish()?;
    let stats = writer.stats();

    let chunks = parse_chunks(&sink.contents())?;
    assert_eq!(stats.uncompressed_bytes, data.len() as u64);
    assert_eq!(stats.compressed_bytes, sink.len() as u64);
    assert_eq!(
        stats.lzma_chunks as usize,
        chunks.iter().filter(|c| matches!(c, Chunk::Lzma { .. })).count()
    );
    assert_eq!(
        stats.raw_chunks as usize,
        chunks.iter().filter(|c| c.is_raw()).count()
    );
    assert!(stats.ratio() < 1.0);
    Ok(())
}

#[test]
fn output_does_not_depend_on_write_sizes() -> TestResult {
    let options = Lzma2Options::preset(6)?;
    let data = text_bytes(700_000, 16);
    let whole = compress(&data, &options)?;

    let mut writer = Lzma2Writer::new(Vec::new(), &options)?;
    for piece in data.chunks(4_093) {
        writer.write_bytes(piece)?;
    }
    assert_eq!(writer.finish_into_inner()?, whole);
    Ok(())
}

#[test]
fn works_as_an_io_writer() -> TestResult {
    let options = fast_options()?;
    let data = text_bytes(120_000, 17);
    let mut writer = Lzma2Writer::new(Vec::new(), &options)?;
    io::copy(&mut &data[..], &mut writer)?;
    Write::flush(&mut writer)?;
    let stream = writer.finish_into_inner()?;
    assert_eq!(decode(&stream, options.dict_size())?, data);
    Ok(())
}

#[test]
fn dropping_an_open_writer_ends_the_stream() -> TestResult {
    let options = fast_options()?;
    let sink = SharedSink::new();
    let data = text_bytes(30_000, 18);
    {
        let mut writer = Lzma2Writer::new(sink.clone(), &options)?;
        writer.write_bytes(&data)?;
    }
    assert_eq!(sink.finish_count(), 1);
    assert_eq!(sink.close_count(), 1);
    assert_eq!(decode(&sink.contents(), options.dict_size())?, data);
    Ok(())
}

#[test]
fn preset_dictionary_starts_with_prop_reset() -> TestResult {
    let dictionary = random_bytes(64 << 10, 19);
    let plain = fast_options()?;
    let mut primed = plain.clone();
    primed.set_preset_dict(dictionary.clone());

    let without = compress(&dictionary, &plain)?;
    let with = compress(&dictionary, &primed)?;

    match parse_chunks(&with)?[0] {
        Chunk::Lzma { reset, props, .. } => {
            assert_eq!(reset, ResetState::PropReset);
            assert_eq!(props, Some(primed.props_byte()));
        }
        other => panic!("expected a compressed chunk: {other:?}"),
    }
    assert!(with.len() * 2 < without.len(), "{} vs {}", with.len(), without.len());
    Ok(())
}

/// Accepts `limit` bytes, then fails every write.
struct FailingSink {
    limit: usize,
    written: usize,
    closed: Arc<AtomicUsize>,
}

impl Write for FailingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() > self.limit {
            return Err(io::Error::new(io::ErrorKind::StorageFull, "sink full"));
        }
        self.written += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Lzma2Sink for FailingSink {
    fn close(&mut self) -> io::Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn sink_failure_closes_the_writer() -> TestResult {
    let options = fast_options()?;
    let closed = Arc::new(AtomicUsize::new(0));
    let sink = FailingSink {
        limit: 1_000,
        written: 0,
        closed: Arc::clone(&closed),
    };

    let mut writer = Lzma2Writer::new(sink, &options)?;
    let err = writer.write_bytes(&random_bytes(300_000, 20)).unwrap_err();
    assert!(matches!(err, Lzma2Error::Io(ref io) if io.kind() == io::ErrorKind::StorageFull));
    assert!(writer.is_closed());
    assert_eq!(closed.load(Ordering::SeqCst), 1);

    assert!(matches!(
        writer.write_bytes(b"late"),
        Err(Lzma2Error::IllegalState(_))
    ));
    writer.close()?;
    drop(writer);
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    Ok(())
}
