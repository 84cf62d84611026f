#![allow(dead_code)]

use std::collections::HashMap;
use std::error::Error;
use std::io::Read;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use lzmt_core::{AbortHandle, BlockTelemetry, ResetState};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use xz2::read::XzDecoder;
use xz2::stream::{Filters, LzmaOptions, Stream};

pub type TestResult = Result<(), Box<dyn Error>>;

const WORDS: [&str; 16] = [
    "block", "chunk", "window", "match", "literal", "range", "coder", "dictionary", "stream",
    "worker", "slot", "history", "reset", "state", "marker", "props",
];

/// Incompressible bytes.
pub fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);
    data
}

/// Word salad that compresses well but not trivially.
pub fn text_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = Vec::with_capacity(len + 16);
    while data.len() < len {
        data.extend_from_slice(WORDS[rng.gen_range(0..WORDS.len())].as_bytes());
        data.push(if rng.gen_range(0..12) == 0 { b'\n' } else { b' ' });
    }
    data.truncate(len);
    data
}

/// Decodes a raw LZMA2 stream with liblzma.
pub fn decode(stream: &[u8], dict_size: u32) -> Result<Vec<u8>, Box<dyn Error>> {
    let mut options = LzmaOptions::new_preset(6)?;
    options.dict_size(dict_size.max(4096));
    let mut filters = Filters::new();
    filters.lzma2(&options);
    let raw = Stream::new_raw_decoder(&filters)?;

    let mut decoded = Vec::new();
    XzDecoder::new_stream(stream, raw).read_to_end(&mut decoded)?;
    Ok(decoded)
}

/// One framed unit of an LZMA2 stream, as read from its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chunk {
    Lzma {
        reset: ResetState,
        uncompressed: usize,
        compressed: usize,
        props: Option<u8>,
        offset: usize,
    },
    Raw {
        dict_reset: bool,
        size: usize,
        offset: usize,
    },
    End,
}

impl Chunk {
    pub fn uncompressed(&self) -> usize {
        match *self {
            Chunk::Lzma { uncompressed, .. } => uncompressed,
            Chunk::Raw { size, .. } => size,
            Chunk::End => 0,
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, Chunk::Raw { .. })
    }
}

/// Walks the chunk headers of `stream`, checking that the framing is sound.
pub fn parse_chunks(stream: &[u8]) -> Result<Vec<Chunk>, String> {
    let mut chunks = Vec::new();
    let mut pos = 0;
    while pos < stream.len() {
        let offset = pos;
        let control = stream[pos];
        match control {
            0x00 => {
                chunks.push(Chunk::End);
                pos += 1;
                if pos != stream.len() {
                    return Err(format!("{} bytes after end marker", stream.len() - pos));
                }
            }
            0x01 | 0x02 => {
                let h = header(stream, pos, 3)?;
                let size = ((h[1] as usize) << 8 | h[2] as usize) + 1;
                chunks.push(Chunk::Raw {
                    dict_reset: control == 0x01,
                    size,
                    offset,
                });
                pos += 3 + size;
            }
            0x80..=0xFF => {
                let reset = ResetState::from_control(control)
                    .ok_or_else(|| format!("bad control byte {control:#04x}"))?;
                let with_props = reset >= ResetState::PropReset;
                let h = header(stream, pos, if with_props { 6 } else { 5 })?;
                let uncompressed =
                    (((control & 0x1F) as usize) << 16 | (h[1] as usize) << 8 | h[2] as usize) + 1;
                let compressed = ((h[3] as usize) << 8 | h[4] as usize) + 1;
                chunks.push(Chunk::Lzma {
                    reset,
                    uncompressed,
                    compressed,
                    props: with_props.then(|| h[5]),
                    offset,
                });
                pos += h.len() + compressed;
            }
            other => return Err(format!("invalid control byte {other:#04x} at {pos}")),
        }
        if pos > stream.len() {
            return Err(format!("chunk at {offset} runs past the end"));
        }
    }
    Ok(chunks)
}

fn header(stream: &[u8], pos: usize, len: usize) -> Result<&[u8], String> {
    stream
        .get(pos..pos + len)
        .ok_or_else(|| format!("truncated header at {pos}"))
}

/// Block telemetry that records what happened and can hold blocks back.
#[derive(Default)]
pub struct RecordingTelemetry {
    delays: HashMap<u64, Duration>,
    abort_on_start: Mutex<Option<(u64, AbortHandle)>>,
    events: Mutex<Events>,
}

#[derive(Debug, Default, Clone)]
pub struct Events {
    pub started: Vec<u64>,
    pub finished: Vec<u64>,
    pub failed: Vec<u64>,
    pub flushed: Vec<u64>,
    pub alive: usize,
    pub max_alive: usize,
}

impl RecordingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleeps for `delay` when block `id` starts.
    pub fn with_delay(mut self, id: u64, delay: Duration) -> Self {
        self.delays.insert(id, delay);
        self
    }

    /// Aborts the stream behind `handle` as soon as block `id` starts.
    pub fn abort_when_started(&self, id: u64, handle: AbortHandle) {
        *self.abort_on_start.lock().unwrap() = Some((id, handle));
    }

    pub fn events(&self) -> Events {
        self.events.lock().unwrap().clone()
    }
}

impl BlockTelemetry for RecordingTelemetry {
    fn on_block_started(&self, block_id: u64, _uncompressed: usize) {
        {
            let mut events = self.events.lock().unwrap();
            events.started.push(block_id);
            events.alive += 1;
            events.max_alive = events.max_alive.max(events.alive);
        }
        if let Some((id, handle)) = self.abort_on_start.lock().unwrap().as_ref() {
            if *id == block_id {
                handle.abort();
            }
        }
        if let Some(delay) = self.delays.get(&block_id) {
            thread::sleep(*delay);
        }
    }

    fn on_block_finished(&self, block_id: u64, _elapsed: Duration, _u: usize, _c: usize) {
        self.events.lock().unwrap().finished.push(block_id);
    }

    fn on_block_failed(&self, block_id: u64, _elapsed: Duration) {
        let mut events = self.events.lock().unwrap();
        events.failed.push(block_id);
        events.alive = events.alive.saturating_sub(1);
    }

    fn on_block_flushed(&self, block_id: u64, _compressed: usize) {
        let mut events = self.events.lock().unwrap();
        events.flushed.push(block_id);
        events.alive = events.alive.saturating_sub(1);
    }
}
