//! LZMA2 chunk framing shared by the sequential stream and the block tasks.

use std::io::Write;
use std::time::Instant;

use crate::lzma::{BlockEncoder, COMPRESSED_SIZE_MAX};
use crate::telemetry;
use crate::telemetry::profile;
use crate::telemetry::tags;
use crate::{Lzma2Error, Result, StreamStats};

const PROFILE_TAG_STACK_CHUNK: [&str; 2] = [tags::TAG_SYSTEM, tags::TAG_CHUNK];

/// Control byte terminating an LZMA2 stream.
pub const END_MARKER: u8 = 0x00;
/// Control byte of an uncompressed chunk that also resets the dictionary.
pub const RAW_DICT_RESET: u8 = 0x01;
/// Control byte of an uncompressed chunk that keeps the dictionary.
pub const RAW_NO_RESET: u8 = 0x02;
const LZMA_CHUNK: u8 = 0x80;

/// How much decoder state the next LZMA chunk resets.
///
/// Levels are ordered: every level implies the ones below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResetState {
    /// Continue with the current state, properties and dictionary.
    Lzma = 0,
    /// Reset the LZMA state.
    StateReset = 1,
    /// Reset the state and write a new properties byte.
    PropReset = 2,
    /// Reset everything, dictionary included.
    DictReset = 3,
}

impl ResetState {
    /// The reset level encoded in an LZMA chunk's control byte.
    pub fn from_control(control: u8) -> Option<Self> {
        if control & LZMA_CHUNK == 0 {
            return None;
        }
        Some(match (control >> 5) & 0x03 {
            0 => Self::Lzma,
            1 => Self::StateReset,
            2 => Self::PropReset,
            _ => Self::DictReset,
        })
    }

    fn after_raw(self) -> Self {
        if self >= Self::PropReset {
            Self::PropReset
        } else {
            Self::StateReset
        }
    }
}

/// Writes the LZMA2 chunks produced by one [`BlockEncoder`].
///
/// The framer owns the reset-level bookkeeping: every chunk is labelled with
/// the weakest reset that is still correct for what the decoder has seen.
#[derive(Debug)]
pub struct ChunkEncoder<E> {
    encoder: E,
    state: ResetState,
    pending: usize,
    stats: StreamStats,
}

impl<E: BlockEncoder> ChunkEncoder<E> {
    /// Wraps a freshly restarted encoder; the first chunk resets the dictionary.
    pub fn new(encoder: E) -> Self {
        Self {
            encoder,
            state: ResetState::DictReset,
            pending: 0,
            stats: StreamStats::default(),
        }
    }

    /// Starts a new run of chunks whose first byte is at absolute `position`.
    ///
    /// `state` is the reset level the first chunk of the run carries;
    /// `history` is loaded as look-back that is never emitted.
    pub fn begin(&mut self, position: u64, state: ResetState, history: &[u8]) {
        self.encoder.restart(position);
        if !history.is_empty() {
            self.encoder.set_preset_dict(history);
        }
        self.state = state;
        self.pending = 0;
    }

    pub fn state(&self) -> ResetState {
        self.state
    }

    /// Bytes accepted but not yet written as chunks.
    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    pub fn take_stats(&mut self) -> StreamStats {
        std::mem::take(&mut self.stats)
    }

    pub fn encoder(&self) -> &E {
        &self.encoder
    }

    /// Feeds `input` to the encoder, writing every chunk that fills up.
    ///
    /// `checkpoint` runs before each chunk is written; an error from it stops
    /// the run.
    pub fn write<W, C>(&mut self, mut input: &[u8], out: &mut W, mut checkpoint: C) -> Result<()>
    where
        W: Write + ?Sized,
        C: FnMut() -> Result<()>,
    {
        while !input.is_empty() {
            let used = self.encoder.fill_window(input);
            input = &input[used..];
            self.pending += used;
            self.stats.uncompressed_bytes += used as u64;
            if self.encoder.encode_for_lzma2() {
                checkpoint()?;
                self.write_chunk(out)?;
            }
        }
        Ok(())
    }

    /// Writes every pending byte as chunks without ending the stream.
    pub fn flush<W, C>(&mut self, out: &mut W, checkpoint: C) -> Result<()>
    where
        W: Write + ?Sized,
        C: FnMut() -> Result<()>,
    {
        self.encoder.set_flushing();
        self.drain(out, checkpoint)
    }

    /// Writes every pending byte as chunks; no more input may follow until
    /// the next [`begin`](Self::begin). The end marker is not written.
    pub fn finish<W, C>(&mut self, out: &mut W, checkpoint: C) -> Result<()>
    where
        W: Write + ?Sized,
        C: FnMut() -> Result<()>,
    {
        self.encoder.set_finishing();
        self.drain(out, checkpoint)
    }

    fn drain<W, C>(&mut self, out: &mut W, mut checkpoint: C) -> Result<()>
    where
        W: Write + ?Sized,
        C: FnMut() -> Result<()>,
    {
        while self.pending > 0 {
            self.encoder.encode_for_lzma2();
            checkpoint()?;
            if self.write_chunk(out)? == 0 {
                return Err(Lzma2Error::IllegalState("encoder made no progress"));
            }
        }
        Ok(())
    }

    /// Frames the encoder's current attempt and returns the uncompressed size
    /// it covered.
    fn write_chunk<W: Write + ?Sized>(&mut self, out: &mut W) -> Result<usize> {
        let uncompressed = self.encoder.uncompressed_size();
        if uncompressed == 0 {
            return Ok(0);
        }
        let started_at = Instant::now();
        let props = self.encoder.props_byte();
        let state = self.state;

        let attempt = self
            .encoder
            .finish_range_coder()
            .filter(|payload| payload.len() + 2 < uncompressed);
        let (kind, written) = match attempt {
            Some(payload) => {
                let (header, len) = lzma_header(state, uncompressed, payload.len(), props);
                out.write_all(&header[..len])?;
                out.write_all(payload)?;
                ("lzma", len + payload.len())
            }
            None => {
                self.encoder.reset();
                let data = self.encoder.uncompressed_tail(uncompressed);
                let mut written = 0;
                for (index, piece) in data.chunks(COMPRESSED_SIZE_MAX).enumerate() {
                    let reset_dict = index == 0 && state == ResetState::DictReset;
                    let header = raw_header(reset_dict, piece.len());
                    out.write_all(&header)?;
                    out.write_all(piece)?;
                    written += header.len() + piece.len();
                    self.stats.raw_chunks += 1;
                }
                ("raw", written)
            }
        };

        if kind == "lzma" {
            self.state = ResetState::Lzma;
            self.stats.lzma_chunks += 1;
        } else {
            self.state = state.after_raw();
        }
        self.stats.compressed_bytes += written as u64;
        self.pending -= uncompressed;
        self.encoder.reset_uncompressed_size();
        self.encoder.reset_range_coder();

        telemetry::record_chunk(kind == "lzma", uncompressed, written);
        profile::event(
            tags::PROFILE_CHUNK,
            &PROFILE_TAG_STACK_CHUNK,
            "write_chunk",
            kind,
            profile::elapsed_us(started_at),
            "chunk written",
        );
        Ok(uncompressed)
    }
}

/// Header of an LZMA chunk; the second value is how many bytes are used.
pub fn lzma_header(
    state: ResetState,
    uncompressed: usize,
    compressed: usize,
    props: u8,
) -> ([u8; 6], usize) {
    let u = uncompressed - 1;
    let c = compressed - 1;
    let header = [
        LZMA_CHUNK | ((state as u8) << 5) | ((u >> 16) as u8 & 0x1F),
        (u >> 8) as u8,
        u as u8,
        (c >> 8) as u8,
        c as u8,
        props,
    ];
    let len = if state >= ResetState::PropReset { 6 } else { 5 };
    (header, len)
}

/// Header of an uncompressed chunk of `len` (1..=65536) bytes.
pub fn raw_header(reset_dict: bool, len: usize) -> [u8; 3] {
    let n = len - 1;
    let control = if reset_dict { RAW_DICT_RESET } else { RAW_NO_RESET };
    [control, (n >> 8) as u8, n as u8]
}
