//! LZMA block encoders that produce one LZMA2 chunk at a time.

mod encoder;
pub mod range;
pub(crate) mod window;

pub use encoder::LzmaEncoder;

use crate::buffer::BufferPool;
use crate::options::{Lzma2Options, Mode};
use crate::Result;

pub const MATCH_LEN_MIN: usize = 2;
pub const MATCH_LEN_MAX: usize = 273;

/// Largest compressed payload one LZMA2 chunk can carry.
pub const COMPRESSED_SIZE_MAX: usize = 1 << 16;
/// Largest uncompressed size one LZMA2 chunk can describe.
pub const UNCOMPRESSED_SIZE_MAX: usize = 2 << 20;

/// An encoder stops growing a chunk once it holds this many input bytes,
/// leaving room for one more maximal match.
pub const LZMA2_UNCOMPRESSED_LIMIT: usize = UNCOMPRESSED_SIZE_MAX - MATCH_LEN_MAX;
/// Same for compressed bytes; the slack covers one more symbol plus the
/// range coder flush.
pub const LZMA2_COMPRESSED_LIMIT: usize = COMPRESSED_SIZE_MAX - 26;

pub(crate) const UNCOMPRESSED_LIMIT: usize = LZMA2_UNCOMPRESSED_LIMIT;
pub(crate) const COMPRESSED_LIMIT: usize = LZMA2_COMPRESSED_LIMIT;

pub(crate) const STATES: usize = 12;
pub(crate) const POS_STATES_MAX: usize = 1 << 4;
pub(crate) const REPS: usize = 4;
pub(crate) const DIST_STATES: usize = 4;
pub(crate) const DIST_SLOTS: usize = 1 << 6;
pub(crate) const DIST_MODEL_START: usize = 4;
pub(crate) const DIST_MODEL_END: usize = 14;
pub(crate) const LITERAL_CODER_SIZE: usize = 0x300;

/// The encoder contract the chunk framer drives.
///
/// Input is pushed with [`fill_window`](BlockEncoder::fill_window) and
/// turned into symbols by [`encode_for_lzma2`](BlockEncoder::encode_for_lzma2)
/// until a chunk is full. The framer then takes the range coder payload (or
/// falls back to the raw bytes from
/// [`uncompressed_tail`](BlockEncoder::uncompressed_tail)) and starts over.
pub trait BlockEncoder: Send {
    /// The LZMA properties byte written with property-resetting chunks.
    fn props_byte(&self) -> u8;

    /// Drops all history and model state; the next input byte sits at
    /// absolute `position` for pos-state purposes.
    fn restart(&mut self, position: u64);

    /// Loads history that is never emitted.
    fn set_preset_dict(&mut self, dict: &[u8]);

    /// Copies as much of `input` as fits and returns how much was taken.
    fn fill_window(&mut self, input: &[u8]) -> usize;

    /// Lets the encoder consume the tail of its window without lookahead.
    fn set_flushing(&mut self);

    /// Like flushing, but no more input will follow.
    fn set_finishing(&mut self);

    /// Encodes symbols into the current chunk.
    ///
    /// Returns `true` once the chunk has reached one of the LZMA2 limits and
    /// must be written, `false` when the encoder ran out of input first.
    fn encode_for_lzma2(&mut self) -> bool;

    /// Input bytes encoded into the current chunk.
    fn uncompressed_size(&self) -> usize;

    fn reset_uncompressed_size(&mut self);

    /// Resets the probability models, the state machine and the rep distances.
    fn reset(&mut self);

    /// Flushes the range coder; `None` when this encoder never compresses.
    fn finish_range_coder(&mut self) -> Option<&[u8]>;

    fn reset_range_coder(&mut self);

    /// The last `len` input bytes of the current chunk.
    fn uncompressed_tail(&self, len: usize) -> &[u8];
}

/// Builds the encoder for `options.mode()`.
pub fn new_block_encoder(
    options: &Lzma2Options,
    pool: &BufferPool,
) -> Result<Box<dyn BlockEncoder>> {
    Ok(match options.mode() {
        Mode::Uncompressed => Box::new(RawEncoder::with_pool(pool)?),
        Mode::Fast | Mode::Normal => Box::new(LzmaEncoder::with_pool(options, pool)?),
    })
}

/// Store-only encoder: every chunk it produces is written uncompressed.
#[derive(Debug)]
pub struct RawEncoder {
    pending: crate::buffer::PooledBuffer,
    flushing: bool,
}

impl RawEncoder {
    pub fn new() -> Result<Self> {
        Self::with_pool(&BufferPool::new(1))
    }

    pub fn with_pool(pool: &BufferPool) -> Result<Self> {
        Ok(Self {
            pending: pool.acquire(UNCOMPRESSED_LIMIT)?,
            flushing: false,
        })
    }

    pub fn memory_usage() -> usize {
        UNCOMPRESSED_LIMIT
    }
}

impl BlockEncoder for RawEncoder {
    fn props_byte(&self) -> u8 {
        0
    }

    fn restart(&mut self, _position: u64) {
        self.pending.clear();
        self.flushing = false;
    }

    fn set_preset_dict(&mut self, _dict: &[u8]) {}

    fn fill_window(&mut self, input: &[u8]) -> usize {
        let take = input.len().min(UNCOMPRESSED_LIMIT - self.pending.len());
        self.pending.extend_from_slice(&input[..take]);
        if take > 0 {
            self.flushing = false;
        }
        take
    }

    fn set_flushing(&mut self) {
        self.flushing = true;
    }

    fn set_finishing(&mut self) {
        self.flushing = true;
    }

    fn encode_for_lzma2(&mut self) -> bool {
        self.pending.len() >= UNCOMPRESSED_LIMIT || (self.flushing && !self.pending.is_empty())
    }

    fn uncompressed_size(&self) -> usize {
        self.pending.len()
    }

    fn reset_uncompressed_size(&mut self) {
        self.pending.clear();
    }

    fn reset(&mut self) {}

    fn finish_range_coder(&mut self) -> Option<&[u8]> {
        None
    }

    fn reset_range_coder(&mut self) {}

    fn uncompressed_tail(&self, len: usize) -> &[u8] {
        &self.pending[self.pending.len() - len..]
    }
}

impl<E: BlockEncoder + ?Sized> BlockEncoder for Box<E> {
    fn props_byte(&self) -> u8 {
        (**self).props_byte()
    }

    fn restart(&mut self, position: u64) {
        (**self).restart(position)
    }

    fn set_preset_dict(&mut self, dict: &[u8]) {
        (**self).set_preset_dict(dict)
    }

    fn fill_window(&mut self, input: &[u8]) -> usize {
        (**self).fill_window(input)
    }

    fn set_flushing(&mut self) {
        (**self).set_flushing()
    }

    fn set_finishing(&mut self) {
        (**self).set_finishing()
    }

    fn encode_for_lzma2(&mut self) -> bool {
        (**self).encode_for_lzma2()
    }

    fn uncompressed_size(&self) -> usize {
        (**self).uncompressed_size()
    }

    fn reset_uncompressed_size(&mut self) {
        (**self).reset_uncompressed_size()
    }

    fn reset(&mut self) {
        (**self).reset()
    }

    fn finish_range_coder(&mut self) -> Option<&[u8]> {
        (**self).finish_range_coder()
    }

    fn reset_range_coder(&mut self) {
        (**self).reset_range_coder()
    }

    fn uncompressed_tail(&self, len: usize) -> &[u8] {
        (**self).uncompressed_tail(len)
    }
}
