use crate::buffer::{BufferPool, PooledBuffer};
use crate::Result;

use super::{COMPRESSED_SIZE_MAX, MATCH_LEN_MAX};

const HASH_BITS_MIN: u32 = 12;
const HASH_BITS_MAX: u32 = 20;
const CHAIN_SIZE_MAX: usize = 1 << 22;
const MIN_HASHED_LEN: usize = 3;
const EMPTY: u32 = 0;

/// Sliding history window with a hash-chain match finder.
///
/// Positions are tracked as absolute stream offsets counted from the last
/// dictionary reset, so `position() & pos_mask` is the decoder's pos state.
/// The chain stores `offset + 1` truncated to 32 bits; a stale or aliased
/// entry can only cost a byte comparison, because every candidate is
/// verified against the window before it is used.
#[derive(Debug)]
pub(crate) struct LzWindow {
    buf: PooledBuffer,
    buf_size: usize,
    keep_before: usize,
    dict_size: usize,
    start_pos: u64,
    read_pos: usize,
    write_pos: usize,
    hashed_pos: usize,
    flushing: bool,
    finishing: bool,
    hash_bits: u32,
    head: Vec<u32>,
    chain: Vec<u32>,
    max_distance: usize,
    depth_limit: usize,
    nice_len: usize,
}

/// Best match found at the current position; `distance` is one-based.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Match {
    pub len: usize,
    pub distance: usize,
}

pub(crate) fn buffer_size(dict_size: usize) -> usize {
    let reserve = (dict_size / 2 + (256 << 10)).min(512 << 20);
    keep_before(dict_size) + MATCH_LEN_MAX + reserve
}

/// Raw chunks are cut from history, so at least one maximal compressed
/// chunk worth of bytes has to stay behind the read position.
fn keep_before(dict_size: usize) -> usize {
    dict_size.max(COMPRESSED_SIZE_MAX + 16)
}

pub(crate) fn hash_bits(dict_size: usize) -> u32 {
    let log2 = usize::BITS - dict_size.saturating_sub(1).leading_zeros();
    log2.saturating_sub(2).clamp(HASH_BITS_MIN, HASH_BITS_MAX)
}

pub(crate) fn chain_len(dict_size: usize) -> usize {
    dict_size.min(CHAIN_SIZE_MAX) + 1
}

impl LzWindow {
    pub fn new(
        dict_size: usize,
        nice_len: usize,
        depth_limit: usize,
        pool: &BufferPool,
    ) -> Result<Self> {
        let buf_size = buffer_size(dict_size);
        let mut buf = pool.acquire(buf_size)?;
        buf.resize(buf_size, 0);
        let hash_bits = hash_bits(dict_size);
        let chain_len = chain_len(dict_size);

        Ok(Self {
            buf,
            buf_size,
            keep_before: keep_before(dict_size),
            dict_size,
            start_pos: 0,
            read_pos: 0,
            write_pos: 0,
            hashed_pos: 0,
            flushing: false,
            finishing: false,
            hash_bits,
            head: vec![EMPTY; 1 << hash_bits],
            chain: vec![EMPTY; chain_len],
            max_distance: dict_size.min(chain_len - 1),
            depth_limit: depth_limit.max(1),
            nice_len: nice_len.clamp(MIN_HASHED_LEN, MATCH_LEN_MAX),
        })
    }

    /// Forgets all history; the next byte written sits at absolute `position`.
    pub fn restart(&mut self, position: u64) {
        self.start_pos = position;
        self.read_pos = 0;
        self.write_pos = 0;
        self.hashed_pos = 0;
        self.flushing = false;
        self.finishing = false;
        self.head.fill(EMPTY);
    }

    /// Appends history that is never encoded, as if it had been encoded earlier.
    pub fn preload(&mut self, dict: &[u8]) {
        let dict = &dict[dict.len().saturating_sub(self.dict_size)..];
        let mut offset = 0;
        while offset < dict.len() {
            self.make_room();
            let take = (dict.len() - offset).min(self.buf_size - self.write_pos);
            self.buf[self.write_pos..self.write_pos + take]
                .copy_from_slice(&dict[offset..offset + take]);
            self.write_pos += take;
            offset += take;
            self.read_pos = self.write_pos;
            self.hash_up_to(self.read_pos);
        }
    }

    /// Copies as much of `input` as fits and returns the number of bytes taken.
    pub fn fill(&mut self, input: &[u8]) -> usize {
        if self.write_pos == self.buf_size {
            self.make_room();
        }

        let take = input.len().min(self.buf_size - self.write_pos);
        self.buf[self.write_pos..self.write_pos + take].copy_from_slice(&input[..take]);
        self.write_pos += take;
        if take > 0 {
            self.flushing = false;
        }
        take
    }

    fn make_room(&mut self) {
        let offset = self.read_pos.saturating_sub(self.keep_before);
        if offset == 0 {
            return;
        }
        self.buf.copy_within(offset..self.write_pos, 0);
        self.read_pos -= offset;
        self.write_pos -= offset;
        self.hashed_pos = self.hashed_pos.saturating_sub(offset);
        self.start_pos += offset as u64;
    }

    pub fn set_flushing(&mut self) {
        self.flushing = true;
    }

    pub fn set_finishing(&mut self) {
        self.finishing = true;
    }

    /// Bytes available for encoding at the read position, or zero when more
    /// input is needed before a symbol can be chosen safely.
    pub fn available(&self) -> usize {
        let avail = self.write_pos - self.read_pos;
        if avail >= MATCH_LEN_MAX || self.flushing || self.finishing {
            avail.min(MATCH_LEN_MAX)
        } else {
            0
        }
    }

    /// Absolute offset of the read position since the last dictionary reset.
    pub fn position(&self) -> u64 {
        self.start_pos + self.read_pos as u64
    }

    /// Encoded bytes that are still addressable as match history.
    pub fn history(&self) -> usize {
        self.read_pos.min(self.max_distance)
    }

    /// Byte `back` positions behind the read position (1 = previous byte).
    pub fn byte_back(&self, back: usize) -> u8 {
        self.buf[self.read_pos - back]
    }

    pub fn current_byte(&self) -> u8 {
        self.buf[self.read_pos]
    }

    /// Length of the match at one-based `distance`, capped at `limit`.
    pub fn match_len_at(&self, distance: usize, limit: usize) -> usize {
        Self::common_prefix(&self.buf, self.read_pos - distance, self.read_pos, limit)
    }

    fn common_prefix(buf: &[u8], earlier: usize, later: usize, limit: usize) -> usize {
        let mut len = 0;
        while len < limit && buf[earlier + len] == buf[later + len] {
            len += 1;
        }
        len
    }

    /// The last `len` bytes before the read position.
    pub fn tail(&self, len: usize) -> &[u8] {
        &self.buf[self.read_pos - len..self.read_pos]
    }

    pub fn advance(&mut self, len: usize) {
        self.read_pos += len;
    }

    /// Longest hash-chain match at `ahead` bytes past the read position.
    pub fn find_match(&mut self, ahead: usize, limit: usize) -> Match {
        let pos = self.read_pos + ahead;
        self.hash_up_to(pos);
        let mut best = Match::default();
        let limit = limit.min(self.write_pos.saturating_sub(pos));
        if limit < MIN_HASHED_LEN {
            return best;
        }

        let history = pos.min(self.max_distance);
        let abs = self.start_pos + pos as u64;
        let tag = (abs as u32).wrapping_add(1);
        let mut candidate = self.head[self.hash(pos)];
        let mut last_distance = 0;
        for _ in 0..self.depth_limit {
            if candidate == EMPTY {
                break;
            }
            let distance = tag.wrapping_sub(candidate) as usize;
            if distance == 0 || distance > history || distance <= last_distance {
                break;
            }

            let len = Self::common_prefix(&self.buf, pos - distance, pos, limit);
            if len > best.len {
                best = Match { len, distance };
                if len >= self.nice_len || len == limit {
                    break;
                }
            }
            last_distance = distance;
            candidate = self.chain[((abs - distance as u64) % self.chain.len() as u64) as usize];
        }

        if best.len < MIN_HASHED_LEN {
            Match::default()
        } else {
            best
        }
    }

    fn hash(&self, pos: usize) -> usize {
        let value = u32::from(self.buf[pos])
            | u32::from(self.buf[pos + 1]) << 8
            | u32::from(self.buf[pos + 2]) << 16;
        (value.wrapping_mul(0x9E37_79B1) >> (32 - self.hash_bits)) as usize
    }

    /// Inserts every position before `end` that has enough bytes to hash.
    fn hash_up_to(&mut self, end: usize) {
        let limit = end.min(self.write_pos.saturating_sub(MIN_HASHED_LEN - 1));
        while self.hashed_pos < limit {
            let pos = self.hashed_pos;
            let abs = self.start_pos + pos as u64;
            let slot = self.hash(pos);
            let chain_index = (abs % self.chain.len() as u64) as usize;
            self.chain[chain_index] = self.head[slot];
            self.head[slot] = (abs as u32).wrapping_add(1);
            self.hashed_pos += 1;
        }
    }

    pub fn memory_usage(dict_size: usize) -> usize {
        buffer_size(dict_size)
            + (4usize << hash_bits(dict_size))
            + 4 * chain_len(dict_size)
    }
}
