use std::fmt;
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::lzma::{LzmaEncoder, MATCH_LEN_MAX};
use crate::sink::CountingSink;
use crate::stream::Lzma2Writer;
use crate::{Lzma2Error, Result};

pub const DICT_SIZE_MIN: u32 = 4096;
pub const DICT_SIZE_MAX: u32 = 768 << 20;
pub const DICT_SIZE_DEFAULT: u32 = 8 << 20;
pub const LC_LP_MAX: u32 = 4;
pub const LC_DEFAULT: u32 = 3;
pub const LP_DEFAULT: u32 = 0;
pub const PB_MAX: u32 = 4;
pub const PB_DEFAULT: u32 = 2;
pub const NICE_LEN_MIN: u32 = 8;
pub const NICE_LEN_MAX: u32 = MATCH_LEN_MAX as u32;
pub const PRESET_MIN: u32 = 0;
pub const PRESET_MAX: u32 = 9;
pub const PRESET_DEFAULT: u32 = 5;

const PRESET_TO_DICT_SIZE: [u32; 10] = [
    1 << 18,
    1 << 20,
    1 << 21,
    1 << 22,
    1 << 22,
    1 << 23,
    1 << 23,
    1 << 24,
    1 << 25,
    1 << 26,
];
const PRESET_TO_DEPTH_LIMIT: [u32; 4] = [4, 8, 24, 48];

/// How the encoder parses its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Emit only uncompressed chunks.
    Uncompressed,
    /// Greedy parsing: take the first acceptable match.
    Fast,
    /// One-step lazy parsing: defer a match when the next position has a longer one.
    Normal,
}

/// Codec tuning shared by the sequential and parallel writers.
///
/// Mirrors the usual LZMA2 knobs. Every setter validates its input, so an
/// options value that exists is always usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lzma2Options {
    dict_size: u32,
    lc: u32,
    lp: u32,
    pb: u32,
    mode: Mode,
    nice_len: u32,
    depth_limit: u32,
    preset_dict: Option<Arc<[u8]>>,
}

impl Default for Lzma2Options {
    fn default() -> Self {
        Self::preset_unchecked(PRESET_DEFAULT)
    }
}

impl Lzma2Options {
    /// Options for compression level `preset` (0..=9).
    pub fn preset(preset: u32) -> Result<Self> {
        if preset > PRESET_MAX {
            return Err(Lzma2Error::InvalidOptions(format!(
                "unsupported preset: {preset}"
            )));
        }
        Ok(Self::preset_unchecked(preset))
    }

    fn preset_unchecked(preset: u32) -> Self {
        let preset = preset.min(PRESET_MAX) as usize;
        let (mode, nice_len, depth_limit) = if preset <= 3 {
            let nice_len = if preset <= 1 { 128 } else { NICE_LEN_MAX };
            (Mode::Fast, nice_len, PRESET_TO_DEPTH_LIMIT[preset])
        } else {
            let nice_len = match preset {
                4 => 16,
                5 => 32,
                _ => 64,
            };
            (Mode::Normal, nice_len, 0)
        };

        Self {
            dict_size: PRESET_TO_DICT_SIZE[preset],
            lc: LC_DEFAULT,
            lp: LP_DEFAULT,
            pb: PB_DEFAULT,
            mode,
            nice_len,
            depth_limit,
            preset_dict: None,
        }
    }

    /// Rebuilds the lc/lp/pb triple from an LZMA properties byte.
    pub fn from_props_byte(props: u8) -> Result<Self> {
        let props = u32::from(props);
        if props >= 9 * 5 * 5 {
            return Err(Lzma2Error::InvalidOptions(format!(
                "invalid properties byte: {props:#04x}"
            )));
        }
        let lc = props % 9;
        let lp = (props / 9) % 5;
        let pb = props / 45;
        let mut options = Self::default();
        options.set_lc_lp(lc, lp)?.set_pb(pb)?;
        Ok(options)
    }

    pub fn set_dict_size(&mut self, dict_size: u32) -> Result<&mut Self> {
        if dict_size < DICT_SIZE_MIN {
            return Err(Lzma2Error::InvalidOptions(format!(
                "dictionary size must be at least 4 KiB: {dict_size} B"
            )));
        }
        if dict_size > DICT_SIZE_MAX {
            return Err(Lzma2Error::InvalidOptions(format!(
                "dictionary size must not exceed {} MiB: {dict_size} B",
                DICT_SIZE_MAX >> 20
            )));
        }
        self.dict_size = dict_size;
        Ok(self)
    }

    pub fn set_lc_lp(&mut self, lc: u32, lp: u32) -> Result<&mut Self> {
        if lc + lp > LC_LP_MAX {
            return Err(Lzma2Error::InvalidOptions(format!(
                "lc + lp must not exceed {LC_LP_MAX}: {lc} + {lp}"
            )));
        }
        self.lc = lc;
        self.lp = lp;
        Ok(self)
    }

    pub fn set_pb(&mut self, pb: u32) -> Result<&mut Self> {
        if pb > PB_MAX {
            return Err(Lzma2Error::InvalidOptions(format!(
                "pb must not exceed {PB_MAX}: {pb}"
            )));
        }
        self.pb = pb;
        Ok(self)
    }

    pub fn set_mode(&mut self, mode: Mode) -> &mut Self {
        self.mode = mode;
        self
    }

    pub fn set_nice_len(&mut self, nice_len: u32) -> Result<&mut Self> {
        if !(NICE_LEN_MIN..=NICE_LEN_MAX).contains(&nice_len) {
            return Err(Lzma2Error::InvalidOptions(format!(
                "nice length must be in {NICE_LEN_MIN}..={NICE_LEN_MAX}: {nice_len}"
            )));
        }
        self.nice_len = nice_len;
        Ok(self)
    }

    /// Sets the match finder search depth; 0 picks one from the mode and nice length.
    pub fn set_depth_limit(&mut self, depth_limit: u32) -> &mut Self {
        self.depth_limit = depth_limit;
        self
    }

    /// History the decoder is given out of band before the first chunk.
    pub fn set_preset_dict(&mut self, preset_dict: impl Into<Arc<[u8]>>) -> &mut Self {
        let preset_dict = preset_dict.into();
        self.preset_dict = if preset_dict.is_empty() {
            None
        } else {
            Some(preset_dict)
        };
        self
    }

    pub fn clear_preset_dict(&mut self) -> &mut Self {
        self.preset_dict = None;
        self
    }

    pub fn dict_size(&self) -> u32 {
        self.dict_size
    }

    pub fn lc(&self) -> u32 {
        self.lc
    }

    pub fn lp(&self) -> u32 {
        self.lp
    }

    pub fn pb(&self) -> u32 {
        self.pb
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn nice_len(&self) -> u32 {
        self.nice_len
    }

    pub fn depth_limit(&self) -> u32 {
        self.depth_limit
    }

    /// Search depth actually used by the match finder.
    pub fn effective_depth_limit(&self) -> u32 {
        if self.depth_limit > 0 {
            return self.depth_limit;
        }
        match self.mode {
            Mode::Fast => 4 + self.nice_len / 4,
            Mode::Normal | Mode::Uncompressed => 16 + self.nice_len / 2,
        }
    }

    pub fn preset_dict(&self) -> Option<&[u8]> {
        self.preset_dict.as_deref()
    }

    /// The part of the preset dictionary that fits in the dictionary window.
    pub(crate) fn effective_preset_dict(&self) -> &[u8] {
        match self.preset_dict.as_deref() {
            Some(dict) => {
                let keep = dict.len().min(self.dict_size as usize);
                &dict[dict.len() - keep..]
            }
            None => &[],
        }
    }

    /// The LZMA properties byte: `(pb * 5 + lp) * 9 + lc`.
    pub fn props_byte(&self) -> u8 {
        ((self.pb * 5 + self.lp) * 9 + self.lc) as u8
    }

    /// The one-byte LZMA2 filter property encoding the dictionary size.
    ///
    /// The encoded size is the smallest `2^n` or `3 * 2^(n-1)` not below the
    /// configured size, which is what a decoder must allocate.
    pub fn dict_size_byte(&self) -> u8 {
        (0u8..40)
            .find(|&bits| lzma2_dict_size(bits) >= u64::from(self.dict_size))
            .unwrap_or(40)
    }

    /// Bytes of memory one sequential encoder with these options allocates.
    pub fn encoder_memory_usage(&self) -> usize {
        match self.mode {
            Mode::Uncompressed => 2 << 20,
            Mode::Fast | Mode::Normal => LzmaEncoder::memory_usage(self),
        }
    }

    /// Bytes of memory a decoder needs for streams written with these options.
    pub fn decoder_memory_usage(&self) -> usize {
        let literal_coders = 1usize << (self.lc + self.lp);
        lzma2_dict_size(self.dict_size_byte()).min(u64::from(u32::MAX)) as usize
            + literal_coders * 0x300 * 2
            + (16 << 10)
    }

    /// Tries every lc/lp/pb combination on `data` and adopts the smallest result.
    ///
    /// Returns the compressed size achieved with the adopted properties. The
    /// combinations are compressed concurrently on the rayon pool.
    pub fn find_best_props(&mut self, data: &[u8]) -> Result<u64> {
        let mut candidates = Vec::new();
        for lc in 0..=LC_LP_MAX {
            for lp in 0..=(LC_LP_MAX - lc) {
                for pb in 0..=PB_MAX {
                    candidates.push((lc, lp, pb));
                }
            }
        }

        let best = candidates
            .par_iter()
            .map(|&(lc, lp, pb)| {
                let mut candidate = self.clone();
                candidate.set_lc_lp(lc, lp)?.set_pb(pb)?;
                let mut writer = Lzma2Writer::new(CountingSink::default(), &candidate)?;
                writer.write_bytes(data)?;
                let size = writer.finish_into_inner()?.count();
                Ok((size, (lc, lp, pb)))
            })
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .min_by_key(|&(size, (lc, lp, pb))| (size, lc, lp, pb));

        let Some((size, (lc, lp, pb))) = best else {
            return Err(Lzma2Error::IllegalState("no property candidates"));
        };
        self.set_lc_lp(lc, lp)?.set_pb(pb)?;
        Ok(size)
    }
}

fn lzma2_dict_size(bits: u8) -> u64 {
    if bits >= 40 {
        return u64::from(u32::MAX);
    }
    (2 | u64::from(bits & 1)) << (bits / 2 + 11)
}

impl fmt::Display for Lzma2Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dict_size.is_power_of_two() {
            write!(f, "{}", self.dict_size.trailing_zeros())?;
        } else if self.dict_size % (1 << 20) == 0 {
            write!(f, "{}M", self.dict_size >> 20)?;
        } else if self.dict_size % (1 << 10) == 0 {
            write!(f, "{}K", self.dict_size >> 10)?;
        } else {
            write!(f, "{}", self.dict_size)?;
        }

        if self.lc != LC_DEFAULT {
            write!(f, ":lc{}", self.lc)?;
        }
        if self.lp != LP_DEFAULT {
            write!(f, ":lp{}", self.lp)?;
        }
        if self.pb != PB_DEFAULT {
            write!(f, ":pb{}", self.pb)?;
        }

        match self.mode {
            Mode::Fast => f.write_str(" FAST"),
            Mode::Uncompressed => f.write_str(" STORE"),
            Mode::Normal => Ok(()),
        }
    }
}
