pub(crate) const BIT_MODEL_TOTAL_BITS: u32 = 11;
pub(crate) const BIT_MODEL_TOTAL: u32 = 1 << BIT_MODEL_TOTAL_BITS;
pub(crate) const PROB_INIT: u16 = (BIT_MODEL_TOTAL / 2) as u16;
const MOVE_BITS: u32 = 5;
const TOP_VALUE: u32 = 1 << 24;

/// Binary range encoder producing one LZMA2 chunk payload at a time.
///
/// `low` carries 33 significant bits so a carry out of the 32-bit window can
/// ripple back through the cached `0xFF` run before it is written.
#[derive(Debug)]
pub struct RangeEncoder {
    low: u64,
    range: u32,
    cache_size: u64,
    cache: u8,
    out: Vec<u8>,
}

impl Default for RangeEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl RangeEncoder {
    pub fn new() -> Self {
        Self {
            low: 0,
            range: u32::MAX,
            cache_size: 1,
            cache: 0,
            out: Vec::with_capacity(1 << 16),
        }
    }

    /// Starts a fresh chunk, keeping the output allocation.
    pub fn reset(&mut self) {
        self.low = 0;
        self.range = u32::MAX;
        self.cache_size = 1;
        self.cache = 0;
        self.out.clear();
    }

    /// Size the payload would have if `finish` were called now.
    pub fn pending_size(&self) -> usize {
        self.out.len() + self.cache_size as usize + 5 - 1
    }

    /// Flushes the coder state and returns the complete chunk payload.
    pub fn finish(&mut self) -> &[u8] {
        for _ in 0..5 {
            self.shift_low();
        }
        &self.out
    }

    pub fn encode_bit(&mut self, prob: &mut u16, bit: u32) {
        let bound = (self.range >> BIT_MODEL_TOTAL_BITS) * u32::from(*prob);
        if bit == 0 {
            self.range = bound;
            *prob += ((BIT_MODEL_TOTAL - u32::from(*prob)) >> MOVE_BITS) as u16;
        } else {
            self.low += u64::from(bound);
            self.range -= bound;
            *prob -= *prob >> MOVE_BITS;
        }

        while self.range < TOP_VALUE {
            self.range <<= 8;
            self.shift_low();
        }
    }

    /// Encodes the low `bits` bits of `symbol`, most significant first.
    pub fn encode_bit_tree(&mut self, probs: &mut [u16], bits: u32, symbol: u32) {
        let mut index = 1usize;
        for shift in (0..bits).rev() {
            let bit = (symbol >> shift) & 1;
            self.encode_bit(&mut probs[index], bit);
            index = (index << 1) | bit as usize;
        }
    }

    /// Encodes the low `bits` bits of `symbol`, least significant first.
    pub fn encode_reverse_bit_tree(&mut self, probs: &mut [u16], bits: u32, mut symbol: u32) {
        let mut index = 1usize;
        for _ in 0..bits {
            let bit = symbol & 1;
            symbol >>= 1;
            self.encode_bit(&mut probs[index], bit);
            index = (index << 1) | bit as usize;
        }
    }

    /// Encodes `count` bits of `value` with a fixed probability of one half.
    pub fn encode_direct_bits(&mut self, value: u32, count: u32) {
        for shift in (0..count).rev() {
            self.range >>= 1;
            if (value >> shift) & 1 == 1 {
                self.low += u64::from(self.range);
            }
            while self.range < TOP_VALUE {
                self.range <<= 8;
                self.shift_low();
            }
        }
    }

    fn shift_low(&mut self) {
        let low32 = self.low as u32;
        if low32 < 0xFF00_0000 || (self.low >> 32) != 0 {
            let carry = (self.low >> 32) as u8;
            let mut temp = self.cache;
            loop {
                self.out.push(temp.wrapping_add(carry));
                if self.cache_size == 1 {
                    break;
                }
                self.cache_size -= 1;
                temp = 0xFF;
            }
            self.cache = ((self.low >> 24) & 0xFF) as u8;
            self.cache_size = 0;
        }
        self.cache_size += 1;
        self.low = (self.low & 0x00FF_FFFF) << 8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_chunk_starts_with_zero_byte() {
        let mut rc = RangeEncoder::new();
        let mut prob = PROB_INIT;
        for bit in [0, 1, 1, 0, 1] {
            rc.encode_bit(&mut prob, bit);
        }
        let payload = rc.finish().to_vec();
        assert_eq!(payload[0], 0);
        assert!(payload.len() >= 5);
    }

    #[test]
    fn pending_size_matches_finished_length() {
        let mut rc = RangeEncoder::new();
        let mut probs = [PROB_INIT; 256];
        for symbol in 0..200u32 {
            rc.encode_bit_tree(&mut probs, 8, symbol.wrapping_mul(37) & 0xFF);
        }
        let predicted = rc.pending_size();
        assert_eq!(rc.finish().len(), predicted);
    }
}
