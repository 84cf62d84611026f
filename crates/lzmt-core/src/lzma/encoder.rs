use crate::buffer::BufferPool;
use crate::options::{Lzma2Options, Mode};
use crate::Result;

use super::range::{PROB_INIT, RangeEncoder};
use super::window::{LzWindow, Match};
use super::{
    BlockEncoder, COMPRESSED_LIMIT, DIST_MODEL_END, DIST_MODEL_START, DIST_SLOTS, DIST_STATES,
    LITERAL_CODER_SIZE, MATCH_LEN_MIN, POS_STATES_MAX, REPS, STATES,
    UNCOMPRESSED_LIMIT,
};

const LOW_SYMBOLS: usize = 8;
const MID_SYMBOLS: usize = 8;
const HIGH_SYMBOLS: usize = 256;
const ALIGN_BITS: u32 = 4;
const ALIGN_SIZE: usize = 1 << ALIGN_BITS;
const DIST_SPECIAL_MAX: usize = 1 << ((DIST_MODEL_END / 2) - 2);
const LIT_STATES: u8 = 7;

/// The LZMA state machine: 0..7 after literals, 7..12 after matches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct State(u8);

impl State {
    fn index(self) -> usize {
        self.0 as usize
    }

    fn is_literal(self) -> bool {
        self.0 < LIT_STATES
    }

    fn update_literal(&mut self) {
        self.0 = match self.0 {
            0..=3 => 0,
            4..=9 => self.0 - 3,
            _ => self.0 - 6,
        };
    }

    fn update_match(&mut self) {
        self.0 = if self.is_literal() { 7 } else { 10 };
    }

    fn update_long_rep(&mut self) {
        self.0 = if self.is_literal() { 8 } else { 11 };
    }

    fn update_short_rep(&mut self) {
        self.0 = if self.is_literal() { 9 } else { 11 };
    }
}

#[derive(Debug, Clone)]
struct LengthEncoder {
    choice: u16,
    choice2: u16,
    low: [[u16; LOW_SYMBOLS]; POS_STATES_MAX],
    mid: [[u16; MID_SYMBOLS]; POS_STATES_MAX],
    high: [u16; HIGH_SYMBOLS],
}

impl LengthEncoder {
    fn new() -> Self {
        Self {
            choice: PROB_INIT,
            choice2: PROB_INIT,
            low: [[PROB_INIT; LOW_SYMBOLS]; POS_STATES_MAX],
            mid: [[PROB_INIT; MID_SYMBOLS]; POS_STATES_MAX],
            high: [PROB_INIT; HIGH_SYMBOLS],
        }
    }

    fn encode(&mut self, rc: &mut RangeEncoder, len: usize, pos_state: usize) {
        let symbol = (len - MATCH_LEN_MIN) as u32;
        if symbol < LOW_SYMBOLS as u32 {
            rc.encode_bit(&mut self.choice, 0);
            rc.encode_bit_tree(&mut self.low[pos_state], 3, symbol);
        } else if symbol < (LOW_SYMBOLS + MID_SYMBOLS) as u32 {
            rc.encode_bit(&mut self.choice, 1);
            rc.encode_bit(&mut self.choice2, 0);
            rc.encode_bit_tree(&mut self.mid[pos_state], 3, symbol - LOW_SYMBOLS as u32);
        } else {
            rc.encode_bit(&mut self.choice, 1);
            rc.encode_bit(&mut self.choice2, 1);
            rc.encode_bit_tree(
                &mut self.high,
                8,
                symbol - (LOW_SYMBOLS + MID_SYMBOLS) as u32,
            );
        }
    }
}

/// Every adaptive probability of one LZMA coder.
#[derive(Debug, Clone)]
struct Probabilities {
    is_match: [[u16; POS_STATES_MAX]; STATES],
    is_rep: [u16; STATES],
    is_rep0: [u16; STATES],
    is_rep1: [u16; STATES],
    is_rep2: [u16; STATES],
    is_rep0_long: [[u16; POS_STATES_MAX]; STATES],
    literal: Vec<[u16; LITERAL_CODER_SIZE]>,
    dist_slots: [[u16; DIST_SLOTS]; DIST_STATES],
    dist_special: [[u16; DIST_SPECIAL_MAX]; DIST_MODEL_END - DIST_MODEL_START],
    dist_align: [u16; ALIGN_SIZE],
    match_len: LengthEncoder,
    rep_len: LengthEncoder,
}

impl Probabilities {
    fn new(literal_coders: usize) -> Self {
        Self {
            is_match: [[PROB_INIT; POS_STATES_MAX]; STATES],
            is_rep: [PROB_INIT; STATES],
            is_rep0: [PROB_INIT; STATES],
            is_rep1: [PROB_INIT; STATES],
            is_rep2: [PROB_INIT; STATES],
            is_rep0_long: [[PROB_INIT; POS_STATES_MAX]; STATES],
            literal: vec![[PROB_INIT; LITERAL_CODER_SIZE]; literal_coders],
            dist_slots: [[PROB_INIT; DIST_SLOTS]; DIST_STATES],
            dist_special: [[PROB_INIT; DIST_SPECIAL_MAX]; DIST_MODEL_END - DIST_MODEL_START],
            dist_align: [PROB_INIT; ALIGN_SIZE],
            match_len: LengthEncoder::new(),
            rep_len: LengthEncoder::new(),
        }
    }

    fn reset(&mut self) {
        let mut literal = std::mem::take(&mut self.literal);
        literal.iter_mut().for_each(|coder| coder.fill(PROB_INIT));
        *self = Self {
            literal,
            ..Self::new(0)
        };
    }
}

/// What the parser decided to emit at the current position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Symbol {
    Literal,
    Rep { index: usize, len: usize },
    Match { distance: usize, len: usize },
}

/// LZMA encoder driven one LZMA2 chunk at a time.
///
/// Parsing is greedy in [`Mode::Fast`] and one-step lazy in [`Mode::Normal`];
/// there is no price optimisation.
#[derive(Debug)]
pub struct LzmaEncoder {
    window: LzWindow,
    rc: RangeEncoder,
    probs: Box<Probabilities>,
    state: State,
    reps: [u32; REPS],
    lc: u32,
    lp_mask: u64,
    pos_mask: u64,
    props: u8,
    lazy: bool,
    nice_len: usize,
    uncompressed_size: usize,
}

fn dist_slot(dist: u32) -> u32 {
    if dist < DIST_MODEL_START as u32 {
        return dist;
    }
    let top = 31 - dist.leading_zeros();
    (top << 1) | ((dist >> (top - 1)) & 1)
}

impl LzmaEncoder {
    /// Creates an encoder whose window is allocated outside any shared pool.
    pub fn new(options: &Lzma2Options) -> Result<Self> {
        Self::with_pool(options, &BufferPool::new(1))
    }

    /// Creates an encoder whose window buffer is taken from `pool`.
    pub fn with_pool(options: &Lzma2Options, pool: &BufferPool) -> Result<Self> {
        let dict_size = options.dict_size() as usize;
        let nice_len = options.nice_len() as usize;
        let window = LzWindow::new(
            dict_size,
            nice_len,
            options.effective_depth_limit() as usize,
            pool,
        )?;

        Ok(Self {
            window,
            rc: RangeEncoder::new(),
            probs: Box::new(Probabilities::new(1 << (options.lc() + options.lp()))),
            state: State::default(),
            reps: [0; REPS],
            lc: options.lc(),
            lp_mask: (1u64 << options.lp()) - 1,
            pos_mask: (1u64 << options.pb()) - 1,
            props: options.props_byte(),
            lazy: options.mode() == Mode::Normal,
            nice_len,
            uncompressed_size: 0,
        })
    }

    /// Approximate heap footprint of one encoder with `options`.
    pub fn memory_usage(options: &Lzma2Options) -> usize {
        let literal_coders = 1usize << (options.lc() + options.lp());
        LzWindow::memory_usage(options.dict_size() as usize)
            + literal_coders * LITERAL_CODER_SIZE * 2
            + std::mem::size_of::<Probabilities>()
            + (1 << 16)
    }

    fn choose_symbol(&mut self, avail: usize) -> Symbol {
        let history = self.window.history();
        let mut best_rep = (0usize, 0usize);
        for (index, &rep) in self.reps.iter().enumerate() {
            let distance = rep as usize + 1;
            if distance > history {
                continue;
            }
            let len = self.window.match_len_at(distance, avail);
            if len > best_rep.1 {
                best_rep = (index, len);
                if len >= self.nice_len {
                    break;
                }
            }
        }

        if best_rep.1 >= self.nice_len {
            return Symbol::Rep {
                index: best_rep.0,
                len: best_rep.1,
            };
        }

        let main = self.window.find_match(0, avail);
        if best_rep.1 >= MATCH_LEN_MIN && best_rep.1 + 1 >= main.len {
            return Symbol::Rep {
                index: best_rep.0,
                len: best_rep.1,
            };
        }

        let Match { len, distance } = main;
        if len < 3 || (len == 3 && distance > 0x4000) {
            return Symbol::Literal;
        }

        if self.lazy && len < self.nice_len && avail > 1 {
            let next = self.window.find_match(1, avail - 1);
            if next.len > len + 1 || (next.len == len + 1 && next.distance < distance / 2) {
                return Symbol::Literal;
            }
        }

        Symbol::Match { distance, len }
    }

    fn encode_literal(&mut self) {
        let position = self.window.position();
        let pos_state = (position & self.pos_mask) as usize;
        let state = self.state.index();
        self.rc
            .encode_bit(&mut self.probs.is_match[state][pos_state], 0);

        let prev = if self.window.history() > 0 {
            u32::from(self.window.byte_back(1))
        } else {
            0
        };
        let coder =
            (((position & self.lp_mask) as usize) << self.lc) + (prev >> (8 - self.lc)) as usize;
        let byte = u32::from(self.window.current_byte());
        let probs = &mut self.probs.literal[coder];

        if self.state.is_literal() {
            self.rc.encode_bit_tree(probs, 8, byte);
        } else {
            let mut match_byte = u32::from(self.window.byte_back(self.reps[0] as usize + 1));
            let mut symbol = byte | 0x100;
            let mut offset = 0x100u32;
            while symbol < 0x10000 {
                match_byte <<= 1;
                let match_bit = match_byte & offset;
                let index = (offset + match_bit + (symbol >> 8)) as usize;
                let bit = (symbol >> 7) & 1;
                self.rc.encode_bit(&mut probs[index], bit);
                symbol <<= 1;
                offset &= !(match_byte ^ symbol);
            }
        }

        self.state.update_literal();
    }

    fn encode_match(&mut self, distance: usize, len: usize) {
        let pos_state = (self.window.position() & self.pos_mask) as usize;
        let state = self.state.index();
        self.rc
            .encode_bit(&mut self.probs.is_match[state][pos_state], 1);
        self.rc.encode_bit(&mut self.probs.is_rep[state], 0);
        self.probs.match_len.encode(&mut self.rc, len, pos_state);

        let dist = (distance - 1) as u32;
        let slot = dist_slot(dist);
        let dist_state = (len - MATCH_LEN_MIN).min(DIST_STATES - 1);
        self.rc
            .encode_bit_tree(&mut self.probs.dist_slots[dist_state], 6, slot);

        if slot >= DIST_MODEL_START as u32 {
            let footer_bits = (slot >> 1) - 1;
            let base = (2 | (slot & 1)) << footer_bits;
            let reduced = dist - base;
            if slot < DIST_MODEL_END as u32 {
                self.rc.encode_reverse_bit_tree(
                    &mut self.probs.dist_special[slot as usize - DIST_MODEL_START],
                    footer_bits,
                    reduced,
                );
            } else {
                self.rc
                    .encode_direct_bits(reduced >> ALIGN_BITS, footer_bits - ALIGN_BITS);
                self.rc.encode_reverse_bit_tree(
                    &mut self.probs.dist_align,
                    ALIGN_BITS,
                    reduced & (ALIGN_SIZE as u32 - 1),
                );
            }
        }

        self.reps = [dist, self.reps[0], self.reps[1], self.reps[2]];
        self.state.update_match();
    }

    fn encode_rep(&mut self, index: usize, len: usize) {
        let pos_state = (self.window.position() & self.pos_mask) as usize;
        let state = self.state.index();
        self.rc
            .encode_bit(&mut self.probs.is_match[state][pos_state], 1);
        self.rc.encode_bit(&mut self.probs.is_rep[state], 1);

        if index == 0 {
            self.rc.encode_bit(&mut self.probs.is_rep0[state], 0);
            let long = u32::from(len != 1);
            self.rc
                .encode_bit(&mut self.probs.is_rep0_long[state][pos_state], long);
        } else {
            let dist = self.reps[index];
            self.rc.encode_bit(&mut self.probs.is_rep0[state], 1);
            if index == 1 {
                self.rc.encode_bit(&mut self.probs.is_rep1[state], 0);
            } else {
                self.rc.encode_bit(&mut self.probs.is_rep1[state], 1);
                self.rc
                    .encode_bit(&mut self.probs.is_rep2[state], (index - 2) as u32);
                if index == 3 {
                    self.reps[3] = self.reps[2];
                }
                self.reps[2] = self.reps[1];
            }
            self.reps[1] = self.reps[0];
            self.reps[0] = dist;
        }

        if len == 1 {
            self.state.update_short_rep();
        } else {
            self.probs.rep_len.encode(&mut self.rc, len, pos_state);
            self.state.update_long_rep();
        }
    }

    /// Encodes one symbol; false when the window needs more input first.
    fn encode_symbol(&mut self) -> bool {
        let avail = self.window.available();
        if avail == 0 {
            return false;
        }

        let len = match self.choose_symbol(avail) {
            Symbol::Literal => {
                self.encode_literal();
                1
            }
            Symbol::Rep { index, len } => {
                self.encode_rep(index, len);
                len
            }
            Symbol::Match { distance, len } => {
                self.encode_match(distance, len);
                len
            }
        };

        self.window.advance(len);
        self.uncompressed_size += len;
        true
    }
}

impl BlockEncoder for LzmaEncoder {
    fn props_byte(&self) -> u8 {
        self.props
    }

    fn restart(&mut self, position: u64) {
        self.window.restart(position);
        self.rc.reset();
        self.reset();
        self.uncompressed_size = 0;
    }

    fn set_preset_dict(&mut self, dict: &[u8]) {
        self.window.preload(dict);
    }

    fn fill_window(&mut self, input: &[u8]) -> usize {
        self.window.fill(input)
    }

    fn set_flushing(&mut self) {
        self.window.set_flushing();
    }

    fn set_finishing(&mut self) {
        self.window.set_finishing();
    }

    fn encode_for_lzma2(&mut self) -> bool {
        while self.uncompressed_size <= UNCOMPRESSED_LIMIT
            && self.rc.pending_size() <= COMPRESSED_LIMIT
        {
            if !self.encode_symbol() {
                return false;
            }
        }
        true
    }

    fn uncompressed_size(&self) -> usize {
        self.uncompressed_size
    }

    fn reset_uncompressed_size(&mut self) {
        self.uncompressed_size = 0;
    }

    fn reset(&mut self) {
        self.state = State::default();
        self.reps = [0; REPS];
        self.probs.reset();
    }

    fn finish_range_coder(&mut self) -> Option<&[u8]> {
        Some(self.rc.finish())
    }

    fn reset_range_coder(&mut self) {
        self.rc.reset();
    }

    fn uncompressed_tail(&self, len: usize) -> &[u8] {
        self.window.tail(len)
    }
}
