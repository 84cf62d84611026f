use serde::{Deserialize, Serialize};

use crate::error::Lzma2Error;

pub type Result<T> = std::result::Result<T, Lzma2Error>;

/// Running totals for one compressed stream.
///
/// Both writers keep one of these; the CLI prints it as the run summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStats {
    /// Bytes accepted from the caller.
    pub uncompressed_bytes: u64,
    /// Bytes handed to the sink, chunk headers and the end marker included.
    pub compressed_bytes: u64,
    /// LZMA chunks emitted.
    pub lzma_chunks: u64,
    /// Uncompressed chunks emitted.
    pub raw_chunks: u64,
    /// Parallel blocks flushed (zero for the sequential writer).
    pub blocks: u64,
}

impl StreamStats {
    /// Compressed size as a fraction of the input, or 0.0 for empty input.
    pub fn ratio(&self) -> f64 {
        if self.uncompressed_bytes == 0 {
            0.0
        } else {
            self.compressed_bytes as f64 / self.uncompressed_bytes as f64
        }
    }

    pub(crate) fn absorb(&mut self, other: &StreamStats) {
        self.uncompressed_bytes += other.uncompressed_bytes;
        self.compressed_bytes += other.compressed_bytes;
        self.lzma_chunks += other.lzma_chunks;
        self.raw_chunks += other.raw_chunks;
        self.blocks += other.blocks;
    }
}
