use crate::buffer::{BufferPool, PooledBuffer};
use crate::chunk::{ChunkEncoder, ResetState};
use crate::lzma::{BlockEncoder, COMPRESSED_SIZE_MAX, new_block_encoder};
use crate::options::Lzma2Options;
use crate::parallel::BlockHistory;
use crate::{Result, StreamStats};

/// Where one block sits in its stream and what it should be compressed with.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BlockPlan<'a> {
    pub id: u64,
    pub kind: BlockHistory,
    /// Absolute position of the first payload byte, preset dictionary included.
    pub position: u64,
    /// Tail of the previous block, empty for the first block and for cold blocks.
    pub history: &'a [u8],
    pub payload: &'a [u8],
    pub preset: &'a [u8],
}

/// One block's worth of compression state.
///
/// A task owns its encoder and both buffers for its whole life; the
/// coordinator hands the same task to consecutive blocks, so the buffers are
/// allocated once per slot rather than once per block.
pub(crate) struct BlockTask {
    chunks: ChunkEncoder<Box<dyn BlockEncoder>>,
    input: PooledBuffer,
    output: PooledBuffer,
    id: u64,
    kind: BlockHistory,
    position: u64,
    history_len: usize,
    primed: bool,
    stats: StreamStats,
}

/// Upper bound on the framed size of `len` input bytes.
pub(crate) fn output_capacity(len: usize) -> usize {
    len + (len / COMPRESSED_SIZE_MAX + 1) * 6 + 1
}

/// Bytes a task's input buffer needs for blocks of `kind`.
pub(crate) fn input_capacity(kind: BlockHistory, dict_size: usize, block_size: usize) -> usize {
    match kind {
        BlockHistory::Carried => dict_size + block_size,
        BlockHistory::Cold | BlockHistory::Loaded => block_size,
    }
}

impl BlockTask {
    pub fn new(
        options: &Lzma2Options,
        kind: BlockHistory,
        block_size: usize,
        pool: &BufferPool,
    ) -> Result<Self> {
        let input = pool.acquire(input_capacity(kind, options.dict_size() as usize, block_size))?;
        let output = pool.acquire(output_capacity(block_size))?;
        let encoder = new_block_encoder(options, pool)?;
        Ok(Self {
            chunks: ChunkEncoder::new(encoder),
            input,
            output,
            id: 0,
            kind,
            position: 0,
            history_len: 0,
            primed: false,
            stats: StreamStats::default(),
        })
    }

    /// Copies the block into the task so the writer can reuse its buffer.
    ///
    /// Loaded history goes straight into the encoder's window here, on the
    /// submitting thread. Carried history stays in front of the payload and
    /// priming is left to [`compress`].
    ///
    /// [`compress`]: BlockTask::compress
    pub fn load(&mut self, plan: &BlockPlan<'_>) {
        self.id = plan.id;
        self.kind = plan.kind;
        self.position = plan.position;
        self.output.clear();
        self.input.clear();
        self.stats = StreamStats::default();

        self.history_len = if plan.kind == BlockHistory::Carried {
            self.input.extend_from_slice(plan.history);
            plan.history.len()
        } else {
            0
        };
        self.input.extend_from_slice(plan.payload);

        self.primed = plan.kind == BlockHistory::Loaded;
        if self.primed {
            self.prime(plan.history, plan.preset);
        }
    }

    fn prime(&mut self, history: &[u8], preset: &[u8]) {
        prime(&mut self.chunks, self.id, self.kind, self.position, history, preset);
    }

    /// Compresses the payload into the task's output buffer.
    ///
    /// `checkpoint` runs before every chunk is written; an error from it
    /// abandons the block. The output never carries the end marker.
    pub fn compress<C>(&mut self, preset: &[u8], mut checkpoint: C) -> Result<()>
    where
        C: FnMut() -> Result<()>,
    {
        checkpoint()?;
        if !self.primed {
            let history = &self.input[..self.history_len];
            prime(&mut self.chunks, self.id, self.kind, self.position, history, preset);
            self.primed = true;
        }

        let payload = &self.input[self.history_len..];
        let output = self.output.as_mut_vec();
        self.chunks.write(payload, output, &mut checkpoint)?;
        self.chunks.finish(output, &mut checkpoint)?;

        self.stats = self.chunks.take_stats();
        self.stats.blocks = 1;
        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn payload_len(&self) -> usize {
        self.input.len() - self.history_len
    }

    /// Framed chunks produced by the last [`compress`](BlockTask::compress).
    pub fn output(&self) -> &[u8] {
        self.output.as_slice()
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }
}

/// Restarts `chunks` for a block. The first block carries the preset
/// dictionary; later blocks either start cold or continue from `history`.
fn prime(
    chunks: &mut ChunkEncoder<Box<dyn BlockEncoder>>,
    id: u64,
    kind: BlockHistory,
    position: u64,
    history: &[u8],
    preset: &[u8],
) {
    if id == 0 {
        let state = if preset.is_empty() {
            ResetState::DictReset
        } else {
            ResetState::PropReset
        };
        chunks.begin(0, state, preset);
        return;
    }

    match kind {
        BlockHistory::Loaded | BlockHistory::Carried => {
            // Earlier blocks may have been all raw chunks, in which case the
            // decoder has never seen a properties byte.
            chunks.begin(position - history.len() as u64, ResetState::PropReset, history);
        }
        BlockHistory::Cold => chunks.begin(0, ResetState::DictReset, &[]),
    }
}

impl std::fmt::Debug for BlockTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockTask")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("payload_len", &self.payload_len())
            .field("output_len", &self.output.len())
            .finish()
    }
}
