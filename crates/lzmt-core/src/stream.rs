use std::io::{self, Write};

use crate::buffer::BufferPool;
use crate::chunk::{ChunkEncoder, END_MARKER, ResetState};
use crate::lzma::{BlockEncoder, new_block_encoder};
use crate::options::Lzma2Options;
use crate::sink::Lzma2Sink;
use crate::telemetry;
use crate::telemetry::tags;
use crate::{Lzma2Error, Result, StreamStats};

type Chunks = ChunkEncoder<Box<dyn BlockEncoder>>;

/// Single-threaded LZMA2 writer.
///
/// Bytes written are compressed on the calling thread and framed into chunks
/// as soon as the encoder fills one. The stream ends with [`finish`], which
/// writes the end marker, or [`close`], which also closes the sink.
///
/// Any error from `write_bytes`, `flush` or `finish` closes the writer before
/// it is returned; the writer is unusable afterwards.
///
/// [`finish`]: Lzma2Writer::finish
/// [`close`]: Lzma2Writer::close
pub struct Lzma2Writer<W: Lzma2Sink> {
    sink: Option<W>,
    chunks: Option<Chunks>,
    stats: StreamStats,
    finished: bool,
    closed: bool,
}

impl<W: Lzma2Sink> Lzma2Writer<W> {
    pub fn new(sink: W, options: &Lzma2Options) -> Result<Self> {
        Self::with_pool(sink, options, &BufferPool::new(2))
    }

    /// Creates a writer whose encoder buffers come from `pool`.
    pub fn with_pool(sink: W, options: &Lzma2Options, pool: &BufferPool) -> Result<Self> {
        let mut chunks = ChunkEncoder::new(new_block_encoder(options, pool)?);
        let preset = options.effective_preset_dict();
        let state = if preset.is_empty() {
            ResetState::DictReset
        } else {
            ResetState::PropReset
        };
        chunks.begin(0, state, preset);

        telemetry::increment_counter(tags::METRIC_STREAM_OPEN_COUNT, 1);
        tracing::debug!(
            target: tags::LOG_STREAM,
            options = %options,
            preset_dict = preset.len(),
            "sequential stream opened"
        );

        Ok(Self {
            sink: Some(sink),
            chunks: Some(chunks),
            stats: StreamStats::default(),
            finished: false,
            closed: false,
        })
    }

    /// Compresses `data`, writing every chunk that completes along the way.
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        let result = self.write_inner(data);
        self.settle(result)
    }

    /// Writes all buffered input as chunks and flushes the sink.
    ///
    /// The stream stays open; a flush costs compression ratio because the
    /// encoder loses its lookahead at the flush point.
    pub fn flush(&mut self) -> Result<()> {
        let result = self.flush_inner();
        self.settle(result)
    }

    /// Writes the remaining chunks and the end marker, then finishes the sink.
    ///
    /// Calling `finish` again is a no-op.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        let result = self.finish_inner();
        self.settle(result)
    }

    /// Finishes the stream if needed and closes the sink.
    ///
    /// Safe to call any number of times, including after a failure.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let finished = self.finish();
        if self.closed {
            return finished;
        }
        let released = self.release();
        finished.and(released)
    }

    /// Finishes the stream and hands back the sink without closing it.
    pub fn finish_into_inner(mut self) -> Result<W> {
        self.finish()?;
        self.collect_stats();
        self.chunks = None;
        self.closed = true;
        self.sink
            .take()
            .ok_or(Lzma2Error::IllegalState("stream closed"))
    }

    /// Totals so far; compressed bytes include the end marker once written.
    pub fn stats(&self) -> StreamStats {
        let mut stats = self.stats;
        if let Some(chunks) = &self.chunks {
            stats.absorb(chunks.stats());
        }
        stats
    }

    pub fn get_ref(&self) -> Option<&W> {
        self.sink.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn parts(&mut self) -> Result<(&mut Chunks, &mut W)> {
        if self.finished {
            return Err(Lzma2Error::IllegalState("stream already finished"));
        }
        match (self.chunks.as_mut(), self.sink.as_mut()) {
            (Some(chunks), Some(sink)) => Ok((chunks, sink)),
            _ => Err(Lzma2Error::IllegalState("stream closed")),
        }
    }

    fn write_inner(&mut self, data: &[u8]) -> Result<()> {
        let (chunks, sink) = self.parts()?;
        chunks.write(data, sink, || Ok(()))
    }

    fn flush_inner(&mut self) -> Result<()> {
        let (chunks, sink) = self.parts()?;
        chunks.flush(sink, || Ok(()))?;
        sink.flush()?;
        Ok(())
    }

    fn finish_inner(&mut self) -> Result<()> {
        let (chunks, sink) = self.parts()?;
        chunks.finish(sink, || Ok(()))?;
        sink.write_all(&[END_MARKER])?;
        sink.finish()?;
        self.stats.compressed_bytes += 1;
        self.finished = true;

        telemetry::increment_counter(tags::METRIC_STREAM_FINISH_COUNT, 1);
        let stats = self.stats();
        tracing::debug!(
            target: tags::LOG_STREAM,
            uncompressed = stats.uncompressed_bytes,
            compressed = stats.compressed_bytes,
            lzma_chunks = stats.lzma_chunks,
            raw_chunks = stats.raw_chunks,
            "sequential stream finished"
        );
        Ok(())
    }

    /// Closes the writer when `result` is an error, keeping the original error.
    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if !self.closed {
                telemetry::increment_counter(tags::METRIC_STREAM_ABORT_COUNT, 1);
                tracing::debug!(target: tags::LOG_STREAM, error = %err, "closing stream after failure");
                if let Err(secondary) = self.release() {
                    tracing::trace!(target: tags::LOG_STREAM, error = %secondary, "close after failure also failed");
                }
            }
        }
        result
    }

    fn collect_stats(&mut self) {
        if let Some(chunks) = self.chunks.as_mut() {
            let stats = chunks.take_stats();
            self.stats.absorb(&stats);
        }
    }

    /// Drops the encoder and closes the sink, once.
    fn release(&mut self) -> Result<()> {
        self.closed = true;
        self.finished = true;
        self.collect_stats();
        self.chunks = None;
        if let Some(sink) = self.sink.as_mut() {
            sink.close()?;
        }
        Ok(())
    }
}

impl<W: Lzma2Sink> Write for Lzma2Writer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Lzma2Writer::flush(self)?;
        Ok(())
    }
}

impl<W: Lzma2Sink> Drop for Lzma2Writer<W> {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(err) = self.close() {
                tracing::debug!(target: tags::LOG_STREAM, error = %err, "close on drop failed");
            }
        }
    }
}

impl<W: Lzma2Sink> std::fmt::Debug for Lzma2Writer<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lzma2Writer")
            .field("stats", &self.stats())
            .field("finished", &self.finished)
            .field("closed", &self.closed)
            .finish()
    }
}
