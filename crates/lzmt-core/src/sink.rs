use std::fs::File;
use std::io::{self, BufWriter, Cursor, Write};
use std::sync::{Arc, Mutex};

use crate::sync::lock_unpoisoned;

/// Destination for a compressed stream.
///
/// On top of `Write`, a sink can be told that the stream is complete
/// (`finish`) separately from being released (`close`). Writers call
/// `finish` exactly once after the end marker and `close` at most once.
pub trait Lzma2Sink: Write {
    /// Completes the stream without releasing the underlying resource.
    fn finish(&mut self) -> io::Result<()> {
        self.flush()
    }

    /// Releases the underlying resource.
    fn close(&mut self) -> io::Result<()> {
        self.flush()
    }
}

impl Lzma2Sink for Vec<u8> {}
impl Lzma2Sink for io::Sink {}
impl Lzma2Sink for Cursor<Vec<u8>> {}
impl Lzma2Sink for Cursor<&mut Vec<u8>> {}

impl Lzma2Sink for File {
    fn close(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

impl<W: Write> Lzma2Sink for BufWriter<W> {}

impl<S: Lzma2Sink + ?Sized> Lzma2Sink for &mut S {
    fn finish(&mut self) -> io::Result<()> {
        (**self).finish()
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

impl<S: Lzma2Sink + ?Sized> Lzma2Sink for Box<S> {
    fn finish(&mut self) -> io::Result<()> {
        (**self).finish()
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

/// Adapts any `Write` into a sink whose finish and close are plain flushes.
#[derive(Debug, Default)]
pub struct PlainSink<W>(pub W);

impl<W: Write> Write for PlainSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<W: Write> Lzma2Sink for PlainSink<W> {}

impl<W> PlainSink<W> {
    pub fn into_inner(self) -> W {
        self.0
    }
}

/// Discards the stream and counts its bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct CountingSink {
    count: u64,
}

impl CountingSink {
    pub fn count(&self) -> u64 {
        self.count
    }
}

impl Write for CountingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.count += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Lzma2Sink for CountingSink {}

#[derive(Debug, Default)]
struct SharedState {
    bytes: Vec<u8>,
    finished: usize,
    closed: usize,
}

/// An in-memory sink that can be read while a writer owns a clone of it.
///
/// Parallel writers move their sink onto worker threads; keeping a second
/// handle is the simplest way to look at the output afterwards.
#[derive(Debug, Default, Clone)]
pub struct SharedSink {
    state: Arc<Mutex<SharedState>>,
}

impl SharedSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything written so far.
    pub fn contents(&self) -> Vec<u8> {
        lock_unpoisoned(&self.state).bytes.clone()
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.state).bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of times `finish` was called.
    pub fn finish_count(&self) -> usize {
        lock_unpoisoned(&self.state).finished
    }

    /// Number of times `close` was called.
    pub fn close_count(&self) -> usize {
        lock_unpoisoned(&self.state).closed
    }
}

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock_unpoisoned(&self.state).bytes.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Lzma2Sink for SharedSink {
    fn finish(&mut self) -> io::Result<()> {
        lock_unpoisoned(&self.state).finished += 1;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        lock_unpoisoned(&self.state).closed += 1;
        Ok(())
    }
}
