//! Fan-out writers which duplicate every write into several sinks in parallel
//!
//! Hashing and copying a file means feeding the same bytes into a set of
//! writers: one per copy destination plus one per digest. The writes of one
//! call run concurrently on the rayon pool and the call returns once all of
//! them completed.

use rayon::prelude::*;
use std::io::{self, Write};

/// A sink shared with a multi writer
pub type Sink<'a> = &'a mut (dyn Write + Send);

fn forward(w: &mut (dyn Write + Send), buf: &[u8]) -> io::Result<()> {
    if buf.is_empty() {
        w.write(buf).map(|_| ())
    } else {
        w.write_all(buf)
    }
}

/// Writes to all sinks and fails with the first error encountered.
///
/// After an error the state of the sinks is undefined, as some of them may
/// have received the data while others did not.
pub struct UncheckedParallelMultiWriter<'a> {
    writers: Vec<Sink<'a>>,
}

impl<'a> UncheckedParallelMultiWriter<'a> {
    /// Create a multi writer over `writers`
    pub fn new(writers: Vec<Sink<'a>>) -> Self {
        Self { writers }
    }
}

impl Write for UncheckedParallelMultiWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writers
            .par_iter_mut()
            .map(|w| forward(&mut **w, buf))
            .collect::<io::Result<Vec<()>>>()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        for w in &mut self.writers {
            w.flush()?;
        }
        Ok(())
    }
}

struct Slot<'a> {
    writer: Option<Sink<'a>>,
    error: Option<io::Error>,
}

/// Writes to all sinks and remembers failures per sink.
///
/// A sink that failed, or an empty slot, is skipped on subsequent writes.
/// Writing itself only fails once no working sink is left.
pub struct ParallelMultiWriter<'a> {
    slots: Vec<Slot<'a>>,
}

impl<'a> ParallelMultiWriter<'a> {
    /// Create a multi writer with `n` empty slots
    pub fn with_slots(n: usize) -> Self {
        Self {
            slots: (0..n).map(|_| Slot { writer: None, error: None }).collect(),
        }
    }

    /// Put `writer` into slot `i` and clear its error
    pub fn set_writer_at(&mut self, i: usize, writer: Option<Sink<'a>>) {
        self.slots[i] = Slot { writer, error: None };
    }

    /// Consume the writer, returning the error of every slot
    pub fn into_errors(self) -> Vec<Option<io::Error>> {
        self.slots.into_iter().map(|s| s.error).collect()
    }

    fn working(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.writer.is_some() && s.error.is_none())
            .count()
    }
}

impl Write for ParallelMultiWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.slots.par_iter_mut().for_each(|slot| {
            if slot.error.is_some() {
                return;
            }
            if let Some(w) = slot.writer.as_mut() {
                if let Err(e) = forward(&mut **w, buf) {
                    slot.error = Some(e);
                }
            }
        });

        if self.working() == 0 && !self.slots.is_empty() {
            return Err(io::Error::new(io::ErrorKind::Other, "all writers failed"));
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        for slot in &mut self.slots {
            if slot.error.is_none() {
                if let Some(w) = slot.writer.as_mut() {
                    if let Err(e) = w.flush() {
                        slot.error = Some(e);
                    }
                }
            }
        }
        Ok(())
    }
}
