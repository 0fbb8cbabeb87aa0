//! Device-bound parallel reading
//!
//! A [`ReadChannelController`] owns a fixed pool of reader threads which pick
//! requests off one unbuffered channel. Whoever submits a request gets a
//! [`ChannelReader`] back and pulls the data with [`ChannelReader::write_to`].
//!
//! The buffer travels by value: the consumer hands it to the reader thread on
//! the `ready` channel, the reader fills it and sends it back as a
//! [`ReadChunk`]. Only one side owns the buffer at any time, so it is never
//! overwritten while the consumer still looks at it, and nothing is copied.

use crate::cancel::CancelToken;
use crate::error::{Result, SealError};
use crate::stats::{self, Stats};
use crate::types::FileMode;
use crate::utils;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tracing::{debug, trace};

/// Where a request reads from
pub enum ReadSource {
    /// A path to open, or to read the link target of
    Path {
        /// Path to read
        path: PathBuf,
        /// Kind of entry at `path`
        mode: FileMode,
    },
    /// An already opened reader
    Reader(Box<dyn Read + Send>),
}

/// How a chunk ends the exchange, if at all
#[derive(Debug)]
pub enum ChunkStatus {
    /// More chunks follow
    More,
    /// This was the last chunk
    Eof,
    /// Reading failed, this is the last chunk
    Failed(SealError),
}

/// One buffer's worth of data, handed from a reader thread to the consumer
#[derive(Debug)]
pub struct ReadChunk {
    /// The consumer's buffer, valid up to `n`
    pub buf: Vec<u8>,
    /// Amount of valid bytes
    pub n: usize,
    /// Whether more is to come
    pub status: ChunkStatus,
}

struct ReadRequest {
    source: ReadSource,
    ready: Receiver<Vec<u8>>,
    results: Sender<ReadChunk>,
}

/// A pool of reader threads serving one device
#[derive(Clone)]
pub struct ReadChannelController {
    requests: Sender<ReadRequest>,
    streams: usize,
}

impl ReadChannelController {
    /// Start `nprocs` reader threads.
    ///
    /// Threads stop once the controller and all its clones are dropped.
    pub fn new(nprocs: usize, stats: Arc<Stats>, cancel: CancelToken) -> Result<Self> {
        if nprocs < 1 {
            return Err(SealError::config("a read controller needs at least one stream"));
        }

        let (tx, rx) = bounded::<ReadRequest>(0);
        for i in 0..nprocs {
            let rx = rx.clone();
            let stats = Arc::clone(&stats);
            let cancel = cancel.clone();
            thread::Builder::new()
                .name(format!("bitseal-reader-{}", i))
                .spawn(move || {
                    for request in rx.iter() {
                        stats::inc(&stats.files_being_read);
                        serve(request, &stats, &cancel);
                        stats::dec(&stats.files_being_read);
                        stats::inc(&stats.total_files_read);
                    }
                })?;
        }
        debug!(streams = nprocs, "started read controller");

        Ok(Self {
            requests: tx,
            streams: nprocs,
        })
    }

    /// Amount of reads this controller performs in parallel
    pub fn streams(&self) -> usize {
        self.streams
    }

    /// Queue a read of `path`. Blocks until a reader thread accepts it
    pub fn reader_from_path(&self, path: PathBuf, mode: FileMode) -> Result<ChannelReader> {
        self.submit(ReadSource::Path { path, mode })
    }

    /// Queue a read from an open reader. Blocks until a reader thread accepts it
    pub fn reader_from_reader(&self, reader: Box<dyn Read + Send>) -> Result<ChannelReader> {
        self.submit(ReadSource::Reader(reader))
    }

    fn submit(&self, source: ReadSource) -> Result<ChannelReader> {
        let (ready_tx, ready_rx) = bounded(0);
        let (results_tx, results_rx) = bounded(0);
        self.requests
            .send(ReadRequest {
                source,
                ready: ready_rx,
                results: results_tx,
            })
            .map_err(|_| SealError::internal("read controller has shut down"))?;
        Ok(ChannelReader {
            ready: ready_tx,
            results: results_rx,
        })
    }
}

/// The consumer's end of one queued read
pub struct ChannelReader {
    ready: Sender<Vec<u8>>,
    results: Receiver<ReadChunk>,
}

impl ChannelReader {
    /// Stream everything into `sink`, using `buf` as transfer buffer.
    ///
    /// `buf` is handed to the reader thread and put back when the exchange
    /// ends. An empty `buf` is replaced with one of [`BUF_SIZE`](super::BUF_SIZE)
    /// bytes, as reading into it would look like the end of the file. Every
    /// chunk causes one write, including the final empty one, so empty files
    /// still see a write call.
    pub fn write_to<W: Write + ?Sized>(self, sink: &mut W, buf: &mut Vec<u8>) -> Result<u64> {
        let mut written = 0u64;
        let mut next = std::mem::take(buf);
        if next.is_empty() {
            next = vec![0; super::BUF_SIZE];
        }

        loop {
            if self.ready.send(next).is_err() {
                *buf = vec![0; super::BUF_SIZE];
                return Err(SealError::internal("reader thread vanished"));
            }
            let chunk = match self.results.recv() {
                Ok(chunk) => chunk,
                Err(_) => {
                    *buf = vec![0; super::BUF_SIZE];
                    return Err(SealError::internal("reader thread vanished"));
                }
            };

            let data = &chunk.buf[..chunk.n];
            let res = if data.is_empty() {
                sink.write(data).map(|_| ())
            } else {
                sink.write_all(data)
            };
            written += chunk.n as u64;

            match (res, chunk.status) {
                (Err(e), _) => {
                    *buf = chunk.buf;
                    return Err(SealError::Io(e));
                }
                (Ok(()), ChunkStatus::More) => next = chunk.buf,
                (Ok(()), ChunkStatus::Eof) => {
                    *buf = chunk.buf;
                    return Ok(written);
                }
                (Ok(()), ChunkStatus::Failed(err)) => {
                    *buf = chunk.buf;
                    return Err(err);
                }
            }
        }
    }
}

/// Handle one request on a reader thread.
///
/// The consumer always sends a buffer before it expects a chunk. If it goes
/// away instead, the request is abandoned.
fn serve(request: ReadRequest, stats: &Stats, cancel: &CancelToken) {
    let ReadRequest {
        source,
        ready,
        results,
    } = request;

    let fail = |err: SealError| {
        if let Ok(buf) = ready.recv() {
            let _ = results.send(ReadChunk {
                buf,
                n: 0,
                status: ChunkStatus::Failed(err),
            });
        }
    };

    let (mut reader, path): (Box<dyn Read + Send>, Option<PathBuf>) = match source {
        ReadSource::Path {
            path,
            mode: FileMode::Symlink,
        } => {
            match fs::read_link(&path) {
                Ok(target) => {
                    let Ok(mut buf) = ready.recv() else { return };
                    let target = utils::path_to_bytes(&target);
                    if buf.len() < target.len() {
                        buf.resize(target.len(), 0);
                    }
                    buf[..target.len()].copy_from_slice(&target);
                    stats::add_bytes(&stats.bytes_read, target.len());
                    let _ = results.send(ReadChunk {
                        buf,
                        n: target.len(),
                        status: ChunkStatus::Eof,
                    });
                }
                Err(e) => fail(SealError::io_at(&path, e)),
            }
            return;
        }
        ReadSource::Path { path, .. } => match File::open(&path) {
            Ok(file) => (Box::new(file), Some(path)),
            Err(e) => return fail(SealError::io_at(&path, e)),
        },
        ReadSource::Reader(reader) => (reader, None),
    };

    loop {
        let Ok(mut buf) = ready.recv() else {
            trace!(path = ?path, "consumer left before the read finished");
            return;
        };

        if cancel.is_cancelled() {
            let _ = results.send(ReadChunk {
                buf,
                n: 0,
                status: ChunkStatus::Failed(SealError::Cancelled { path }),
            });
            return;
        }

        let (n, status) = match read_some(&mut reader, &mut buf) {
            Ok(0) => (0, ChunkStatus::Eof),
            Ok(n) => (n, ChunkStatus::More),
            Err(e) => {
                let err = match &path {
                    Some(p) => SealError::io_at(p, e),
                    None => SealError::Io(e),
                };
                (0, ChunkStatus::Failed(err))
            }
        };
        stats::add_bytes(&stats.bytes_read, n);

        let done = !matches!(status, ChunkStatus::More);
        if results.send(ReadChunk { buf, n, status }).is_err() || done {
            return;
        }
    }
}

fn read_some(reader: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match reader.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// A read controller together with the trees it serves
#[derive(Clone)]
pub struct RootedReadController {
    /// Trees on the controller's device
    pub trees: Vec<PathBuf>,
    /// The controller shared by all of them
    pub ctrl: ReadChannelController,
}

/// Create one read controller per device spanned by `trees`
pub fn device_read_controllers(
    nprocs: usize,
    trees: &[PathBuf],
    stats: &Arc<Stats>,
    cancel: &CancelToken,
) -> Result<Vec<RootedReadController>> {
    utils::device_map(trees)
        .into_iter()
        .map(|trees| {
            Ok(RootedReadController {
                trees,
                ctrl: ReadChannelController::new(nprocs, Arc::clone(stats), cancel.clone())?,
            })
        })
        .collect()
}
