//! Device-bound parallel writing
//!
//! Mirrors the read side: a [`WriteChannelController`] limits the amount of
//! concurrent writes to one device, and a [`ChannelWriter`] is the
//! [`Write`] handle a gather worker uses to feed one destination.

use crate::error::{Result, SealError};
use crate::stats::{self, Stats};
use crate::types::FileMode;
use crate::utils;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tracing::debug;

/// A writer that creates its file, and the directories leading to it, on
/// first write.
///
/// Files are never overwritten: opening fails with `AlreadyExists` if the
/// destination is present. Symbolic links are created from the first write,
/// which must carry the complete link target.
#[derive(Debug, Default)]
pub struct LazyFileWriter {
    path: PathBuf,
    mode: FileMode,
    file: Option<File>,
    link_created: bool,
}

impl LazyFileWriter {
    /// A writer without destination
    pub fn new() -> Self {
        Self::default()
    }

    /// Point the writer at a new destination. Fails while a file is open
    pub fn set_path(&mut self, path: PathBuf, mode: FileMode) -> Result<()> {
        if self.file.is_some() {
            return Err(SealError::internal(format!(
                "'{}' must be closed before writing to '{}'",
                self.path.display(),
                path.display()
            )));
        }
        self.path = path;
        self.mode = mode;
        self.link_created = false;
        Ok(())
    }

    /// Current destination
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Close the open file, if any
    pub fn close(&mut self) -> io::Result<()> {
        match self.file.take() {
            Some(mut file) => file.flush(),
            None => Ok(()),
        }
    }

    fn prepare_parent(&self) -> io::Result<()> {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
            _ => Ok(()),
        }
    }
}

impl Write for LazyFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.path.as_os_str().is_empty() {
            return Err(io::Error::new(io::ErrorKind::Other, "writer has no destination"));
        }

        if self.mode == FileMode::Symlink {
            if !self.link_created {
                self.prepare_parent()?;
                utils::create_symlink(&utils::path_from_bytes(buf), &self.path)?;
                self.link_created = true;
            }
            return Ok(buf.len());
        }

        if self.file.is_none() {
            self.prepare_parent()?;
            let file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)?;
            self.file = Some(file);
        }

        match self.file.as_mut() {
            Some(file) => file.write(buf),
            None => Err(io::Error::new(io::ErrorKind::Other, "file vanished")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

struct WriteRequest {
    writer: LazyFileWriter,
    data: Vec<u8>,
    reply: Sender<WriteReply>,
}

struct WriteReply {
    writer: LazyFileWriter,
    data: Vec<u8>,
    result: io::Result<()>,
}

/// A pool of writer threads serving one device
#[derive(Clone)]
pub struct WriteChannelController {
    requests: Sender<WriteRequest>,
    streams: usize,
    stats: Arc<Stats>,
}

impl WriteChannelController {
    /// Start `nprocs` writer threads.
    ///
    /// Threads stop once the controller, its clones and all writers created
    /// from it are dropped.
    pub fn new(nprocs: usize, stats: Arc<Stats>) -> Result<Self> {
        if nprocs < 1 {
            return Err(SealError::config("a write controller needs at least one stream"));
        }

        let (tx, rx) = bounded::<WriteRequest>(0);
        for i in 0..nprocs {
            let rx = rx.clone();
            let stats = Arc::clone(&stats);
            thread::Builder::new()
                .name(format!("bitseal-writer-{}", i))
                .spawn(move || {
                    for WriteRequest { mut writer, data, reply } in rx.iter() {
                        let result = if data.is_empty() {
                            writer.write(&data).map(|_| ())
                        } else {
                            writer.write_all(&data)
                        };
                        if result.is_ok() {
                            stats::add_bytes(&stats.bytes_written, data.len());
                        }
                        let _ = reply.send(WriteReply { writer, data, result });
                    }
                })?;
        }
        debug!(streams = nprocs, "started write controller");

        Ok(Self {
            requests: tx,
            streams: nprocs,
            stats,
        })
    }

    /// Amount of writes this controller performs in parallel
    pub fn streams(&self) -> usize {
        self.streams
    }

    /// A writer bound to this controller, without destination
    pub fn new_writer(&self) -> ChannelWriter {
        let (reply_tx, reply_rx) = bounded(1);
        ChannelWriter {
            ctrl: self.clone(),
            writer: Some(LazyFileWriter::new()),
            scratch: Vec::new(),
            reply_tx,
            reply_rx,
            open: false,
        }
    }
}

/// Writes into one destination file through a [`WriteChannelController`].
///
/// Each `write` copies the given bytes into a scratch buffer owned by this
/// writer, passes writer and buffer to a controller thread, and waits until
/// both come back.
pub struct ChannelWriter {
    ctrl: WriteChannelController,
    writer: Option<LazyFileWriter>,
    scratch: Vec<u8>,
    reply_tx: Sender<WriteReply>,
    reply_rx: Receiver<WriteReply>,
    open: bool,
}

impl ChannelWriter {
    /// Write subsequent data to `path`. The previous destination must be closed
    pub fn set_destination(&mut self, path: PathBuf, mode: FileMode) -> Result<()> {
        let writer = self.lazy()?;
        writer.set_path(path, mode)?;
        stats::inc(&self.ctrl.stats.files_being_written);
        self.open = true;
        Ok(())
    }

    /// The current destination
    pub fn path(&self) -> PathBuf {
        self.writer
            .as_ref()
            .map(|w| w.path().to_path_buf())
            .unwrap_or_default()
    }

    /// Close the current destination
    pub fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        stats::dec(&self.ctrl.stats.files_being_written);
        stats::inc(&self.ctrl.stats.total_files_written);
        let writer = self.lazy()?;
        let path = writer.path().to_path_buf();
        writer.close().map_err(|e| SealError::io_at(path, e))
    }

    fn lazy(&mut self) -> Result<&mut LazyFileWriter> {
        self.writer
            .as_mut()
            .ok_or_else(|| SealError::internal("writer lost to a failed write"))
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let Some(writer) = self.writer.take() else {
            return Err(io::Error::new(io::ErrorKind::Other, "writer lost to a failed write"));
        };
        let mut data = std::mem::take(&mut self.scratch);
        data.clear();
        data.extend_from_slice(buf);

        let request = WriteRequest {
            writer,
            data,
            reply: self.reply_tx.clone(),
        };
        if self.ctrl.requests.send(request).is_err() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "write controller has shut down"));
        }
        let reply = self
            .reply_rx
            .recv()
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "writer thread vanished"))?;

        self.writer = Some(reply.writer);
        self.scratch = reply.data;
        reply.result.map(|()| buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for ChannelWriter {
    fn drop(&mut self) {
        if self.open {
            stats::dec(&self.ctrl.stats.files_being_written);
        }
    }
}

/// A write controller together with the trees it serves
#[derive(Clone)]
pub struct RootedWriteController {
    /// Destination trees on the controller's device
    pub trees: Vec<PathBuf>,
    /// The controller shared by all of them
    pub ctrl: WriteChannelController,
}

/// Create one write controller per device spanned by `trees`
pub fn device_write_controllers(
    nprocs: usize,
    trees: &[PathBuf],
    stats: &Arc<Stats>,
) -> Result<Vec<RootedWriteController>> {
    utils::device_map(trees)
        .into_iter()
        .map(|trees| {
            Ok(RootedWriteController {
                trees,
                ctrl: WriteChannelController::new(nprocs, Arc::clone(stats))?,
            })
        })
        .collect()
}
