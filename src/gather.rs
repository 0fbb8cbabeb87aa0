//! Hashing stage
//!
//! Gather workers pull [`FileInfo`]s from the traversal channel, stream each
//! file through a device read controller into a SHA-1 and an MD5 accumulator,
//! and optionally into one copy destination per target tree. Every file yields
//! exactly one outcome per destination (one outcome without destinations),
//! including files skipped due to cancellation.

use crate::cancel::CancelToken;
use crate::error::SealError;
use crate::io::multi_writer::{ParallelMultiWriter, Sink, UncheckedParallelMultiWriter};
use crate::io::{ChannelWriter, ReadChannelController, WriteChannelController, BUF_SIZE};
use crate::stats::{self, Stats};
use crate::types::{FileInfo, Outcome};
use crossbeam_channel::{Receiver, Sender};
use md5::Md5;
use sha1::digest::FixedOutputReset;
use sha1::{Digest, Sha1};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{trace, warn};

/// Turns a hashed file into an outcome.
///
/// Receives the file with fresh digests (empty on failure), the file as it
/// was received, and the error, if any.
pub trait MakeOutcome: Fn(FileInfo, &FileInfo, Option<SealError>) -> Outcome + Sync {}

impl<F> MakeOutcome for F where F: Fn(FileInfo, &FileInfo, Option<SealError>) -> Outcome + Sync {}

/// A [`Write`] sink feeding a digest
struct HashSink<D> {
    digest: D,
    stats: Arc<Stats>,
}

impl<D: Digest + FixedOutputReset> HashSink<D> {
    fn new(stats: &Arc<Stats>) -> Self {
        stats.num_hashers.fetch_add(1, Ordering::Relaxed);
        Self {
            digest: D::new(),
            stats: Arc::clone(stats),
        }
    }

    /// Finish the digest and start over
    fn take(&mut self) -> Vec<u8> {
        self.digest.finalize_reset().to_vec()
    }
}

impl<D: Digest> Write for HashSink<D> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.digest.update(buf);
        stats::add_bytes(&self.stats.bytes_hashed, buf.len());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<D> Drop for HashSink<D> {
    fn drop(&mut self) {
        self.stats.num_hashers.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Per-worker state: transfer buffer and digests, reused for every file
pub struct Gatherer {
    stats: Arc<Stats>,
    cancel: CancelToken,
    buf: Vec<u8>,
    sha1: HashSink<Sha1>,
    md5: HashSink<Md5>,
}

/// A copy destination: the target tree and the controller of its device
#[derive(Clone)]
pub struct Destination {
    /// Root of the destination tree
    pub tree: PathBuf,
    /// Write controller of the device `tree` lives on
    pub ctrl: WriteChannelController,
}

impl Gatherer {
    /// Create a worker
    pub fn new(stats: Arc<Stats>, cancel: CancelToken) -> Self {
        let sha1 = HashSink::new(&stats);
        let md5 = HashSink::new(&stats);
        Self {
            stats,
            cancel,
            buf: vec![0; BUF_SIZE],
            sha1,
            md5,
        }
    }

    /// Hash every file received on `files` and send one outcome per file
    pub fn hash_all<F: MakeOutcome>(
        &mut self,
        files: &Receiver<FileInfo>,
        ctrl: &ReadChannelController,
        results: &Sender<Outcome>,
        make_outcome: &F,
    ) {
        for f in files.iter() {
            let (finfo, err) = self.hash_one(&f, ctrl);
            if results.send(make_outcome(finfo, &f, err)).is_err() {
                return;
            }
        }
    }

    fn hash_one(&mut self, f: &FileInfo, ctrl: &ReadChannelController) -> (FileInfo, Option<SealError>) {
        let mut finfo = f.clone();
        finfo.sha1.clear();
        finfo.md5.clear();

        if self.cancel.is_cancelled() {
            return (finfo, Some(SealError::Cancelled { path: Some(f.path.clone()) }));
        }

        let reader = match ctrl.reader_from_path(f.path.clone(), f.mode) {
            Ok(reader) => reader,
            Err(e) => return (finfo, Some(e)),
        };

        let mut sinks = UncheckedParallelMultiWriter::new(vec![
            &mut self.sha1 as Sink,
            &mut self.md5 as Sink,
        ]);
        let res = reader.write_to(&mut sinks, &mut self.buf);
        drop(sinks);

        match res {
            Ok(n) => {
                trace!(path = %f.path.display(), bytes = n, "hashed");
                finfo.sha1 = self.sha1.take();
                finfo.md5 = self.md5.take();
                (finfo, size_check(f, n))
            }
            Err(e) => {
                self.sha1.take();
                self.md5.take();
                (finfo, Some(e))
            }
        }
    }

    /// Hash every file received on `files` and copy it into each destination.
    ///
    /// A destination that failed once stays failed, and all subsequent files
    /// are reported as failed for it. Once every destination failed, the
    /// worker bumps `stop_the_engines` so traversal stops early.
    pub fn copy_all<F: MakeOutcome>(
        &mut self,
        files: &Receiver<FileInfo>,
        ctrl: &ReadChannelController,
        destinations: &[Destination],
        results: &Sender<Outcome>,
        make_outcome: &F,
    ) {
        let mut writers: Vec<ChannelWriter> =
            destinations.iter().map(|d| d.ctrl.new_writer()).collect();
        let mut failed: Vec<Option<SealError>> = destinations.iter().map(|_| None).collect();
        let mut engines_stopped = false;

        for f in files.iter() {
            let dest_paths: Vec<PathBuf> = destinations
                .iter()
                .map(|d| d.tree.join(&f.rela_path))
                .collect();
            let copied = self.copy_one(&f, ctrl, &dest_paths, &mut writers, &failed);

            for (i, dest_err) in copied.dest_errors.into_iter().enumerate() {
                let err = if let Some(prev) = &failed[i] {
                    Some(prev.replicate())
                } else if let Some(e) = dest_err {
                    if !e.is_already_exists() {
                        failed[i] = Some(e.replicate());
                    }
                    Some(e)
                } else {
                    copied.read_err.as_ref().map(SealError::replicate)
                };

                let mut dest = copied.finfo.clone();
                dest.path = dest_paths[i].clone();
                let mut outcome = make_outcome(dest, &f, err);
                outcome.basic_mut().source = Some(f.path.clone());
                if results.send(outcome).is_err() {
                    return;
                }
            }

            if !engines_stopped && failed.iter().all(Option::is_some) {
                engines_stopped = true;
                stats::inc(&self.stats.stop_the_engines);
                warn!("all copy destinations failed, stopping");
            }
        }
    }

    fn copy_one(
        &mut self,
        f: &FileInfo,
        ctrl: &ReadChannelController,
        dest_paths: &[PathBuf],
        writers: &mut [ChannelWriter],
        failed: &[Option<SealError>],
    ) -> Copied {
        let mut copied = Copied {
            finfo: f.clone(),
            read_err: None,
            dest_errors: dest_paths.iter().map(|_| None).collect(),
        };
        copied.finfo.sha1.clear();
        copied.finfo.md5.clear();

        if self.cancel.is_cancelled() {
            copied.read_err = Some(SealError::Cancelled { path: Some(f.path.clone()) });
            return copied;
        }
        if failed.iter().all(Option::is_some) {
            return copied;
        }

        let reader = match ctrl.reader_from_path(f.path.clone(), f.mode) {
            Ok(reader) => reader,
            Err(e) => {
                copied.read_err = Some(e);
                return copied;
            }
        };

        let n = writers.len();
        let mut active = vec![false; n];
        let mut mw = ParallelMultiWriter::with_slots(n + 2);
        for (i, w) in writers.iter_mut().enumerate() {
            if failed[i].is_some() {
                continue;
            }
            match w.set_destination(dest_paths[i].clone(), f.mode) {
                Ok(()) => {
                    active[i] = true;
                    mw.set_writer_at(i, Some(w as Sink));
                }
                Err(e) => copied.dest_errors[i] = Some(e),
            }
        }
        mw.set_writer_at(n, Some(&mut self.sha1 as Sink));
        mw.set_writer_at(n + 1, Some(&mut self.md5 as Sink));

        let res = reader.write_to(&mut mw, &mut self.buf);
        let write_errors = mw.into_errors();

        for (i, w) in writers.iter_mut().enumerate() {
            if !active[i] {
                continue;
            }
            let closed = w.close();
            if let Some(e) = &write_errors[i] {
                copied.dest_errors[i] = Some(SealError::io_at(
                    &dest_paths[i],
                    io::Error::new(e.kind(), e.to_string()),
                ));
            } else if let Err(e) = closed {
                copied.dest_errors[i] = Some(e);
            }
        }

        match res {
            Ok(bytes) => {
                copied.finfo.sha1 = self.sha1.take();
                copied.finfo.md5 = self.md5.take();
                copied.read_err = size_check(f, bytes);
            }
            Err(e) => {
                self.sha1.take();
                self.md5.take();
                copied.read_err = Some(e);
            }
        }
        copied
    }
}

/// Result of copying one file
struct Copied {
    /// The source file with fresh digests, empty on failure
    finfo: FileInfo,
    /// Reading or hashing failure, applies to every destination
    read_err: Option<SealError>,
    /// Failures specific to each destination
    dest_errors: Vec<Option<SealError>>,
}

fn size_check(f: &FileInfo, got: u64) -> Option<SealError> {
    let got = got as i64;
    (got != f.size).then(|| SealError::SizeMismatch {
        path: f.path.clone(),
        want: f.size,
        got,
    })
}
