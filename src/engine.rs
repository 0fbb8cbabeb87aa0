//! Engine orchestration
//!
//! A run is a three-stage pipeline:
//!
//! ```text
//! generate ──FileInfo──▶ gather × streams ──Outcome──▶ aggregate
//!    │ notices                                            │ results
//!    └──────────────────────▶ caller ◀────────────────────┘
//! ```
//!
//! [`start_engine`] wires the stages together using scoped threads and
//! delivers the two outcome streams to caller-supplied handlers until both
//! are exhausted. Files are routed to the gather workers of the device they
//! live on, so each device's read budget is honored independently.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use bitseal::{start_engine, EngineBuilder};
//!
//! # fn main() -> bitseal::Result<()> {
//! let runner = EngineBuilder::new().seal(&["/data/photos"])?;
//! start_engine(&runner, |notice| println!("{:?}", notice.info()), |res| println!("{:?}", res.info()))?;
//! # Ok(())
//! # }
//! ```

use crate::cancel::CancelToken;
use crate::codec::Codec;
use crate::error::{Result, SealError};
use crate::io::reader::{device_read_controllers, ReadChannelController, RootedReadController};
use crate::io::writer::device_write_controllers;
use crate::seal::SealRunner;
use crate::stats::Stats;
use crate::types::{FileFilter, FileInfo, Outcome, Priority};
use crate::utils;
use crate::verify::VerifyRunner;
use crossbeam_channel::{bounded, never, select, Receiver, Sender};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use tracing::{debug, info};

/// Capacity of the outcome channels between stages
const OUTCOME_BUFFER: usize = 64;

/// State shared by all runner kinds
pub struct BasicRunner {
    /// Trees to read from: source trees, or the directories holding seals
    pub(crate) trees: Vec<PathBuf>,
    /// One read controller per device spanned by `trees`
    pub(crate) readers: Vec<RootedReadController>,
    pub(crate) stats: Arc<Stats>,
    pub(crate) cancel: CancelToken,
    /// Routine outcomes below this level are not forwarded
    pub(crate) level: Priority,
    pub(crate) filters: Vec<FileFilter>,
}

impl BasicRunner {
    fn new(trees: Vec<PathBuf>, builder: &EngineBuilder, cancel: CancelToken) -> Result<Self> {
        let stats = Arc::new(Stats::new());
        let readers =
            device_read_controllers(builder.streams_per_input_device, &trees, &stats, &cancel)?;
        Ok(Self {
            trees,
            readers,
            stats,
            cancel,
            level: builder.level,
            filters: builder.filters.clone(),
        })
    }

    /// Forward `outcome` to `out` if the level allows it.
    ///
    /// Errors, summaries and seal markers are always forwarded, whatever the
    /// level: callers rely on them for the run's result and to find the seals
    /// that were written. Returns false once nobody listens anymore.
    pub(crate) fn emit(&self, out: &Sender<Outcome>, outcome: Outcome) -> bool {
        let (_, prio) = outcome.info();
        let essential = outcome.error().is_some()
            || prio >= Priority::Error
            || outcome.file_info().is_seal_marker();
        if !essential && !self.level.may_log(prio) {
            return true;
        }
        out.send(outcome).is_ok()
    }

    /// Record whether the run was cancelled, once aggregation is done
    pub(crate) fn finish(&self) {
        if self.cancel.is_cancelled() {
            self.stats.was_cancelled.store(true, Ordering::Relaxed);
        }
    }
}

/// A configured run, ready for [`start_engine`]
pub enum Runner {
    /// Seal trees, optionally copying them
    Seal(SealRunner),
    /// Verify trees against their seals
    Verify(VerifyRunner),
}

impl Runner {
    pub(crate) fn basic(&self) -> &BasicRunner {
        match self {
            Runner::Seal(r) => &r.basic,
            Runner::Verify(r) => &r.basic,
        }
    }

    /// Counters of this run
    pub fn stats(&self) -> &Arc<Stats> {
        &self.basic().stats
    }

    /// The token that cancels this run
    pub fn cancel_token(&self) -> &CancelToken {
        &self.basic().cancel
    }

    /// Trees this run reads from
    pub fn trees(&self) -> &[PathBuf] {
        &self.basic().trees
    }

    fn generate(&self, router: &FileRouter, notices: &Sender<Outcome>, results: &Sender<Outcome>) {
        match self {
            Runner::Seal(r) => r.generate(router, notices),
            Runner::Verify(r) => r.generate(router, notices, results),
        }
    }

    fn gather(&self, ctrl: &ReadChannelController, files: &Receiver<FileInfo>, results: &Sender<Outcome>) {
        match self {
            Runner::Seal(r) => r.gather(ctrl, files, results),
            Runner::Verify(r) => r.gather(ctrl, files, results),
        }
    }

    fn aggregate(&self, results: &Receiver<Outcome>, out: &Sender<Outcome>) {
        match self {
            Runner::Seal(r) => r.aggregate(results, out),
            Runner::Verify(r) => r.aggregate(results, out),
        }
    }
}

/// Sends each file to the gather workers of the device it lives on
pub struct FileRouter {
    routes: Vec<(Vec<PathBuf>, Sender<FileInfo>)>,
}

impl FileRouter {
    fn new(readers: &[RootedReadController]) -> (Self, Vec<(ReadChannelController, Receiver<FileInfo>)>) {
        let mut routes = Vec::with_capacity(readers.len());
        let mut workers = Vec::with_capacity(readers.len());
        for rc in readers {
            let (tx, rx) = bounded(0);
            routes.push((rc.trees.clone(), tx));
            workers.push((rc.ctrl.clone(), rx));
        }
        (Self { routes }, workers)
    }

    /// The channel for files below `path`
    pub fn sender_for(&self, path: &Path) -> Option<&Sender<FileInfo>> {
        self.routes
            .iter()
            .find(|(trees, _)| trees.iter().any(|t| path.starts_with(t)))
            .map(|(_, tx)| tx)
    }

    /// Route `finfo`. Returns false if nobody accepts files anymore
    pub fn send(&self, finfo: FileInfo) -> bool {
        match self.sender_for(&finfo.path) {
            Some(tx) => tx.send(finfo).is_ok(),
            None => {
                debug!(path = %finfo.path.display(), "no route for file");
                false
            }
        }
    }
}

/// Run `runner` to completion.
///
/// Notices of the generate stage go to `generate_handler`, everything the
/// aggregation stage reports goes to `aggregate_handler`. Both are called on
/// the calling thread. The run fails with the last error any outcome carried,
/// or with a generic failure for error outcomes without an error.
pub fn start_engine<G, A>(runner: &Runner, mut generate_handler: G, mut aggregate_handler: A) -> Result<()>
where
    G: FnMut(&Outcome),
    A: FnMut(&Outcome),
{
    let basic = runner.basic();
    basic.stats.mark_started();

    let (router, workers) = FileRouter::new(&basic.readers);
    let (notice_tx, notice_rx) = bounded::<Outcome>(OUTCOME_BUFFER);
    let (results_tx, results_rx) = bounded::<Outcome>(OUTCOME_BUFFER);
    let (accum_tx, accum_rx) = bounded::<Outcome>(OUTCOME_BUFFER);

    let mut last_error: Option<SealError> = None;

    thread::scope(|s| -> Result<()> {
        {
            let results_tx = results_tx.clone();
            thread::Builder::new()
                .name("bitseal-generate".into())
                .spawn_scoped(s, move || {
                    runner.generate(&router, &notice_tx, &results_tx);
                    debug!("generate stage done");
                })?;
        }

        for (i, (ctrl, files)) in workers.into_iter().enumerate() {
            for j in 0..ctrl.streams() {
                let ctrl = ctrl.clone();
                let files = files.clone();
                let results_tx = results_tx.clone();
                thread::Builder::new()
                    .name(format!("bitseal-gather-{}-{}", i, j))
                    .spawn_scoped(s, move || runner.gather(&ctrl, &files, &results_tx))?;
            }
        }
        drop(results_tx);

        thread::Builder::new()
            .name("bitseal-aggregate".into())
            .spawn_scoped(s, move || runner.aggregate(&results_rx, &accum_tx))?;

        let mut notices = Some(notice_rx);
        let mut accumulated = Some(accum_rx);
        let closed = never::<Outcome>();
        while notices.is_some() || accumulated.is_some() {
            let (from_generate, msg) = select! {
                recv(notices.as_ref().unwrap_or(&closed)) -> msg => (true, msg),
                recv(accumulated.as_ref().unwrap_or(&closed)) -> msg => (false, msg),
            };
            match (from_generate, msg) {
                (true, Ok(outcome)) => {
                    generate_handler(&outcome);
                    record(outcome, &mut last_error);
                }
                (false, Ok(outcome)) => {
                    aggregate_handler(&outcome);
                    record(outcome, &mut last_error);
                }
                (true, Err(_)) => notices = None,
                (false, Err(_)) => accumulated = None,
            }
        }
        Ok(())
    })?;

    info!(elapsed = ?basic.stats.elapsed(), "run finished");
    match last_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn record(mut outcome: Outcome, last: &mut Option<SealError>) {
    let (msg, prio) = outcome.info();
    if prio != Priority::Error {
        return;
    }
    *last = Some(outcome.take_error().unwrap_or(SealError::Failed(msg)));
}

/// Builder for configuring and creating runners
///
/// # Examples
///
/// ```rust,no_run
/// use bitseal::{Codec, EngineBuilder, Priority};
///
/// # fn main() -> bitseal::Result<()> {
/// let runner = EngineBuilder::new()
///     .streams_per_input_device(2)
///     .format(Codec::Mhl)
///     .level(Priority::Warn)
///     .sealed_copy(&["/data/src", "--", "/backup/a", "/backup/b"])?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct EngineBuilder {
    streams_per_input_device: usize,
    streams_per_output_device: usize,
    level: Priority,
    filters: Vec<FileFilter>,
    format: Codec,
    cancel: Option<CancelToken>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    /// Create a builder with default settings
    pub fn new() -> Self {
        Self {
            streams_per_input_device: 1,
            streams_per_output_device: 1,
            level: Priority::Info,
            filters: vec![FileFilter::Seals],
            format: Codec::default(),
            cancel: None,
        }
    }

    /// Parallel reads per input device
    pub fn streams_per_input_device(mut self, n: usize) -> Self {
        self.streams_per_input_device = n;
        self
    }

    /// Parallel writes per output device, used by sealed copies
    pub fn streams_per_output_device(mut self, n: usize) -> Self {
        self.streams_per_output_device = n;
        self
    }

    /// Least priority of outcomes to report
    pub fn level(mut self, level: Priority) -> Self {
        self.level = level;
        self
    }

    /// Entries to skip while traversing
    pub fn filters(mut self, filters: Vec<FileFilter>) -> Self {
        self.filters = filters;
        self
    }

    /// Format of the seals to write
    pub fn format(mut self, format: Codec) -> Self {
        self.format = format;
        self
    }

    /// Use an existing cancellation token, e.g. one shared with a signal handler
    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn validate<P: AsRef<Path>>(&self, items: &[P]) -> Result<()> {
        if self.streams_per_input_device < 1 {
            return Err(SealError::config(
                "--streams-per-input-device must not be smaller than 1",
            ));
        }
        if self.streams_per_output_device < 1 {
            return Err(SealError::config(
                "--streams-per-output-device must not be smaller than 1",
            ));
        }
        if items.is_empty() {
            return Err(SealError::config("Please specify at least one item to work on"));
        }
        Ok(())
    }

    fn token(&self) -> CancelToken {
        self.cancel.clone().unwrap_or_default()
    }

    /// Seal the given trees
    pub fn seal<P: AsRef<Path>>(self, trees: &[P]) -> Result<Runner> {
        self.validate(trees)?;
        let trees = utils::parse_sources(trees, true)?;
        let basic = BasicRunner::new(trees, &self, self.token())?;
        Ok(Runner::Seal(SealRunner::new(basic, self.format, Vec::new())))
    }

    /// Copy and seal: `src... -- dst...`, or `src dst`
    pub fn sealed_copy<P: AsRef<Path>>(self, items: &[P]) -> Result<Runner> {
        self.validate(items)?;
        let (sources, destinations) = utils::split_copy_items(items)?;
        let sources = utils::parse_sources(&sources, true)?;
        let destinations = utils::parse_sources(&destinations, false)?;

        for dst in &destinations {
            if let Some(src) = sources.iter().find(|src| dst.starts_with(src)) {
                return Err(SealError::config(format!(
                    "Cannot copy '{}' into itself at '{}'",
                    src.display(),
                    dst.display()
                )));
            }
        }

        let basic = BasicRunner::new(sources, &self, self.token())?;
        let writers =
            device_write_controllers(self.streams_per_output_device, &destinations, &basic.stats)?;
        Ok(Runner::Seal(SealRunner::new(basic, self.format, writers)))
    }

    /// Verify the given seal files
    pub fn verify<P: AsRef<Path>>(self, seals: &[P]) -> Result<Runner> {
        self.validate(seals)?;
        let mut files = Vec::with_capacity(seals.len());
        for seal in seals {
            let seal = utils::normalize_path(seal.as_ref())?;
            Codec::by_path(&seal)?;
            let meta = std::fs::metadata(&seal).map_err(|e| SealError::io_at(&seal, e))?;
            if !meta.is_file() {
                return Err(SealError::config(format!(
                    "'{}' is not a seal file",
                    seal.display()
                )));
            }
            if !files.contains(&seal) {
                files.push(seal);
            }
        }

        let dirs = files
            .iter()
            .map(|f| f.parent().map(Path::to_path_buf).unwrap_or_default())
            .collect::<Vec<_>>();
        let mut trees: Vec<PathBuf> = Vec::with_capacity(dirs.len());
        for dir in &dirs {
            if !trees.contains(dir) {
                trees.push(dir.clone());
            }
        }

        let basic = BasicRunner::new(trees, &self, self.token())?;
        Ok(Runner::Verify(VerifyRunner::new(basic, files)))
    }
}
