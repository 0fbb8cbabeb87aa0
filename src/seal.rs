//! Sealing and sealed copies
//!
//! ## Generate
//!
//! Each source tree is walked depth first. All files of a directory are
//! emitted before its subdirectories are entered, in name order. Symbolic
//! links, other non-regular entries and dotfiles never enter a seal; entries
//! matching a [`FileFilter`] are skipped as well. Every skipped entry is
//! reported as an informational notice.
//!
//! ## Aggregate
//!
//! Results are grouped by the tree they belong to: the source tree when
//! sealing, the destination tree when copying. Each tree streams its records
//! into a temporary seal file on a dedicated thread, which is moved into place
//! once all results are in.
//!
//! In a sealed copy, any failure within a destination tree makes it faulty.
//! All files written into a faulty tree are removed again and its seal is
//! discarded, so a destination either holds a complete, sealed copy or nothing
//! that was written by this run.

use crate::codec::Codec;
use crate::collections::HashSet;
use crate::engine::{BasicRunner, FileRouter};
use crate::error::{Result, SealError};
use crate::gather::{Destination, Gatherer};
use crate::io::{ReadChannelController, RootedWriteController};
use crate::stats::{self, STATS_SEP};
use crate::types::{BasicOutcome, FileFilter, FileInfo, Outcome, Priority};
use crate::utils;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Why a traversal ended early
enum Walk {
    Done,
    TreeFailed,
    Stopped,
}

/// Seals source trees, and copies them into destinations if there are any
pub struct SealRunner {
    pub(crate) basic: BasicRunner,
    format: Codec,
    writers: Vec<RootedWriteController>,
    destinations: Vec<Destination>,
}

fn seal_outcome(finfo: FileInfo, _: &FileInfo, err: Option<SealError>) -> Outcome {
    Outcome::Basic(BasicOutcome::file(finfo, err))
}

impl SealRunner {
    pub(crate) fn new(basic: BasicRunner, format: Codec, writers: Vec<RootedWriteController>) -> Self {
        let destinations = writers
            .iter()
            .flat_map(|w| {
                w.trees.iter().map(|tree| Destination {
                    tree: tree.clone(),
                    ctrl: w.ctrl.clone(),
                })
            })
            .collect();
        Self {
            basic,
            format,
            writers,
            destinations,
        }
    }

    /// True if this runner copies while sealing
    pub fn is_copy(&self) -> bool {
        !self.writers.is_empty()
    }

    /// Format of the seals this runner writes
    pub fn format(&self) -> Codec {
        self.format
    }

    /// Trees that receive a seal: the destinations, or the sources if not copying
    pub fn sealed_trees(&self) -> Vec<PathBuf> {
        if self.is_copy() {
            self.destinations.iter().map(|d| d.tree.clone()).collect()
        } else {
            self.basic.trees.clone()
        }
    }

    pub(crate) fn generate(&self, router: &FileRouter, notices: &Sender<Outcome>) {
        for tree in &self.basic.trees {
            if self.basic.cancel.is_cancelled() {
                break;
            }
            debug!(tree = %tree.display(), "traversing");
            match self.traverse(tree, tree, router, notices) {
                Walk::Done => {}
                Walk::TreeFailed => warn!(tree = %tree.display(), "traversal aborted"),
                Walk::Stopped => break,
            }
        }
    }

    fn traverse(&self, root: &Path, dir: &Path, router: &FileRouter, notices: &Sender<Outcome>) -> Walk {
        if self.basic.cancel.is_cancelled() {
            return Walk::Stopped;
        }

        let entries = match read_dir_sorted(dir) {
            Ok(entries) => entries,
            Err(err) => {
                self.report(notices, err);
                return Walk::TreeFailed;
            }
        };

        let mut subdirs = Vec::new();
        for (name, path, ft) in entries {
            if self.basic.stats.stop_the_engines.load(Ordering::Relaxed) > 0 {
                return Walk::Stopped;
            }

            // seals store paths as text
            let Some(name) = name.to_str() else {
                self.report(notices, SealError::NonUtf8Path { path });
                continue;
            };

            // seals of this very run, still being written
            if ft.is_file() && name.starts_with(utils::SEAL_TEMP_PREFIX) {
                continue;
            }

            let skip = if ft.is_dir() {
                self.skip_dir(name, &path, &ft)
            } else {
                self.skip_file(name, &path, &ft)
            };
            if let Some(msg) = skip {
                stats::inc(&self.basic.stats.num_skipped);
                self.basic
                    .emit(notices, BasicOutcome::message(msg, Priority::Info).into());
                continue;
            }

            if ft.is_dir() {
                subdirs.push(path);
                continue;
            }

            let size = match fs::symlink_metadata(&path) {
                Ok(meta) => meta.len() as i64,
                Err(e) => {
                    self.report(notices, SealError::io_at(&path, e));
                    continue;
                }
            };
            if !router.send(FileInfo::new(root, path, size)) {
                return Walk::Stopped;
            }
        }

        for sub in subdirs {
            match self.traverse(root, &sub, router, notices) {
                Walk::Done => {}
                other => return other,
            }
        }
        Walk::Done
    }

    /// Count and report a traversal failure
    fn report(&self, notices: &Sender<Outcome>, err: SealError) {
        stats::inc(&self.basic.stats.err_count);
        self.basic.emit(notices, BasicOutcome::failure(err).into());
    }

    fn skip_file(&self, name: &str, path: &Path, ft: &fs::FileType) -> Option<String> {
        if ft.is_symlink() {
            return Some(format!("Ignoring symbolic link: '{}'", path.display()));
        }
        if !ft.is_file() {
            return Some(format!("Ignoring non-regular file: '{}'", path.display()));
        }
        if utils::is_hidden(name) {
            return Some(format!("Ignoring hidden file: '{}'", path.display()));
        }
        self.basic
            .filters
            .iter()
            .find(|f| f.matches(name, ft))
            .map(|f| match f {
                FileFilter::Seals => format!("Ignoring seal file: '{}'", path.display()),
                other => format!("Ignoring '{}' (matched '{}')", path.display(), other),
            })
    }

    fn skip_dir(&self, name: &str, path: &Path, ft: &fs::FileType) -> Option<String> {
        self.basic
            .filters
            .iter()
            .filter(|f| matches!(f, FileFilter::Hidden | FileFilter::Glob { .. }))
            .find(|f| f.matches(name, ft))
            .map(|f| format!("Ignoring '{}' (matched '{}')", path.display(), f))
    }

    pub(crate) fn gather(&self, ctrl: &ReadChannelController, files: &Receiver<FileInfo>, results: &Sender<Outcome>) {
        let mut gatherer = Gatherer::new(Arc::clone(&self.basic.stats), self.basic.cancel.clone());
        if self.destinations.is_empty() {
            gatherer.hash_all(files, ctrl, results, &seal_outcome);
        } else {
            gatherer.copy_all(files, ctrl, &self.destinations, results, &seal_outcome);
        }
    }

    pub(crate) fn aggregate(&self, results: &Receiver<Outcome>, out: &Sender<Outcome>) {
        let copy = self.is_copy();
        let stats = &self.basic.stats;

        thread::scope(|s| {
            let mut trees: Vec<TreeState<'_>> = self
                .sealed_trees()
                .into_iter()
                .map(|tree| {
                    let (tx, rx) = bounded::<FileInfo>(64);
                    let format = self.format;
                    let writer_tree = tree.clone();
                    let writer = thread::Builder::new()
                        .name("bitseal-seal-writer".into())
                        .spawn_scoped(s, move || write_seal(&writer_tree, format, rx))
                        .map_err(SealError::from);
                    TreeState {
                        tree,
                        seen: HashSet::default(),
                        written: Vec::new(),
                        num_records: 0,
                        faulty: false,
                        records: Some(tx),
                        writer,
                    }
                })
                .collect();

            for mut outcome in results.iter() {
                let path = outcome.file_info().path.clone();
                let Some(state) = trees.iter_mut().find(|t| path.starts_with(&t.tree)) else {
                    self.basic.emit(out, outcome);
                    continue;
                };

                if let Some(err) = outcome.error() {
                    if err.is_cancelled() {
                        if copy && path.exists() {
                            utils::remove_with_empty_parents(&state.tree, &path);
                        }
                        continue;
                    }
                    if copy {
                        if !err.is_already_exists() {
                            state.written.push(path);
                        }
                        state.faulty = true;
                    }
                    stats::inc(&stats.err_count);
                    self.basic.emit(out, outcome);
                    continue;
                }

                let finfo = outcome.file_info().clone();
                if !state.seen.insert(finfo.rela_path.clone()) {
                    stats::inc(&stats.err_count);
                    outcome.basic_mut().err = Some(SealError::DuplicatePath { path });
                    self.basic.emit(out, outcome);
                    continue;
                }
                if copy {
                    state.written.push(path.clone());
                }

                let msg = match &outcome.basic().source {
                    Some(source) => format!("CP {} -> {}", source.display(), path.display()),
                    None => format!("# {}", path.display()),
                };
                let basic = outcome.basic_mut();
                basic.msg = msg;
                basic.prio = Priority::Info;

                state.num_records += 1;
                if let Some(tx) = &state.records {
                    let _ = tx.send(finfo);
                }
                self.basic.emit(out, outcome);
            }

            self.basic.finish();
            let cancelled = self.basic.cancel.is_cancelled();
            for state in trees {
                self.finish_tree(state, cancelled, out);
            }
        });

        let snap = stats.snapshot();
        let verdict = if snap.err_count == 0 { "SEAL DONE" } else { "SEAL FAILED" };
        let msg = format!(
            "{}: {}{}",
            verdict,
            snap.delta_string(None, snap.elapsed, STATS_SEP),
            snap
        );
        info!("{}", msg);
        self.basic
            .emit(out, BasicOutcome::message(msg, Priority::Valuable).into());
    }

    fn finish_tree(&self, mut state: TreeState<'_>, cancelled: bool, out: &Sender<Outcome>) {
        drop(state.records.take());
        let sealed = state
            .writer
            .and_then(|h| h.join().unwrap_or_else(|_| Err(SealError::internal("seal writer panicked"))));

        if state.faulty {
            state.written.sort_by_key(|p| std::cmp::Reverse(p.as_os_str().len()));
            for path in &state.written {
                if utils::remove_with_empty_parents(&state.tree, path) {
                    stats::inc(&self.basic.stats.num_undone);
                    self.basic.emit(
                        out,
                        BasicOutcome::message(format!("Removed '{}'", path.display()), Priority::Info)
                            .into(),
                    );
                }
            }
            warn!(tree = %state.tree.display(), undone = state.written.len(), "undid faulty copy");
            self.basic.emit(
                out,
                BasicOutcome::message(
                    format!(
                        "Did not write seal for '{}' due to preceding errors",
                        state.tree.display()
                    ),
                    Priority::Error,
                )
                .into(),
            );
            return;
        }

        if cancelled && state.num_records == 0 {
            self.basic.emit(
                out,
                BasicOutcome::message(
                    format!(
                        "Did not write seal for '{}' as the run was cancelled before any file was sealed",
                        state.tree.display()
                    ),
                    Priority::Warn,
                )
                .into(),
            );
            return;
        }

        let persisted = sealed.and_then(|tmp| {
            let index = utils::index_path(&state.tree, self.format.extension());
            tmp.persist_noclobber(&index)
                .map_err(|e| SealError::io_at(&index, e.error))?;
            Ok(index)
        });

        match persisted {
            Ok(index) => {
                info!(seal = %index.display(), records = state.num_records, "wrote seal");
                let mut outcome = BasicOutcome::message(
                    format!("Wrote seal file to '{}'", index.display()),
                    Priority::Valuable,
                );
                outcome.finfo = FileInfo {
                    path: index,
                    size: -1,
                    ..Default::default()
                };
                self.basic.emit(out, outcome.into());
            }
            Err(err) => {
                stats::inc(&self.basic.stats.err_count);
                self.basic.emit(out, BasicOutcome::failure(err).into());
            }
        }
    }
}

/// Aggregation state of one sealed tree
struct TreeState<'scope> {
    tree: PathBuf,
    /// Relative paths already sealed
    seen: HashSet<PathBuf>,
    /// Files this run created in the tree, copy mode only
    written: Vec<PathBuf>,
    num_records: usize,
    faulty: bool,
    records: Option<Sender<FileInfo>>,
    writer: Result<thread::ScopedJoinHandle<'scope, Result<NamedTempFile>>>,
}

/// Stream `records` into a temporary seal inside `tree`
fn write_seal(tree: &Path, format: Codec, records: Receiver<FileInfo>) -> Result<NamedTempFile> {
    fs::create_dir_all(tree).map_err(|e| SealError::io_at(tree, e))?;
    let tmp = tempfile::Builder::new()
        .prefix(utils::SEAL_TEMP_PREFIX)
        .tempfile_in(tree)
        .map_err(|e| SealError::io_at(tree, e))?;
    let res = format.serialize(records.iter(), tmp.as_file());
    // keep draining so aggregation never blocks on a failed writer
    for _ in records.iter() {}
    res?;
    tmp.as_file().sync_all()?;
    Ok(tmp)
}

/// Directory entries as `(name, path, type)`, sorted by name
fn read_dir_sorted(dir: &Path) -> Result<Vec<(OsString, PathBuf, fs::FileType)>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| SealError::io_at(dir, e))? {
        let entry = entry.map_err(|e| SealError::io_at(dir, e))?;
        let ft = entry.file_type().map_err(|e| SealError::io_at(entry.path(), e))?;
        entries.push((entry.file_name(), entry.path(), ft));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{start_engine, EngineBuilder, Runner};
    use tempfile::TempDir;

    fn run(runner: &Runner) -> (Result<()>, Vec<String>, Vec<PathBuf>) {
        let mut messages = Vec::new();
        let mut seals = Vec::new();
        let res = start_engine(
            runner,
            |o| messages.push(o.info().0),
            |o| {
                if o.file_info().is_seal_marker() {
                    seals.push(o.file_info().path.clone());
                }
            },
        );
        (res, messages, seals)
    }

    #[test]
    fn test_traversal_skips_and_reports() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();
        fs::write(dir.path().join(".hidden"), b"h").unwrap();
        fs::write(dir.path().join("bitseal_2020-01-01_000000.sealz"), b"old").unwrap();
        fs::write(dir.path().join("skip.tmp"), b"t").unwrap();

        let runner = EngineBuilder::new()
            .filters(FileFilter::parse_list("SEALS,*.tmp").unwrap())
            .seal(&[dir.path()])
            .unwrap();
        let (res, notices, seals) = run(&runner);
        res.unwrap();

        assert_eq!(seals.len(), 1);
        assert_eq!(runner.stats().snapshot().num_skipped, 3);
        assert!(notices.iter().any(|m| m.starts_with("Ignoring hidden file")));
        assert!(notices.iter().any(|m| m.starts_with("Ignoring seal file")));
        assert!(notices.iter().any(|m| m.ends_with("(matched '*.tmp')")));
    }

    #[test]
    fn test_empty_tree_gets_empty_seal() {
        let dir = TempDir::new().unwrap();
        let runner = EngineBuilder::new().seal(&[dir.path()]).unwrap();
        let (res, _, seals) = run(&runner);
        res.unwrap();
        assert_eq!(seals.len(), 1);
        assert!(seals[0].starts_with(dir.path()));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_non_utf8_names_are_rejected() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("good.txt"), b"good").unwrap();
        let bad = dir.path().join(OsStr::from_bytes(b"bad\xffname"));
        fs::write(&bad, b"bad").unwrap();

        let runner = EngineBuilder::new().seal(&[dir.path()]).unwrap();
        let (res, notices, seals) = run(&runner);
        assert!(matches!(res, Err(SealError::NonUtf8Path { .. })));
        assert!(notices.iter().any(|m| m.contains("name is not valid UTF-8")));
        assert_eq!(runner.stats().snapshot().err_count, 1);
        assert_eq!(seals.len(), 1);

        // the seal only holds what it can name, and that verifies clean
        let verifier = EngineBuilder::new().verify(&seals).unwrap();
        let (res, _, _) = run(&verifier);
        res.unwrap();
        assert_eq!(verifier.stats().snapshot().total_files_read, 1);
    }

    #[test]
    fn test_read_dir_sorted() {
        let dir = TempDir::new().unwrap();
        for name in ["c", "a", "b"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        let names: Vec<String> = read_dir_sorted(dir.path())
            .unwrap()
            .into_iter()
            .map(|(n, _, _)| n.into_string().unwrap())
            .collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert!(read_dir_sorted(&dir.path().join("missing")).is_err());
    }
}
