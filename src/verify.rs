//! Verification of trees against their seals
//!
//! Rather than walking the file system, the generate stage reads each seal
//! and hands its records out as work items, with paths resolved against the
//! directory holding the seal. Gather re-hashes them, and aggregation compares
//! the fresh digests with the sealed ones.
//!
//! Every directory holding a seal is one tree. Its verdict is computed once
//! all results are in:
//!
//! ```text
//! Clean ──▶ Mismatched | Missing | SealBroken
//! ```
//!
//! A broken seal overrides everything else, as none of its records can be
//! trusted.

use crate::codec::Codec;
use crate::collections::HashMap;
use crate::engine::{BasicRunner, FileRouter};
use crate::error::{Result, SealError};
use crate::gather::Gatherer;
use crate::io::ReadChannelController;
use crate::stats::{self, STATS_SEP};
use crate::types::{BasicOutcome, FileInfo, Outcome, Priority, VerifyOutcome};
use crossbeam_channel::{Receiver, Sender};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Verifies trees against the given seal files
pub struct VerifyRunner {
    pub(crate) basic: BasicRunner,
    seals: Vec<PathBuf>,
}

fn verify_outcome(finfo: FileInfo, expected: &FileInfo, err: Option<SealError>) -> Outcome {
    Outcome::Verify(VerifyOutcome {
        basic: BasicOutcome::file(finfo, err),
        expected: expected.clone(),
    })
}

/// Terminal classification of a tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TreeVerdict {
    Clean,
    Mismatched,
    Missing,
    SealBroken,
}

/// Running counts of one tree
#[derive(Debug, Default)]
struct TreeInfo {
    root: PathBuf,
    num_files: u32,
    signature_mismatches: u32,
    missing_files: u32,
    /// The first seal of this tree found to be broken
    broken_seal: Option<PathBuf>,
}

impl TreeInfo {
    fn verdict(&self) -> TreeVerdict {
        if self.broken_seal.is_some() {
            TreeVerdict::SealBroken
        } else if self.signature_mismatches > 0 {
            TreeVerdict::Mismatched
        } else if self.missing_files > 0 {
            TreeVerdict::Missing
        } else {
            TreeVerdict::Clean
        }
    }
}

/// True if any digest stored in `expected` differs from the one in `actual`
fn digests_differ(actual: &FileInfo, expected: &FileInfo) -> bool {
    (!expected.sha1.is_empty() && expected.sha1 != actual.sha1)
        || (!expected.md5.is_empty() && expected.md5 != actual.md5)
}

impl VerifyRunner {
    pub(crate) fn new(basic: BasicRunner, seals: Vec<PathBuf>) -> Self {
        Self { basic, seals }
    }

    /// The seal files this runner verifies
    pub fn seals(&self) -> &[PathBuf] {
        &self.seals
    }

    pub(crate) fn generate(&self, router: &FileRouter, _notices: &Sender<Outcome>, results: &Sender<Outcome>) {
        for seal in &self.seals {
            if self.basic.cancel.is_cancelled() {
                break;
            }
            debug!(seal = %seal.display(), "reading seal");
            if let Err(err) = self.read_seal(seal, router) {
                warn!(seal = %seal.display(), error = %err, "cannot read seal");
                let marker = FileInfo {
                    path: seal.clone(),
                    rela_path: seal.file_name().map(PathBuf::from).unwrap_or_default(),
                    ..Default::default()
                };
                let outcome = verify_outcome(marker.clone(), &marker, Some(err));
                if results.send(outcome).is_err() {
                    return;
                }
            }
        }
    }

    fn read_seal(&self, seal: &Path, router: &FileRouter) -> Result<()> {
        let codec = Codec::by_path(seal)?;
        let dir = seal
            .parent()
            .ok_or_else(|| SealError::internal(format!("seal '{}' has no parent", seal.display())))?;
        let files = router
            .sender_for(dir)
            .ok_or_else(|| SealError::internal(format!("no reader for '{}'", dir.display())))?;
        let reader = File::open(seal).map_err(|e| SealError::io_at(seal, e))?;

        let cancel = &self.basic.cancel;
        codec.deserialize(reader, files, |finfo| {
            finfo.path = dir.join(&finfo.rela_path);
            !cancel.is_cancelled()
        })
    }

    pub(crate) fn gather(&self, ctrl: &ReadChannelController, files: &Receiver<FileInfo>, results: &Sender<Outcome>) {
        let mut gatherer = Gatherer::new(Arc::clone(&self.basic.stats), self.basic.cancel.clone());
        gatherer.hash_all(files, ctrl, results, &verify_outcome);
    }

    pub(crate) fn aggregate(&self, results: &Receiver<Outcome>, out: &Sender<Outcome>) {
        let stats = &self.basic.stats;
        let mut trees: Vec<TreeInfo> = Vec::new();
        let mut by_root: HashMap<PathBuf, usize> = HashMap::default();
        for seal in &self.seals {
            let root = seal.parent().map(Path::to_path_buf).unwrap_or_default();
            by_root.entry(root.clone()).or_insert_with(|| {
                trees.push(TreeInfo {
                    root,
                    ..Default::default()
                });
                trees.len() - 1
            });
        }

        for outcome in results.iter() {
            let Outcome::Verify(mut v) = outcome else {
                self.basic.emit(out, outcome);
                continue;
            };
            let Some(&at) = by_root.get(&v.expected.root()) else {
                self.basic.emit(out, Outcome::Verify(v));
                continue;
            };
            let tree = &mut trees[at];

            let class = v.basic.err.as_ref().map(|e| (e.is_seal_broken(), e.is_cancelled(), e.is_missing()));
            match class {
                Some((true, _, _)) => {
                    tree.broken_seal.get_or_insert_with(|| v.basic.finfo.path.clone());
                }
                Some((_, true, _)) => continue,
                Some((_, _, true)) => {
                    tree.num_files += 1;
                    tree.missing_files += 1;
                }
                // size changes imply content changes; other failures leave the
                // file unconfirmed
                Some(_) => {
                    tree.num_files += 1;
                    tree.signature_mismatches += 1;
                }
                None => {
                    tree.num_files += 1;
                    if digests_differ(&v.basic.finfo, &v.expected) {
                        tree.signature_mismatches += 1;
                        v.basic.err = Some(SealError::HashMismatch {
                            path: v.basic.finfo.path.clone(),
                        });
                    } else {
                        v.basic.msg = format!("OK: {}", v.basic.finfo.path.display());
                        v.basic.prio = Priority::Info;
                    }
                }
            }

            if v.basic.err.is_some() {
                stats::inc(&stats.err_count);
            }
            self.basic.emit(out, Outcome::Verify(v));
        }

        self.basic.finish();
        let snap = stats.snapshot();
        let summary = format!("[{}]{}", snap.delta_string(None, snap.elapsed, STATS_SEP), snap);
        for tree in &trees {
            let verdict = tree.verdict();
            info!(tree = %tree.root.display(), ?verdict, files = tree.num_files, "verified");
            let (msg, prio) = match verdict {
                TreeVerdict::SealBroken => (
                    format!(
                        "VERIFY FAIL: seal at '{}' is broken - do not trust any result of this tree",
                        tree.broken_seal.as_deref().unwrap_or(tree.root.as_path()).display()
                    ),
                    Priority::Error,
                ),
                TreeVerdict::Clean => (
                    format!(
                        "VERIFY OK: None of {} file(s) changed after sealing {}",
                        tree.num_files, summary
                    ),
                    Priority::Valuable,
                ),
                TreeVerdict::Mismatched | TreeVerdict::Missing => (
                    format!(
                        "VERIFY FAIL: {} of {} file(s) have changed on disk after sealing, {} are missing {}",
                        tree.signature_mismatches, tree.num_files, tree.missing_files, summary
                    ),
                    Priority::Error,
                ),
            };
            self.basic.emit(out, BasicOutcome::message(msg, prio).into());
        }
    }
}
