//! Core data types shared by all pipeline stages
//!
//! ## Overview
//!
//! - **Work items**: [`FileInfo`] flows from traversal to the hashing stage and,
//!   enriched with digests, on to aggregation and the seal codecs.
//! - **Events**: [`Outcome`] is what every stage reports. It is a closed set of
//!   variants: a [`BasicOutcome`] for sealing and informational notices, and a
//!   [`VerifyOutcome`] which additionally carries the digests stored in the seal.
//! - **Filtering**: [`FileFilter`] decides which directory entries are skipped.
//! - **Verbosity**: [`Priority`] orders outcomes for display.
//!
//! ## Examples
//!
//! ```rust
//! use bitseal::types::{BasicOutcome, Outcome, Priority};
//!
//! let outcome = Outcome::Basic(BasicOutcome::message("hello", Priority::Info));
//! let (msg, prio) = outcome.info();
//! assert_eq!(msg, "hello");
//! assert!(Priority::Info.may_log(prio));
//! ```

use crate::error::{Result, SealError};
use crate::utils;
use globset::{Glob, GlobMatcher};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Kind of a file system entry, as far as reading and writing are concerned
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum FileMode {
    /// A regular file, read and written byte by byte
    #[default]
    Regular,
    /// A symbolic link, whose target is transferred as content
    Symlink,
}

impl FileMode {
    /// Derive the mode from a (non-following) file type
    pub fn from_file_type(ft: &fs::FileType) -> Self {
        if ft.is_symlink() {
            FileMode::Symlink
        } else {
            FileMode::Regular
        }
    }
}

/// A file to process, and everything known about it so far
///
/// Created by traversal or by deserializing a seal. The hashing stage fills in
/// `sha1` and `md5` on its own copy; after that the value is never mutated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileInfo {
    /// Path used for on-disk access
    pub path: PathBuf,
    /// Path relative to the tree the file belongs to
    pub rela_path: PathBuf,
    /// Kind of entry
    pub mode: FileMode,
    /// Size in bytes. Seal markers use `-1`
    pub size: i64,
    /// SHA-1 digest, empty if unknown
    pub sha1: Vec<u8>,
    /// MD5 digest, empty if unknown
    pub md5: Vec<u8>,
}

impl FileInfo {
    /// Create a work item for `path`, which lives below `root`
    pub fn new(root: &Path, path: PathBuf, size: i64) -> Self {
        let rela_path = path.strip_prefix(root).map(Path::to_path_buf).unwrap_or_default();
        Self {
            path,
            rela_path,
            mode: FileMode::Regular,
            size,
            sha1: Vec::new(),
            md5: Vec::new(),
        }
    }

    /// The tree this file belongs to: `path` with `rela_path` removed
    pub fn root(&self) -> PathBuf {
        let depth = self.rela_path.components().count();
        self.path
            .ancestors()
            .nth(depth)
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }

    /// True if this info announces a freshly written seal rather than a file
    pub fn is_seal_marker(&self) -> bool {
        self.size == -1 && !self.path.as_os_str().is_empty()
    }
}

/// Importance of an outcome, ordered from chattiest to most important
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Fine-grained progress
    Progress,
    /// Per-file information
    #[default]
    Info,
    /// Something unexpected that was handled
    Warn,
    /// A failure
    Error,
    /// A result the operator always wants to see, like a summary
    Valuable,
    /// Nothing may be logged
    LogDisabled,
}

impl Priority {
    const ALL: [Priority; 6] = [
        Priority::Progress,
        Priority::Info,
        Priority::Warn,
        Priority::Error,
        Priority::Valuable,
        Priority::LogDisabled,
    ];

    /// True if an outcome of priority `op` may be logged at this level.
    ///
    /// `Valuable` outcomes are always shown unless logging is disabled.
    pub fn may_log(self, op: Priority) -> bool {
        if self == Priority::LogDisabled {
            return false;
        }
        if op == Priority::Valuable {
            return true;
        }
        op >= self
    }

    /// Name used on the command line
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Progress => "progress",
            Priority::Info => "info",
            Priority::Warn => "warn",
            Priority::Error => "error",
            Priority::Valuable => "result",
            Priority::LogDisabled => "off",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = SealError;

    fn from_str(s: &str) -> Result<Self> {
        Priority::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| SealError::config(format!("Unknown verbosity level: '{}'", s)))
    }
}

/// Outcome of any operation: a file that was processed, or a notice
#[derive(Debug, Default)]
pub struct BasicOutcome {
    /// The file this outcome is about, default if it is a notice
    pub finfo: FileInfo,
    /// Human readable message, may be empty
    pub msg: String,
    /// The error, if the operation failed
    pub err: Option<SealError>,
    /// Display priority, overridden by `Error` whenever `err` is set
    pub prio: Priority,
    /// Source of a copy, set only when `finfo.path` is a copy destination
    pub source: Option<PathBuf>,
}

impl BasicOutcome {
    /// An informational notice
    pub fn message(msg: impl Into<String>, prio: Priority) -> Self {
        Self {
            msg: msg.into(),
            prio,
            ..Default::default()
        }
    }

    /// A failure without an associated file
    pub fn failure(err: SealError) -> Self {
        Self {
            err: Some(err),
            prio: Priority::Error,
            ..Default::default()
        }
    }

    /// The result of processing `finfo`
    pub fn file(finfo: FileInfo, err: Option<SealError>) -> Self {
        Self {
            finfo,
            err,
            ..Default::default()
        }
    }
}

/// Outcome of verifying one file
#[derive(Debug, Default)]
pub struct VerifyOutcome {
    /// What was found on disk
    pub basic: BasicOutcome,
    /// What the seal claims
    pub expected: FileInfo,
}

/// Everything a stage can report
#[derive(Debug)]
pub enum Outcome {
    /// Seal results and notices
    Basic(BasicOutcome),
    /// Verify results, carrying the sealed digests
    Verify(VerifyOutcome),
}

impl Outcome {
    /// Shared part of every outcome
    pub fn basic(&self) -> &BasicOutcome {
        match self {
            Outcome::Basic(b) => b,
            Outcome::Verify(v) => &v.basic,
        }
    }

    /// Mutable access to the shared part
    pub fn basic_mut(&mut self) -> &mut BasicOutcome {
        match self {
            Outcome::Basic(b) => b,
            Outcome::Verify(v) => &mut v.basic,
        }
    }

    /// Message and priority for display. Errors always report `Error`
    pub fn info(&self) -> (String, Priority) {
        let b = self.basic();
        match &b.err {
            Some(err) if b.msg.is_empty() => (err.to_string(), Priority::Error),
            Some(_) => (b.msg.clone(), Priority::Error),
            None => (b.msg.clone(), b.prio),
        }
    }

    /// The error carried by this outcome
    pub fn error(&self) -> Option<&SealError> {
        self.basic().err.as_ref()
    }

    /// Take the error out, leaving the outcome error-free
    pub fn take_error(&mut self) -> Option<SealError> {
        self.basic_mut().err.take()
    }

    /// The file this outcome is about
    pub fn file_info(&self) -> &FileInfo {
        &self.basic().finfo
    }
}

impl From<BasicOutcome> for Outcome {
    fn from(b: BasicOutcome) -> Self {
        Outcome::Basic(b)
    }
}

/// Classes of directory entries to skip while traversing
#[derive(Debug, Clone)]
pub enum FileFilter {
    /// Symbolic links
    Symlinks,
    /// Entries whose name starts with a dot
    Hidden,
    /// Seal files produced by earlier runs
    Seals,
    /// Entries which are neither regular files nor links, and `.DS_Store`
    Volatile,
    /// A glob matched against the entry's name
    Glob {
        /// The pattern as given
        pattern: String,
        /// The compiled pattern
        matcher: GlobMatcher,
    },
}

impl FileFilter {
    /// Parse a special filter name or a glob.
    ///
    /// `SYMLINK`, `HIDDEN`, `SEALS` and `VOLATILE` name the builtin classes;
    /// everything else is compiled as glob.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "SYMLINK" => Ok(FileFilter::Symlinks),
            "HIDDEN" => Ok(FileFilter::Hidden),
            "SEALS" => Ok(FileFilter::Seals),
            "VOLATILE" => Ok(FileFilter::Volatile),
            pattern => {
                let glob = Glob::new(pattern)
                    .map_err(|e| SealError::InvalidPattern(format!("'{}': {}", pattern, e)))?;
                Ok(FileFilter::Glob {
                    pattern: pattern.to_string(),
                    matcher: glob.compile_matcher(),
                })
            }
        }
    }

    /// Parse a comma separated list of filters, ignoring empty items
    pub fn parse_list(list: &str) -> Result<Vec<Self>> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(FileFilter::parse)
            .collect()
    }

    /// True if the entry called `name` of type `ft` should be skipped
    pub fn matches(&self, name: &str, ft: &fs::FileType) -> bool {
        match self {
            FileFilter::Symlinks => ft.is_symlink(),
            FileFilter::Hidden => utils::is_hidden(name),
            FileFilter::Seals => utils::is_seal_name(name),
            FileFilter::Volatile => (!ft.is_symlink() && !ft.is_file()) || name == ".DS_Store",
            FileFilter::Glob { matcher, .. } => matcher.is_match(name),
        }
    }
}

impl fmt::Display for FileFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileFilter::Symlinks => f.write_str("SYMLINK"),
            FileFilter::Hidden => f.write_str("HIDDEN"),
            FileFilter::Seals => f.write_str("SEALS"),
            FileFilter::Volatile => f.write_str("VOLATILE"),
            FileFilter::Glob { pattern, .. } => f.write_str(pattern),
        }
    }
}
