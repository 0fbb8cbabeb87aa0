//! Seal file formats
//!
//! A seal is a list of `(relative path, size, sha1, md5)` records plus a
//! signature: a SHA-1 over every record's relative path and digests, in the
//! order the records were written. Two formats are supported:
//!
//! - [`Codec::Binary`]: bincode records in an lz4 frame, extension `sealz`
//! - [`Codec::Mhl`]: an XML hash list, extension `mhl`
//!
//! Writing picks the format explicitly, reading picks it by extension.

pub mod binary;
pub mod mhl;

use crate::error::{Result, SealError};
use crate::types::FileInfo;
use crossbeam_channel::Sender;
use sha1::{Digest, Sha1};
use std::io::{Read, Write};
use std::path::{Component, Path};

/// Length of a SHA-1 digest
pub const SHA1_LEN: usize = 20;
/// Length of an MD5 digest
pub const MD5_LEN: usize = 16;

/// A seal file format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Codec {
    /// Compressed binary records
    #[default]
    Binary,
    /// XML media hash list
    Mhl,
}

impl Codec {
    const ALL: [Codec; 2] = [Codec::Binary, Codec::Mhl];

    /// File extension, without dot
    pub fn extension(self) -> &'static str {
        match self {
            Codec::Binary => "sealz",
            Codec::Mhl => "mhl",
        }
    }

    /// Name used on the command line
    pub fn name(self) -> &'static str {
        match self {
            Codec::Binary => "binary",
            Codec::Mhl => "mhl",
        }
    }

    /// All format names
    pub fn names() -> Vec<&'static str> {
        Self::ALL.iter().map(|c| c.name()).collect()
    }

    /// Look up a format by name
    pub fn by_name(name: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.name() == name)
            .ok_or_else(|| SealError::UnknownFormat(name.to_string()))
    }

    /// Look up a format by the extension of `path`
    pub fn by_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        Self::ALL
            .into_iter()
            .find(|c| c.extension() == ext)
            .ok_or_else(|| SealError::UnknownFormat(path.display().to_string()))
    }

    /// Write `records` as a seal to `writer`
    pub fn serialize<I, W>(self, records: I, writer: W) -> Result<()>
    where
        I: IntoIterator<Item = FileInfo>,
        W: Write,
    {
        match self {
            Codec::Binary => binary::serialize(records, writer),
            Codec::Mhl => mhl::serialize(records, writer),
        }
    }

    /// Read a seal and send every record to `out`.
    ///
    /// Each record passes through `predicate` first, which may adjust it.
    /// Returning false stops reading early without error, as does a closed
    /// `out` channel. Records are streamed, so a broken signature is only
    /// detected after all records were sent.
    pub fn deserialize<R, F>(self, reader: R, out: &Sender<FileInfo>, predicate: F) -> Result<()>
    where
        R: Read,
        F: FnMut(&mut FileInfo) -> bool,
    {
        match self {
            Codec::Binary => binary::deserialize(reader, out, predicate),
            Codec::Mhl => mhl::deserialize(reader, out, predicate),
        }
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Codec {
    type Err = SealError;

    fn from_str(s: &str) -> Result<Self> {
        Codec::by_name(s)
    }
}

/// Running checksum over the records of one seal
#[derive(Default)]
pub(crate) struct Signature {
    hasher: Sha1,
    count: u64,
}

impl Signature {
    pub(crate) fn update(&mut self, rela_path: &str, sha1: &[u8], md5: &[u8]) {
        self.hasher.update(rela_path.as_bytes());
        self.hasher.update(sha1);
        self.hasher.update(md5);
        self.count += 1;
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }

    pub(crate) fn finish(self) -> Vec<u8> {
        self.hasher.finalize().to_vec()
    }
}

/// The relative path of a record as stored in a seal
pub(crate) fn stored_path(finfo: &FileInfo) -> Result<String> {
    finfo
        .rela_path
        .to_str()
        .map(str::to_owned)
        .ok_or_else(|| SealError::NonUtf8Path {
            path: finfo.path.clone(),
        })
}

/// Reject stored paths which would resolve outside the sealed tree
pub(crate) fn check_stored_path(path: &str) -> Result<()> {
    let p = Path::new(path);
    if path.is_empty() || !p.components().all(|c| matches!(c, Component::Normal(_))) {
        return Err(SealError::decode(format!(
            "'{}' is not a plain relative path",
            path
        )));
    }
    Ok(())
}
