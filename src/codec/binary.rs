//! Compressed binary seal format
//!
//! Layout inside an lz4 frame, each item bincode encoded:
//!
//! ```text
//! Header { magic, version }
//! Entry::Record(..)   repeated
//! Entry::End { count, signature }
//! ```
//!
//! The record count lives in the trailer, as records are streamed to the
//! encoder while the tree is still being hashed.

use super::{check_stored_path, stored_path, Signature, MD5_LEN, SHA1_LEN};
use crate::error::{Result, SealError};
use crate::types::FileInfo;
use bincode::config::{self, Configuration, LittleEndian, Limit, Varint};
use crossbeam_channel::Sender;
use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use serde::{Deserialize, Serialize};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::PathBuf;

/// Identifies a binary seal
pub const MAGIC: u32 = 0x5345_414c;
/// Current format version
pub const VERSION: u16 = 1;
/// Upper bound for the encoded size of one item
const MAX_ITEM_SIZE: usize = 64 * 1024;

/// Encoding of every item. The limit makes a corrupt length prefix a decode
/// error instead of an allocation of that length.
fn cfg() -> Configuration<LittleEndian, Varint, Limit<MAX_ITEM_SIZE>> {
    config::standard().with_limit::<MAX_ITEM_SIZE>()
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    magic: u32,
    version: u16,
}

#[derive(Debug, Serialize, Deserialize)]
struct SealRecord {
    path: String,
    size: i64,
    sha1: Vec<u8>,
    md5: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
enum Entry {
    Record(SealRecord),
    End { count: u64, signature: Vec<u8> },
}

pub(super) fn serialize<I, W>(records: I, writer: W) -> Result<()>
where
    I: IntoIterator<Item = FileInfo>,
    W: Write,
{
    let cfg = cfg();
    let mut enc = FrameEncoder::new(BufWriter::new(writer));
    bincode::serde::encode_into_std_write(
        &Header {
            magic: MAGIC,
            version: VERSION,
        },
        &mut enc,
        cfg,
    )?;

    let mut signature = Signature::default();
    for finfo in records {
        let path = stored_path(&finfo)?;
        signature.update(&path, &finfo.sha1, &finfo.md5);
        let entry = Entry::Record(SealRecord {
            path,
            size: finfo.size,
            sha1: finfo.sha1,
            md5: finfo.md5,
        });
        bincode::serde::encode_into_std_write(&entry, &mut enc, cfg)?;
    }

    let count = signature.count();
    let end = Entry::End {
        count,
        signature: signature.finish(),
    };
    bincode::serde::encode_into_std_write(&end, &mut enc, cfg)?;

    let mut inner = enc.finish()?;
    inner.flush()?;
    Ok(())
}

pub(super) fn deserialize<R, F>(reader: R, out: &Sender<FileInfo>, mut predicate: F) -> Result<()>
where
    R: Read,
    F: FnMut(&mut FileInfo) -> bool,
{
    let cfg = cfg();
    let mut dec = FrameDecoder::new(BufReader::new(reader));

    let header: Header = bincode::serde::decode_from_std_read(&mut dec, cfg)?;
    if header.magic != MAGIC {
        return Err(SealError::decode(format!(
            "not a binary seal (magic {:#x})",
            header.magic
        )));
    }
    if header.version != VERSION {
        return Err(SealError::UnsupportedVersion(header.version.to_string()));
    }

    let mut signature = Signature::default();
    loop {
        let entry: Entry = bincode::serde::decode_from_std_read(&mut dec, cfg)?;
        match entry {
            Entry::Record(rec) => {
                check_stored_path(&rec.path)?;
                if rec.sha1.len() != SHA1_LEN || rec.md5.len() != MD5_LEN {
                    return Err(SealError::decode(format!(
                        "record '{}' carries digests of invalid length",
                        rec.path
                    )));
                }
                signature.update(&rec.path, &rec.sha1, &rec.md5);

                let mut finfo = FileInfo {
                    rela_path: PathBuf::from(&rec.path),
                    path: PathBuf::from(rec.path),
                    size: rec.size,
                    sha1: rec.sha1,
                    md5: rec.md5,
                    ..Default::default()
                };
                if !predicate(&mut finfo) || out.send(finfo).is_err() {
                    return Ok(());
                }
            }
            Entry::End {
                count,
                signature: stored,
            } => {
                if count != signature.count() {
                    return Err(SealError::decode(format!(
                        "seal claims {} records, but {} were read",
                        count,
                        signature.count()
                    )));
                }
                if stored != signature.finish() {
                    return Err(SealError::SignatureMismatch);
                }
                return Ok(());
            }
        }
    }
}
