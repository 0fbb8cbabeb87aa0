//! XML media hash list format
//!
//! ```xml
//! <hashlist version="1.0">
//!   <creatorinfo>...</creatorinfo>
//!   <hash>
//!     <file>dir/file.bin</file>
//!     <size>42</size>
//!     <sha1>...</sha1>
//!     <md5>...</md5>
//!   </hash>
//!   <signature><sha1>...</sha1></signature>
//! </hashlist>
//! ```
//!
//! Unlike the binary format, the whole list is held in memory, so the
//! signature is validated before any record is handed out.

use super::{check_stored_path, stored_path, Signature, MD5_LEN, SHA1_LEN};
use crate::error::{Result, SealError};
use crate::types::FileInfo;
use chrono::Local;
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;

/// The only supported hash list version
pub const VERSION: &str = "1.0";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "hashlist")]
struct HashList {
    #[serde(rename = "@version")]
    version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    creatorinfo: Option<CreatorInfo>,
    #[serde(rename = "hash", default)]
    hashes: Vec<HashEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signature: Option<SignatureElement>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CreatorInfo {
    #[serde(default)]
    hostname: String,
    #[serde(default)]
    tool: String,
    #[serde(default)]
    startdate: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct HashEntry {
    file: String,
    size: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    sha1: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    md5: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SignatureElement {
    sha1: String,
}

impl CreatorInfo {
    fn current() -> Self {
        Self {
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_default(),
            tool: format!("bitseal {}", env!("CARGO_PKG_VERSION")),
            startdate: Local::now().to_rfc3339(),
        }
    }
}

pub(super) fn serialize<I, W>(records: I, mut writer: W) -> Result<()>
where
    I: IntoIterator<Item = FileInfo>,
    W: Write,
{
    let mut signature = Signature::default();
    let hashes = records
        .into_iter()
        .map(|finfo| {
            let file = stored_path(&finfo)?;
            signature.update(&file, &finfo.sha1, &finfo.md5);
            Ok(HashEntry {
                file,
                size: finfo.size,
                sha1: hex::encode(&finfo.sha1),
                md5: hex::encode(&finfo.md5),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let list = HashList {
        version: VERSION.to_string(),
        creatorinfo: Some(CreatorInfo::current()),
        hashes,
        signature: Some(SignatureElement {
            sha1: hex::encode(signature.finish()),
        }),
    };

    let mut xml = String::new();
    let mut ser = quick_xml::se::Serializer::with_root(&mut xml, Some("hashlist"))
        .map_err(|e| SealError::Xml(e.to_string()))?;
    ser.indent(' ', 2);
    list.serialize(ser)
        .map_err(|e| SealError::Xml(e.to_string()))?;

    writer.write_all(b"<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n")?;
    writer.write_all(xml.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

fn decode_digest(file: &str, kind: &str, hex_digest: &str, len: usize) -> Result<Vec<u8>> {
    if hex_digest.is_empty() {
        return Ok(Vec::new());
    }
    let bytes = hex::decode(hex_digest.trim())
        .map_err(|e| SealError::decode(format!("{} of '{}': {}", kind, file, e)))?;
    if bytes.len() != len {
        return Err(SealError::decode(format!(
            "{} of '{}' has {} bytes, expected {}",
            kind,
            file,
            bytes.len(),
            len
        )));
    }
    Ok(bytes)
}

fn to_file_info(entry: HashEntry) -> Result<FileInfo> {
    if entry.file.is_empty() {
        return Err(SealError::decode("hash entry without file name"));
    }
    check_stored_path(&entry.file)?;
    if entry.size < 0 {
        return Err(SealError::decode(format!(
            "'{}' has negative size {}",
            entry.file, entry.size
        )));
    }
    let sha1 = decode_digest(&entry.file, "sha1", &entry.sha1, SHA1_LEN)?;
    let md5 = decode_digest(&entry.file, "md5", &entry.md5, MD5_LEN)?;
    if sha1.is_empty() && md5.is_empty() {
        return Err(SealError::decode(format!("'{}' carries no digest", entry.file)));
    }

    Ok(FileInfo {
        path: PathBuf::from(&entry.file),
        rela_path: PathBuf::from(entry.file),
        size: entry.size,
        sha1,
        md5,
        ..Default::default()
    })
}

pub(super) fn deserialize<R, F>(reader: R, out: &Sender<FileInfo>, mut predicate: F) -> Result<()>
where
    R: Read,
    F: FnMut(&mut FileInfo) -> bool,
{
    let list: HashList = quick_xml::de::from_reader(BufReader::new(reader))
        .map_err(|e| SealError::Xml(e.to_string()))?;
    if list.version != VERSION {
        return Err(SealError::UnsupportedVersion(list.version));
    }

    let records = list
        .hashes
        .into_iter()
        .map(to_file_info)
        .collect::<Result<Vec<_>>>()?;

    if let Some(stored) = list.signature {
        let mut signature = Signature::default();
        for finfo in &records {
            signature.update(&stored_path(finfo)?, &finfo.sha1, &finfo.md5);
        }
        if !stored.sha1.trim().eq_ignore_ascii_case(&hex::encode(signature.finish())) {
            return Err(SealError::SignatureMismatch);
        }
    }

    for mut finfo in records {
        if !predicate(&mut finfo) || out.send(finfo).is_err() {
            break;
        }
    }
    Ok(())
}
