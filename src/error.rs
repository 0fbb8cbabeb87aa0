//! Error types for bitseal
//!
//! Every failure that can occur while sealing, copying or verifying is
//! expressed as a [`SealError`]. Per-file failures never unwind the pipeline;
//! they travel inside an [`Outcome`](crate::types::Outcome) to the aggregation
//! stage, which classifies them with the predicates defined here.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the bitseal library
pub type Result<T> = std::result::Result<T, SealError>;

/// Main error type for all bitseal operations
#[derive(Debug, Error)]
pub enum SealError {
    /// I/O errors without further context
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// I/O errors bound to the path they occurred on
    #[error("{}: {source}", .path.display())]
    IoAt {
        /// Path the operation was performed on
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Errors during bincode serialization/deserialization
    #[error("Bincode error: {0}")]
    Bincode(String),

    /// Errors of the XML seal codec
    #[error("XML error: {0}")]
    Xml(String),

    /// Errors of the lz4 frame container
    #[error("Compression error: {0}")]
    Compression(String),

    /// The amount of bytes read differs from the size recorded before reading
    #[error("Filesize of '{}' reported as {want}, yet {got} bytes were read", .path.display())]
    SizeMismatch {
        /// File that changed its size
        path: PathBuf,
        /// Size recorded by traversal or seal
        want: i64,
        /// Amount of bytes actually streamed
        got: i64,
    },

    /// Freshly computed digest differs from the sealed one
    #[error("HASH MISMATCH: {}", .path.display())]
    HashMismatch {
        /// File whose content changed
        path: PathBuf,
    },

    /// The seal's self-checksum does not match its records
    #[error("Signature mismatch")]
    SignatureMismatch,

    /// A seal could not be decoded
    #[error("Failed to decode seal: {0}")]
    Decode(String),

    /// Seal was written by an incompatible version
    #[error("Cannot handle seal file: invalid header version: {0}")]
    UnsupportedVersion(String),

    /// The same relative path was produced twice for one tree
    #[error("Path '{}' was handled multiple times - ignoring occurrence", .path.display())]
    DuplicatePath {
        /// The offending path
        path: PathBuf,
    },

    /// A path that cannot be stored in a seal without losing information
    #[error("Cannot seal '{}': name is not valid UTF-8", .path.display())]
    NonUtf8Path {
        /// The offending path
        path: PathBuf,
    },

    /// A read was interrupted by the cancellation token
    #[error("{}", cancelled_message(.path))]
    Cancelled {
        /// File that was being read, if reading from a path
        path: Option<PathBuf>,
    },

    /// Invalid job description
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A file filter could not be parsed
    #[error("Invalid file filter: {0}")]
    InvalidPattern(String),

    /// Unknown seal format name or extension
    #[error("Unknown seal format: '{0}'")]
    UnknownFormat(String),

    /// An error-priority outcome without an attached error, e.g. an omitted seal
    #[error("{0}")]
    Failed(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

fn cancelled_message(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => format!("Reading of '{}' cancelled", path.display()),
        None => "Reading cancelled by user".to_string(),
    }
}

impl From<bincode::error::DecodeError> for SealError {
    fn from(err: bincode::error::DecodeError) -> Self {
        SealError::Bincode(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for SealError {
    fn from(err: bincode::error::EncodeError) -> Self {
        SealError::Bincode(err.to_string())
    }
}

impl From<lz4_flex::frame::Error> for SealError {
    fn from(err: lz4_flex::frame::Error) -> Self {
        SealError::Compression(err.to_string())
    }
}

impl SealError {
    /// Attach a path to an I/O error
    pub fn io_at(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SealError::IoAt {
            path: path.into(),
            source,
        }
    }

    /// Create a decode error with a custom message
    pub fn decode(msg: impl Into<String>) -> Self {
        SealError::Decode(msg.into())
    }

    /// Create a configuration error with a custom message
    pub fn config(msg: impl Into<String>) -> Self {
        SealError::InvalidConfiguration(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        SealError::Internal(msg.into())
    }

    /// The I/O error kind, if this is an I/O error
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            SealError::Io(e) | SealError::IoAt { source: e, .. } => Some(e.kind()),
            _ => None,
        }
    }

    /// True if the file could not be found or accessed at all
    pub fn is_missing(&self) -> bool {
        matches!(
            self.io_kind(),
            Some(io::ErrorKind::NotFound) | Some(io::ErrorKind::PermissionDenied)
        )
    }

    /// True if the destination already existed and was left untouched
    pub fn is_already_exists(&self) -> bool {
        self.io_kind() == Some(io::ErrorKind::AlreadyExists)
    }

    /// True if the file changed its length
    pub fn is_size_mismatch(&self) -> bool {
        matches!(self, SealError::SizeMismatch { .. })
    }

    /// True if the seal itself cannot be trusted anymore
    pub fn is_seal_broken(&self) -> bool {
        matches!(
            self,
            SealError::SignatureMismatch
                | SealError::Decode(_)
                | SealError::UnsupportedVersion(_)
                | SealError::Bincode(_)
                | SealError::Xml(_)
                | SealError::Compression(_)
        )
    }

    /// True if the operation stopped because of cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SealError::Cancelled { .. })
    }

    /// Produce an equivalent error for another consumer.
    ///
    /// I/O errors keep their kind, so classification of the copy matches the original.
    pub fn replicate(&self) -> SealError {
        match self {
            SealError::Io(e) => SealError::Io(io::Error::new(e.kind(), e.to_string())),
            SealError::IoAt { path, source } => SealError::IoAt {
                path: path.clone(),
                source: io::Error::new(source.kind(), source.to_string()),
            },
            SealError::SizeMismatch { path, want, got } => SealError::SizeMismatch {
                path: path.clone(),
                want: *want,
                got: *got,
            },
            SealError::HashMismatch { path } => SealError::HashMismatch { path: path.clone() },
            SealError::DuplicatePath { path } => SealError::DuplicatePath { path: path.clone() },
            SealError::NonUtf8Path { path } => SealError::NonUtf8Path { path: path.clone() },
            SealError::Cancelled { path } => SealError::Cancelled { path: path.clone() },
            SealError::SignatureMismatch => SealError::SignatureMismatch,
            SealError::Bincode(m) => SealError::Bincode(m.clone()),
            SealError::Xml(m) => SealError::Xml(m.clone()),
            SealError::Compression(m) => SealError::Compression(m.clone()),
            SealError::Decode(m) => SealError::Decode(m.clone()),
            SealError::UnsupportedVersion(m) => SealError::UnsupportedVersion(m.clone()),
            SealError::InvalidConfiguration(m) => SealError::InvalidConfiguration(m.clone()),
            SealError::InvalidPattern(m) => SealError::InvalidPattern(m.clone()),
            SealError::UnknownFormat(m) => SealError::UnknownFormat(m.clone()),
            SealError::Failed(m) => SealError::Failed(m.clone()),
            SealError::Internal(m) => SealError::Internal(m.clone()),
        }
    }
}
