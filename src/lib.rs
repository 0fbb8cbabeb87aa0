//! # Bitseal - Seal directory trees against bit rot
//!
//! A concurrent engine that hashes whole directory trees, records the digests
//! in a seal file inside each tree, and later verifies the trees against their
//! seals. Trees can also be copied while being sealed, so the copy is verified
//! against the digests of the data that was actually read.
//!
//! ## Overview
//!
//! Bitseal runs one of three jobs:
//! - **Seal**: hash every file below one or more trees and write a seal into each
//! - **Sealed copy**: copy source trees into destination trees, hashing while
//!   copying, and seal each destination
//! - **Verify**: re-hash the files named in one or more seals and report every
//!   file that changed or went missing
//!
//! ## Architecture
//!
//! Every job is a pipeline of three stages connected by channels:
//!
//! - **Generate**: walks source trees, or streams the records of seal files
//! - **Gather**: a pool of workers per device which read each file once and
//!   fan the data out to a SHA-1 and an MD5 digest, plus any copy destinations
//! - **Aggregate**: a single consumer which writes seals, undoes failed copies,
//!   or compares digests and classifies trees
//!
//! Disk access is governed per device: every device gets a fixed number of
//! reader (and writer) threads, so spinning disks are never hit by more
//! concurrent streams than configured.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bitseal::{start_engine, EngineBuilder};
//!
//! # fn main() -> bitseal::Result<()> {
//! let runner = EngineBuilder::new().seal(&["./photos"])?;
//! let mut seals = Vec::new();
//! start_engine(
//!     &runner,
//!     |notice| println!("{}", notice.info().0),
//!     |result| {
//!         if result.file_info().is_seal_marker() {
//!             seals.push(result.file_info().path.clone());
//!         }
//!     },
//! )?;
//!
//! // Later on
//! let runner = EngineBuilder::new().verify(&seals)?;
//! start_engine(&runner, |_| {}, |result| println!("{}", result.info().0))?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Sealed Copies
//!
//! ```rust,no_run
//! use bitseal::{start_engine, EngineBuilder};
//!
//! # fn main() -> bitseal::Result<()> {
//! let runner = EngineBuilder::new()
//!     .streams_per_output_device(2)
//!     .sealed_copy(&["./photos", "--", "/mnt/backup/photos", "/mnt/offsite/photos"])?;
//! start_engine(&runner, |_| {}, |result| println!("{}", result.info().0))?;
//! # Ok(())
//! # }
//! ```
//!
//! A destination tree that saw any failure is rolled back: everything this
//! run wrote into it is removed, and no seal is written for it.
//!
//! ## Seal Formats
//!
//! - [`Codec::Binary`]: lz4 compressed bincode records, streamed as they arrive
//! - [`Codec::Mhl`]: an XML media hash list, readable by other tools
//!
//! Both carry a SHA-1 signature over all records, so a tampered or truncated
//! seal is reported as broken instead of producing bogus results.
//!
//! ## Cancellation
//!
//! Every runner owns a [`CancelToken`]. Cancelling it stops traversal and
//! makes in-flight reads bail out. Seals are still written for the files
//! completed so far.
//!
//! ## Error Handling
//!
//! All operations return `Result<T, SealError>`. Per-file failures do not
//! abort a run; they are reported as [`Outcome`]s carrying the error, and
//! [`start_engine`] returns the last of them once the run is complete.
//!
//! ## Module Organization
//!
//! - [`engine`]: Runner construction and pipeline orchestration
//! - [`seal`]: Traversal and seal writing
//! - [`verify`]: Seal reading and classification
//! - [`gather`]: Hashing and copying workers
//! - [`io`]: Device-bound read and write controllers
//! - [`codec`]: Seal formats
//! - [`types`]: Common types and data structures
//! - [`stats`]: Run counters and their rendering
//! - [`error`]: Error types and handling

// Public API modules
pub mod cancel;
pub mod codec;
pub mod engine;
pub mod error;
pub mod gather;
pub mod io;
pub mod seal;
pub mod stats;
pub mod types;
pub mod utils;
pub mod verify;

// Internal modules (not part of public API)
mod collections;

// Re-export main types for convenience
pub use cancel::CancelToken;
pub use codec::Codec;
pub use engine::{start_engine, EngineBuilder, Runner};
pub use error::{Result, SealError};
pub use seal::SealRunner;
pub use stats::{BytesVolume, Stats, StatsSnapshot};
pub use types::*;
pub use verify::VerifyRunner;
