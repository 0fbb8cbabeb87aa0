//! Process-wide counters shared by every stage of a run
//!
//! Workers only ever add to or subtract from the atomics in [`Stats`]. A
//! reporter takes a [`StatsSnapshot`] and renders the difference to a previous
//! snapshot with [`StatsSnapshot::delta_string`].

use humantime::format_duration;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Symbol for rates
pub const SYMBOL_DELTA: &str = "Δ";
/// Symbol for counts
pub const SYMBOL_HASH: &str = "⌗";
/// Symbol for totals
pub const SYMBOL_TOTAL: &str = "Σ";
/// Symbol for wall-clock time
pub const SYMBOL_WALLCLOCK: &str = "⌚";
/// Separator between the fields of a statistics line
pub const STATS_SEP: &str = " | ";

/// Shared counters of one engine run
#[derive(Debug, Default)]
pub struct Stats {
    /// Whole files read so far
    pub total_files_read: AtomicU32,
    /// Whole files written so far
    pub total_files_written: AtomicU32,
    /// Files currently being read
    pub files_being_read: AtomicU32,
    /// Files currently being written
    pub files_being_written: AtomicU32,
    /// Bytes read, over all input streams
    pub bytes_read: AtomicU64,
    /// Bytes written, over all output streams
    pub bytes_written: AtomicU64,
    /// Bytes fed into hash accumulators, counted once per active hasher, so
    /// hashing one byte with SHA-1 and MD5 counts two
    pub bytes_hashed: AtomicU64,
    /// Hash accumulators currently alive
    pub num_hashers: AtomicU32,
    /// Entries skipped by traversal
    pub num_skipped: AtomicU32,
    /// Gather workers that lost every destination
    pub stop_the_engines: AtomicU32,
    /// Errors seen by aggregation
    pub err_count: AtomicU32,
    /// Files removed again because their tree failed
    pub num_undone: AtomicU32,
    /// True once aggregation noticed cancellation
    pub was_cancelled: AtomicBool,
    started_at: Mutex<Option<Instant>>,
}

impl Stats {
    /// Create zeroed statistics
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the start of a run
    pub fn mark_started(&self) {
        *self.started_at.lock() = Some(Instant::now());
    }

    /// Time since [`Stats::mark_started`], zero if never started
    pub fn elapsed(&self) -> Duration {
        self.started_at
            .lock()
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }

    /// Copy all counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_files_read: self.total_files_read.load(Ordering::Relaxed),
            total_files_written: self.total_files_written.load(Ordering::Relaxed),
            files_being_read: self.files_being_read.load(Ordering::Relaxed),
            files_being_written: self.files_being_written.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_hashed: self.bytes_hashed.load(Ordering::Relaxed),
            num_hashers: self.num_hashers.load(Ordering::Relaxed),
            num_skipped: self.num_skipped.load(Ordering::Relaxed),
            stop_the_engines: self.stop_the_engines.load(Ordering::Relaxed),
            err_count: self.err_count.load(Ordering::Relaxed),
            num_undone: self.num_undone.load(Ordering::Relaxed),
            was_cancelled: self.was_cancelled.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
        }
    }
}

pub(crate) fn inc(counter: &AtomicU32) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn dec(counter: &AtomicU32) {
    counter.fetch_sub(1, Ordering::Relaxed);
}

pub(crate) fn add_bytes(counter: &AtomicU64, n: usize) {
    counter.fetch_add(n as u64, Ordering::Relaxed);
}

/// A plain copy of [`Stats`], taken at one point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub total_files_read: u32,
    pub total_files_written: u32,
    pub files_being_read: u32,
    pub files_being_written: u32,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub bytes_hashed: u64,
    pub num_hashers: u32,
    pub num_skipped: u32,
    pub stop_the_engines: u32,
    pub err_count: u32,
    pub num_undone: u32,
    pub was_cancelled: bool,
    pub elapsed: Duration,
}

impl StatsSnapshot {
    /// The greater of files read and files written
    pub fn most_files(&self) -> u32 {
        self.total_files_read.max(self.total_files_written)
    }

    /// Render a single statistics line.
    ///
    /// With `prev` set, rates are computed over `td` relative to `prev` and
    /// unchanged rates are omitted. Without it, the line summarizes the whole
    /// run and rates are averages.
    pub fn delta_string(&self, prev: Option<&StatsSnapshot>, td: Duration, sep: &str) -> String {
        let result_mode = prev.is_none();
        let zero = StatsSnapshot::default();
        let prev = prev.unwrap_or(&zero);
        let secs = td.as_secs_f64().max(f64::EPSILON);

        let int_delta = |cur: u32, before: u32| -> String {
            if cur == before && !result_mode {
                return String::new();
            }
            let rate = cur.saturating_sub(before) as f64 / secs;
            format!(" {}{}{:04}/s", SYMBOL_HASH, SYMBOL_DELTA, rate as u64)
        };
        let bytes_delta = |cur: u64, before: u64| -> String {
            if cur == before && !result_mode {
                return String::new();
            }
            let rate = cur.saturating_sub(before) as f64 / secs;
            format!(" {}{}/s", SYMBOL_DELTA, BytesVolume(rate as u64))
        };
        let in_out = |n: u32| if n == 0 { "  ".to_string() } else { format!("{} ", n) };

        let elapsed = if result_mode {
            format_duration(Duration::from_millis(self.elapsed.as_millis() as u64)).to_string()
        } else {
            format!("{:4.0}s", self.elapsed.as_secs_f64())
        };
        let mut out = format!("{}  {}", SYMBOL_WALLCLOCK, elapsed);

        if self.total_files_read > 0 || self.files_being_read > 0 {
            out.push_str(&format!(
                "{}{}->READ {}{:04}{} {}{}{}",
                sep,
                in_out(self.files_being_read),
                SYMBOL_HASH,
                self.total_files_read,
                int_delta(self.total_files_read, prev.total_files_read),
                SYMBOL_TOTAL,
                BytesVolume(self.bytes_read),
                bytes_delta(self.bytes_read, prev.bytes_read),
            ));
        }

        out.push_str(&format!(
            "{}{}HASH {}{}{}",
            sep,
            in_out(self.num_hashers),
            SYMBOL_HASH,
            BytesVolume(self.bytes_hashed),
            bytes_delta(self.bytes_hashed, prev.bytes_hashed),
        ));

        if self.total_files_written > 0 || self.files_being_written > 0 {
            out.push_str(&format!(
                "{}{}WRITE {}{:04}{} {}{}{}",
                sep,
                in_out(self.files_being_written),
                SYMBOL_HASH,
                self.total_files_written,
                int_delta(self.total_files_written, prev.total_files_written),
                SYMBOL_TOTAL,
                BytesVolume(self.bytes_written),
                bytes_delta(self.bytes_written, prev.bytes_written),
            ));
        }

        out
    }
}

/// Renders as ` (2 errors, 1 skipped, cancelled)`, or nothing if all is well
impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tokens = Vec::new();
        if self.err_count > 0 {
            tokens.push(format!("{} errors", self.err_count));
        }
        if self.num_skipped > 0 {
            tokens.push(format!("{} skipped", self.num_skipped));
        }
        if self.num_undone > 0 {
            tokens.push(format!("{} undone", self.num_undone));
        }
        if self.was_cancelled {
            tokens.push("cancelled".to_string());
        }
        if tokens.is_empty() {
            return Ok(());
        }
        write!(f, " ({})", tokens.join(", "))
    }
}

/// An amount of bytes, displayed with a binary unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct BytesVolume(pub u64);

impl fmt::Display for BytesVolume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const KIB: u64 = 1024;
        let (divider, unit) = match self.0 {
            b if b < KIB << 10 => (KIB, "KiB"),
            b if b < KIB << 20 => (KIB << 10, "MiB"),
            b if b < KIB << 30 => (KIB << 20, "GiB"),
            b if b < KIB << 40 => (KIB << 30, "TiB"),
            _ => (KIB << 40, "PiB"),
        };
        write!(f, "{:6.2}{}", self.0 as f64 / divider as f64, unit)
    }
}
