//! # Bitseal CLI - Seal, copy and verify directory trees
//!
//! ## Usage
//! ```bash
//! # Seal a tree, writing bitseal_<date>_<time>.sealz into it
//! bitseal seal ~/photos
//!
//! # Copy a tree to two backups, sealing each copy, then verify them
//! bitseal sealed-copy --verify ~/photos -- /mnt/a/photos /mnt/b/photos
//!
//! # Verify a tree against its seal
//! bitseal verify ~/photos/bitseal_2024-05-01_101500.sealz
//! ```

use bitseal::stats::STATS_SEP;
use bitseal::utils::COPY_SEPARATOR;
use bitseal::{
    start_engine, CancelToken, Codec, EngineBuilder, FileFilter, Outcome, Priority, Result,
    Runner, SealError,
};
use clap::{Parser, Subcommand};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// First statistics line after this long
const FIRST_TICK: Duration = Duration::from_millis(166);
/// Subsequent statistics lines
const TICK: Duration = Duration::from_secs(1);

/// Bitseal CLI - seal directory trees against bit rot
#[derive(Parser)]
#[command(name = "bitseal")]
#[command(version)]
#[command(about = "Seal directory trees, copy them while sealing, and verify them against their seals")]
#[command(long_about = None)]
struct Cli {
    /// Amount of parallel streams per input device
    #[arg(long = "streams-per-input-device", visible_alias = "spid", default_value_t = 1, global = true)]
    streams_per_input_device: usize,

    /// Output verbosity: progress, info, warn, error, result or off
    #[arg(long, default_value = "info", global = true)]
    verbosity: Priority,

    /// Comma separated list of SYMLINK, HIDDEN, SEALS, VOLATILE or glob patterns to skip
    #[arg(long = "file-exclude-patterns", default_value = "SEALS", global = true)]
    file_exclude_patterns: String,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Seal one or more trees
    Seal {
        /// Seal format
        #[arg(long, default_value = "binary")]
        format: Codec,

        /// Trees to seal
        #[arg(required = true)]
        trees: Vec<PathBuf>,
    },

    /// Copy trees into destinations and seal each copy
    #[command(name = "sealed-copy")]
    SealedCopy {
        /// Verify all written seals once the copy is done
        #[arg(long)]
        verify: bool,

        /// Amount of parallel streams per output device
        #[arg(long = "streams-per-output-device", visible_alias = "spod", default_value_t = 1)]
        streams_per_output_device: usize,

        /// Seal format
        #[arg(long, default_value = "binary")]
        format: Codec,

        /// Source trees, or exactly one source and one destination
        #[arg(required = true)]
        sources: Vec<PathBuf>,

        /// Destination trees
        #[arg(last = true)]
        destinations: Vec<PathBuf>,
    },

    /// Verify trees against their seals
    Verify {
        /// Seal files to verify
        #[arg(required = true)]
        seals: Vec<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    // Set up logging
    let default_level = if cli.debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    // Disable colors if needed
    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli) {
        eprintln!("{}: {}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.cancel())
            .map_err(|e| SealError::internal(format!("cannot install signal handler: {}", e)))?;
    }

    let level = cli.verbosity;
    let builder = EngineBuilder::new()
        .streams_per_input_device(cli.streams_per_input_device)
        .level(level)
        .filters(FileFilter::parse_list(&cli.file_exclude_patterns)?)
        .cancel_token(cancel.clone());

    match cli.command {
        Commands::Seal { format, trees } => {
            let runner = builder.format(format).seal(&trees)?;
            execute(&runner, level).map(|_| ())
        }
        Commands::SealedCopy {
            verify,
            streams_per_output_device,
            format,
            sources,
            destinations,
        } => {
            let mut items = sources;
            if !destinations.is_empty() {
                items.push(PathBuf::from(COPY_SEPARATOR));
                items.extend(destinations);
            }
            let runner = builder
                .clone()
                .format(format)
                .streams_per_output_device(streams_per_output_device)
                .sealed_copy(&items)?;
            let seals = execute(&runner, level)?;

            if verify && !cancel.is_cancelled() && !seals.is_empty() {
                let runner = builder.verify(&seals)?;
                execute(&runner, level)?;
            }
            Ok(())
        }
        Commands::Verify { seals } => {
            let runner = builder.verify(&seals)?;
            execute(&runner, level).map(|_| ())
        }
    }
}

/// Run `runner`, printing its outcomes and a periodic statistics line.
///
/// Returns the seals written by the run.
fn execute(runner: &Runner, level: Priority) -> Result<Vec<PathBuf>> {
    let start = Instant::now();
    let printer = Printer::new(level);
    let ticker = (level != Priority::LogDisabled).then(|| Ticker::start(runner, printer.clone()));

    let mut seals = Vec::new();
    let res = start_engine(
        runner,
        |outcome| printer.print(outcome),
        |outcome| {
            if outcome.file_info().is_seal_marker() {
                seals.push(outcome.file_info().path.clone());
            }
            printer.print(outcome);
        },
    );

    if let Some(ticker) = ticker {
        ticker.stop();
    }
    if level.may_log(Priority::Info) {
        let elapsed = Duration::from_millis(start.elapsed().as_millis() as u64);
        println!("{}", format!("Total time: {}", format_duration(elapsed)).dimmed());
    }
    res.map(|_| seals)
}

/// Prints outcomes, coordinating with the statistics spinner
#[derive(Clone)]
struct Printer {
    level: Priority,
    bar: ProgressBar,
    last_print: Arc<Mutex<Option<Instant>>>,
}

impl Printer {
    fn new(level: Priority) -> Self {
        let bar = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
            bar.set_style(style);
        }
        Self {
            level,
            bar,
            last_print: Arc::new(Mutex::new(None)),
        }
    }

    fn print(&self, outcome: &Outcome) {
        let (msg, prio) = outcome.info();
        if msg.is_empty() || !self.level.may_log(prio) {
            return;
        }
        *self.last_print.lock() = Some(Instant::now());
        self.bar.suspend(|| match prio {
            Priority::Error => eprintln!("{}", msg.red()),
            Priority::Warn => println!("{}", msg.yellow()),
            Priority::Valuable => println!("{}", msg.green().bold()),
            Priority::Progress => println!("{}", msg.dimmed()),
            _ => println!("{}", msg),
        });
    }

    fn printed_within(&self, interval: Duration) -> bool {
        self.last_print.lock().is_some_and(|t| t.elapsed() < interval)
    }
}

/// Updates the spinner with the delta statistics of a running engine
struct Ticker {
    done: CancelToken,
    handle: Option<thread::JoinHandle<()>>,
    bar: ProgressBar,
}

impl Ticker {
    fn start(runner: &Runner, printer: Printer) -> Self {
        let done = CancelToken::new();
        let stats = Arc::clone(runner.stats());
        let bar = printer.bar.clone();

        let handle = {
            let done = done.clone();
            thread::Builder::new()
                .name("bitseal-ticker".into())
                .spawn(move || {
                    let mut prev = stats.snapshot();
                    let mut last = Instant::now();
                    let mut interval = FIRST_TICK;
                    while !done.wait_timeout(interval) {
                        let recent = printer.printed_within(interval);
                        interval = TICK;
                        if recent {
                            continue;
                        }
                        let snap = stats.snapshot();
                        let line = format!(
                            "{}{}",
                            snap.delta_string(Some(&prev), last.elapsed(), STATS_SEP),
                            snap
                        );
                        printer.bar.set_message(line);
                        printer.bar.tick();
                        prev = snap;
                        last = Instant::now();
                    }
                })
                .ok()
        };

        Self { done, handle, bar }
    }

    fn stop(mut self) {
        self.done.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.bar.finish_and_clear();
    }
}
