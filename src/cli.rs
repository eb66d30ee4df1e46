//! CLI surface. The front end itself — argument parsing,
//! daemonisation, the signal-wait loop — is an external collaborator per
//! this module is the thin, real glue that wires it to the core.

use clap::{Parser, ValueEnum};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SortOrder {
    Open,
    Path,
    Disk,
    Size,
}

/// Builds a pack of files and page ranges to warm on the next boot.
#[derive(Debug, Parser)]
#[command(name = "coldcache", version, about)]
pub struct Args {
    /// Mount path to trace; defaults to `/`.
    #[arg(default_value = "/")]
    pub mount: PathBuf,

    /// Run as a daemon: fork, with the parent exiting immediately.
    #[arg(long)]
    pub daemon: bool,

    /// Ignore any existing pack and re-trace from scratch.
    #[arg(long)]
    pub force_trace: bool,

    /// How long to collect trace data for, in seconds.
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<u64>,

    /// Print an existing pack instead of tracing.
    #[arg(long)]
    pub dump: bool,

    /// Sort order for `--dump` output.
    #[arg(long, value_enum)]
    pub sort: Option<SortOrder>,

    /// Rewrite traced paths under this prefix when they exist on its device.
    #[arg(long, value_name = "PREFIX")]
    pub path_prefix: Option<PathBuf>,

    /// Only trace paths starting with this prefix.
    #[arg(long, value_name = "PREFIX")]
    pub path_prefix_filter: Option<String>,

    /// Write (or read, with --dump) this exact pack file.
    #[arg(long, value_name = "PATH")]
    pub pack_file: Option<PathBuf>,

    /// Don't enable/disable trace events; assume they're already configured.
    #[arg(long)]
    pub use_existing_trace_events: bool,

    /// Treat the traced device as non-rotational regardless of what it reports.
    #[arg(long)]
    pub force_ssd_mode: bool,

    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,
}

impl Args {
    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }
}

/// Exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    BadArgs = 1,
    CannotComputePackFilename = 2,
    ReplayError = 3,
    PackReadError = 4,
    TraceError = 5,
}
