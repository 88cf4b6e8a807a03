//! CLI definitions and argument types.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use opt8::{InputFormat, Width};

/// Exit code for success.
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code for failure.
pub const EXIT_FAILURE: i32 = 1;

#[derive(Parser)]
#[command(name = "opt8")]
#[command(about = "Verified optimizer for machine-level instruction streams")]
#[command(version)]
pub struct Cli {
    /// Show metrics summary after execution
    #[arg(long, global = true)]
    pub metrics: bool,

    /// Enable verbose output (sets RUST_LOG=debug)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress output (only show errors)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub silent: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Optimize one or more functions and print the result
    Optimize {
        /// Input files, one function each
        #[arg(value_name = "FILE", required = true)]
        inputs: Vec<PathBuf>,

        /// Input format (auto = by file extension)
        #[arg(long, value_enum, default_value = "auto")]
        format: FormatArg,

        /// Pass pipeline, e.g. "const-prop,dse,dce,peephole:window=3"
        #[arg(long, value_name = "PIPELINE")]
        passes: Option<String>,

        /// Invariant setting NAME=VALUE (repeatable)
        #[arg(long = "invariant", value_name = "NAME=VALUE")]
        invariants: Vec<String>,

        /// Registers observable after return (default: all)
        #[arg(long, value_name = "REGS")]
        live_out: Option<String>,

        /// Number of proof workers (0 = auto)
        #[arg(short = 'j', long, default_value = "0")]
        jobs: usize,

        /// Solver timeout per proof obligation in milliseconds
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,

        /// Default register width of listings
        #[arg(long, value_enum, default_value = "8")]
        width: WidthArg,

        /// Maximum pipeline repetitions per function
        #[arg(long, default_value = "1")]
        rounds: usize,

        /// Write the optimized listing here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print per-pass reports
        #[arg(long)]
        report: bool,
    },
    /// Print the basic blocks and edges of a function
    Cfg {
        /// Input file
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Input format (auto = by file extension)
        #[arg(long, value_enum, default_value = "auto")]
        format: FormatArg,

        /// Default register width of listings
        #[arg(long, value_enum, default_value = "8")]
        width: WidthArg,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum, Default)]
pub enum FormatArg {
    #[default]
    Auto,
    Listing,
    Chip8,
}

impl FormatArg {
    pub fn resolve(self, path: &Path) -> InputFormat {
        match self {
            Self::Auto => InputFormat::detect(path),
            Self::Listing => InputFormat::Listing,
            Self::Chip8 => InputFormat::Chip8,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum WidthArg {
    #[value(name = "8")]
    W8,
    #[value(name = "16")]
    W16,
    #[value(name = "32")]
    W32,
    #[value(name = "64")]
    W64,
}

impl From<WidthArg> for Width {
    fn from(arg: WidthArg) -> Self {
        match arg {
            WidthArg::W8 => Self::W8,
            WidthArg::W16 => Self::W16,
            WidthArg::W32 => Self::W32,
            WidthArg::W64 => Self::W64,
        }
    }
}
