//! # CLI Interface
//!
//! Defines the command-line argument structure for `obol-node` using
//! `clap` derive. Supports two subcommands: `demo` and `version`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// OBOL protocol operations binary.
///
/// Runs deterministic, scripted scenarios against an in-memory instance of
/// the protocol engine: opening positions, accruing interest, liquidating,
/// and redeeming through the limit-order book. Useful for demos, parameter
/// exploration, and smoke-testing a release build.
#[derive(Parser, Debug)]
#[command(
    name = "obol-node",
    about = "OBOL credit protocol operations binary",
    version,
    propagate_version = true
)]
pub struct ObolNodeCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the OBOL node binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the scripted demo scenario against a fresh in-memory engine.
    Demo(DemoArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `demo` subcommand.
#[derive(Parser, Debug)]
pub struct DemoArgs {
    /// Log output format: "pretty" or "json".
    #[arg(long, env = "OBOL_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,

    /// Write the final engine state as JSON to this path.
    ///
    /// When omitted, the state dump is skipped.
    #[arg(long, short = 'o', env = "OBOL_STATE_OUT")]
    pub state_out: Option<PathBuf>,

    /// Seconds of simulated interest accrual between scenario acts.
    #[arg(long, default_value_t = 31_536_000)]
    pub accrual_secs: u64,
}
