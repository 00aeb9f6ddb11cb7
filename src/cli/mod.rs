//! Command-line interface definitions for the `jsom` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `jsom` binary.
///
/// Every flag is optional here; values missing from the command line fall
/// back to `JSOM_*` environment variables and `jsom.toml`.
#[derive(Debug, Parser)]
#[command(
    name = "jsom",
    version,
    about = "Connect to a Jupyter notebook server on SOM-HPC"
)]
pub(crate) struct Cli {
    /// Address of the SSH login host.
    #[arg(short = 'a', long, value_name = "HOST")]
    pub(crate) address: Option<String>,
    /// SSH username.
    #[arg(short = 'u', long, value_name = "USER")]
    pub(crate) username: Option<String>,
    /// Private key file to log in with.
    #[arg(short = 'k', long, value_name = "PATH")]
    pub(crate) key: Option<String>,
    /// Conda environment containing the Jupyter server [default: jupyter].
    #[arg(short = 'c', long, value_name = "ENV")]
    pub(crate) conda: Option<String>,
    /// Memory to request for the job, for example `16G`.
    #[arg(long, value_name = "SIZE")]
    pub(crate) memory: Option<String>,
    /// Wall-clock limit for the job, for example `04:00:00`.
    #[arg(long, value_name = "TIME")]
    pub(crate) time: Option<String>,
    /// CPUs to request per task.
    #[arg(long, value_name = "N")]
    pub(crate) cpus: Option<u32>,
    /// Echo the remote session and log at debug level.
    #[arg(long)]
    pub(crate) debug: bool,
}
