//! CLI command definitions for the `seqflow` binary.

pub mod checkpoints;
pub mod run;
pub mod summary;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use seqflow_types::config::{BackendKind, EngineCount, SchedulerFamily};

/// Run sequencing analysis pipelines locally, through a job broker, or on a
/// grid-scheduled engine pool.
#[derive(Parser)]
#[command(name = "seqflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log line format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run pipeline stages over a set of samples.
    Run(RunArgs),

    /// List checkpoints recorded in the working directory.
    Checkpoints {
        /// System configuration file.
        #[arg(short, long, default_value = "seqflow.toml")]
        config: PathBuf,

        /// Backend whose checkpoints to list (defaults to the configured one).
        #[arg(long)]
        backend: Option<BackendKind>,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[derive(clap::Args)]
pub struct RunArgs {
    /// System configuration file.
    #[arg(short, long, default_value = "seqflow.toml")]
    pub config: PathBuf,

    /// Directory to discover sample inputs from.
    #[arg(long)]
    pub input_dir: Option<PathBuf>,

    /// Run description with samples and stage definitions.
    #[arg(long)]
    pub run: Option<PathBuf>,

    /// Stages to run, in order (defaults to every defined stage).
    #[arg(long = "stage", value_name = "NAME")]
    pub stages: Vec<String>,

    /// Execution backend.
    #[arg(long)]
    pub backend: Option<BackendKind>,

    /// Total cores to use (defaults to every core on this machine).
    #[arg(long)]
    pub cores: Option<u32>,

    /// Grid scheduler for the cluster backend.
    #[arg(long)]
    pub scheduler: Option<SchedulerFamily>,

    /// Scheduler queue for the cluster backend.
    #[arg(long)]
    pub queue: Option<String>,

    /// Engines to start, or "all" for every free slot but one.
    #[arg(long)]
    pub num_jobs: Option<EngineCount>,
}
