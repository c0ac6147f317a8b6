//! Command-line interface for turbine

mod commands;

pub use commands::*;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Turbine - run shell scripts on the Google Cloud
///
/// Publish a list of shell commands to Pub/Sub, run them on Compute Engine
/// workers, and collect their output from Cloud Storage.
#[derive(Parser, Debug)]
#[command(name = "turbine")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Configuration file path
    #[arg(short, long, global = true, env = "TURBINE_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the topic, subscription and bucket
    Init(InitArgs),

    /// Submit a job
    Submit(SubmitArgs),

    /// Pull and run tasks on this machine
    Worker(WorkerArgs),

    /// Start Compute Engine workers for a job
    Launch(LaunchArgs),

    /// Show the progress of a job
    Status(StatusArgs),

    /// Download the results of a job
    Collect(CollectArgs),

    /// Delete the workers of a job
    Teardown(TeardownArgs),

    /// Run a job entirely on this machine
    Local(LocalArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

/// Arguments for the init command
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Skip creating the bucket
    #[arg(long)]
    pub no_bucket: bool,
}

/// Arguments for the submit command
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// Manifest file: one command per line, or a .toml manifest
    #[arg(required = true)]
    pub manifest: PathBuf,

    /// Job name (default: manifest name or file stem)
    #[arg(short, long)]
    pub name: Option<String>,

    /// Directory of support files unpacked next to every task
    #[arg(short, long)]
    pub bundle: Option<PathBuf>,

    /// Replace an existing job with the same name
    #[arg(short, long)]
    pub force: bool,
}

/// Arguments for the worker command
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Only run tasks of this job
    #[arg(short, long)]
    pub job: Option<String>,

    /// Tasks to run at once
    #[arg(short = 'n', long)]
    pub concurrency: Option<usize>,

    /// Exit after this many empty polls (0 = never)
    #[arg(long)]
    pub idle_polls: Option<u32>,

    /// Delete this Compute Engine instance after exiting idle
    #[arg(long)]
    pub shutdown_when_idle: bool,
}

/// Arguments for the launch command
#[derive(Parser, Debug)]
pub struct LaunchArgs {
    /// Job the workers are for
    #[arg(required = true)]
    pub job: String,

    /// Number of instances
    #[arg(short = 'n', long, default_value = "1")]
    pub count: usize,

    /// Empty polls before a worker shuts its instance down
    #[arg(long, default_value = "12")]
    pub idle_polls: u32,

    /// Upload this turbine binary for the workers to download
    #[arg(long)]
    pub binary: Option<PathBuf>,
}

/// Output format for status
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable pretty output
    Pretty,
    /// JSON output
    Json,
}

/// Arguments for the status command
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Job name
    #[arg(required = true)]
    pub job: String,

    /// List tasks that failed or timed out
    #[arg(long)]
    pub failed: bool,

    /// Refresh every N seconds until the job completes
    #[arg(short, long)]
    pub watch: Option<u64>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Pretty)]
    pub format: OutputFormat,
}

/// Arguments for the collect command
#[derive(Parser, Debug)]
pub struct CollectArgs {
    /// Job name
    #[arg(required = true)]
    pub job: String,

    /// Output directory (default: ./<job>)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Write a .tar.gz archive instead of a directory
    #[arg(short, long, conflicts_with = "output")]
    pub archive: Option<PathBuf>,
}

/// Arguments for the teardown command
#[derive(Parser, Debug)]
pub struct TeardownArgs {
    /// Job name
    #[arg(required = true)]
    pub job: String,

    /// Also delete the subscription and topic
    #[arg(long)]
    pub all: bool,

    /// Skip confirmation prompts
    #[arg(short = 'y', long)]
    pub yes: bool,
}

/// Arguments for the local command
#[derive(Parser, Debug)]
pub struct LocalArgs {
    /// Manifest file: one command per line, or a .toml manifest
    #[arg(required = true)]
    pub manifest: PathBuf,

    /// Job name (default: manifest name or file stem)
    #[arg(short, long)]
    pub name: Option<String>,

    /// Number of workers
    #[arg(short, long, default_value = "4")]
    pub workers: usize,

    /// Output directory (default: ./turbine-local)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Directory of support files unpacked next to every task
    #[arg(short, long)]
    pub bundle: Option<PathBuf>,

    /// Replace previous results for the same job
    #[arg(short, long)]
    pub force: bool,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Configuration subcommand
    #[command(subcommand)]
    pub command: ConfigCommands,
}

/// Configuration subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Print the configuration file path
    Path,
    /// Reset configuration to defaults
    Reset,
    /// Set a configuration value
    Set {
        /// Configuration key
        key: String,
        /// Configuration value
        value: String,
    },
    /// Get a configuration value
    Get {
        /// Configuration key
        key: String,
    },
    /// Initialize configuration file
    Init {
        /// Force overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
