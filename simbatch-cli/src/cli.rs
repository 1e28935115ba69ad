//! CLI argument parsing definitions

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Set the log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Accept workers and print batches of sample lines
    Coordinator(CoordinatorArgs),

    /// Connect to a coordinator and drive the demo environment
    Worker(WorkerArgs),

    /// Configuration management commands
    Config {
        #[command(subcommand)]
        config_cmd: ConfigCommands,
    },
}

#[derive(Args, Debug, Clone)]
pub struct CoordinatorArgs {
    /// Number of batches to produce before shutting down
    #[arg(long, value_name = "N", default_value_t = 1)]
    pub batches: usize,

    /// Listening port (overrides configuration)
    #[arg(long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Number of workers to accept (overrides configuration)
    #[arg(long, value_name = "N")]
    pub nb_client: Option<usize>,

    /// Sample lines per batch (overrides configuration)
    #[arg(long, value_name = "N")]
    pub batch_size: Option<usize>,

    /// Execution model: tasks, threads (overrides configuration)
    #[arg(long, value_name = "MODEL")]
    pub concurrency: Option<String>,

    /// Let workers request predictions from the damping predictor
    #[arg(long)]
    pub allow_predictions: bool,

    /// Replay each batch once more after producing it
    #[arg(long)]
    pub replay: bool,
}

#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    /// Coordinator address (overrides configuration)
    #[arg(long, value_name = "HOST")]
    pub address: Option<String>,

    /// Coordinator port (overrides configuration)
    #[arg(long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Instance id to request; omit to let the coordinator assign one
    #[arg(long, value_name = "ID")]
    pub instance_id: Option<u32>,

    /// Directory for stored samples when the coordinator sends no location
    #[arg(long, value_name = "PATH")]
    pub store_dir: Option<PathBuf>,

    /// Keep samples in memory instead of on disk
    #[arg(long, conflicts_with = "store_dir")]
    pub memory_store: bool,

    /// Use a blocking socket on a dedicated thread
    #[arg(long)]
    pub blocking: bool,

    /// Seed for the demo environment
    #[arg(long, value_name = "SEED")]
    pub seed: Option<u64>,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        #[arg(long, value_name = "PATH")]
        config_file: PathBuf,
    },

    /// Generate a sample configuration file
    Generate {
        /// Output file path
        #[arg(long, value_name = "PATH")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },

    /// Show current configuration in use
    Show {
        /// Path to configuration file (optional, uses default loading logic)
        #[arg(long, value_name = "PATH")]
        config_file: Option<PathBuf>,

        /// Output format: yaml, json
        #[arg(long, value_name = "FORMAT", default_value = "yaml")]
        format: String,
    },
}
