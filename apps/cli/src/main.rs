//! Spindle CLI - Command-line interface for distributed MNIST training
//!
//! Provides the `spindle` command: run a training or inference job on an
//! in-process cluster, inspect and clear its directories, and generate
//! synthetic datasets.

mod commands;
mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use spindle_training::RunConfig;
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use commands::{clean, generate, ls, run};

/// Spindle CLI - Data-parallel MNIST on an in-process cluster
#[derive(Parser, Debug)]
#[command(name = "spindle", author, version, about = "Spindle - data-parallel MNIST training and inference")]
struct Args {
    /// Log level or filter directive (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Configuration file (defaults to ./.spindlerc over ~/.spindle/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a model or run inference
    ///
    /// Clears the model (train) or output (inference) directory, starts the
    /// cluster, feeds the paired records and lists the resulting artifacts.
    Run {
        #[command(flatten)]
        config: RunConfig,

        /// Output the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// List a directory (or a single file)
    Ls {
        path: PathBuf,

        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Remove paths recursively; missing paths are ignored
    Clean {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Write a synthetic MNIST-shaped CSV dataset
    Generate {
        /// Target directory (images/ and labels/ are created inside)
        #[arg(long, default_value = "mnist/csv")]
        dir: PathBuf,

        /// Number of records
        #[arg(long, default_value_t = 600)]
        count: usize,

        /// Random seed
        #[arg(long, default_value_t = 42)]
        seed: u64,

        /// Number of part files
        #[arg(long, default_value_t = 2)]
        partitions: usize,
    },
}

/// `--log-level`, then `RUST_LOG`, then the config file, then `info`.
fn init_tracing(flag: Option<&str>, cli_config: &config::CliConfig) -> anyhow::Result<()> {
    let filter = match flag {
        Some(level) => EnvFilter::try_new(level).context("Invalid --log-level")?,
        None => EnvFilter::try_from_default_env().or_else(|_| {
            EnvFilter::try_new(cli_config.log_level.as_deref().unwrap_or("info"))
        })?,
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let cli_config = config::load_config(args.config.as_deref())?;
    init_tracing(args.log_level.as_deref(), &cli_config)?;

    match args.command {
        Command::Run { config, json } => run::execute(config, &cli_config, json).await,
        Command::Ls { path, json } => ls::execute(&path, json),
        Command::Clean { paths } => clean::execute(&paths),
        Command::Generate { dir, count, seed, partitions } => generate::execute(&dir, count, seed, partitions),
    }
}
