//! Command line entry point of the trainer.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use dlrm_train::config::{ConfigOverrides, DlrmConfig};
use dlrm_train::{TrainError, init_logging, trainer};
use tracing_core::LevelFilter;

/// Train a DLRM on synthetic data across in-process devices.
#[derive(Parser, Debug)]
#[command(name = "dlrm-train", version, about, long_about = None)]
struct Cli {
    /// JSON configuration file; missing fields take their default value.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level, overridden by `RUST_LOG`.
    #[arg(long, default_value_t = LevelFilter::INFO)]
    log_level: LevelFilter,

    /// Also append log records to this file.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Write the effective configuration to this file and exit.
    #[arg(long)]
    save_config: Option<PathBuf>,

    #[command(flatten)]
    overrides: ConfigOverrides,
}

fn run(cli: Cli) -> Result<(), TrainError> {
    init_logging(cli.log_level, cli.log_file.as_deref())?;

    let mut config = match &cli.config {
        Some(path) => DlrmConfig::load(path)?,
        None => DlrmConfig::default(),
    };
    cli.overrides.apply(&mut config);
    config.validate()?;

    if let Some(path) = &cli.save_config {
        config.save(path)?;
        log::info!("Wrote configuration to {}", path.display());
        return Ok(());
    }

    log::info!(
        "Training on {} devices, model-parallel group length {}, tables {:?}",
        config.parallel.world_size,
        config.group_len(),
        config.arch.embedding_sizes
    );
    let summaries = trainer::launch(&config)?;
    if let Some(summary) = summaries.first() {
        log::info!(
            "Done: {} steps, {} samples, loss {:.6}, accuracy {:.3} %",
            summary.steps,
            summary.samples,
            summary.loss,
            summary.accuracy * 100.0
        );
    }
    Ok(())
}

fn main() -> ExitCode {
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
