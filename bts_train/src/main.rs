use anyhow::Result;
use clap::Parser;
use itertools::Itertools;
use tracing::{error, info, metadata::LevelFilter, warn};
use tracing_subscriber::EnvFilter;

use config::TrainConfig;

mod config;
mod evaluate;
mod report;
mod training;

fn main() -> Result<()> {
    let config = TrainConfig::parse();
    configure_logging(config.verbose);
    log_args(&config)?;

    if let Err(e) = plane::device::check_visible_devices_from_env(config.ngpu) {
        error!("{e}");
        std::process::exit(1);
    }
    config.backend.ensure_implemented()?;

    training::run_training(&config)
}

fn configure_logging(verbose: usize) {
    let level = match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        _ => LevelFilter::DEBUG,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt()
        .compact()
        .with_target(false)
        .with_env_filter(filter)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("logging was already configured");
    }
    if verbose == 0 {
        warn!("Skip DEBUG/INFO messages");
    }
}

fn log_args(config: &TrainConfig) -> Result<()> {
    let args = serde_json::to_value(config)?;
    if let Some(args) = args.as_object() {
        for (key, value) in args.iter().sorted_by(|a, b| a.0.cmp(b.0)) {
            info!("ARGS: {key}: {value}");
        }
    }
    Ok(())
}
