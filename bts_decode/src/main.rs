use anyhow::{Context, Result};
use clap::Parser;
use itertools::Itertools;
use tracing::{error, info};

use decode::config::DecodeConfig;
use plane::data::{store::ArchiveWriter, DatasetIndex};

fn main() -> Result<()> {
    let config = DecodeConfig::parse();
    decode::configure_logging(config.verbose);
    log_args(&config)?;

    if let Err(e) = plane::device::check_visible_devices_from_env(config.ngpu) {
        error!("{e}");
        std::process::exit(1);
    }
    config.backend.ensure_implemented()?;

    let model = decode::load_model(&config.model, &config.model_conf)?;
    let index = DatasetIndex::load(&config.json)
        .with_context(|| format!("unable to read manifest {}", config.json.display()))?;

    let mut writer = ArchiveWriter::create(&config.out)?;
    let count = decode::decode(&model, &index, &config.inference_options(), &mut writer)?;
    info!("wrote {count} utterances to {}", writer.scp_path().display());
    Ok(())
}

fn log_args(config: &DecodeConfig) -> Result<()> {
    let args = serde_json::to_value(config)?;
    if let Some(args) = args.as_object() {
        for (key, value) in args.iter().sorted_by(|a, b| a.0.cmp(b.0)) {
            info!("ARGS: {key}: {value}");
        }
    }
    Ok(())
}
