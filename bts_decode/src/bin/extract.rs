use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use decode::config::ExtractConfig;
use plane::data::{store::ArchiveWriter, DatasetIndex};

fn main() -> Result<()> {
    let config = ExtractConfig::parse();
    decode::configure_logging(config.verbose);
    let ngpu = config.resolved_ngpu();
    info!("{config:?}");

    if let Err(e) = plane::device::check_visible_devices_from_env(ngpu) {
        error!("{e}");
        std::process::exit(1);
    }
    config.backend.ensure_implemented()?;

    let model = decode::load_model(&config.model, &config.model_conf)?;
    let index = DatasetIndex::load(&config.feat)
        .with_context(|| format!("unable to read manifest {}", config.feat.display()))?;

    let mut writer = ArchiveWriter::create(&config.out)?;
    let count = decode::extract(&model, &index, config.extract_layer_idx, &mut writer)?;
    info!(
        "extracted layer {} for {count} utterances to {}",
        config.extract_layer_idx,
        writer.scp_path().display()
    );
    Ok(())
}
