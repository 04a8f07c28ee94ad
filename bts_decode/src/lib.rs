use std::path::Path;

use tracing::{info, instrument, metadata::LevelFilter, warn};
use tracing_subscriber::EnvFilter;

use plane::{
    checkpoint::{load_weights, RunConfig},
    data::{store::FeatureWriter, DatasetIndex},
    ml::{
        linear::Linear,
        model::{InferenceOptions, Synthesizer, Trainable},
        tacotron::Tacotron,
        RngStrategy,
    },
    Error, Result,
};

pub mod config;

/// Rebuilds a model from its run config and weights, ready for inference.
pub fn load_model<P: AsRef<Path>, Q: AsRef<Path>>(model: P, model_conf: Q) -> Result<Tacotron> {
    let run = RunConfig::load(model_conf)?;
    info!("model dims: idim = {}, odim = {}", run.idim, run.odim);

    let mut tacotron = Tacotron::new(run.model, &RngStrategy::default())?;
    load_weights(model, tacotron.parameters_mut())?;
    tacotron.set_training(false);
    Ok(tacotron)
}

/// Generates a feature sequence for every utterance in `index`, writing each under its id.
#[instrument(level = "debug", skip_all, fields(utterances = index.len()))]
pub fn decode<S, W>(
    model: &S,
    index: &DatasetIndex,
    options: &InferenceOptions,
    writer: &mut W,
) -> Result<usize>
where
    S: Synthesizer + ?Sized,
    W: FeatureWriter + ?Sized,
{
    run_each(model, index, writer, |tokens| {
        model.inference(tokens, options).map(|generated| generated.outs)
    })
}

/// Writes the hidden states at `layer` for every utterance in `index`.
#[instrument(level = "debug", skip_all, fields(utterances = index.len(), layer))]
pub fn extract<S, W>(
    model: &S,
    index: &DatasetIndex,
    layer: isize,
    writer: &mut W,
) -> Result<usize>
where
    S: Synthesizer + ?Sized,
    W: FeatureWriter + ?Sized,
{
    let options = InferenceOptions::default();
    run_each(model, index, writer, |tokens| {
        model.hidden_states(tokens, layer, &options)
    })
}

fn run_each<S, W, F>(model: &S, index: &DatasetIndex, writer: &mut W, mut generate: F) -> Result<usize>
where
    S: Synthesizer + ?Sized,
    W: FeatureWriter + ?Sized,
    F: FnMut(&[usize]) -> Result<Linear>,
{
    let eos = model
        .idim()
        .checked_sub(1)
        .ok_or_else(|| Error::Configuration("model has an empty input vocabulary".to_string()))?;

    let total = index.len();
    for (idx, record) in index.iter().enumerate() {
        let mut tokens = record.tokens.clone();
        tokens.push(eos);

        let outs = generate(&tokens)?;
        info!(
            "({}/{}) {} (size:{}->{})",
            idx + 1,
            total,
            record.id,
            tokens.len(),
            outs.count()
        );
        writer.write(&record.id, &outs)?;
    }
    writer.finish()?;
    Ok(total)
}

pub fn configure_logging(verbose: usize) {
    let level = if verbose > 0 {
        LevelFilter::INFO
    } else {
        LevelFilter::WARN
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
