use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::warn;

use plane::{device::Backend, ml::model::InferenceOptions, ml::NodeValue};

#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(name = "decode", about = "Generate feature sequences from token manifests")]
pub struct DecodeConfig {
    #[arg(long, default_value_t = 0)]
    pub ngpu: usize,

    #[arg(long, default_value_t = Backend::Plane)]
    pub backend: Backend,

    #[arg(short = 'V', long, default_value_t = 0)]
    pub verbose: usize,

    /// Utterance manifest with token ids to synthesize
    #[arg(long)]
    pub json: PathBuf,

    /// Output basename; writes `<out>.ark` and `<out>.scp`
    #[arg(long)]
    pub out: PathBuf,

    #[arg(long)]
    pub model: PathBuf,

    #[arg(long)]
    pub model_conf: PathBuf,

    /// Stop probability threshold
    #[arg(long, default_value_t = 0.5)]
    pub threshold: NodeValue,

    #[arg(long, default_value_t = 5.0)]
    pub maxlenratio: NodeValue,

    #[arg(long, default_value_t = 0.0)]
    pub minlenratio: NodeValue,
}

impl DecodeConfig {
    pub fn inference_options(&self) -> InferenceOptions {
        InferenceOptions {
            threshold: self.threshold,
            maxlenratio: self.maxlenratio,
            minlenratio: self.minlenratio,
        }
    }
}

#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(name = "extract", about = "Extract hidden states of a trained model")]
pub struct ExtractConfig {
    /// Accelerator id, negative for cpu (deprecated, use --ngpu)
    #[arg(long, allow_negative_numbers = true)]
    #[serde(default)]
    pub gpu: Option<i64>,

    #[arg(long, default_value_t = 0)]
    pub ngpu: usize,

    #[arg(long, default_value_t = Backend::Plane)]
    pub backend: Backend,

    /// Output basename; writes `<out>.ark` and `<out>.scp`
    #[arg(long)]
    pub out: PathBuf,

    #[arg(short = 'V', long, default_value_t = 0)]
    pub verbose: usize,

    /// Utterance manifest to extract from
    #[arg(long)]
    pub feat: PathBuf,

    #[arg(long)]
    pub model: PathBuf,

    #[arg(long)]
    pub model_conf: PathBuf,

    /// Layer whose states are written; negative values count from the last layer
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub extract_layer_idx: isize,
}

impl ExtractConfig {
    /// Accelerator count, honouring the deprecated `--gpu` flag when given.
    pub fn resolved_ngpu(&self) -> usize {
        match self.gpu {
            Some(gpu) => {
                warn!("--gpu option will be deprecated, please use --ngpu option.");
                if gpu < 0 {
                    0
                } else {
                    1
                }
            }
            None => self.ngpu,
        }
    }
}
