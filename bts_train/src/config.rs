use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use plane::{
    data::{BatchConfig, SortPolicy},
    device::Backend,
    ml::{
        activation::OutputActivation,
        tacotron::{LossConfig, TacotronConfig},
        NodeValue,
    },
};

#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(name = "train", about = "Train a token to feature sequence model")]
pub struct TrainConfig {
    /// Number of accelerators; 0 runs on cpu
    #[arg(long, default_value_t = 0)]
    pub ngpu: usize,

    #[arg(long, default_value_t = Backend::Plane)]
    pub backend: Backend,

    /// Output directory for models, snapshots and reports
    #[arg(long)]
    pub outdir: PathBuf,

    /// Values >= 1 run replicas sequentially for reproducible reductions
    #[arg(long, default_value_t = 1)]
    pub debugmode: usize,

    #[arg(long, default_value_t = 1)]
    pub seed: u32,

    /// Resume from a snapshot file
    #[arg(short, long)]
    #[serde(default)]
    pub resume: Option<PathBuf>,

    /// Use only the first N minibatches; 0 uses all
    #[arg(short = 'N', long, default_value_t = 0)]
    pub minibatches: usize,

    #[arg(short = 'V', long, default_value_t = 0)]
    pub verbose: usize,

    #[arg(long)]
    pub train_json: PathBuf,

    #[arg(long)]
    pub valid_json: PathBuf,

    #[arg(long, default_value_t = 32)]
    pub embed_dim: usize,

    #[arg(long, default_value_t = 5.0)]
    pub frames_per_token: NodeValue,

    #[arg(long, default_value_t = 1.0)]
    pub attention_width: NodeValue,

    #[arg(long, default_value_t = 0.5)]
    pub dropout_rate: NodeValue,

    #[arg(long, default_value_t = OutputActivation::Linear)]
    pub output_activation: OutputActivation,

    /// Restrict the loss to frames before each utterance's real length
    #[arg(long, default_value_t = false)]
    #[serde(default)]
    pub use_masking: bool,

    #[arg(long, default_value_t = 1.0)]
    pub bce_pos_weight: NodeValue,

    #[arg(long, default_value_t = 1e-3)]
    pub lr: NodeValue,

    #[arg(long, default_value_t = 1e-6)]
    pub eps: NodeValue,

    #[arg(long, default_value_t = 0.0)]
    pub weight_decay: NodeValue,

    /// Gradient norm threshold to clip
    #[arg(long, default_value_t = 1.0)]
    pub grad_clip: NodeValue,

    #[arg(short = 'b', long, default_value_t = 32)]
    pub batch_size: usize,

    /// Batch size is reduced once an utterance's input exceeds this length
    #[arg(long, default_value_t = 150)]
    pub maxlen_in: usize,

    /// Batch size is reduced once an utterance's output exceeds this length
    #[arg(long, default_value_t = 400)]
    pub maxlen_out: usize,

    #[arg(long, default_value_t = SortPolicy::None)]
    pub batch_sort_key: SortPolicy,

    /// Reshuffle the order of minibatches every epoch
    #[arg(long, default_value_t = false)]
    #[serde(default)]
    pub shuffle_batch_order: bool,

    #[arg(long, default_value_t = 30)]
    pub epochs: usize,

    #[arg(long, default_value_t = 1)]
    pub eval_interval_epochs: usize,

    #[arg(long, default_value_t = 100)]
    pub log_interval: usize,

    /// Number of validation utterances whose attention is saved
    #[arg(long, default_value_t = 5)]
    pub num_save_attention: usize,

    #[arg(long, default_value_t = 1000)]
    pub plot_interval: usize,
}

impl TrainConfig {
    pub fn model_config(&self, idim: usize, odim: usize) -> TacotronConfig {
        TacotronConfig {
            idim,
            odim,
            embed_dim: self.embed_dim,
            frames_per_token: self.frames_per_token,
            attention_width: self.attention_width,
            dropout_rate: self.dropout_rate,
            output_activation: self.output_activation,
            loss: LossConfig {
                use_masking: self.use_masking,
                bce_pos_weight: self.bce_pos_weight,
            },
        }
    }

    /// Batch settings with the batch size scaled so each replica gets `batch_size` rows.
    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            batch_size: self.batch_size * self.ngpu.max(1),
            max_length_in: self.maxlen_in,
            max_length_out: self.maxlen_out,
            num_batches: self.minibatches,
            policy: self.batch_sort_key,
        }
    }
}
