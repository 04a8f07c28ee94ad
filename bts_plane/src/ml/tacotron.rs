use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::{
    data::Batch,
    ml::{
        activation::OutputActivation,
        bce_with_logits,
        linear::Linear,
        model::{Generated, InferenceOptions, Observation, Synthesizer, Trainable},
        param::Parameter,
        rand_normal, sigmoid, NodeValue, RngStrategy, RNG,
    },
    Error, Result,
};

const EMBED: usize = 0;
const FEAT_OUT_WEIGHT: usize = 1;
const FEAT_OUT_BIAS: usize = 2;
const PROB_OUT_WEIGHT: usize = 3;
const PROB_OUT_BIAS: usize = 4;
const PROB_OUT_PROGRESS: usize = 5;

const HIDDEN_LAYERS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossConfig {
    /// Only count frames before each row's real length.
    pub use_masking: bool,
    /// Weight on stop-token positives in the binary cross entropy.
    pub bce_pos_weight: NodeValue,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            use_masking: false,
            bce_pos_weight: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TacotronConfig {
    pub idim: usize,
    pub odim: usize,
    pub embed_dim: usize,
    /// Frames the attention window advances per token.
    pub frames_per_token: NodeValue,
    /// Standard deviation of the attention window, in tokens.
    pub attention_width: NodeValue,
    pub dropout_rate: NodeValue,
    pub output_activation: OutputActivation,
    pub loss: LossConfig,
}

impl TacotronConfig {
    pub fn new(idim: usize, odim: usize) -> Self {
        Self {
            idim,
            odim,
            embed_dim: 32,
            frames_per_token: 5.0,
            attention_width: 1.0,
            dropout_rate: 0.5,
            output_activation: OutputActivation::default(),
            loss: LossConfig::default(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.idim == 0 || self.odim == 0 || self.embed_dim == 0 {
            return Err(Error::Configuration(format!(
                "model dims must be positive (idim={}, odim={}, embed_dim={})",
                self.idim, self.odim, self.embed_dim
            )));
        }
        if !(self.frames_per_token > 0.0) || !(self.attention_width > 0.0) {
            return Err(Error::Configuration(
                "frames per token and attention width must be positive".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(Error::Configuration(format!(
                "dropout rate must be in [0, 1), got {}",
                self.dropout_rate
            )));
        }
        Ok(())
    }
}

/// Token to feature-frame model with a fixed monotonic attention window.
///
/// Frame `t` attends to tokens around position `t / frames_per_token` with
/// Gaussian weights. The attended embedding is projected to the output
/// features and to a stop-token logit, which also sees how far through the
/// input the window has moved.
#[derive(Clone)]
pub struct Tacotron {
    config: TacotronConfig,
    params: Vec<Parameter>,
    training: bool,
    rng: Arc<dyn RNG>,
}

impl std::fmt::Debug for Tacotron {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tacotron")
            .field("config", &self.config)
            .field("params", &self.params.len())
            .field("training", &self.training)
            .finish()
    }
}

struct Frame {
    alpha: Vec<NodeValue>,
    context: Vec<NodeValue>,
    mask: Option<Vec<NodeValue>>,
    output: Vec<NodeValue>,
    logit: NodeValue,
    progress: NodeValue,
}

impl Tacotron {
    pub fn new(config: TacotronConfig, rng: &RngStrategy) -> Result<Self> {
        config.validate()?;
        let rng = rng.to_arc();
        let scale = 1.0 / (config.embed_dim as NodeValue).sqrt();
        let normal = |count: usize, stride: usize, sigma: NodeValue| {
            Linear::from_iter(
                stride,
                (0..count * stride).map(|_| rand_normal(0.0, sigma, rng.as_ref())),
            )
        };

        let params = vec![
            Parameter::new("embed", normal(config.idim, config.embed_dim, 1.0)?),
            Parameter::new("feat_out.weight", normal(config.embed_dim, config.odim, scale)?),
            Parameter::new("feat_out.bias", Linear::new(1, config.odim)),
            Parameter::new("prob_out.weight", normal(1, config.embed_dim, scale)?),
            Parameter::new("prob_out.bias", Linear::new(1, 1)),
            Parameter::new("prob_out.progress", Linear::new(1, 1)),
        ];
        debug!(
            "built model with {} parameters",
            params.iter().map(|x| x.value().values().len()).sum::<usize>()
        );

        Ok(Self {
            config,
            params,
            training: true,
            rng,
        })
    }

    pub fn config(&self) -> &TacotronConfig {
        &self.config
    }

    fn check_tokens(&self, tokens: &[usize]) -> Result<()> {
        if tokens.is_empty() {
            return Err(Error::Shape("empty token sequence".to_string()));
        }
        match tokens.iter().find(|&&x| x >= self.config.idim) {
            Some(token) => Err(Error::Shape(format!(
                "token id {token} out of range for vocabulary of {}",
                self.config.idim
            ))),
            None => Ok(()),
        }
    }

    fn attention_row(&self, t: usize, n: usize) -> Vec<NodeValue> {
        let center = t as NodeValue / self.config.frames_per_token;
        let width = 2.0 * self.config.attention_width.powi(2);
        let logits: Vec<NodeValue> = (0..n)
            .map(|i| -(i as NodeValue - center).powi(2) / width)
            .collect();
        let max = logits.iter().copied().fold(NodeValue::NEG_INFINITY, NodeValue::max);
        let exp: Vec<NodeValue> = logits.iter().map(|x| (x - max).exp()).collect();
        let sum: NodeValue = exp.iter().sum();
        exp.into_iter().map(|x| x / sum).collect()
    }

    fn dropout_mask(&self) -> Vec<NodeValue> {
        let rate = self.config.dropout_rate;
        let keep = 1.0 / (1.0 - rate);
        (0..self.config.embed_dim)
            .map(|_| if self.rng.rand() < rate { 0.0 } else { keep })
            .collect()
    }

    fn frame(&self, tokens: &[usize], t: usize, dropout: bool) -> Frame {
        let n = tokens.len();
        let embed = self.params[EMBED].value();
        let alpha = self.attention_row(t, n);

        let mut context = vec![0.0; self.config.embed_dim];
        for (&token, &a) in tokens.iter().zip(&alpha) {
            for (c, &e) in context.iter_mut().zip(embed.row(token)) {
                *c += a * e;
            }
        }

        let mask = dropout.then(|| self.dropout_mask());
        let attended: Vec<NodeValue> = match &mask {
            Some(mask) => context.iter().zip(mask).map(|(c, m)| c * m).collect(),
            None => context.clone(),
        };

        let weight = self.params[FEAT_OUT_WEIGHT].value();
        let bias = self.params[FEAT_OUT_BIAS].value().row(0);
        let mut output = bias.to_vec();
        for (k, &c) in attended.iter().enumerate() {
            for (z, &w) in output.iter_mut().zip(weight.row(k)) {
                *z += c * w;
            }
        }
        let activation = self.config.output_activation;
        output.iter_mut().for_each(|z| *z = activation.apply(*z));

        let progress = t as NodeValue / self.config.frames_per_token / n as NodeValue;
        let stop_weight = self.params[PROB_OUT_WEIGHT].value().row(0);
        let logit = attended.iter().zip(stop_weight).map(|(c, w)| c * w).sum::<NodeValue>()
            + self.params[PROB_OUT_PROGRESS].value().get(0, 0) * progress
            + self.params[PROB_OUT_BIAS].value().get(0, 0);

        Frame {
            alpha,
            context,
            mask,
            output,
            logit,
            progress,
        }
    }

    fn valid_frames(&self, batch: &Batch, olens: &[usize], row: usize) -> usize {
        if self.config.loss.use_masking {
            olens[row].min(batch.max_frames())
        } else {
            batch.max_frames()
        }
    }

    /// Loss over `batch`. Gradients are added into `grads` when given.
    fn run(
        &self,
        batch: &Batch,
        mut grads: Option<&mut Vec<Linear>>,
        dropout: bool,
    ) -> Result<Observation> {
        let (labels, olens) = match (&batch.labels, &batch.olens) {
            (Some(labels), Some(olens)) => (labels, olens),
            _ => return Err(Error::Shape("batch has no stop labels".to_string())),
        };
        if batch.feature_dim() != self.config.odim {
            return Err(Error::Shape(format!(
                "batch features have dim {}, model outputs {}",
                batch.feature_dim(),
                self.config.odim
            )));
        }

        let total_frames: usize = (0..batch.len())
            .map(|row| self.valid_frames(batch, olens, row))
            .sum();
        if total_frames == 0 {
            return Err(Error::Shape("batch has no frames".to_string()));
        }
        let mse_norm = 1.0 / (total_frames * self.config.odim) as NodeValue;
        let bce_norm = 1.0 / total_frames as NodeValue;
        let activation = self.config.output_activation;

        let mut mse_sum = 0.0;
        let mut bce_sum = 0.0;
        for row in 0..batch.len() {
            let tokens = batch.tokens(row);
            self.check_tokens(tokens)?;

            for t in 0..self.valid_frames(batch, olens, row) {
                let frame = self.frame(tokens, t, dropout);
                let target = batch.ys[row].row(t);
                mse_sum += frame
                    .output
                    .iter()
                    .zip(target)
                    .map(|(y, x)| (y - x).powi(2))
                    .sum::<NodeValue>();
                let (bce, dlogit) = bce_with_logits(
                    frame.logit,
                    labels.get(row, t),
                    self.config.loss.bce_pos_weight,
                );
                bce_sum += bce;

                if let Some(grads) = grads.as_deref_mut() {
                    let dz: Vec<NodeValue> = frame
                        .output
                        .iter()
                        .zip(target)
                        .map(|(y, x)| 2.0 * (y - x) * mse_norm * activation.derivative(*y))
                        .collect();
                    let ds = dlogit * bce_norm;
                    self.backward(&mut grads[..], tokens, &frame, &dz, ds);
                }
            }
        }

        let mse_loss = mse_sum * mse_norm;
        let bce_loss = bce_sum * bce_norm;
        Ok(Observation::from([
            ("loss".to_string(), mse_loss + bce_loss),
            ("mse_loss".to_string(), mse_loss),
            ("bce_loss".to_string(), bce_loss),
        ]))
    }

    fn backward(
        &self,
        grads: &mut [Linear],
        tokens: &[usize],
        frame: &Frame,
        dz: &[NodeValue],
        ds: NodeValue,
    ) {
        let attended: Vec<NodeValue> = match &frame.mask {
            Some(mask) => frame.context.iter().zip(mask).map(|(c, m)| c * m).collect(),
            None => frame.context.clone(),
        };

        for (k, &c) in attended.iter().enumerate() {
            for (g, &d) in grads[FEAT_OUT_WEIGHT].row_mut(k).iter_mut().zip(dz) {
                *g += c * d;
            }
        }
        for (g, &d) in grads[FEAT_OUT_BIAS].row_mut(0).iter_mut().zip(dz) {
            *g += d;
        }
        for (g, &c) in grads[PROB_OUT_WEIGHT].row_mut(0).iter_mut().zip(&attended) {
            *g += ds * c;
        }
        grads[PROB_OUT_BIAS].row_mut(0)[0] += ds;
        grads[PROB_OUT_PROGRESS].row_mut(0)[0] += ds * frame.progress;

        let weight = self.params[FEAT_OUT_WEIGHT].value();
        let stop_weight = self.params[PROB_OUT_WEIGHT].value().row(0);
        let dcontext: Vec<NodeValue> = (0..self.config.embed_dim)
            .map(|k| {
                let d = weight.row(k).iter().zip(dz).map(|(w, d)| w * d).sum::<NodeValue>()
                    + ds * stop_weight[k];
                match &frame.mask {
                    Some(mask) => d * mask[k],
                    None => d,
                }
            })
            .collect();

        for (&token, &a) in tokens.iter().zip(&frame.alpha) {
            for (g, &d) in grads[EMBED].row_mut(token).iter_mut().zip(&dcontext) {
                *g += a * d;
            }
        }
    }

    fn generate(&self, tokens: &[usize], options: &InferenceOptions) -> Result<(Generated, Linear)> {
        self.check_tokens(tokens)?;
        let n = tokens.len() as NodeValue;
        let maxlen = ((n * options.maxlenratio) as usize).max(1);
        let minlen = (n * options.minlenratio) as usize;

        let mut outs = vec![];
        let mut probs = vec![];
        let mut att_ws = vec![];
        let mut contexts = vec![];
        loop {
            let frame = self.frame(tokens, outs.len(), false);
            let prob = sigmoid(frame.logit);
            outs.extend(frame.output);
            att_ws.extend(frame.alpha);
            contexts.extend(frame.context);
            probs.push(prob);

            let frames = probs.len();
            if (prob >= options.threshold || frames >= maxlen) && frames >= minlen {
                break;
            }
        }

        let generated = Generated {
            outs: Linear::from_iter(self.config.odim, outs.into_iter())?,
            probs,
            att_ws: Linear::from_iter(tokens.len(), att_ws.into_iter())?,
        };
        let contexts = Linear::from_iter(self.config.embed_dim, contexts.into_iter())?;
        Ok((generated, contexts))
    }
}

impl Trainable for Tacotron {
    fn parameters(&self) -> &[Parameter] {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut [Parameter] {
        &mut self.params
    }

    #[instrument(level = "trace", skip_all, fields(rows = batch.len()))]
    fn forward_backward(&mut self, batch: &Batch) -> Result<Observation> {
        let mut grads: Vec<Linear> = self
            .params
            .iter()
            .map(|x| Linear::with_dimensions(x.value()))
            .collect();
        let dropout = self.training && self.config.dropout_rate > 0.0;
        let observation = self.run(batch, Some(&mut grads), dropout)?;

        for (param, grad) in self.params.iter_mut().zip(&grads) {
            param.accumulate_grad(grad, 1.0)?;
        }
        Ok(observation)
    }

    fn evaluate(&self, batch: &Batch) -> Result<Observation> {
        let dropout = self.training && self.config.dropout_rate > 0.0;
        self.run(batch, None, dropout)
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }
}

impl Synthesizer for Tacotron {
    fn idim(&self) -> usize {
        self.config.idim
    }

    fn odim(&self) -> usize {
        self.config.odim
    }

    fn inference(&self, tokens: &[usize], options: &InferenceOptions) -> Result<Generated> {
        self.generate(tokens, options).map(|(generated, _)| generated)
    }

    fn hidden_states(
        &self,
        tokens: &[usize],
        layer: isize,
        options: &InferenceOptions,
    ) -> Result<Linear> {
        let resolved = if layer < 0 {
            HIDDEN_LAYERS as isize + layer
        } else {
            layer
        };

        match resolved {
            0 => {
                self.check_tokens(tokens)?;
                let embed = self.params[EMBED].value();
                let values = tokens.iter().flat_map(|&x| embed.row(x).iter().copied());
                Linear::from_iter(self.config.embed_dim, values)
            }
            1 => self.generate(tokens, options).map(|(_, contexts)| contexts),
            2 => self.generate(tokens, options).map(|(generated, _)| generated.outs),
            _ => Err(Error::Configuration(format!(
                "layer index {layer} out of range for {HIDDEN_LAYERS} layers"
            ))),
        }
    }

    fn attention_weights(&self, batch: &Batch) -> Result<Vec<Linear>> {
        (0..batch.len())
            .map(|row| {
                let tokens = batch.tokens(row);
                self.check_tokens(tokens)?;
                let frames = match &batch.olens {
                    Some(olens) => olens[row],
                    None => batch.max_frames(),
                };
                let values = (0..frames).flat_map(|t| self.attention_row(t, tokens.len()));
                Linear::from_iter(tokens.len(), values)
            })
            .collect()
    }
}
