use std::{
    collections::BTreeMap,
    ops::{Deref, DerefMut},
};

use serde::{Deserialize, Serialize};

use crate::{
    data::Batch,
    ml::{linear::Linear, param::Parameter, NodeValue},
    Result,
};

/// Named scalar losses from one forward pass, e.g. `loss`, `mse_loss`, `bce_loss`.
pub type Observation = BTreeMap<String, NodeValue>;

/// A loss-wrapped model the training loop can drive.
pub trait Trainable {
    fn parameters(&self) -> &[Parameter];
    fn parameters_mut(&mut self) -> &mut [Parameter];

    /// Runs forward and backward on `batch`, adding gradients into the parameters.
    fn forward_backward(&mut self, batch: &Batch) -> Result<Observation>;

    /// Forward only. Leaves gradients untouched.
    fn evaluate(&self, batch: &Batch) -> Result<Observation>;

    fn set_training(&mut self, training: bool);
    fn is_training(&self) -> bool;

    fn zero_grad(&mut self) {
        crate::ml::param::zero_grad(self.parameters_mut());
    }
}

/// Knobs for autoregressive generation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InferenceOptions {
    /// Stop once the stop probability reaches this value.
    pub threshold: NodeValue,
    /// Upper bound on frames, as a multiple of the token count.
    pub maxlenratio: NodeValue,
    /// Lower bound on frames before stopping is allowed.
    pub minlenratio: NodeValue,
}

impl Default for InferenceOptions {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            maxlenratio: 5.0,
            minlenratio: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Generated {
    /// `frames × odim`
    pub outs: Linear,
    pub probs: Vec<NodeValue>,
    /// `frames × tokens`
    pub att_ws: Linear,
}

pub trait Synthesizer {
    fn idim(&self) -> usize;
    fn odim(&self) -> usize;

    fn inference(&self, tokens: &[usize], options: &InferenceOptions) -> Result<Generated>;

    /// Intermediate representation at `layer`; negative values count from the last layer.
    fn hidden_states(&self, tokens: &[usize], layer: isize, options: &InferenceOptions)
        -> Result<Linear>;

    /// Attention weights driven by the target frames for each row, trimmed to its token count.
    fn attention_weights(&self, batch: &Batch) -> Result<Vec<Linear>>;
}

/// Puts a model in evaluation mode until dropped, then restores the previous mode.
pub struct EvalMode<'a, M: Trainable + ?Sized> {
    model: &'a mut M,
    was_training: bool,
}

impl<'a, M: Trainable + ?Sized> EvalMode<'a, M> {
    pub fn new(model: &'a mut M) -> Self {
        let was_training = model.is_training();
        model.set_training(false);
        Self {
            model,
            was_training,
        }
    }
}

impl<'a, M: Trainable + ?Sized> Deref for EvalMode<'a, M> {
    type Target = M;

    fn deref(&self) -> &Self::Target {
        self.model
    }
}

impl<'a, M: Trainable + ?Sized> DerefMut for EvalMode<'a, M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.model
    }
}

impl<'a, M: Trainable + ?Sized> Drop for EvalMode<'a, M> {
    fn drop(&mut self) {
        self.model.set_training(self.was_training);
    }
}
