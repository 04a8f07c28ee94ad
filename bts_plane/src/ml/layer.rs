use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};

#[cfg(not(feature = "short_floats"))]
pub type NodeValue = f64;

#[cfg(feature = "short_floats")]
pub type NodeValue = f32;

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerValues(Vec<NodeValue>);

impl<T> From<T> for LayerValues
where
    T: AsRef<[NodeValue]>,
{
    fn from(value: T) -> Self {
        Self(value.as_ref().to_vec())
    }
}

impl FromIterator<NodeValue> for LayerValues {
    fn from_iter<T: IntoIterator<Item = NodeValue>>(iter: T) -> Self {
        LayerValues(iter.into_iter().collect())
    }
}

impl Deref for LayerValues {
    type Target = Vec<NodeValue>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for LayerValues {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl LayerValues {
    pub fn new(inner: Vec<NodeValue>) -> Self {
        Self(inner)
    }

    pub fn into_inner(self) -> Vec<NodeValue> {
        self.0
    }

    pub fn squared_norm(&self) -> NodeValue {
        self.iter().map(|x| x * x).sum()
    }

    pub fn is_finite(&self) -> bool {
        self.iter().all(|x| x.is_finite())
    }
}

pub fn sigmoid(x: NodeValue) -> NodeValue {
    1.0 / (1.0 + (-x).exp())
}

/// Binary cross entropy computed from a logit, with an optional weight on
/// the positive class. Returns `(loss, dloss_dlogit)`.
pub fn bce_with_logits(logit: NodeValue, label: NodeValue, pos_weight: NodeValue) -> (NodeValue, NodeValue) {
    let prob = sigmoid(logit);
    // log(sigmoid(x)) and log(1 - sigmoid(x)) in a form that stays finite for large |x|
    let log_prob = -softplus(-logit);
    let log_not_prob = -softplus(logit);

    let loss = -(pos_weight * label * log_prob + (1.0 - label) * log_not_prob);
    let grad = pos_weight * label * (prob - 1.0) + (1.0 - label) * prob;
    (loss, grad)
}

fn softplus(x: NodeValue) -> NodeValue {
    if x > 0.0 {
        x + (-x).exp().ln_1p()
    } else {
        x.exp().ln_1p()
    }
}
